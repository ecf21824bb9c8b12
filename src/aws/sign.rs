use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use ring::{digest, hmac};

use crate::http::{HeaderName, HeaderValue, RequestParts, path_and_query};
use crate::*;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const SERVICE_LAMBDA: &str = "lambda";
pub const SERVICE_STS: &str = "sts";

pub const DATE_HEADER: HeaderName = HeaderName::from_static("x-amz-date");
pub const SECURITY_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-amz-security-token");
pub const HOST_HEADER: &str = "host";

/// Everything except unreserved characters and the path separator. Applied
/// to an already-encoded path this yields the double encoding AWS expects
/// for Lambda invocation paths (`%3A` becomes `%253A`).
const CANONICAL_URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
	.remove(b'-')
	.remove(b'.')
	.remove(b'_')
	.remove(b'~')
	.remove(b'/');

/// Lowercase header names to sign, kept sorted for the canonical request.
pub type HeaderList = BTreeSet<String>;

pub fn create_header_list<I, S>(names: I) -> HeaderList
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	names
		.into_iter()
		.map(|n| n.as_ref().to_lowercase())
		.collect()
}

/// AWS Signature Version 4 signer. The payload hash is accumulated
/// incrementally with `update_payload_hash` as body chunks are decoded and
/// finalized by `sign`.
pub struct AwsAuthenticator {
	service: Strng,
	access_key: Option<String>,
	// "AWS4" + secret, the root of the signing key derivation
	first_key: Option<String>,
	session_token: Option<String>,
	body_sha: digest::Context,
}

impl AwsAuthenticator {
	pub fn new(service: &str) -> Self {
		AwsAuthenticator {
			service: strng::new(service),
			access_key: None,
			first_key: None,
			session_token: None,
			body_sha: digest::Context::new(&digest::SHA256),
		}
	}

	pub fn init(&mut self, access_key: &str, secret_key: &str, session_token: Option<&str>) {
		self.access_key = Some(access_key.to_string());
		self.first_key = Some(format!("AWS4{secret_key}"));
		self.session_token = session_token.map(str::to_string);
	}

	pub fn update_payload_hash(&mut self, data: &[u8]) {
		self.body_sha.update(data);
	}

	/// Lowercase hex SHA-256 of the payload seen so far.
	pub fn body_hex_sha(&self) -> String {
		hex::encode(self.body_sha.clone().finish())
	}

	pub fn sign(
		&mut self,
		request: &mut RequestParts,
		headers_to_sign: &HeaderList,
		region: &str,
	) -> String {
		self.sign_with_time(request, headers_to_sign, region, Utc::now())
	}

	/// Sign with an explicit timestamp, for deterministic tests.
	pub fn sign_with_time(
		&mut self,
		request: &mut RequestParts,
		headers_to_sign: &HeaderList,
		region: &str,
		now: DateTime<Utc>,
	) -> String {
		let request_date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
		let date = now.format("%Y%m%d").to_string();

		if let Ok(value) = HeaderValue::from_str(&request_date_time) {
			request.headers.insert(DATE_HEADER, value);
		}
		if let Some(token) = &self.session_token
			&& let Ok(mut value) = HeaderValue::from_str(token)
		{
			value.set_sensitive(true);
			request.headers.insert(SECURITY_TOKEN_HEADER, value);
		}

		// x-amz-date is always part of the signature
		let mut names = headers_to_sign.clone();
		names.insert(DATE_HEADER.as_str().to_string());

		let mut canonical_headers = String::new();
		for name in &names {
			let value = signable_header_value(request, name);
			canonical_headers.push_str(name);
			canonical_headers.push(':');
			canonical_headers.push_str(value.trim());
			canonical_headers.push('\n');
		}
		let signed_headers = names.iter().join(";");

		let full_path = path_and_query(request).to_string();
		let (url_base, query_string) = match full_path.split_once('?') {
			Some((path, query)) => (path, query),
			None => (full_path.as_str(), ""),
		};
		let canonical_uri = canonical_uri(url_base);

		let hex_payload = hex::encode(self.body_sha.clone().finish());

		let canonical_request = format!(
			"{method}\n{canonical_uri}\n{query_string}\n{canonical_headers}\n{signed_headers}\n{hex_payload}",
			method = request.method.as_str(),
		);
		let hashed_canonical_request = hex::encode(digest::digest(
			&digest::SHA256,
			canonical_request.as_bytes(),
		));

		let credential_scope = format!("{date}/{region}/{}/aws4_request", self.service);
		let string_to_sign = format!(
			"{ALGORITHM}\n{request_date_time}\n{credential_scope}\n{hashed_canonical_request}"
		);

		let first_key = self.first_key.as_deref().unwrap_or_default();
		let k_date = hmac_sha256(first_key.as_bytes(), date.as_bytes());
		let k_region = hmac_sha256(k_date.as_ref(), region.as_bytes());
		let k_service = hmac_sha256(k_region.as_ref(), self.service.as_bytes());
		let k_signing = hmac_sha256(k_service.as_ref(), b"aws4_request");
		let signature = hex::encode(hmac_sha256(k_signing.as_ref(), string_to_sign.as_bytes()));

		let access_key = self.access_key.as_deref().unwrap_or_default();
		let authorization = format!(
			"{ALGORITHM} Credential={access_key}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}"
		);
		if let Ok(mut value) = HeaderValue::from_str(&authorization) {
			value.set_sensitive(true);
			request
				.headers
				.insert(crate::http::header::AUTHORIZATION, value);
		}
		authorization
	}
}

/// The canonical URI is the path URL-encoded a second time; AWS expects
/// `%3A` in a Lambda function path to arrive as `%253A`.
pub(crate) fn canonical_uri(url_base: &str) -> String {
	utf8_percent_encode(url_base, CANONICAL_URI_ENCODE).to_string()
}

fn signable_header_value<'a>(request: &'a RequestParts, name: &str) -> &'a str {
	if let Some(value) = request.headers.get(name).and_then(|v| v.to_str().ok()) {
		return value;
	}
	if name == HOST_HEADER {
		return request.uri.authority().map(|a| a.as_str()).unwrap_or("");
	}
	""
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> hmac::Tag {
	let key = hmac::Key::new(hmac::HMAC_SHA256, key);
	hmac::sign(&key, data)
}

#[cfg(test)]
#[path = "sign_tests.rs"]
mod tests;
