use std::collections::BTreeMap;

use bytes::BytesMut;
use percent_encoding::percent_decode_str;
use serde_json::Value;

use crate::http::transformation::{Direction, TransformCtx, TransformationError};
use crate::http::{HeaderMap, HeaderValue, header, path_and_query};
use crate::*;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalHeaderBodyTransform {
	#[serde(default)]
	pub add_request_metadata: bool,
}

/// Serializes the whole request (or response) into a canonical JSON
/// envelope: `{ headers, body?, … }`, optionally with request metadata in
/// the Lambda proxy-integration shape.
#[derive(Debug, Clone, Default)]
pub struct BodyHeaderTransformer {
	add_request_metadata: bool,
}

impl From<LocalHeaderBodyTransform> for BodyHeaderTransformer {
	fn from(value: LocalHeaderBodyTransform) -> Self {
		BodyHeaderTransformer {
			add_request_metadata: value.add_request_metadata,
		}
	}
}

impl BodyHeaderTransformer {
	pub fn transform(&self, ctx: &mut TransformCtx<'_>) -> Result<(), TransformationError> {
		let mut envelope = serde_json::Map::new();
		if !ctx.body.is_empty() {
			envelope.insert(
				"body".to_string(),
				Value::String(String::from_utf8_lossy(ctx.body).into_owned()),
			);
		}

		let on_request = ctx.direction == Direction::Request;
		let (headers, multi_value_headers) = parse_headers(match ctx.direction {
			Direction::Request => &ctx.request.headers,
			Direction::Response => ctx
				.response
				.as_ref()
				.map(|r| &r.headers)
				.unwrap_or(&ctx.request.headers),
		});
		envelope.insert("headers".to_string(), to_json(headers));

		if self.add_request_metadata && on_request {
			envelope.insert(
				"multiValueHeaders".to_string(),
				to_json_multi(multi_value_headers),
			);
			let full_path = path_and_query(ctx.request);
			let (path, query_string) = match full_path.split_once('?') {
				Some((path, qs)) => (path, qs),
				None => (full_path, ""),
			};
			envelope.insert("path".to_string(), Value::String(path.to_string()));
			envelope.insert(
				"queryString".to_string(),
				Value::String(query_string.to_string()),
			);
			envelope.insert(
				"httpMethod".to_string(),
				Value::String(ctx.request.method.to_string()),
			);
			let (params, multi_params) = parse_query_string(query_string);
			envelope.insert("queryStringParameters".to_string(), to_json(params));
			envelope.insert(
				"multiValueQueryStringParameters".to_string(),
				to_json_multi(multi_params),
			);
		}

		let new_body = Value::Object(envelope).to_string();
		let headers = ctx.active_headers();
		headers.remove(header::CONTENT_LENGTH);
		headers.remove(header::CONTENT_TYPE);
		headers.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		*ctx.body = BytesMut::from(new_body.as_bytes());
		let len = ctx.body.len() as u64;
		ctx
			.active_headers()
			.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
		Ok(())
	}
}

// Single-value map records the last value seen per key; the multi-value map
// only gains an entry once a key repeats, and then carries every value in
// order.
fn parse_headers(
	header_map: &HeaderMap,
) -> (BTreeMap<String, String>, BTreeMap<String, Vec<String>>) {
	let mut headers: BTreeMap<String, String> = BTreeMap::new();
	let mut multi: BTreeMap<String, Vec<String>> = BTreeMap::new();
	for (name, value) in header_map {
		let name = name.as_str().to_string();
		let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
		if let Some(existing) = headers.insert(name.clone(), value.clone()) {
			let entry = multi.entry(name).or_default();
			if entry.is_empty() {
				entry.push(existing);
			}
			entry.push(value);
		}
	}
	(headers, multi)
}

fn parse_query_string(
	query_string: &str,
) -> (BTreeMap<String, String>, BTreeMap<String, Vec<String>>) {
	let mut params: BTreeMap<String, String> = BTreeMap::new();
	let mut multi: BTreeMap<String, Vec<String>> = BTreeMap::new();
	if query_string.is_empty() {
		return (params, multi);
	}
	for param in query_string.split('&') {
		let (name, value) = match param.split_once('=') {
			Some((name, value)) => (
				percent_decode_str(name).decode_utf8_lossy().into_owned(),
				percent_decode_str(value).decode_utf8_lossy().into_owned(),
			),
			None => (param.to_string(), String::new()),
		};
		if let Some(existing) = params.insert(name.clone(), value.clone()) {
			let entry = multi.entry(name).or_default();
			if entry.is_empty() {
				entry.push(existing);
			}
			entry.push(value);
		}
	}
	(params, multi)
}

fn to_json(map: BTreeMap<String, String>) -> Value {
	Value::Object(
		map
			.into_iter()
			.map(|(k, v)| (k, Value::String(v)))
			.collect(),
	)
}

fn to_json_multi(map: BTreeMap<String, Vec<String>>) -> Value {
	Value::Object(
		map
			.into_iter()
			.map(|(k, v)| (k, Value::Array(v.into_iter().map(Value::String).collect())))
			.collect(),
	)
}

#[cfg(test)]
#[path = "body_header_tests.rs"]
mod tests;
