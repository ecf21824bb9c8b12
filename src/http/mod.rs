pub mod transformation;

#[cfg(test)]
pub(crate) mod tests_common;

pub use ::http::uri::{Authority, PathAndQuery};
pub use ::http::{
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, status, uri,
};

/// Header-and-metadata half of a request, as delivered by the proxy host.
pub type RequestParts = ::http::request::Parts;
/// Header-and-metadata half of a response.
pub type ResponseParts = ::http::response::Parts;

pub fn empty_request_parts() -> RequestParts {
	let (parts, _) = ::http::Request::new(()).into_parts();
	parts
}

pub fn empty_response_parts() -> ResponseParts {
	let (parts, _) = ::http::Response::new(()).into_parts();
	parts
}

/// First value of a header, or `None` when absent or not valid UTF-8.
pub fn first_header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	headers.get(name).and_then(|v| v.to_str().ok())
}

/// The `:method`/`:path`/`:authority`/`:status` pseudo-headers, which the
/// `http` crate keeps outside the header map. Captured once per
/// transformation so template and extractor header lookups see them.
#[derive(Debug, Clone, Default)]
pub struct PseudoHeaders {
	pub method: String,
	pub path: String,
	pub authority: String,
	pub status: String,
}

impl PseudoHeaders {
	pub fn from_request(parts: &RequestParts) -> Self {
		PseudoHeaders {
			method: parts.method.to_string(),
			path: path_and_query(parts).to_string(),
			authority: parts.uri.authority().map(|a| a.to_string()).unwrap_or_default(),
			status: String::new(),
		}
	}

	pub fn from_response(parts: &ResponseParts) -> Self {
		PseudoHeaders {
			method: String::new(),
			path: String::new(),
			authority: String::new(),
			status: parts.status.as_u16().to_string(),
		}
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		let value = match name {
			":method" => &self.method,
			":path" => &self.path,
			":authority" => &self.authority,
			":status" => &self.status,
			_ => return None,
		};
		if value.is_empty() { None } else { Some(value) }
	}
}

/// Header lookup covering both real and pseudo headers.
pub fn header_or_pseudo<'a>(
	headers: &'a HeaderMap,
	pseudo: &'a PseudoHeaders,
	name: &str,
) -> Option<&'a str> {
	if name.starts_with(':') {
		return pseudo.get(name);
	}
	first_header_value(headers, name)
}

/// Path including the query string, as sent on the wire.
pub fn path_and_query(parts: &RequestParts) -> &str {
	parts
		.uri
		.path_and_query()
		.map(PathAndQuery::as_str)
		.unwrap_or("/")
}

pub fn modify_uri(
	parts: &mut RequestParts,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let uri = std::mem::take(&mut parts.uri);
	let mut uri_parts = uri.into_parts();
	f(&mut uri_parts)?;
	parts.uri = Uri::from_parts(uri_parts)?;
	Ok(())
}

/// Replace the `:path` pseudo-header (path and query).
pub fn set_path(parts: &mut RequestParts, path: &str) -> anyhow::Result<()> {
	let pq = PathAndQuery::try_from(path)?;
	modify_uri(parts, |uri| {
		uri.path_and_query = Some(pq);
		Ok(())
	})
}

/// The authority (`:authority`/`Host`) the request is addressed to.
pub fn host(parts: &RequestParts) -> Option<&str> {
	parts
		.uri
		.host()
		.or_else(|| first_header_value(&parts.headers, "host"))
}
