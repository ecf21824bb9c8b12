use anyhow::anyhow;
use regex::Regex;

use crate::http::transformation::StreamInfo;
use crate::http::{HeaderMap, RequestParts, ResponseParts, first_header_value};
use crate::*;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalRequestMatcher {
	#[serde(default)]
	pub prefix: Option<String>,
	#[serde(default)]
	pub path: Option<String>,
	#[serde(default)]
	pub regex: Option<String>,
	#[serde(default)]
	pub headers: Vec<LocalHeaderMatcher>,
	#[serde(default)]
	pub query_parameters: Vec<LocalQueryParameterMatcher>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalQueryParameterMatcher {
	pub name: String,
	#[serde(default)]
	pub value: Option<String>,
	#[serde(default)]
	pub regex: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalHeaderMatcher {
	pub name: String,
	#[serde(default)]
	pub value: Option<String>,
	#[serde(default)]
	pub regex: bool,
	#[serde(default)]
	pub invert_match: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalResponseMatcher {
	#[serde(default)]
	pub headers: Vec<LocalHeaderMatcher>,
	#[serde(default)]
	pub response_code_details: Option<String>,
}

#[derive(Debug)]
enum PathMatch {
	Any,
	Prefix(String),
	Exact(String),
	Regex(Regex),
}

#[derive(Debug)]
enum ValueMatch {
	Present,
	Exact(String),
	Regex(Regex),
}

#[derive(Debug)]
pub struct HeaderMatcher {
	name: Strng,
	value: ValueMatch,
	invert: bool,
}

impl HeaderMatcher {
	fn matches(&self, headers: &HeaderMap) -> bool {
		let value = first_header_value(headers, &self.name);
		let matched = match (&self.value, value) {
			(_, None) => false,
			(ValueMatch::Present, Some(_)) => true,
			(ValueMatch::Exact(expected), Some(v)) => v == expected,
			(ValueMatch::Regex(re), Some(v)) => re.is_match(v),
		};
		matched != self.invert
	}
}

fn build_header_matchers(local: Vec<LocalHeaderMatcher>) -> anyhow::Result<Vec<HeaderMatcher>> {
	local
		.into_iter()
		.map(|h| {
			let value = match (&h.value, h.regex) {
				(None, _) => ValueMatch::Present,
				(Some(v), false) => ValueMatch::Exact(v.clone()),
				(Some(v), true) => ValueMatch::Regex(
					Regex::new(v).map_err(|e| anyhow!("invalid header match regex for '{}': {e}", h.name))?,
				),
			};
			Ok(HeaderMatcher {
				name: strng::new(h.name.to_lowercase()),
				value,
				invert: h.invert_match,
			})
		})
		.collect()
}

/// Selects a transformation pair by request path, headers, and query
/// parameters.
#[derive(Debug)]
pub struct RequestMatcher {
	path: PathMatch,
	headers: Vec<HeaderMatcher>,
	query_parameters: Vec<QueryParameterMatcher>,
}

#[derive(Debug)]
pub struct QueryParameterMatcher {
	name: String,
	value: ValueMatch,
}

impl QueryParameterMatcher {
	fn matches(&self, query: &str) -> bool {
		let found = query.split('&').find_map(|param| {
			let (name, value) = param.split_once('=').unwrap_or((param, ""));
			(name == self.name).then_some(value)
		});
		match (&self.value, found) {
			(_, None) => false,
			(ValueMatch::Present, Some(_)) => true,
			(ValueMatch::Exact(expected), Some(v)) => v == expected,
			(ValueMatch::Regex(re), Some(v)) => re.is_match(v),
		}
	}
}

impl TryFrom<LocalRequestMatcher> for RequestMatcher {
	type Error = anyhow::Error;

	fn try_from(value: LocalRequestMatcher) -> Result<Self, Self::Error> {
		let path = match (value.prefix, value.path, value.regex) {
			(Some(prefix), None, None) => PathMatch::Prefix(prefix),
			(None, Some(path), None) => PathMatch::Exact(path),
			(None, None, Some(regex)) => PathMatch::Regex(
				Regex::new(&regex).map_err(|e| anyhow!("invalid path match regex: {e}"))?,
			),
			(None, None, None) => PathMatch::Any,
			_ => return Err(anyhow!("at most one of prefix, path, regex may be set")),
		};
		let query_parameters = value
			.query_parameters
			.into_iter()
			.map(|q| {
				let value = match (&q.value, q.regex) {
					(None, _) => ValueMatch::Present,
					(Some(v), false) => ValueMatch::Exact(v.clone()),
					(Some(v), true) => ValueMatch::Regex(Regex::new(v).map_err(|e| {
						anyhow!("invalid query parameter match regex for '{}': {e}", q.name)
					})?),
				};
				Ok(QueryParameterMatcher {
					name: q.name,
					value,
				})
			})
			.collect::<anyhow::Result<_>>()?;
		Ok(RequestMatcher {
			path,
			headers: build_header_matchers(value.headers)?,
			query_parameters,
		})
	}
}

impl RequestMatcher {
	pub fn matches(&self, request: &RequestParts) -> bool {
		let path = request.uri.path();
		let path_matched = match &self.path {
			PathMatch::Any => true,
			PathMatch::Prefix(prefix) => path.starts_with(prefix.as_str()),
			PathMatch::Exact(exact) => path == exact,
			PathMatch::Regex(re) => re.is_match(path),
		};
		if !path_matched {
			return false;
		}
		if !self.headers.iter().all(|h| h.matches(&request.headers)) {
			return false;
		}
		let query = request.uri.query().unwrap_or_default();
		self.query_parameters.iter().all(|q| q.matches(query))
	}
}

/// Selects a response transformation by response headers and the stream's
/// response code details. An explicit matcher with no expressions always
/// matches; a details expression never matches a stream without details.
#[derive(Debug)]
pub struct ResponseMatcher {
	headers: Vec<HeaderMatcher>,
	response_code_details: Option<Strng>,
}

impl TryFrom<LocalResponseMatcher> for ResponseMatcher {
	type Error = anyhow::Error;

	fn try_from(value: LocalResponseMatcher) -> Result<Self, Self::Error> {
		Ok(ResponseMatcher {
			headers: build_header_matchers(value.headers)?,
			response_code_details: value.response_code_details.map(strng::new),
		})
	}
}

impl ResponseMatcher {
	pub fn matches(&self, response: &ResponseParts, info: &StreamInfo) -> bool {
		if let Some(expected) = &self.response_code_details {
			match &info.response_code_details {
				None => return false,
				Some(details) if details != expected => return false,
				Some(_) => {},
			}
		}
		self.headers.iter().all(|h| h.matches(&response.headers))
	}
}

#[cfg(test)]
#[path = "matcher_tests.rs"]
mod tests;
