use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use serde_json::Value;

use crate::http::transformation::{Direction, TransformCtx, TransformationError};
use crate::http::{HeaderName, HeaderValue, ResponseParts, StatusCode, header};
use crate::*;

const AMAZON_ERRORTYPE_HEADER: HeaderName = HeaderName::from_static("x-amzn-errortype");
const DEFAULT_STATUS_VALUE: StatusCode = StatusCode::OK;

struct ApiGatewayError {
	status_code: StatusCode,
	code: &'static str,
	message: &'static str,
}

/// Decodes a Lambda proxy-integration response envelope
/// (`statusCode`/`headers`/`multiValueHeaders`/`body`/`isBase64Encoded`)
/// into the real response. A malformed envelope is replaced by a well-typed
/// plain-text error, never forwarded.
#[derive(Debug, Clone, Default)]
pub struct ApiGatewayTransformer {}

impl ApiGatewayTransformer {
	pub fn transform(&self, ctx: &mut TransformCtx<'_>) -> Result<(), TransformationError> {
		if ctx.direction != Direction::Request
			&& let Some(response) = ctx.response.as_mut()
		{
			Self::transform_response(response, ctx.body);
			return Ok(());
		}
		Err(TransformationError::Template(
			"API gateway transformer cannot be used on the request path".to_string(),
		))
	}

	pub fn transform_response(response: &mut ResponseParts, body: &mut BytesMut) {
		if let Err(error) = Self::try_transform_response(response, body) {
			Self::format_error(response, body, error);
		}
	}

	fn try_transform_response(
		response: &mut ResponseParts,
		body: &mut BytesMut,
	) -> Result<(), ApiGatewayError> {
		// all information about the response is carried in the body
		let json_body: Value = serde_json::from_slice(body.as_ref()).map_err(|e| {
			debug!("error parsing response body as JSON: {e}");
			ApiGatewayError {
				status_code: StatusCode::INTERNAL_SERVER_ERROR,
				code: "500",
				message: "failed to parse response body as JSON",
			}
		})?;

		// clear existing response headers before any are set; the status line
		// is re-established below so the response is never left undefined
		response.headers.clear();
		response.status = DEFAULT_STATUS_VALUE;

		if let Some(status) = json_body.get("statusCode") {
			let code = status
				.as_u64()
				.and_then(|v| u16::try_from(v).ok())
				.and_then(|v| StatusCode::from_u16(v).ok())
				.ok_or_else(|| {
					debug!("received status code with value: {status}");
					ApiGatewayError {
						status_code: StatusCode::INTERNAL_SERVER_ERROR,
						code: "500",
						message: "cannot parse non unsigned integer status code",
					}
				})?;
			response.status = code;
		}

		if let Some(headers) = json_body.get("headers") {
			let headers = headers.as_object().ok_or_else(|| {
				debug!("invalid headers object");
				ApiGatewayError {
					status_code: StatusCode::INTERNAL_SERVER_ERROR,
					code: "500",
					message: "invalid headers object",
				}
			})?;
			for (key, value) in headers {
				let value = match value {
					Value::String(s) => s.clone(),
					other => other.to_string(),
				};
				add_response_header(&mut response.headers, key, &value, false);
			}
		}

		if let Some(multi_value_headers) = json_body.get("multiValueHeaders") {
			let multi_value_headers = multi_value_headers.as_object().ok_or_else(|| {
				debug!("invalid multiValueHeaders object");
				ApiGatewayError {
					status_code: StatusCode::INTERNAL_SERVER_ERROR,
					code: "500",
					message: "invalid multiValueHeaders object",
				}
			})?;
			for (key, values) in multi_value_headers {
				let values: Vec<&Value> = match values {
					Value::Array(items) => items.iter().collect(),
					Value::Object(_) => {
						debug!("invalid multi header value object");
						return Err(ApiGatewayError {
							status_code: StatusCode::INTERNAL_SERVER_ERROR,
							code: "500",
							message: "invalid multi header value object",
						});
					},
					other => {
						warn!("using non-array value for multi header value");
						vec![other]
					},
				};
				for value in values {
					let value = match value {
						Value::String(s) => s.clone(),
						other => other.to_string(),
					};
					add_response_header(&mut response.headers, key, &value, true);
				}
			}
		}

		body.clear();
		match json_body.get("body") {
			Some(envelope_body) => {
				let mut body_out = match envelope_body {
					Value::String(s) => s.clone(),
					other => other.to_string(),
				};
				if json_body.get("isBase64Encoded").and_then(Value::as_bool) == Some(true) {
					body_out = STANDARD
						.decode(&body_out)
						.ok()
						.and_then(|b| String::from_utf8(b).ok())
						.unwrap_or_default();
				}
				body.extend_from_slice(body_out.as_bytes());
			},
			None => body.extend_from_slice(b"{}"),
		}
		let len = body.len() as u64;
		response
			.headers
			.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
		Ok(())
	}

	fn format_error(response: &mut ResponseParts, body: &mut BytesMut, error: ApiGatewayError) {
		debug!("returning error with message: {}", error.message);
		response.headers.clear();
		response.status = error.status_code;
		response.headers.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("text/plain"),
		);
		if let Ok(value) = HeaderValue::from_str(error.code) {
			response.headers.insert(AMAZON_ERRORTYPE_HEADER, value);
		}
		body.clear();
		body.extend_from_slice(format!("{}: {}", error.code, error.message).as_bytes());
		let len = body.len() as u64;
		response
			.headers
			.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
	}
}

fn add_response_header(headers: &mut crate::http::HeaderMap, key: &str, value: &str, append: bool) {
	let Ok(name) = HeaderName::try_from(key) else {
		debug!("failed to write response header with invalid header key: {key}");
		return;
	};
	let Ok(value) = HeaderValue::from_str(value) else {
		debug!("failed to write response header with invalid header value: {value}");
		return;
	};
	if append {
		headers.append(name, value);
	} else {
		headers.insert(name, value);
	}
}

#[cfg(test)]
#[path = "api_gateway_tests.rs"]
mod tests;
