use bytes::BytesMut;

use super::*;
use crate::http::tests_common::{request_parts, response_parts};
use crate::http::transformation::{Direction, StreamInfo, TransformCtx};

fn unwrap_body(body: &str) -> (crate::http::ResponseParts, BytesMut) {
	let mut response = response_parts(200, &[("x-preexisting", "gone")]);
	let mut buf = BytesMut::from(body.as_bytes());
	ApiGatewayTransformer::transform_response(&mut response, &mut buf);
	(response, buf)
}

#[test]
fn decodes_the_envelope() {
	let (response, body) = unwrap_body(
		r#"{"statusCode":200,"headers":{"Content-Type":"application/json"},"body":{"test":"test-value"}}"#,
	);
	assert_eq!(response.status, StatusCode::OK);
	assert_eq!(
		response.headers.get("content-type").unwrap(),
		"application/json"
	);
	// pre-existing headers are cleared before the envelope is applied
	assert!(response.headers.get("x-preexisting").is_none());
	assert_eq!(&body[..], br#"{"test":"test-value"}"#);
	assert_eq!(response.headers.get("content-length").unwrap(), "21");
}

#[test]
fn multi_value_headers_append_in_order() {
	let (response, _) = unwrap_body(
		r#"{"statusCode":200,"headers":{"test-multi-header":"v0"},"multiValueHeaders":{"test-multi-header":["v1","v2"]}}"#,
	);
	let values: Vec<_> = response.headers.get_all("test-multi-header").iter().collect();
	assert_eq!(values, vec!["v0", "v1", "v2"]);
}

#[test]
fn missing_status_defaults_to_200() {
	let (response, body) = unwrap_body(r#"{"headers":{"a":"b"}}"#);
	assert_eq!(response.status, StatusCode::OK);
	assert_eq!(&body[..], b"{}");
}

#[test]
fn non_unsigned_status_is_an_error_envelope() {
	for envelope in [
		r#"{"statusCode":"200"}"#,
		r#"{"statusCode":-1}"#,
		r#"{"statusCode":1.5}"#,
	] {
		let (response, body) = unwrap_body(envelope);
		assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
		assert_eq!(response.headers.get("content-type").unwrap(), "text/plain");
		assert_eq!(response.headers.get("x-amzn-errortype").unwrap(), "500");
		assert_eq!(
			&body[..],
			b"500: cannot parse non unsigned integer status code"
		);
	}
}

#[test]
fn invalid_json_is_an_error_envelope() {
	let (response, body) = unwrap_body("not json");
	assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
	assert_eq!(&body[..], b"500: failed to parse response body as JSON");
}

#[test]
fn non_string_header_values_are_json_encoded() {
	let (response, _) = unwrap_body(r#"{"headers":{"x-num":42,"x-obj":{"a":1}}}"#);
	assert_eq!(response.headers.get("x-num").unwrap(), "42");
	assert_eq!(response.headers.get("x-obj").unwrap(), r#"{"a":1}"#);
}

#[test]
fn multi_value_header_object_is_rejected() {
	let (response, body) = unwrap_body(r#"{"multiValueHeaders":{"x":{"a":1}}}"#);
	assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
	assert_eq!(&body[..], b"500: invalid multi header value object");
}

#[test]
fn multi_value_header_scalar_is_accepted_with_a_warning() {
	let (response, _) = unwrap_body(r#"{"multiValueHeaders":{"x":"lone"}}"#);
	assert_eq!(response.headers.get("x").unwrap(), "lone");
}

#[test]
fn base64_body_is_decoded() {
	// "hello" base64-encoded
	let (_, body) = unwrap_body(r#"{"body":"aGVsbG8=","isBase64Encoded":true}"#);
	assert_eq!(&body[..], b"hello");
}

#[test]
fn non_string_body_is_json_encoded() {
	let (_, body) = unwrap_body(r#"{"body":[1,2,3]}"#);
	assert_eq!(&body[..], b"[1,2,3]");
}

#[test]
fn rejects_the_request_path() {
	let transformer = ApiGatewayTransformer::default();
	let mut request = request_parts("GET", "/", &[]);
	let mut info = StreamInfo::default();
	let mut buf = BytesMut::new();
	let mut ctx = TransformCtx {
		direction: Direction::Request,
		request: &mut request,
		response: None,
		body: &mut buf,
		info: &mut info,
	};
	assert!(transformer.transform(&mut ctx).is_err());
}
