use bytes::BytesMut;
use serde_json::{Value, json};

use super::*;
use crate::http::RequestParts;
use crate::http::tests_common::{request_parts, response_parts};
use crate::http::transformation::{Direction, StreamInfo, TransformCtx};

fn transformer(yaml: &str) -> InjaTransformer {
	let local: LocalTransformationTemplate = serde_yaml::from_str(yaml).unwrap();
	InjaTransformer::try_from(local).unwrap()
}

fn apply_request(
	transformer: &InjaTransformer,
	request: &mut RequestParts,
	body: &str,
) -> (Result<(), TransformationError>, BytesMut, StreamInfo) {
	let mut info = StreamInfo::default();
	let mut buf = BytesMut::from(body.as_bytes());
	let result = {
		let mut ctx = TransformCtx {
			direction: Direction::Request,
			request,
			response: None,
			body: &mut buf,
			info: &mut info,
		};
		transformer.transform(&mut ctx)
	};
	(result, buf, info)
}

#[test]
fn header_extraction_into_body_and_header_write() {
	let transformer = transformer(
		r#"
advancedTemplates: true
extractors:
  ext1:
    header: ":path"
    regex: "/users/(\\d+)"
    subgroup: 1
headers:
  x-header:
    text: "ABC"
body:
  text: '{{extraction("ext1")}}{{a}}{{header("x-test")}}'
"#,
	);
	let mut request = request_parts("GET", "/users/123", &[("x-test", "789")]);
	let (result, body, _) = apply_request(&transformer, &mut request, r#"{"a":"456"}"#);
	result.unwrap();
	assert_eq!(&body[..], b"123456789");
	assert_eq!(request.headers.get("x-header").unwrap(), "ABC");
	assert_eq!(request.headers.get("content-length").unwrap(), "9");
}

#[test]
fn non_advanced_extraction_merges_into_body_json() {
	let transformer = transformer(
		r#"
extractors:
  ext1:
    header: ":path"
    regex: "/users/(\\d+)"
    subgroup: 1
  nested.ext:
    header: ":path"
    regex: "/users/(\\d+)"
    subgroup: 1
mergeExtractorsToBody: {}
"#,
	);
	let mut request = request_parts("GET", "/users/123", &[]);
	let (result, body, _) = apply_request(&transformer, &mut request, r#"{"a":1}"#);
	result.unwrap();
	let parsed: Value = serde_json::from_slice(&body).unwrap();
	assert_eq!(
		parsed,
		json!({"a": 1, "ext1": "123", "nested": {"ext": "123"}})
	);
}

#[test]
fn empty_render_removes_header_and_append_never_replaces() {
	let transformer = transformer(
		r#"
headers:
  x-remove:
    text: ""
headersToAppend:
  - key: x-multi
    value:
      text: "b"
headersToRemove:
  - x-gone
"#,
	);
	let mut request = request_parts(
		"GET",
		"/",
		&[("x-remove", "old"), ("x-gone", "x"), ("x-multi", "a")],
	);
	let (result, _, _) = apply_request(&transformer, &mut request, "");
	result.unwrap();
	assert!(request.headers.get("x-remove").is_none());
	assert!(request.headers.get("x-gone").is_none());
	let values: Vec<_> = request.headers.get_all("x-multi").iter().collect();
	assert_eq!(values, vec!["a", "b"]);
}

#[test]
fn dynamic_metadata_json_parsing_with_fallback() {
	let transformer = transformer(
		r#"
dynamicMetadataValues:
  - key: parsed
    value:
      text: '{"a": 1}'
    jsonToProto: true
  - key: plain
    value:
      text: "not json"
    jsonToProto: true
  - key: stringly
    value:
      text: '{"a": 1}'
  - key: skipped
    value:
      text: ""
  - metadataNamespace: other
    key: scoped
    value:
      text: "v"
"#,
	);
	let mut request = request_parts("GET", "/", &[]);
	let (result, _, info) = apply_request(&transformer, &mut request, "");
	result.unwrap();
	let dm = &info.dynamic_metadata;
	assert_eq!(dm.value(FILTER_NAMESPACE, "parsed"), Some(&json!({"a": 1})));
	assert_eq!(dm.value(FILTER_NAMESPACE, "plain"), Some(&json!("not json")));
	assert_eq!(
		dm.value(FILTER_NAMESPACE, "stringly"),
		Some(&json!("{\"a\": 1}"))
	);
	assert_eq!(dm.value(FILTER_NAMESPACE, "skipped"), None);
	assert_eq!(dm.value("other", "scoped"), Some(&json!("v")));
}

#[test]
fn merge_json_keys_respects_override_empty() {
	let transformer = transformer(
		r#"
mergeJsonKeys:
  jsonKeys:
    a.b:
      tmpl:
        text: '"new"'
    empty:
      tmpl:
        text: ""
    forced:
      overrideEmpty: true
      tmpl:
        text: ""
"#,
	);
	let mut request = request_parts("POST", "/", &[]);
	let (result, body, _) =
		apply_request(&transformer, &mut request, r#"{"a":{"b":"old"},"keep":1}"#);
	result.unwrap();
	let parsed: Value = serde_json::from_slice(&body).unwrap();
	assert_eq!(parsed, json!({"a": {"b": "new"}, "keep": 1, "forced": ""}));
}

#[test]
fn merge_json_keys_requires_body_parsing() {
	let local: LocalTransformationTemplate = serde_yaml::from_str(
		r#"
parseBodyBehavior: dontParse
mergeJsonKeys:
  jsonKeys: {}
"#,
	)
	.unwrap();
	assert!(InjaTransformer::try_from(local).is_err());
}

#[test]
fn invalid_json_body_is_an_error_unless_ignored() {
	let strict = transformer("body:\n  text: \"x\"\n");
	let mut request = request_parts("POST", "/", &[]);
	let (result, body, _) = apply_request(&strict, &mut request, "not json");
	assert!(matches!(result, Err(TransformationError::JsonParse(_))));
	// the stream is left untouched for the local reply
	assert_eq!(&body[..], b"not json");

	let lenient = transformer("ignoreErrorOnParse: true\nbody:\n  text: \"x\"\n");
	let mut request = request_parts("POST", "/", &[]);
	let (result, body, _) = apply_request(&lenient, &mut request, "not json");
	result.unwrap();
	assert_eq!(&body[..], b"x");
}

#[test]
fn passthrough_leaves_the_body_alone() {
	let transformer = transformer("passthrough: {}\n");
	assert!(transformer.passthrough_body());
	let mut request = request_parts("POST", "/", &[]);
	let (result, body, _) = apply_request(&transformer, &mut request, r#"{"a":1}"#);
	result.unwrap();
	assert_eq!(&body[..], br#"{"a":1}"#);
	assert!(request.headers.get("content-length").is_none());
}

#[test]
fn render_failure_restores_the_request() {
	let transformer = transformer("body:\n  text: '{{ bogus() }}'\n");
	let mut request = request_parts("POST", "/", &[("x-keep", "1")]);
	let (result, body, _) = apply_request(&transformer, &mut request, r#"{"a":1}"#);
	assert!(matches!(result, Err(TransformationError::Template(_))));
	assert_eq!(request.headers.get("x-keep").unwrap(), "1");
	assert_eq!(&body[..], br#"{"a":1}"#);
}

#[test]
fn response_transform_reads_request_headers() {
	let transformer = transformer(
		r#"
headers:
  x-from-request:
    text: '{{ request_header("x-req") }}-{{ header(":status") }}'
"#,
	);
	let mut request = request_parts("GET", "/", &[("x-req", "abc")]);
	let mut response = response_parts(200, &[]);
	let mut info = StreamInfo::default();
	let mut body = BytesMut::new();
	{
		let mut ctx = TransformCtx {
			direction: Direction::Response,
			request: &mut request,
			response: Some(&mut response),
			body: &mut body,
			info: &mut info,
		};
		transformer.transform(&mut ctx).unwrap();
	}
	assert_eq!(response.headers.get("x-from-request").unwrap(), "abc-200");
	// the request map is handed back untouched
	assert_eq!(request.headers.get("x-req").unwrap(), "abc");
}

#[test]
fn later_header_templates_observe_earlier_writes() {
	let transformer = transformer(
		r#"
headers:
  a-first:
    text: "one"
  b-second:
    text: '{{ header("a-first") }}-two'
"#,
	);
	let mut request = request_parts("GET", "/", &[]);
	let (result, _, _) = apply_request(&transformer, &mut request, "");
	result.unwrap();
	assert_eq!(request.headers.get("b-second").unwrap(), "one-two");
}

#[test]
fn body_extraction_feeds_header_templates() {
	let transformer = transformer(
		r#"
advancedTemplates: true
extractors:
  user:
    body: {}
    regex: "\\{\"user\":\"(\\w+)\"\\}"
    subgroup: 1
headers:
  x-user:
    text: '{{ extraction("user") }}'
passthrough: {}
"#,
	);
	let mut request = request_parts("POST", "/", &[]);
	let (result, body, _) = apply_request(&transformer, &mut request, r#"{"user":"alice"}"#);
	result.unwrap();
	assert_eq!(request.headers.get("x-user").unwrap(), "alice");
	assert_eq!(&body[..], br#"{"user":"alice"}"#);
}

#[test]
fn destructive_extraction_rewrites_into_the_template() {
	let transformer = transformer(
		r#"
advancedTemplates: true
parseBodyBehavior: dontParse
extractors:
  masked:
    header: ":path"
    regex: "/accounts/(\\d+)"
    subgroup: 1
    mode: SINGLE_REPLACE
    replacementText: "masked"
headers:
  x-masked-path:
    text: '{{ extraction("masked") }}'
"#,
	);
	let mut request = request_parts("GET", "/accounts/12345", &[]);
	let (result, _, _) = apply_request(&transformer, &mut request, "");
	result.unwrap();
	assert_eq!(
		request.headers.get("x-masked-path").unwrap(),
		"/accounts/masked"
	);
}

#[test]
fn destructive_extraction_lands_in_the_body_when_not_advanced() {
	let transformer = transformer(
		r#"
extractors:
  cleaned:
    header: ":path"
    regex: "\\d+"
    mode: REPLACE_ALL
    replacementText: "N"
mergeExtractorsToBody: {}
"#,
	);
	let mut request = request_parts("GET", "/a1/b22", &[]);
	let (result, body, _) = apply_request(&transformer, &mut request, "{}");
	result.unwrap();
	let parsed: Value = serde_json::from_slice(&body).unwrap();
	assert_eq!(parsed, json!({"cleaned": "/aN/bN"}));
}

#[test]
fn environment_is_snapshotted_per_transformer() {
	// PATH is present in any sane test environment
	let transformer = transformer(
		r#"
headers:
  x-has-path:
    text: '{{ substring(env("PATH"), 0, 1) }}'
"#,
	);
	let mut request = request_parts("GET", "/", &[]);
	let (result, _, _) = apply_request(&transformer, &mut request, "");
	result.unwrap();
	assert!(request.headers.get("x-has-path").is_some());
}

#[test]
fn rejects_bad_templates_naming_the_key() {
	let local: LocalTransformationTemplate = serde_yaml::from_str(
		r#"
headers:
  x-bad:
    text: "{{ unclosed"
"#,
	)
	.unwrap();
	let err = InjaTransformer::try_from(local).unwrap_err().to_string();
	assert!(err.contains("x-bad"), "{err}");
}
