use super::*;
use crate::*;
use crate::http::tests_common::{request_parts, response_parts};

fn request_matcher(yaml: &str) -> RequestMatcher {
	let local: LocalRequestMatcher = serde_yaml::from_str(yaml).unwrap();
	RequestMatcher::try_from(local).unwrap()
}

#[test]
fn prefix_match() {
	let matcher = request_matcher("prefix: /api\n");
	assert!(matcher.matches(&request_parts("GET", "/api/users", &[])));
	assert!(!matcher.matches(&request_parts("GET", "/other", &[])));
}

#[test]
fn exact_path_match_ignores_the_query() {
	let matcher = request_matcher("path: /api/users\n");
	assert!(matcher.matches(&request_parts("GET", "/api/users?x=1", &[])));
	assert!(!matcher.matches(&request_parts("GET", "/api/users/1", &[])));
}

#[test]
fn regex_path_match() {
	let matcher = request_matcher("regex: \"/users/\\\\d+\"\n");
	assert!(matcher.matches(&request_parts("GET", "/users/123", &[])));
	assert!(!matcher.matches(&request_parts("GET", "/users/abc", &[])));
}

#[test]
fn header_matchers() {
	let matcher = request_matcher(
		r#"
prefix: /
headers:
  - name: x-exact
    value: "yes"
  - name: x-re
    value: "v[0-9]+"
    regex: true
  - name: x-present
"#,
	);
	assert!(matcher.matches(&request_parts(
		"GET",
		"/",
		&[("x-exact", "yes"), ("x-re", "v2"), ("x-present", "anything")]
	)));
	assert!(!matcher.matches(&request_parts(
		"GET",
		"/",
		&[("x-exact", "no"), ("x-re", "v2"), ("x-present", "anything")]
	)));
	assert!(!matcher.matches(&request_parts(
		"GET",
		"/",
		&[("x-exact", "yes"), ("x-re", "v2")]
	)));
}

#[test]
fn inverted_header_match() {
	let matcher = request_matcher(
		r#"
headers:
  - name: x-skip
    invertMatch: true
"#,
	);
	assert!(matcher.matches(&request_parts("GET", "/", &[])));
	assert!(!matcher.matches(&request_parts("GET", "/", &[("x-skip", "1")])));
}

#[test]
fn query_parameter_matchers() {
	let matcher = request_matcher(
		r#"
queryParameters:
  - name: stage
    value: prod
  - name: version
    value: "v[0-9]+"
    regex: true
  - name: flag
"#,
	);
	assert!(matcher.matches(&request_parts("GET", "/x?stage=prod&version=v2&flag", &[])));
	assert!(!matcher.matches(&request_parts("GET", "/x?stage=dev&version=v2&flag", &[])));
	assert!(!matcher.matches(&request_parts("GET", "/x?stage=prod&version=v2", &[])));
}

#[test]
fn rejects_multiple_path_specifiers() {
	let local: LocalRequestMatcher =
		serde_yaml::from_str("prefix: /a\npath: /b\n").unwrap();
	assert!(RequestMatcher::try_from(local).is_err());
}

#[test]
fn response_matcher_with_no_expressions_always_matches() {
	let matcher = ResponseMatcher::try_from(LocalResponseMatcher::default()).unwrap();
	let info = StreamInfo::default();
	assert!(matcher.matches(&response_parts(500, &[]), &info));
}

#[test]
fn response_code_details_require_stream_details() {
	let matcher = ResponseMatcher::try_from(LocalResponseMatcher {
		headers: vec![],
		response_code_details: Some("via_upstream".to_string()),
	})
	.unwrap();
	let response = response_parts(200, &[]);

	// no details recorded on the stream defeats the match
	assert!(!matcher.matches(&response, &StreamInfo::default()));

	let mut info = StreamInfo::default();
	info.response_code_details = Some(strng::new("via_upstream"));
	assert!(matcher.matches(&response, &info));

	info.response_code_details = Some(strng::new("other"));
	assert!(!matcher.matches(&response, &info));
}

#[test]
fn response_matcher_headers() {
	let matcher = ResponseMatcher::try_from(LocalResponseMatcher {
		headers: vec![LocalHeaderMatcher {
			name: "x-amz-function-error".to_string(),
			value: None,
			regex: false,
			invert_match: false,
		}],
		response_code_details: None,
	})
	.unwrap();
	let info = StreamInfo::default();
	assert!(matcher.matches(
		&response_parts(200, &[("x-amz-function-error", "Unhandled")]),
		&info
	));
	assert!(!matcher.matches(&response_parts(200, &[]), &info));
}
