use chrono::{TimeZone, Utc};

use super::*;
use crate::http::tests_common::request_parts;

// https://docs.aws.amazon.com/general/latest/gr/signature-v4-test-suite.html
#[test]
fn reproduces_the_guide_signature() {
	let mut authenticator = AwsAuthenticator::new("service");
	authenticator.init(
		"AKIDEXAMPLE",
		"wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
		Some("session_token"),
	);

	let mut request = request_parts(
		"GET",
		"https://example.amazonaws.com/?Param1=value1&Param2=value2",
		&[],
	);
	let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
	let headers_to_sign = create_header_list(["host"]);
	let authorization = authenticator.sign_with_time(&mut request, &headers_to_sign, "us-east-1", now);

	assert_eq!(
		authorization,
		"AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
		 SignedHeaders=host;x-amz-date, \
		 Signature=b97d918cfa904a5beff61c982a1b6f458b799221646efd99d3219ec94cdf2500"
	);
	assert_eq!(
		request.headers.get("authorization").unwrap(),
		&authorization
	);
	assert_eq!(request.headers.get("x-amz-date").unwrap(), "20150830T123600Z");
	// the session token rides along but is not part of the signature
	assert_eq!(
		request.headers.get("x-amz-security-token").unwrap(),
		"session_token"
	);
}

#[test]
fn payload_hash_accumulates_incrementally() {
	let mut authenticator = AwsAuthenticator::new(SERVICE_LAMBDA);
	authenticator.init("accesskey", "secretkey", None);
	authenticator.update_payload_hash(b"\"abc\"");
	assert_eq!(
		authenticator.body_hex_sha(),
		"6cc43f858fbb763301637b5af970e2a46b46f461f27e5a0f41e009c59b827b25"
	);

	let mut chunked = AwsAuthenticator::new(SERVICE_LAMBDA);
	chunked.init("accesskey", "secretkey", None);
	chunked.update_payload_hash(b"\"ab");
	chunked.update_payload_hash(b"c\"");
	assert_eq!(
		chunked.body_hex_sha(),
		"6cc43f858fbb763301637b5af970e2a46b46f461f27e5a0f41e009c59b827b25"
	);
}

#[test]
fn empty_payload_hashes_to_the_well_known_value() {
	let authenticator = AwsAuthenticator::new(SERVICE_LAMBDA);
	assert_eq!(
		authenticator.body_hex_sha(),
		"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
	);
}

// the URL must be encoded a second time for AWS to accept ARN-style paths
#[test]
fn canonical_uri_is_double_encoded() {
	let path = "/2015-03-31/functions/arn%3Aaws%3Alambda%3Aus-east-1%3A\
	            123456789012%3Afunction%3Asome-function/invocations";
	let expected = "/2015-03-31/functions/arn%253Aaws%253Alambda%253Aus-east-1%253A\
	                123456789012%253Afunction%253Asome-function/invocations";
	assert_eq!(canonical_uri(path), expected);
}

#[test]
fn unreserved_characters_pass_through() {
	assert_eq!(canonical_uri("/a-b.c_d~e/f"), "/a-b.c_d~e/f");
}

#[test]
fn signing_without_a_session_token_omits_the_header() {
	let mut authenticator = AwsAuthenticator::new(SERVICE_LAMBDA);
	authenticator.init("access", "secret", None);
	let mut request = request_parts("POST", "https://lambda.us-east-1.amazonaws.com/x", &[]);
	let headers_to_sign = create_header_list(["host"]);
	authenticator.sign(&mut request, &headers_to_sign, "us-east-1");
	assert!(request.headers.get("x-amz-security-token").is_none());
	assert!(request.headers.get("authorization").is_some());
	assert!(request.headers.get("x-amz-date").is_some());
}
