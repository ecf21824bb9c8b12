use super::*;
use crate::aws::credentials::{AwsConfig, LocalAwsConfig};
use crate::aws::sts::{CredentialsLookup, StsConfig, StsCredentials, StsCredentialsProvider};
use crate::http::path_and_query;
use crate::http::tests_common::{request_parts, response_parts};
use crate::telemetry::metrics::AwsStats;
use crate::*;

fn inline_config() -> Arc<AwsConfig> {
	AwsConfig::new(LocalAwsConfig::default(), AwsStats::default()).unwrap()
}

fn protocol_options() -> Arc<LambdaProtocolOptions> {
	Arc::new(
		serde_yaml::from_str(
			r#"
host: lambda.us-east-1.amazonaws.com
region: us-east-1
accessKey: access
secretKey: secret
"#,
		)
		.unwrap(),
	)
}

fn route(yaml: &str) -> Arc<LambdaRouteConfig> {
	let local: LocalLambdaRouteConfig = serde_yaml::from_str(yaml).unwrap();
	Arc::new(local.try_into().unwrap())
}

fn filter(route_config: Option<Arc<LambdaRouteConfig>>) -> AwsLambdaFilter {
	AwsLambdaFilter::new(inline_config(), protocol_options(), route_config)
}

#[tokio::test]
async fn rewrites_the_request_into_a_lambda_invocation() {
	let mut filter = filter(Some(route("name: func\nqualifier: v1\n")));
	let mut request = request_parts("GET", "/getsomething", &[]);
	let status = filter.on_request_headers(&mut request, true).unwrap();
	assert_eq!(status, crate::http::transformation::filter::FilterHeadersStatus::Continue);

	assert_eq!(
		path_and_query(&request),
		"/2015-03-31/functions/func/invocations?Qualifier=v1"
	);
	assert_eq!(request.method, crate::http::Method::POST);
	assert!(request.headers.get("authorization").is_some());
	assert!(request.headers.get("x-amz-date").is_some());
	assert_eq!(
		request.headers.get("x-amz-invocation-type").unwrap(),
		"RequestResponse"
	);
	assert_eq!(
		request.headers.get("host").unwrap(),
		"lambda.us-east-1.amazonaws.com"
	);
	assert_eq!(filter.state(), State::Complete);
}

#[tokio::test]
async fn async_invocation_uses_the_event_type() {
	let mut filter = filter(Some(route("name: func\nasync: true\n")));
	let mut request = request_parts("GET", "/getsomething", &[]);
	filter.on_request_headers(&mut request, true).unwrap();
	assert_eq!(
		path_and_query(&request),
		"/2015-03-31/functions/func/invocations"
	);
	assert_eq!(
		request.headers.get("x-amz-invocation-type").unwrap(),
		"Event"
	);
}

#[tokio::test]
async fn missing_route_is_a_404() {
	let mut filter = filter(None);
	let mut request = request_parts("GET", "/", &[]);
	let reply = filter.on_request_headers(&mut request, true).unwrap_err();
	assert_eq!(reply.status, crate::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn body_is_hashed_before_signing() {
	let mut filter = filter(Some(route("name: func\n")));
	let mut request = request_parts("POST", "/invoke", &[]);
	let status = filter.on_request_headers(&mut request, false).unwrap();
	assert_eq!(
		status,
		crate::http::transformation::filter::FilterHeadersStatus::StopIteration
	);
	let status = filter
		.on_request_data(&mut request, b"{\"key\":\"value\"}", true)
		.unwrap();
	assert_eq!(
		status,
		crate::http::transformation::filter::FilterDataStatus::Continue
	);
	assert!(request.headers.get("authorization").is_some());
	assert_eq!(filter.state(), State::Complete);
}

#[tokio::test]
async fn empty_body_override_is_substituted_and_hashed() {
	let mut filter = filter(Some(route(
		"name: func\nemptyBodyOverride: \"{\\\"default\\\": true}\"\n",
	)));
	let mut request = request_parts("GET", "/", &[]);
	filter.on_request_headers(&mut request, true).unwrap();
	let body = filter.take_default_body().unwrap();
	assert_eq!(&body[..], b"{\"default\": true}");
	assert_eq!(
		request.headers.get("content-length").unwrap(),
		&body.len().to_string()
	);
}

#[tokio::test]
async fn parked_request_signs_once_credentials_arrive() {
	// a filter whose credentials come from a pending STS lookup
	let config = inline_config();
	let options = Arc::new(
		serde_yaml::from_str::<LambdaProtocolOptions>(
			"host: lambda.us-east-1.amazonaws.com\nregion: us-east-1\n",
		)
		.unwrap(),
	);
	let mut filter = AwsLambdaFilter::new(config, options, Some(route("name: func\n")));

	struct NeverFetcher;
	#[async_trait::async_trait]
	impl crate::aws::sts::StsFetcher for NeverFetcher {
		async fn fetch(
			&self,
			_request: crate::aws::sts::StsFetchRequest,
		) -> Result<StsCredentials, CredentialsError> {
			std::future::pending().await
		}
	}
	let provider = StsCredentialsProvider::new(
		StsConfig::default(),
		Arc::new(NeverFetcher),
		"tok",
		strng::literal!("role"),
	);
	let CredentialsLookup::Pending(context) = provider.find(None, false) else {
		panic!();
	};
	filter.context = Some(context);
	filter.state = State::Calling;

	let mut request = request_parts("POST", "/invoke", &[]);
	let status = filter.on_request_data(&mut request, b"data", true).unwrap();
	assert_eq!(
		status,
		crate::http::transformation::filter::FilterDataStatus::StopIterationNoBuffer
	);

	// complete the fetch through the provider internals
	let sts_credentials = StsCredentials {
		credentials: Credentials::new("AKIA", "secret", Some("token".to_string())),
		expiration: SystemTime::now() + Duration::from_secs(3600),
	};
	provider.complete_for_tests(strng::literal!("role"), sts_credentials);

	filter.on_credentials(&mut request).await.unwrap();
	assert!(request.headers.get("authorization").is_some());
	assert!(request.headers.get("x-amz-security-token").is_some());
	assert_eq!(filter.state(), State::Complete);
}

#[tokio::test]
async fn cancelled_stream_never_signs() {
	let config = inline_config();
	let options = Arc::new(
		serde_yaml::from_str::<LambdaProtocolOptions>(
			"host: lambda.us-east-1.amazonaws.com\nregion: us-east-1\n",
		)
		.unwrap(),
	);
	let mut filter = AwsLambdaFilter::new(config, options, Some(route("name: func\n")));
	filter.state = State::Calling;
	filter.on_destroy();
	assert_eq!(filter.state(), State::Destroyed);
	// destroying twice is harmless
	filter.on_destroy();
}

#[tokio::test]
async fn function_error_remaps_to_gateway_timeout() {
	let mut filter = filter(Some(route("name: func\n")));
	let mut request = request_parts("GET", "/", &[]);
	let mut response = response_parts(200, &[("x-amz-function-error", "Unhandled")]);
	filter.on_response_headers(&mut request, &mut response, true);
	assert_eq!(response.status, crate::http::StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn alb_envelope_is_unwrapped() {
	let mut filter = filter(Some(route("name: func\nunwrapAsAlb: true\n")));
	let mut request = request_parts("GET", "/", &[]);
	let mut response = response_parts(200, &[]);
	let status = filter.on_response_headers(&mut request, &mut response, false);
	assert_eq!(
		status,
		crate::http::transformation::filter::FilterHeadersStatus::StopIteration
	);
	let envelope =
		br#"{"statusCode":201,"headers":{"x-custom":"yes"},"body":"hello","isBase64Encoded":false}"#;
	let status = filter.on_response_data(&mut request, &mut response, envelope, true);
	assert_eq!(
		status,
		crate::http::transformation::filter::FilterDataStatus::Continue
	);
	assert_eq!(response.status, crate::http::StatusCode::CREATED);
	assert_eq!(response.headers.get("x-custom").unwrap(), "yes");
	assert_eq!(&filter.take_response_body()[..], b"hello");
}

#[tokio::test]
async fn invalid_alb_envelope_is_a_500() {
	let mut filter = filter(Some(route("name: func\nunwrapAsAlb: true\n")));
	let mut request = request_parts("GET", "/", &[]);
	let mut response = response_parts(200, &[]);
	filter.on_response_headers(&mut request, &mut response, false);
	filter.on_response_data(&mut request, &mut response, b"not json", true);
	assert_eq!(
		response.status,
		crate::http::StatusCode::INTERNAL_SERVER_ERROR
	);
}

#[tokio::test]
async fn route_transformer_decodes_the_api_gateway_envelope() {
	let mut filter = filter(Some(route(
		"name: func\ntransformerConfig:\n  apiGatewayTransformation: {}\n",
	)));
	let mut request = request_parts("GET", "/", &[]);
	let mut response = response_parts(200, &[]);
	let status = filter.on_response_headers(&mut request, &mut response, false);
	assert_eq!(
		status,
		crate::http::transformation::filter::FilterHeadersStatus::StopIteration
	);
	let envelope = br#"{"statusCode":200,"headers":{"content-type":"application/json"},"body":"ok"}"#;
	filter.on_response_data(&mut request, &mut response, envelope, true);
	assert_eq!(
		response.headers.get("content-type").unwrap(),
		"application/json"
	);
	assert_eq!(&filter.take_response_body()[..], b"ok");
}
