use bytes::BytesMut;
use secrecy::SecretString;

use crate::aws::credentials::{AwsConfig, CredentialsSource};
use crate::aws::sign::{AwsAuthenticator, HOST_HEADER, SERVICE_LAMBDA, create_header_list};
use crate::aws::sts::StsContext;
use crate::aws::{Credentials, CredentialsError};
use crate::http::transformation::filter::{FilterDataStatus, FilterHeadersStatus, LocalReply};
use crate::http::transformation::{
	ApiGatewayTransformer, Direction, StreamInfo, TransformCtx, Transformer,
};
use crate::http::{
	HeaderName, HeaderValue, Method, RequestParts, ResponseParts, StatusCode, header, set_path,
};
use crate::*;

pub const INVOCATION_TYPE_HEADER: HeaderName = HeaderName::from_static("x-amz-invocation-type");
pub const FUNCTION_ERROR_HEADER: HeaderName = HeaderName::from_static("x-amz-function-error");

const INVOCATION_TYPE_EVENT: &str = "Event";
const INVOCATION_TYPE_REQUEST_RESPONSE: &str = "RequestResponse";

/// Upstream connection options for a Lambda cluster: where to send the
/// invocation and, optionally, inline credentials or a role override.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LambdaProtocolOptions {
	pub host: Strng,
	pub region: Strng,
	#[serde(default)]
	pub access_key: Option<SecretString>,
	#[serde(default)]
	pub secret_key: Option<SecretString>,
	#[serde(default)]
	pub session_token: Option<SecretString>,
	#[serde(default)]
	pub role_arn: Option<Strng>,
	#[serde(default)]
	pub disable_role_chaining: bool,
}

/// Per-route Lambda function selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalLambdaRouteConfig {
	pub name: Strng,
	#[serde(default)]
	pub qualifier: Strng,
	#[serde(default, rename = "async")]
	pub async_invoke: bool,
	#[serde(default)]
	pub empty_body_override: Option<String>,
	#[serde(default)]
	pub unwrap_as_alb: bool,
	/// Response transformer, typically the API gateway envelope decoder.
	#[serde(default)]
	pub transformer_config: Option<crate::http::transformation::LocalTransformer>,
}

pub struct LambdaRouteConfig {
	pub name: Strng,
	pub qualifier: Strng,
	pub async_invoke: bool,
	pub empty_body_override: Option<String>,
	pub unwrap_as_alb: bool,
	pub transformer: Option<Arc<Transformer>>,
}

impl TryFrom<LocalLambdaRouteConfig> for LambdaRouteConfig {
	type Error = anyhow::Error;

	fn try_from(value: LocalLambdaRouteConfig) -> Result<Self, Self::Error> {
		let transformer = value
			.transformer_config
			.map(Transformer::try_from)
			.transpose()?
			.map(Arc::new);
		Ok(LambdaRouteConfig {
			name: value.name,
			qualifier: value.qualifier,
			async_invoke: value.async_invoke,
			empty_body_override: value.empty_body_override,
			unwrap_as_alb: value.unwrap_as_alb,
			transformer,
		})
	}
}

impl LambdaRouteConfig {
	pub fn function_url_path(&self) -> String {
		if self.qualifier.is_empty() {
			format!("/2015-03-31/functions/{}/invocations", self.name)
		} else {
			format!(
				"/2015-03-31/functions/{}/invocations?Qualifier={}",
				self.name, self.qualifier
			)
		}
	}

	fn buffers_response(&self) -> bool {
		self.unwrap_as_alb || self.transformer.is_some()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Init,
	/// Parked waiting for STS credentials.
	Calling,
	Responded,
	Complete,
	Destroyed,
}

/// Per-stream Lambda filter: rewrites the request into a Lambda invocation,
/// waits for credentials when they have to be fetched, signs with SigV4, and
/// optionally unwraps an ALB-style response envelope on the way back.
pub struct AwsLambdaFilter {
	config: Arc<AwsConfig>,
	protocol_options: Arc<LambdaProtocolOptions>,
	route: Option<Arc<LambdaRouteConfig>>,
	authenticator: AwsAuthenticator,
	state: State,
	credentials: Option<Arc<Credentials>>,
	context: Option<StsContext>,
	end_stream_seen: bool,
	has_body: bool,
	default_body: Option<Bytes>,
	response_body: BytesMut,
	unwrapping_response: bool,
}

impl AwsLambdaFilter {
	pub fn new(
		config: Arc<AwsConfig>,
		protocol_options: Arc<LambdaProtocolOptions>,
		route: Option<Arc<LambdaRouteConfig>>,
	) -> Self {
		AwsLambdaFilter {
			config,
			protocol_options,
			route,
			authenticator: AwsAuthenticator::new(SERVICE_LAMBDA),
			state: State::Init,
			credentials: None,
			context: None,
			end_stream_seen: false,
			has_body: false,
			default_body: None,
			response_body: BytesMut::new(),
			unwrapping_response: false,
		}
	}

	pub fn state(&self) -> State {
		self.state
	}

	pub fn on_destroy(&mut self) {
		self.state = State::Destroyed;
		// a cancelled context never invokes its callbacks
		if let Some(mut context) = self.context.take() {
			context.cancel();
		}
	}

	pub fn on_request_headers(
		&mut self,
		request: &mut RequestParts,
		end_stream: bool,
	) -> Result<FilterHeadersStatus, LocalReply> {
		if self.route.is_none() {
			return Err(local_reply(
				StatusCode::NOT_FOUND,
				"no function present for AWS upstream",
			));
		}
		self.end_stream_seen = end_stream;
		match self.config.get_credentials(&self.protocol_options) {
			Ok(CredentialsSource::Ready(credentials)) => {
				self.credentials = Some(credentials);
				if end_stream {
					self.lambdafy(request)?;
					return Ok(FilterHeadersStatus::Continue);
				}
				// the signature covers the payload hash, so the headers hold
				// until the body is complete
				Ok(FilterHeadersStatus::StopIteration)
			},
			Ok(CredentialsSource::Pending(context)) => {
				self.context = Some(context);
				self.state = State::Calling;
				Ok(FilterHeadersStatus::StopIteration)
			},
			Err(e) => Err(credentials_local_reply(e)),
		}
	}

	pub fn on_request_data(
		&mut self,
		request: &mut RequestParts,
		data: &[u8],
		end_stream: bool,
	) -> Result<FilterDataStatus, LocalReply> {
		if !data.is_empty() {
			self.has_body = true;
			self.authenticator.update_payload_hash(data);
		}
		if end_stream {
			self.end_stream_seen = true;
			if self.state == State::Calling {
				// credentials are still in flight; they release the stream
				return Ok(FilterDataStatus::StopIterationNoBuffer);
			}
			self.lambdafy(request)?;
			return Ok(FilterDataStatus::Continue);
		}
		Ok(FilterDataStatus::StopIterationNoBuffer)
	}

	/// Awaits the parked credentials fetch. When end of stream was already
	/// seen the payload hash is finalized and the request signed here.
	pub async fn on_credentials(&mut self, request: &mut RequestParts) -> Result<(), LocalReply> {
		let Some(context) = self.context.take() else {
			return Ok(());
		};
		match context.wait().await {
			Ok(sts_credentials) => {
				if self.state == State::Destroyed {
					return Ok(());
				}
				self.credentials = Some(Arc::new(sts_credentials.credentials.clone()));
				self.state = State::Init;
				if self.end_stream_seen {
					self.lambdafy(request)?;
				}
				Ok(())
			},
			// pool teardown; the stream is going away without a reply
			Err(CredentialsError::ContextCancelled) => Ok(()),
			Err(e) => Err(credentials_local_reply(e)),
		}
	}

	/// Turn the buffered request into a signed Lambda invocation.
	fn lambdafy(&mut self, request: &mut RequestParts) -> Result<(), LocalReply> {
		let Some(route) = self.route.clone() else {
			return Err(local_reply(
				StatusCode::NOT_FOUND,
				"no function present for AWS upstream",
			));
		};
		let Some(credentials) = self.credentials.clone() else {
			return Err(credentials_local_reply(CredentialsError::InvalidSts));
		};

		self.handle_default_body(request, &route);

		set_path(request, &route.function_url_path()).map_err(|e| {
			local_reply(
				StatusCode::INTERNAL_SERVER_ERROR,
				&format!("invalid lambda function path: {e}"),
			)
		})?;
		request.method = Method::POST;

		let invocation_type = if route.async_invoke {
			INVOCATION_TYPE_EVENT
		} else {
			INVOCATION_TYPE_REQUEST_RESPONSE
		};
		request.headers.insert(
			INVOCATION_TYPE_HEADER,
			HeaderValue::from_static(invocation_type),
		);

		let host = self.protocol_options.host.clone();
		let _ = crate::http::modify_uri(request, |uri| {
			uri.authority = Some(host.as_str().parse()?);
			Ok(())
		});
		if let Ok(value) = HeaderValue::from_str(&self.protocol_options.host) {
			request.headers.insert(header::HOST, value);
		}

		self.authenticator.init(
			&credentials.access_key_id,
			&credentials.secret_access_key,
			credentials.session_token.as_deref(),
		);
		let headers_to_sign = create_header_list([HOST_HEADER, INVOCATION_TYPE_HEADER.as_str()]);
		self
			.authenticator
			.sign(request, &headers_to_sign, &self.protocol_options.region);
		self.state = State::Complete;
		Ok(())
	}

	fn handle_default_body(&mut self, request: &mut RequestParts, route: &LambdaRouteConfig) {
		if self.has_body {
			return;
		}
		let Some(default_body) = &route.empty_body_override else {
			return;
		};
		self.authenticator.update_payload_hash(default_body.as_bytes());
		self.has_body = true;
		self.default_body = Some(Bytes::copy_from_slice(default_body.as_bytes()));
		request.headers.insert(
			header::CONTENT_LENGTH,
			HeaderValue::from(default_body.len() as u64),
		);
	}

	/// Body the host must append to the upstream request when the route
	/// substitutes one for an empty stream.
	pub fn take_default_body(&mut self) -> Option<Bytes> {
		self.default_body.take()
	}

	pub fn on_response_headers(
		&mut self,
		request: &mut RequestParts,
		response: &mut ResponseParts,
		end_stream: bool,
	) -> FilterHeadersStatus {
		self.state = State::Responded;
		// a function error is an upstream failure, not a client response
		if response.headers.contains_key(&FUNCTION_ERROR_HEADER) {
			response.status = StatusCode::GATEWAY_TIMEOUT;
		}
		if !self.route.as_ref().is_some_and(|r| r.buffers_response()) {
			self.state = State::Complete;
			return FilterHeadersStatus::Continue;
		}
		if !end_stream {
			self.unwrapping_response = true;
			return FilterHeadersStatus::StopIteration;
		}
		self.finalize_response(request, response);
		FilterHeadersStatus::Continue
	}

	pub fn on_response_data(
		&mut self,
		request: &mut RequestParts,
		response: &mut ResponseParts,
		data: &[u8],
		end_stream: bool,
	) -> FilterDataStatus {
		if !self.unwrapping_response {
			return FilterDataStatus::Continue;
		}
		self.response_body.extend_from_slice(data);
		if end_stream {
			self.finalize_response(request, response);
			return FilterDataStatus::Continue;
		}
		FilterDataStatus::StopIterationNoBuffer
	}

	fn finalize_response(&mut self, request: &mut RequestParts, response: &mut ResponseParts) {
		let route = self.route.clone();
		let mut body = std::mem::take(&mut self.response_body);
		if let Some(route) = route {
			if route.unwrap_as_alb {
				ApiGatewayTransformer::transform_response(response, &mut body);
			} else if let Some(transformer) = &route.transformer {
				let mut info = StreamInfo::default();
				let mut ctx = TransformCtx {
					direction: Direction::Response,
					request,
					response: Some(response),
					body: &mut body,
					info: &mut info,
				};
				if let Err(e) = transformer.transform(&mut ctx) {
					debug!("failure transforming lambda response: {e}");
				}
			}
		}
		self.response_body = body;
		self.state = State::Complete;
	}

	pub fn take_response_body(&mut self) -> Bytes {
		std::mem::take(&mut self.response_body).freeze()
	}
}

fn local_reply(status: StatusCode, body: &str) -> LocalReply {
	LocalReply {
		status,
		body: body.to_string(),
		details: strng::literal!("aws_lambda_filter_error"),
	}
}

fn credentials_local_reply(error: CredentialsError) -> LocalReply {
	debug!("credentials failure: {error}");
	LocalReply {
		status: StatusCode::INTERNAL_SERVER_ERROR,
		body: "Internal Server Error".to_string(),
		details: strng::literal!("aws_lambda_filter_error"),
	}
}

#[cfg(test)]
#[path = "lambda_tests.rs"]
mod tests;
