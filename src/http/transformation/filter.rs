use bytes::BytesMut;

use crate::http::transformation::{
	Direction, FilterConfig, RouteConfig, StreamInfo, TransformCtx, TransformationError,
	Transformer, TransformerPair,
};
use crate::http::{
	HeaderValue, RequestParts, ResponseParts, StatusCode, empty_response_parts, header,
};
use crate::*;

pub const TRANSFORMATION_FILTER_DETAILS: &str = "transformation_filter_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
	Continue,
	StopIteration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
	Continue,
	StopIterationNoBuffer,
}

/// A synthesized downstream response replacing the proxied one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReply {
	pub status: StatusCode,
	pub body: String,
	pub details: Strng,
}

/// Per-stream driver for the transformation filter: buffers bodies up to the
/// configured limits, selects the transformer pair, invokes transformations
/// at the right stream boundaries, and surfaces errors as local replies.
///
/// One instance per stream; never shared across streams.
pub struct TransformationFilter {
	config: Arc<FilterConfig>,
	route_config: Option<Arc<RouteConfig>>,
	info: StreamInfo,

	decoder_buffer_limit: usize,
	encoder_buffer_limit: usize,
	request_body: BytesMut,
	response_body: BytesMut,

	request_transformation: Option<Arc<Transformer>>,
	response_transformation: Option<Arc<Transformer>>,
	on_stream_completion_transformation: Option<Arc<Transformer>>,
	should_clear_cache: bool,
	clear_route_cache_requested: bool,

	error: Option<TransformationError>,
	local_reply: Option<LocalReply>,
	destroyed: bool,
}

impl TransformationFilter {
	pub fn new(
		config: Arc<FilterConfig>,
		route_config: Option<Arc<RouteConfig>>,
		info: StreamInfo,
		decoder_buffer_limit: usize,
		encoder_buffer_limit: usize,
	) -> Self {
		TransformationFilter {
			config,
			route_config,
			info,
			decoder_buffer_limit,
			encoder_buffer_limit,
			request_body: BytesMut::new(),
			response_body: BytesMut::new(),
			request_transformation: None,
			response_transformation: None,
			on_stream_completion_transformation: None,
			should_clear_cache: false,
			clear_route_cache_requested: false,
			error: None,
			local_reply: None,
			destroyed: false,
		}
	}

	pub fn on_destroy(&mut self) {
		self.destroyed = true;
		self.reset_internal_state();
	}

	// decode path

	pub fn on_request_headers(
		&mut self,
		request: &mut RequestParts,
		end_stream: bool,
	) -> FilterHeadersStatus {
		self.setup_transformation_pair(request);
		if self.is_error() {
			return FilterHeadersStatus::StopIteration;
		}
		if !self.request_active() {
			return FilterHeadersStatus::Continue;
		}
		let passthrough = self
			.request_transformation
			.as_ref()
			.is_some_and(|t| t.passthrough_body());
		if end_stream || passthrough {
			self.config.stats.request_header_transformations.inc();
			self.transform_request(request);
			return if self.is_error() {
				FilterHeadersStatus::StopIteration
			} else {
				FilterHeadersStatus::Continue
			};
		}
		FilterHeadersStatus::StopIteration
	}

	pub fn on_request_data(
		&mut self,
		request: &mut RequestParts,
		data: &[u8],
		end_stream: bool,
	) -> FilterDataStatus {
		if !self.request_active() {
			return FilterDataStatus::Continue;
		}
		self.request_body.extend_from_slice(data);
		if self.decoder_buffer_limit != 0 && self.request_body.len() > self.decoder_buffer_limit {
			self.error(TransformationError::PayloadTooLarge);
			self.request_error();
			return FilterDataStatus::StopIterationNoBuffer;
		}
		if end_stream {
			self.config.stats.request_body_transformations.inc();
			self.transform_request(request);
			return if self.is_error() {
				FilterDataStatus::StopIterationNoBuffer
			} else {
				FilterDataStatus::Continue
			};
		}
		FilterDataStatus::StopIterationNoBuffer
	}

	pub fn on_request_trailers(&mut self, request: &mut RequestParts) -> FilterHeadersStatus {
		if self.request_active() {
			self.config.stats.request_body_transformations.inc();
			self.transform_request(request);
		}
		if self.is_error() {
			FilterHeadersStatus::StopIteration
		} else {
			FilterHeadersStatus::Continue
		}
	}

	// encode path

	pub fn on_response_headers(
		&mut self,
		request: &mut RequestParts,
		response: &mut ResponseParts,
		end_stream: bool,
	) -> FilterHeadersStatus {
		if self.response_transformation.is_none()
			&& let Some(route_config) = self.route_config.clone()
		{
			let config = route_config
				.stage(self.config.stage)
				.unwrap_or(&self.config.config);
			self.response_transformation = config.find_response_transform(response, &self.info);
		}

		if !self.response_active() {
			// also covers is_error(): an errored stream is never active
			return self.headers_status();
		}
		let passthrough = self
			.response_transformation
			.as_ref()
			.is_some_and(|t| t.passthrough_body());
		if end_stream || passthrough {
			self.config.stats.response_header_transformations.inc();
			self.transform_response(request, response);
			return self.headers_status();
		}
		FilterHeadersStatus::StopIteration
	}

	pub fn on_response_data(
		&mut self,
		request: &mut RequestParts,
		response: &mut ResponseParts,
		data: &[u8],
		end_stream: bool,
	) -> FilterDataStatus {
		if !self.response_active() {
			return self.data_status();
		}
		self.response_body.extend_from_slice(data);
		if self.encoder_buffer_limit != 0 && self.response_body.len() > self.encoder_buffer_limit {
			self.error(TransformationError::PayloadTooLarge);
			self.response_error(response);
			return self.data_status();
		}
		if end_stream {
			self.config.stats.response_body_transformations.inc();
			self.transform_response(request, response);
			return self.data_status();
		}
		FilterDataStatus::StopIterationNoBuffer
	}

	pub fn on_response_trailers(
		&mut self,
		request: &mut RequestParts,
		response: &mut ResponseParts,
	) -> FilterHeadersStatus {
		if self.response_active() {
			self.config.stats.response_body_transformations.inc();
			self.transform_response(request, response);
		}
		self.headers_status()
	}

	/// Invoked when the stream closes. Failures are logged and counted but
	/// never surfaced to the client.
	pub fn on_stream_complete(
		&mut self,
		request: &mut RequestParts,
		response: Option<&mut ResponseParts>,
	) {
		let Some(transformation) = self.on_stream_completion_transformation.take() else {
			return;
		};
		// the body is not part of access logs, so an empty one will do; a
		// missing response (downstream disconnect) gets an empty header map
		let mut synthesized = empty_response_parts();
		let response = match response {
			Some(r) => r,
			None => &mut synthesized,
		};
		let mut body = BytesMut::new();
		let mut ctx = TransformCtx {
			direction: Direction::Response,
			request,
			response: Some(response),
			body: &mut body,
			info: &mut self.info,
		};
		if let Err(e) = transformation.transform(&mut ctx) {
			debug!("failure transforming on stream completion: {e}");
			self.config.stats.on_stream_complete_error.inc();
		}
	}

	// accessors for the host

	pub fn take_local_reply(&mut self) -> Option<LocalReply> {
		self.local_reply.take()
	}

	pub fn take_request_body(&mut self) -> Bytes {
		std::mem::take(&mut self.request_body).freeze()
	}

	pub fn take_response_body(&mut self) -> Bytes {
		std::mem::take(&mut self.response_body).freeze()
	}

	/// Whether the matched pair asked for the route cache to be cleared
	/// after a request transformation ran.
	pub fn take_clear_route_cache(&mut self) -> bool {
		std::mem::take(&mut self.clear_route_cache_requested)
	}

	pub fn dynamic_metadata(&self) -> &super::Metadata {
		&self.info.dynamic_metadata
	}

	// internals

	fn setup_transformation_pair(&mut self, request: &RequestParts) {
		// a route-level staged config overrides the listener rules entirely
		let config_to_use = self
			.route_config
			.as_ref()
			.and_then(|rc| rc.stage(self.config.stage))
			.unwrap_or(&self.config.config);
		if let Some(pair) = config_to_use.find_transformers(request) {
			let TransformerPair {
				request,
				response,
				on_stream_completion,
				clear_route_cache,
			} = pair.as_ref();
			self.should_clear_cache = *clear_route_cache;
			self.request_transformation = request.clone();
			self.response_transformation = response.clone();
			self.on_stream_completion_transformation = on_stream_completion.clone();
		}
	}

	fn request_active(&self) -> bool {
		self.request_transformation.is_some() && !self.is_error() && !self.destroyed
	}

	fn response_active(&self) -> bool {
		self.response_transformation.is_some() && !self.is_error() && !self.destroyed
	}

	fn transform_request(&mut self, request: &mut RequestParts) {
		let Some(transformation) = self.request_transformation.take() else {
			return;
		};
		let passthrough = transformation.passthrough_body();
		if self.config.log_request_response_info {
			debug!("headers before transformation: {:?}", request.headers);
			debug!(
				"body before transformation: {}",
				String::from_utf8_lossy(&self.request_body)
			);
		}
		let mut ctx = TransformCtx {
			direction: Direction::Request,
			request,
			response: None,
			body: &mut self.request_body,
			info: &mut self.info,
		};
		match transformation.transform(&mut ctx) {
			Ok(()) => {
				if ctx.body.is_empty() && !passthrough {
					// an empty body is a transformation result here, so the
					// content type no longer applies
					ctx.active_headers().remove(header::CONTENT_TYPE);
				}
			},
			Err(e) => {
				debug!("failure transforming request: {e}");
				self.error(e);
			},
		}
		if self.config.log_request_response_info {
			debug!("headers after transformation: {:?}", request.headers);
			debug!(
				"body after transformation: {}",
				String::from_utf8_lossy(&self.request_body)
			);
		}
		if self.is_error() {
			self.request_error();
		} else if self.should_clear_cache {
			self.clear_route_cache_requested = true;
		}
	}

	fn transform_response(&mut self, request: &mut RequestParts, response: &mut ResponseParts) {
		let Some(transformation) = self.response_transformation.take() else {
			return;
		};
		let passthrough = transformation.passthrough_body();
		if self.config.log_request_response_info {
			debug!("headers before transformation: {:?}", response.headers);
			debug!(
				"body before transformation: {}",
				String::from_utf8_lossy(&self.response_body)
			);
		}
		let mut ctx = TransformCtx {
			direction: Direction::Response,
			request,
			response: Some(response),
			body: &mut self.response_body,
			info: &mut self.info,
		};
		match transformation.transform(&mut ctx) {
			Ok(()) => {
				if ctx.body.is_empty() && !passthrough {
					ctx.active_headers().remove(header::CONTENT_TYPE);
				}
			},
			Err(e) => {
				debug!("failure transforming response: {e}");
				self.error(e);
			},
		}
		if self.is_error() {
			self.response_error(response);
		}
	}

	fn error(&mut self, error: TransformationError) {
		self.reset_internal_state();
		self.error = Some(error);
	}

	fn is_error(&self) -> bool {
		self.error.is_some()
	}

	fn request_error(&mut self) {
		let Some(error) = self.error.as_ref() else {
			return;
		};
		self.config.stats.request_error.inc();
		self.local_reply = Some(LocalReply {
			status: error.status(),
			body: error.to_string(),
			details: strng::new(TRANSFORMATION_FILTER_DETAILS),
		});
	}

	fn response_error(&mut self, response: &mut ResponseParts) {
		let Some(error) = self.error.as_ref() else {
			return;
		};
		self.config.stats.response_error.inc();
		response.status = error.status();
		let body = error.to_string();
		response.headers.remove(header::CONTENT_TYPE);
		response.headers.insert(
			header::CONTENT_LENGTH,
			HeaderValue::from(body.len() as u64),
		);
		self.response_body = BytesMut::from(body.as_bytes());
	}

	fn reset_internal_state(&mut self) {
		self.request_body.clear();
		self.response_body.clear();
	}

	fn headers_status(&self) -> FilterHeadersStatus {
		if self.destroyed {
			FilterHeadersStatus::StopIteration
		} else {
			FilterHeadersStatus::Continue
		}
	}

	fn data_status(&self) -> FilterDataStatus {
		if self.destroyed {
			FilterDataStatus::StopIterationNoBuffer
		} else {
			FilterDataStatus::Continue
		}
	}
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod tests;
