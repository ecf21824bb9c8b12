use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Counters for the transformation filter.
#[derive(Debug, Default, Clone)]
pub struct TransformationStats {
	pub request_header_transformations: Counter,
	pub request_body_transformations: Counter,
	pub response_header_transformations: Counter,
	pub response_body_transformations: Counter,
	pub request_error: Counter,
	pub response_error: Counter,
	pub on_stream_complete_error: Counter,
}

impl TransformationStats {
	pub fn new(registry: &mut Registry) -> Self {
		let stats = Self::default();
		registry.register(
			"request_header_transformations",
			"Requests transformed at the header boundary",
			stats.request_header_transformations.clone(),
		);
		registry.register(
			"request_body_transformations",
			"Requests transformed after body buffering",
			stats.request_body_transformations.clone(),
		);
		registry.register(
			"response_header_transformations",
			"Responses transformed at the header boundary",
			stats.response_header_transformations.clone(),
		);
		registry.register(
			"response_body_transformations",
			"Responses transformed after body buffering",
			stats.response_body_transformations.clone(),
		);
		registry.register(
			"request_error",
			"Request transformations that failed",
			stats.request_error.clone(),
		);
		registry.register(
			"response_error",
			"Response transformations that failed",
			stats.response_error.clone(),
		);
		registry.register(
			"on_stream_complete_error",
			"Stream-completion transformations that failed",
			stats.on_stream_complete_error.clone(),
		);
		stats
	}
}

/// Counters and gauges for the AWS credential core.
#[derive(Debug, Default, Clone)]
pub struct AwsStats {
	pub fetch_success: Counter,
	pub fetch_failed: Counter,
	pub creds_rotated: Counter,
	pub webtoken_rotated: Counter,
	pub webtoken_failure: Counter,
	/// 1 when the last credential fetch succeeded, 0 otherwise.
	pub current_state: Gauge,
}

impl AwsStats {
	pub fn new(registry: &mut Registry) -> Self {
		let stats = Self::default();
		registry.register(
			"fetch_success",
			"Successful credential fetches",
			stats.fetch_success.clone(),
		);
		registry.register(
			"fetch_failed",
			"Failed credential fetches",
			stats.fetch_failed.clone(),
		);
		registry.register(
			"creds_rotated",
			"Times a fetch produced new credentials",
			stats.creds_rotated.clone(),
		);
		registry.register(
			"webtoken_rotated",
			"Times the web identity token was re-read",
			stats.webtoken_rotated.clone(),
		);
		registry.register(
			"webtoken_failure",
			"Times the web identity token re-read failed",
			stats.webtoken_failure.clone(),
		);
		registry.register(
			"current_state",
			"Whether the last credential fetch succeeded",
			stats.current_state.clone(),
		);
		stats
	}
}
