use bytes::BytesMut;
use serde_json::Value;

use crate::http::{HeaderMap, RequestParts, ResponseParts, StatusCode};
use crate::*;

pub mod ai;
pub mod api_gateway;
pub mod body_header;
pub mod extraction;
pub mod factory;
pub mod filter;
pub mod inja;
pub mod matcher;
pub mod template;

pub use ai::AiTransformer;
pub use api_gateway::ApiGatewayTransformer;
pub use body_header::BodyHeaderTransformer;
pub use extraction::{Extraction, ExtractionMode, ExtractionSource};
pub use filter::TransformationFilter;
pub use inja::InjaTransformer;
pub use matcher::{RequestMatcher, ResponseMatcher};

/// Metadata namespace this filter family reads and writes by default.
pub const FILTER_NAMESPACE: &str = "io.gateway.transformation";

pub type MetadataStruct = serde_json::Map<String, Value>;

/// Filter metadata: a map of namespace to an arbitrary JSON struct, attached
/// to clusters, upstream hosts, or the stream itself.
#[derive(Debug, Clone, Default)]
pub struct Metadata(HashMap<Strng, MetadataStruct>);

impl Metadata {
	pub fn value(&self, namespace: &str, key: &str) -> Option<&Value> {
		self.0.get(namespace).and_then(|s| s.get(key))
	}

	/// Walk a `:`-delimited key through nested objects in the default
	/// namespace, coercing the result to a string.
	pub fn lookup_string(&self, key: &str) -> String {
		let Some(strct) = self.0.get(FILTER_NAMESPACE) else {
			return String::new();
		};
		let mut elements = key.split(':');
		let Some(first) = elements.next() else {
			return String::new();
		};
		let mut current = strct.get(first);
		for element in elements {
			current = current.and_then(|v| v.get(element));
		}
		current.map(coerce_string).unwrap_or_default()
	}

	pub fn set(&mut self, namespace: &str, key: &str, value: Value) {
		self
			.0
			.entry(strng::new(namespace))
			.or_default()
			.insert(key.to_string(), value);
	}

	pub fn namespace(&self, namespace: &str) -> Option<&MetadataStruct> {
		self.0.get(namespace)
	}
}

impl<const N: usize> From<[(Strng, MetadataStruct); N]> for Metadata {
	fn from(value: [(Strng, MetadataStruct); N]) -> Self {
		Metadata(HashMap::from(value))
	}
}

/// String coercion shared by the metadata callables and the AI transformer:
/// strings pass through, numbers and bools are stringified, structured
/// values are JSON-encoded.
pub fn coerce_string(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		Value::Number(n) => n.to_string(),
		Value::Bool(b) => {
			if *b {
				"true".to_string()
			} else {
				"false".to_string()
			}
		},
		Value::Object(_) | Value::Array(_) => serde_json::to_string(value).unwrap_or_default(),
		Value::Null => String::new(),
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
	Request,
	Response,
}

/// Stream-scoped collaborator data the host resolves before invoking a
/// transformation: route target metadata plus mutable dynamic metadata.
#[derive(Debug, Default, Clone)]
pub struct StreamInfo {
	pub cluster_metadata: Arc<Metadata>,
	pub endpoint_metadata: Option<Arc<Metadata>>,
	pub dynamic_metadata: Metadata,
	pub response_code_details: Option<Strng>,
}

/// Everything a transformer may read or mutate for one invocation.
pub struct TransformCtx<'a> {
	pub direction: Direction,
	pub request: &'a mut RequestParts,
	pub response: Option<&'a mut ResponseParts>,
	pub body: &'a mut BytesMut,
	pub info: &'a mut StreamInfo,
}

impl<'a> TransformCtx<'a> {
	/// The header map being transformed: response headers on the encode path,
	/// request headers otherwise.
	pub fn active_headers(&mut self) -> &mut HeaderMap {
		match (self.direction, self.response.as_mut()) {
			(Direction::Response, Some(resp)) => &mut resp.headers,
			_ => &mut self.request.headers,
		}
	}

	pub fn request_headers(&self) -> &HeaderMap {
		&self.request.headers
	}
}

#[derive(thiserror::Error, Debug)]
pub enum TransformationError {
	#[error("payload too large")]
	PayloadTooLarge,
	#[error("bad request: {0}")]
	JsonParse(String),
	#[error("bad request: {0}")]
	Template(String),
	#[error("transformation for function not found")]
	TransformationNotFound,
}

impl TransformationError {
	pub fn status(&self) -> StatusCode {
		match self {
			TransformationError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			TransformationError::JsonParse(_) => StatusCode::BAD_REQUEST,
			TransformationError::Template(_) => StatusCode::BAD_REQUEST,
			TransformationError::TransformationNotFound => StatusCode::NOT_FOUND,
		}
	}
}

/// A transformation, dispatched by config type. `Custom` admits
/// out-of-tree transformers registered by the embedding host.
pub enum Transformer {
	Inja(InjaTransformer),
	BodyHeader(BodyHeaderTransformer),
	Ai(AiTransformer),
	ApiGateway(ApiGatewayTransformer),
	Custom(Box<dyn Transform>),
}

impl std::fmt::Debug for Transformer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Transformer::Inja(t) => f.debug_tuple("Inja").field(t).finish(),
			Transformer::BodyHeader(t) => f.debug_tuple("BodyHeader").field(t).finish(),
			Transformer::Ai(t) => f.debug_tuple("Ai").field(t).finish(),
			Transformer::ApiGateway(t) => f.debug_tuple("ApiGateway").field(t).finish(),
			Transformer::Custom(_) => f.debug_tuple("Custom").finish(),
		}
	}
}

pub trait Transform: Send + Sync {
	fn transform(&self, ctx: &mut TransformCtx<'_>) -> Result<(), TransformationError>;
	fn passthrough_body(&self) -> bool {
		false
	}
}

impl Transformer {
	pub fn transform(&self, ctx: &mut TransformCtx<'_>) -> Result<(), TransformationError> {
		match self {
			Transformer::Inja(t) => t.transform(ctx),
			Transformer::BodyHeader(t) => t.transform(ctx),
			Transformer::Ai(t) => t.transform(ctx),
			Transformer::ApiGateway(t) => t.transform(ctx),
			Transformer::Custom(t) => t.transform(ctx),
		}
	}

	pub fn passthrough_body(&self) -> bool {
		match self {
			Transformer::Inja(t) => t.passthrough_body(),
			Transformer::BodyHeader(_) => false,
			Transformer::Ai(_) => false,
			Transformer::ApiGateway(_) => false,
			Transformer::Custom(t) => t.passthrough_body(),
		}
	}
}

/// The transformations selected for one stream by the request matchers.
pub struct TransformerPair {
	pub request: Option<Arc<Transformer>>,
	pub response: Option<Arc<Transformer>>,
	pub on_stream_completion: Option<Arc<Transformer>>,
	pub clear_route_cache: bool,
}

/// One stage of compiled transformation rules.
#[derive(Default)]
pub struct TransformConfig {
	pub transformations: Vec<(Option<RequestMatcher>, Arc<TransformerPair>)>,
	pub response_transformations: Vec<(Option<ResponseMatcher>, Arc<Transformer>)>,
}

impl TransformConfig {
	pub fn find_transformers(&self, request: &RequestParts) -> Option<Arc<TransformerPair>> {
		for (matcher, pair) in &self.transformations {
			if matcher.as_ref().is_none_or(|m| m.matches(request)) {
				return Some(pair.clone());
			}
		}
		None
	}

	pub fn find_response_transform(
		&self,
		response: &ResponseParts,
		info: &StreamInfo,
	) -> Option<Arc<Transformer>> {
		for (matcher, transformer) in &self.response_transformations {
			if matcher.as_ref().is_none_or(|m| m.matches(response, info)) {
				return Some(transformer.clone());
			}
		}
		None
	}
}

/// Listener-level filter configuration for one filter instance in the chain.
pub struct FilterConfig {
	pub stage: u32,
	/// Log headers and bodies around each transformation. Off by default
	/// since the payloads may be sensitive.
	pub log_request_response_info: bool,
	pub config: TransformConfig,
	pub stats: telemetry::metrics::TransformationStats,
}

/// Per-route configuration, staged so multiple filter instances can be
/// configured independently.
#[derive(Default)]
pub struct RouteConfig {
	pub stages: HashMap<u32, TransformConfig>,
}

impl RouteConfig {
	pub fn stage(&self, stage: u32) -> Option<&TransformConfig> {
		self.stages.get(&stage)
	}
}

// Unvalidated configuration model. Each `Local*` type converts into its
// compiled counterpart via TryFrom; conversion failures name the offending
// template or regex key.

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalTransformationConfig {
	#[serde(default)]
	pub stage: u32,
	#[serde(default)]
	pub log_request_response_info: bool,
	#[serde(default)]
	pub transformations: Vec<LocalTransformationRule>,
}

// no deny_unknown_fields: this struct is flattened into LocalStagedRule
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTransformationRule {
	#[serde(default)]
	pub matcher: Option<matcher::LocalRequestMatcher>,
	#[serde(default)]
	pub clear_route_cache: bool,
	#[serde(default)]
	pub request_transformation: Option<LocalTransformer>,
	#[serde(default)]
	pub response_transformation: Option<LocalTransformer>,
	#[serde(default)]
	pub on_stream_completion_transformation: Option<LocalTransformer>,
	#[serde(default)]
	pub response_transformations: Vec<LocalResponseTransformationRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalResponseTransformationRule {
	#[serde(default)]
	pub matcher: Option<matcher::LocalResponseMatcher>,
	pub response_transformation: LocalTransformer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum LocalTransformer {
	TransformationTemplate(inja::LocalTransformationTemplate),
	HeaderBodyTransform(body_header::LocalHeaderBodyTransform),
	AiTransformation(ai::LocalAiTransformation),
	ApiGatewayTransformation {},
	/// A transformer extension registered through `factory`.
	Extension(factory::LocalExtensionTransformer),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalRouteConfig {
	#[serde(default)]
	pub transformations: Vec<LocalStagedRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStagedRule {
	#[serde(default)]
	pub stage: u32,
	#[serde(flatten)]
	pub rule: LocalTransformationRule,
}

impl TryFrom<LocalTransformer> for Transformer {
	type Error = anyhow::Error;

	fn try_from(value: LocalTransformer) -> Result<Self, Self::Error> {
		Ok(match value {
			LocalTransformer::TransformationTemplate(t) => Transformer::Inja(t.try_into()?),
			LocalTransformer::HeaderBodyTransform(t) => Transformer::BodyHeader(t.into()),
			LocalTransformer::AiTransformation(t) => Transformer::Ai(t.try_into()?),
			LocalTransformer::ApiGatewayTransformation {} => {
				Transformer::ApiGateway(ApiGatewayTransformer::default())
			},
			LocalTransformer::Extension(t) => factory::create_transformer(&t.type_name, &t.config)?,
		})
	}
}

fn compile_rule(
	rule: LocalTransformationRule,
) -> anyhow::Result<(Option<RequestMatcher>, Arc<TransformerPair>)> {
	let matcher = rule.matcher.map(RequestMatcher::try_from).transpose()?;
	let request = rule
		.request_transformation
		.map(Transformer::try_from)
		.transpose()?
		.map(Arc::new);
	let response = rule
		.response_transformation
		.map(Transformer::try_from)
		.transpose()?
		.map(Arc::new);
	let on_stream_completion = rule
		.on_stream_completion_transformation
		.map(Transformer::try_from)
		.transpose()?
		.map(Arc::new);
	Ok((
		matcher,
		Arc::new(TransformerPair {
			request,
			response,
			on_stream_completion,
			clear_route_cache: rule.clear_route_cache,
		}),
	))
}

impl TryFrom<LocalTransformationConfig> for TransformConfig {
	type Error = anyhow::Error;

	fn try_from(value: LocalTransformationConfig) -> Result<Self, Self::Error> {
		let mut config = TransformConfig::default();
		for rule in value.transformations {
			let response_rules = rule.response_transformations.clone();
			config.transformations.push(compile_rule(rule)?);
			for response_rule in response_rules {
				let matcher = response_rule
					.matcher
					.map(ResponseMatcher::try_from)
					.transpose()?;
				let transformer = Arc::new(Transformer::try_from(response_rule.response_transformation)?);
				config.response_transformations.push((matcher, transformer));
			}
		}
		Ok(config)
	}
}

impl TryFrom<LocalRouteConfig> for RouteConfig {
	type Error = anyhow::Error;

	fn try_from(value: LocalRouteConfig) -> Result<Self, Self::Error> {
		let mut stages: HashMap<u32, Vec<LocalTransformationRule>> = HashMap::new();
		for staged in value.transformations {
			stages.entry(staged.stage).or_default().push(staged.rule);
		}
		let mut out = RouteConfig::default();
		for (stage, rules) in stages {
			let config = TransformConfig::try_from(LocalTransformationConfig {
				stage,
				transformations: rules,
				..Default::default()
			})?;
			out.stages.insert(stage, config);
		}
		Ok(out)
	}
}
