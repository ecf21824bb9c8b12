use std::collections::BTreeMap;

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use serde_json::Value;

use crate::http::transformation::extraction::{
	ExtractionInput, LocalExtraction, insert_at_dotted_path,
};
use crate::http::transformation::template::{
	EngineOptions, RequestScope, TemplateEngine, with_scope,
};
use crate::http::transformation::{
	Direction, Extraction, ExtractionMode, FILTER_NAMESPACE, TransformCtx, TransformationError,
	template,
};
use crate::http::{HeaderName, HeaderValue, header};
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParseBehavior {
	#[default]
	ParseAsJson,
	DontParse,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalTemplate {
	pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalHeaderToAppend {
	pub key: String,
	pub value: LocalTemplate,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalDynamicMetadataValue {
	#[serde(default)]
	pub metadata_namespace: Option<String>,
	pub key: String,
	pub value: LocalTemplate,
	#[serde(default)]
	pub json_to_proto: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalMergeJsonKeys {
	#[serde(default)]
	pub json_keys: BTreeMap<String, LocalMergeKey>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalMergeKey {
	#[serde(default)]
	pub override_empty: bool,
	pub tmpl: LocalTemplate,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalTransformationTemplate {
	#[serde(default)]
	pub advanced_templates: bool,
	#[serde(default)]
	pub parse_body_behavior: ParseBehavior,
	#[serde(default)]
	pub ignore_error_on_parse: bool,
	#[serde(default)]
	pub escape_characters: bool,
	#[serde(default)]
	pub extractors: BTreeMap<String, LocalExtraction>,
	#[serde(default)]
	pub headers: BTreeMap<String, LocalTemplate>,
	#[serde(default)]
	pub headers_to_append: Vec<LocalHeaderToAppend>,
	#[serde(default)]
	pub headers_to_remove: Vec<String>,
	#[serde(default)]
	pub dynamic_metadata_values: Vec<LocalDynamicMetadataValue>,
	#[serde(default)]
	pub body: Option<LocalTemplate>,
	#[serde(default)]
	pub merge_extractors_to_body: Option<LocalEmpty>,
	#[serde(default)]
	pub merge_json_keys: Option<LocalMergeJsonKeys>,
	#[serde(default)]
	pub passthrough: Option<LocalEmpty>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalEmpty {}

#[derive(Debug)]
struct DynamicMetadataValue {
	namespace: Strng,
	key: String,
	template_key: String,
	parse_json: bool,
}

#[derive(Debug)]
enum BodyTransform {
	None,
	Template(String),
	MergeExtractorsToBody,
	MergeJsonKeys(Vec<MergeKey>),
	Passthrough,
}

#[derive(Debug)]
struct MergeKey {
	path: String,
	override_empty: bool,
	template_key: String,
}

/// The template-driven transformer. All templates are compiled during
/// configuration loading; `transform` only renders, and is safe to call from
/// any worker since per-request state lives in the thread-local scope.
#[derive(Debug)]
pub struct InjaTransformer {
	advanced_templates: bool,
	parse_body_behavior: ParseBehavior,
	ignore_error_on_parse: bool,
	engine: TemplateEngine,
	extractors: Vec<(String, Extraction)>,
	headers: Vec<(HeaderName, String)>,
	headers_to_append: Vec<(HeaderName, String)>,
	headers_to_remove: Vec<HeaderName>,
	dynamic_metadata: Vec<DynamicMetadataValue>,
	body: BodyTransform,
	environ: Arc<HashMap<String, String>>,
}

impl TryFrom<LocalTransformationTemplate> for InjaTransformer {
	type Error = anyhow::Error;

	fn try_from(value: LocalTransformationTemplate) -> Result<Self, Self::Error> {
		let mut engine = TemplateEngine::new(EngineOptions {
			escape_characters: value.escape_characters,
		});

		let mut extractors = Vec::with_capacity(value.extractors.len());
		for (name, local) in value.extractors {
			let extraction = Extraction::try_from(local)
				.map_err(|e| anyhow!("failed to compile extractor '{name}': {e}"))?;
			extractors.push((name, extraction));
		}

		let mut headers = Vec::with_capacity(value.headers.len());
		for (name, tmpl) in value.headers {
			let header_name = HeaderName::try_from(name.as_str())
				.map_err(|e| anyhow!("invalid header name '{name}': {e}"))?;
			let key = format!("header:{name}");
			engine
				.add_template(key.clone(), &tmpl.text)
				.map_err(|e| anyhow!("failed to parse header template '{name}': {e}"))?;
			headers.push((header_name, key));
		}

		let mut headers_to_append = Vec::with_capacity(value.headers_to_append.len());
		for (idx, entry) in value.headers_to_append.into_iter().enumerate() {
			let header_name = HeaderName::try_from(entry.key.as_str())
				.map_err(|e| anyhow!("invalid header name '{}': {e}", entry.key))?;
			let key = format!("append:{}:{idx}", entry.key);
			engine
				.add_template(key.clone(), &entry.value.text)
				.map_err(|e| anyhow!("failed to parse header template '{}': {e}", entry.key))?;
			headers_to_append.push((header_name, key));
		}

		let mut headers_to_remove = Vec::with_capacity(value.headers_to_remove.len());
		for name in value.headers_to_remove {
			headers_to_remove.push(
				HeaderName::try_from(name.as_str())
					.map_err(|e| anyhow!("invalid header to remove '{name}': {e}"))?,
			);
		}

		let mut dynamic_metadata = Vec::with_capacity(value.dynamic_metadata_values.len());
		for (idx, entry) in value.dynamic_metadata_values.into_iter().enumerate() {
			let key = format!("dynamic_metadata:{}:{idx}", entry.key);
			engine
				.add_template(key.clone(), &entry.value.text)
				.map_err(|e| anyhow!("failed to parse dynamic metadata template '{}': {e}", entry.key))?;
			let namespace = match entry.metadata_namespace {
				Some(ns) if !ns.is_empty() => strng::new(ns),
				_ => strng::new(FILTER_NAMESPACE),
			};
			dynamic_metadata.push(DynamicMetadataValue {
				namespace,
				key: entry.key,
				template_key: key,
				parse_json: entry.json_to_proto,
			});
		}

		let body_modes = usize::from(value.body.is_some())
			+ usize::from(value.merge_extractors_to_body.is_some())
			+ usize::from(value.merge_json_keys.is_some())
			+ usize::from(value.passthrough.is_some());
		if body_modes > 1 {
			bail!("at most one body transformation may be set");
		}
		let body = if let Some(tmpl) = value.body {
			engine
				.add_template("body", &tmpl.text)
				.map_err(|e| anyhow!("failed to parse body template: {e}"))?;
			BodyTransform::Template("body".to_string())
		} else if value.merge_extractors_to_body.is_some() {
			BodyTransform::MergeExtractorsToBody
		} else if let Some(merge) = value.merge_json_keys {
			if value.parse_body_behavior == ParseBehavior::DontParse {
				bail!("MergeJsonKeys requires parsing the body");
			}
			let mut keys = Vec::with_capacity(merge.json_keys.len());
			for (path, entry) in merge.json_keys {
				let key = format!("merge:{path}");
				engine
					.add_template(key.clone(), &entry.tmpl.text)
					.map_err(|e| anyhow!("failed to parse merge template '{path}': {e}"))?;
				keys.push(MergeKey {
					path,
					override_empty: entry.override_empty,
					template_key: key,
				});
			}
			BodyTransform::MergeJsonKeys(keys)
		} else if value.passthrough.is_some() {
			BodyTransform::Passthrough
		} else {
			BodyTransform::None
		};

		Ok(InjaTransformer {
			advanced_templates: value.advanced_templates,
			parse_body_behavior: value.parse_body_behavior,
			ignore_error_on_parse: value.ignore_error_on_parse,
			engine,
			extractors,
			headers,
			headers_to_append,
			headers_to_remove,
			dynamic_metadata,
			body,
			environ: Arc::new(std::env::vars().collect()),
		})
	}
}

impl InjaTransformer {
	pub fn passthrough_body(&self) -> bool {
		matches!(self.body, BodyTransform::Passthrough)
	}

	pub fn transform(&self, ctx: &mut TransformCtx<'_>) -> Result<(), TransformationError> {
		// parse the body before anything is moved, so an error leaves the
		// stream untouched
		let mut body_json = Value::Null;
		if self.parse_body_behavior == ParseBehavior::ParseAsJson && !ctx.body.is_empty() {
			match serde_json::from_slice(ctx.body.as_ref()) {
				Ok(v) => body_json = v,
				Err(e) => {
					if !self.ignore_error_on_parse {
						return Err(TransformationError::JsonParse(e.to_string()));
					}
				},
			}
		}

		let pseudo = match (ctx.direction, ctx.response.as_deref()) {
			(Direction::Response, Some(response)) => crate::http::PseudoHeaders::from_response(response),
			_ => crate::http::PseudoHeaders::from_request(ctx.request),
		};
		let headers = std::mem::take(ctx.active_headers());
		let (request_headers, request_pseudo) = match ctx.direction {
			Direction::Response => (
				Some(std::mem::take(&mut ctx.request.headers)),
				Some(crate::http::PseudoHeaders::from_request(ctx.request)),
			),
			Direction::Request => (None, None),
		};
		let mut scope = RequestScope {
			headers,
			pseudo,
			request_headers,
			request_pseudo,
			body: std::mem::take(ctx.body).freeze(),
			body_json,
			environ: self.environ.clone(),
			cluster_metadata: ctx.info.cluster_metadata.clone(),
			dynamic_metadata: ctx.info.dynamic_metadata.clone(),
			endpoint_metadata: ctx.info.endpoint_metadata.clone(),
			..Default::default()
		};

		self.run_extractors(&mut scope);

		let guard = template::enter(scope);
		let result = self.render_all(ctx);
		let mut scope = guard.finish();

		// hand the maps back before surfacing any error
		*ctx.active_headers() = std::mem::take(&mut scope.headers);
		if let Some(request_headers) = scope.request_headers.take() {
			ctx.request.headers = request_headers;
		}
		let original_body = scope.body;
		let restore = |body: Bytes| {
			body
				.try_into_mut()
				.unwrap_or_else(|b| BytesMut::from(&b[..]))
		};
		let maybe_body = match result {
			Ok(maybe_body) => maybe_body,
			Err(e) => {
				*ctx.body = restore(original_body);
				return Err(e);
			},
		};

		match maybe_body {
			Some(new_body) => {
				ctx.active_headers().remove(header::CONTENT_LENGTH);
				*ctx.body = BytesMut::from(new_body.as_bytes());
				let len = ctx.body.len() as u64;
				ctx
					.active_headers()
					.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
			},
			None => {
				*ctx.body = restore(original_body);
			},
		}
		Ok(())
	}

	fn run_extractors(&self, scope: &mut RequestScope) {
		let mut results = Vec::with_capacity(self.extractors.len());
		{
			let input = ExtractionInput {
				headers: &scope.headers,
				pseudo: &scope.pseudo,
				body: scope.body_str(),
			};
			for (name, extraction) in &self.extractors {
				let destructive = !matches!(extraction.mode(), ExtractionMode::Extract);
				let value = if destructive {
					extraction.extract_destructive(&input)
				} else {
					extraction.extract(&input).to_string()
				};
				results.push((name, destructive, value));
			}
		}
		for (name, destructive, value) in results {
			if self.advanced_templates {
				if destructive {
					scope.destructive_extractions.insert(name.clone(), value);
				} else {
					scope.extractions.insert(name.clone(), value);
				}
			} else {
				insert_at_dotted_path(&mut scope.body_json, name, Value::String(value));
			}
		}
	}

	/// Renders everything against the installed scope. Header writes land in
	/// the scope so later templates observe earlier writes; the new body (if
	/// any) is returned for the caller to install after the scope unwinds.
	fn render_all(&self, ctx: &mut TransformCtx<'_>) -> Result<Option<String>, TransformationError> {
		let maybe_body = match &self.body {
			BodyTransform::Template(key) => Some(self.engine.render(key)?),
			BodyTransform::MergeExtractorsToBody => {
				Some(with_scope(|s| s.body_json.to_string()).unwrap_or_default())
			},
			BodyTransform::MergeJsonKeys(keys) => {
				for merge in keys {
					let rendered = self.engine.render(&merge.template_key)?;
					// do not overwrite with empty unless requested
					if rendered.is_empty() && !merge.override_empty {
						continue;
					}
					let value = serde_json::from_str(&rendered)
						.unwrap_or_else(|_| Value::String(rendered));
					with_scope(|s| insert_at_dotted_path(&mut s.body_json, &merge.path, value));
				}
				Some(with_scope(|s| s.body_json.to_string()).unwrap_or_default())
			},
			BodyTransform::Passthrough | BodyTransform::None => None,
		};

		for dm in &self.dynamic_metadata {
			let output = self.engine.render(&dm.template_key)?;
			if output.is_empty() {
				continue;
			}
			if dm.parse_json {
				match serde_json::from_str::<Value>(&output) {
					Ok(value) => ctx.info.dynamic_metadata.set(&dm.namespace, &dm.key, value),
					Err(_) => {
						ctx
							.info
							.dynamic_metadata
							.set(&dm.namespace, &dm.key, Value::String(output))
					},
				}
			} else {
				ctx
					.info
					.dynamic_metadata
					.set(&dm.namespace, &dm.key, Value::String(output));
			}
		}

		for (name, key) in &self.headers {
			let output = self.engine.render(key)?;
			with_scope(|s| {
				s.headers.remove(name);
				if !output.is_empty() {
					match HeaderValue::from_str(&output) {
						Ok(value) => {
							s.headers.insert(name.clone(), value);
						},
						Err(_) => debug!("rendered value for header '{name}' is not a valid header value"),
					}
				}
			});
		}

		for name in &self.headers_to_remove {
			with_scope(|s| {
				s.headers.remove(name);
			});
		}

		for (name, key) in &self.headers_to_append {
			let output = self.engine.render(key)?;
			if output.is_empty() {
				continue;
			}
			match HeaderValue::from_str(&output) {
				Ok(value) => {
					with_scope(|s| s.headers.append(name.clone(), value));
				},
				Err(_) => debug!("rendered value for header '{name}' is not a valid header value"),
			}
		}

		Ok(maybe_body)
	}
}

#[cfg(test)]
#[path = "inja_tests.rs"]
mod tests;
