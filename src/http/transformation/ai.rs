use bytes::BytesMut;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};

use crate::http::transformation::{Direction, Metadata, TransformCtx, TransformationError};
use crate::http::{HeaderMap, HeaderName, HeaderValue, header, path_and_query, set_path};
use crate::*;

const PROVIDER_ANTHROPIC: &str = "anthropic";
const PROVIDER_AZURE: &str = "azure";
const PROVIDER_GEMINI: &str = "gemini";
const PROVIDER_VERTEXAI: &str = "vertexai";

const SCHEMA_ANTHROPIC: &str = "anthropic";
const SCHEMA_GEMINI: &str = "gemini";

const GEMINI_GENERATE_CONTENT: &str = "generateContent";
const GEMINI_STREAM_GENERATE_CONTENT: &str = "streamGenerateContent";
const GEMINI_STREAM_QS_PARAM: &str = "alt=sse";

const ANTHROPIC_API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");
const ANTHROPIC_VERSION_HEADER: HeaderName = HeaderName::from_static("anthropic-version");
const AZURE_API_KEY_HEADER: HeaderName = HeaderName::from_static("api-key");
const GEMINI_API_KEY_HEADER: HeaderName = HeaderName::from_static("x-goog-api-key");

// OpenAI platform API endpoints (audio, embeddings, files, ...) are proxied
// verbatim: strip any path prefix and leave the body alone.
static OPENAI_PLATFORM_API_REGEX: Lazy<Regex> = Lazy::new(|| {
	Regex::new(
		r".*(/v[0-9]+[a-z]*)(/(audio|embeddings|fine_tuning|batches|files|uploads|images|models|moderations).*)",
	)
	.expect("platform API regex must compile")
});

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalAiTransformation {
	#[serde(default)]
	pub enable_chat_streaming: bool,
	#[serde(default)]
	pub field_defaults: Vec<LocalFieldDefault>,
	#[serde(default)]
	pub prompt_enrichment: Option<LocalPromptEnrichment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalFieldDefault {
	pub field: String,
	pub value: Value,
	#[serde(default, rename = "override")]
	pub override_existing: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalPromptEnrichment {
	#[serde(default)]
	pub prepend: Vec<LocalMessage>,
	#[serde(default)]
	pub append: Vec<LocalMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalMessage {
	pub role: String,
	pub content: String,
}

/// Adapts a client chat request to the upstream LLM provider selected by
/// endpoint metadata: path, auth headers, model and field defaults, prompt
/// enrichment, and streaming flags.
#[derive(Debug)]
pub struct AiTransformer {
	enable_chat_streaming: bool,
	field_defaults: Vec<LocalFieldDefault>,
	prepend: Vec<LocalMessage>,
	append: Vec<LocalMessage>,
}

impl TryFrom<LocalAiTransformation> for AiTransformer {
	type Error = anyhow::Error;

	fn try_from(value: LocalAiTransformation) -> Result<Self, Self::Error> {
		let enrichment = value.prompt_enrichment.unwrap_or_default();
		Ok(AiTransformer {
			enable_chat_streaming: value.enable_chat_streaming,
			field_defaults: value.field_defaults,
			prepend: enrichment.prepend,
			append: enrichment.append,
		})
	}
}

impl AiTransformer {
	pub fn transform(&self, ctx: &mut TransformCtx<'_>) -> Result<(), TransformationError> {
		if ctx.direction != Direction::Request {
			warn!("AI transformation can only run on the request path");
			return Ok(());
		}
		let Some(endpoint_metadata) = ctx.info.endpoint_metadata.clone() else {
			warn!("AI transformation requires endpoint metadata on the selected host");
			return Ok(());
		};

		let model = endpoint_metadata.lookup_string("model");
		let (in_bypass_mode, update_model_in_body) =
			self.transform_headers(ctx, &endpoint_metadata, &model);
		if in_bypass_mode || ctx.body.is_empty() {
			return Ok(());
		}

		let model = if update_model_in_body { model } else { String::new() };
		self.transform_body(ctx, &endpoint_metadata, &model);
		Ok(())
	}

	fn transform_headers(
		&self,
		ctx: &mut TransformCtx<'_>,
		metadata: &Metadata,
		model: &str,
	) -> (bool, bool) {
		let mut in_bypass_mode = false;
		let mut update_model_in_body = false;
		let provider = metadata.lookup_string("provider");

		let mut in_auth_token_passthru_mode = false;
		let mut auth_token = metadata.lookup_string("auth_token");
		if auth_token.is_empty() {
			in_auth_token_passthru_mode = true;
			auth_token = token_from_authorization_header(&ctx.request.headers);
		}

		let original_path = path_and_query(ctx.request).to_string();
		let mut path;
		match provider.as_str() {
			PROVIDER_AZURE => {
				if model.is_empty() {
					warn!("Azure OpenAI: required model setting is missing");
				}
				path = replace_model_in_path(&metadata.lookup_string("path"), model);
				set_provider_key_header(
					&mut ctx.request.headers,
					&AZURE_API_KEY_HEADER,
					&auth_token,
					in_auth_token_passthru_mode,
				);
			},
			PROVIDER_GEMINI => {
				if model.is_empty() {
					warn!("Gemini: required model setting is missing");
				}
				path = replace_model_in_path(&metadata.lookup_string("base_path"), model);
				path.push_str(&self.gemini_content_suffix());
				// the key goes in a header rather than the `key` query param so
				// it stays out of access logs and pass-through keeps working
				set_provider_key_header(
					&mut ctx.request.headers,
					&GEMINI_API_KEY_HEADER,
					&auth_token,
					in_auth_token_passthru_mode,
				);
			},
			PROVIDER_VERTEXAI => {
				if model.is_empty() {
					warn!("VertexAI: required model setting is missing");
				}
				path = replace_model_in_path(&metadata.lookup_string("base_path"), model);
				let model_path = metadata.lookup_string("model_path");
				if model_path.is_empty() {
					path.push_str(&self.gemini_content_suffix());
				} else {
					// model_path is expected to carry its own query params
					path.push_str(&model_path);
				}
				set_bearer_auth_token_header(
					&mut ctx.request.headers,
					&auth_token,
					in_auth_token_passthru_mode,
				);
			},
			_ => {
				// everything else speaks the OpenAI API
				if let Some(platform_path) = check_openai_platform_api_request(&original_path) {
					debug!("platform API path rewrite: {platform_path}");
					path = platform_path;
					in_bypass_mode = true;
				} else {
					if !model.is_empty() {
						update_model_in_body = true;
					}
					path = metadata.lookup_string("path");
					if path.is_empty() {
						path = "/v1/chat/completions".to_string();
					}
				}

				if provider == PROVIDER_ANTHROPIC {
					let version = metadata.lookup_string("version");
					if !version.is_empty()
						&& let Ok(value) = HeaderValue::from_str(&version)
					{
						ctx.request.headers.insert(ANTHROPIC_VERSION_HEADER, value);
					}
					set_provider_key_header(
						&mut ctx.request.headers,
						&ANTHROPIC_API_KEY_HEADER,
						&auth_token,
						in_auth_token_passthru_mode,
					);
				} else {
					set_bearer_auth_token_header(
						&mut ctx.request.headers,
						&auth_token,
						in_auth_token_passthru_mode,
					);
				}
			},
		}

		if !path.is_empty() {
			debug!("changing path from {original_path} to {path}");
			if let Err(e) = set_path(ctx.request, &path) {
				debug!("rewritten path is not valid: {e}");
			}
		}

		(in_bypass_mode, update_model_in_body)
	}

	fn gemini_content_suffix(&self) -> String {
		if self.enable_chat_streaming {
			format!("{GEMINI_STREAM_GENERATE_CONTENT}?{GEMINI_STREAM_QS_PARAM}")
		} else {
			GEMINI_GENERATE_CONTENT.to_string()
		}
	}

	fn transform_body(&self, ctx: &mut TransformCtx<'_>, metadata: &Metadata, model: &str) {
		let mut json_body: Value = match serde_json::from_slice(ctx.body.as_ref()) {
			Ok(v) => v,
			Err(_) => {
				warn!("failed to parse body as json, passing through");
				return;
			},
		};
		let mut body_modified = false;

		if !model.is_empty() && json_body.get("model").and_then(Value::as_str) != Some(model) {
			json_body["model"] = Value::String(model.to_string());
			body_modified = true;
		}

		for field in &self.field_defaults {
			if !field.override_existing && json_body.get(&field.field).is_some() {
				continue;
			}
			json_body[field.field.as_str()] = field.value.clone();
			body_modified = true;
		}

		let schema = metadata.lookup_string("json_schema");
		if !self.prepend.is_empty() || !self.append.is_empty() {
			if add_prompts(&schema, &mut json_body, &self.prepend, &self.append) {
				body_modified = true;
			} else {
				error!("failed to add prompts");
			}
		}

		if self.enable_chat_streaming && schema != SCHEMA_GEMINI {
			json_body["stream"] = Value::Bool(true);
			if schema != SCHEMA_ANTHROPIC {
				match json_body.get_mut("stream_options") {
					Some(Value::Object(opts)) => {
						opts.insert("include_usage".to_string(), Value::Bool(true));
					},
					_ => {
						json_body["stream_options"] = json!({"include_usage": true});
					},
				}
			}
			body_modified = true;
		}

		if body_modified {
			ctx.request.headers.remove(header::CONTENT_LENGTH);
			*ctx.body = BytesMut::from(json_body.to_string().as_bytes());
			let len = ctx.body.len() as u64;
			ctx
				.request
				.headers
				.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
		}
	}
}

fn replace_model_in_path(original_path: &str, model: &str) -> String {
	original_path.replace("{{model}}", model)
}

fn check_openai_platform_api_request(path: &str) -> Option<String> {
	OPENAI_PLATFORM_API_REGEX
		.captures(path)
		.map(|c| format!("{}{}", &c[1], &c[2]))
}

/// Bearer token from the inbound `Authorization` header, prefix stripped.
fn token_from_authorization_header(headers: &HeaderMap) -> String {
	let Some(value) = headers
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
	else {
		return String::new();
	};
	if value.len() >= 8 && (value.starts_with("Bearer ") || value.starts_with("bearer ")) {
		value[7..].to_string()
	} else {
		value.to_string()
	}
}

fn set_bearer_auth_token_header(headers: &mut HeaderMap, token: &str, passthru: bool) {
	if token.is_empty() || passthru {
		return;
	}
	if let Ok(mut value) = HeaderValue::from_str(&format!("Bearer {token}")) {
		value.set_sensitive(true);
		headers.insert(header::AUTHORIZATION, value);
	}
}

// In pass-through mode the token came from the Authorization header; if the
// provider key header is already on the inbound request, it wins.
fn set_provider_key_header(headers: &mut HeaderMap, key: &HeaderName, token: &str, passthru: bool) {
	if token.is_empty() {
		return;
	}
	if passthru && headers.contains_key(key) {
		return;
	}
	if let Ok(mut value) = HeaderValue::from_str(token) {
		value.set_sensitive(true);
		headers.insert(key.clone(), value);
	}
}

fn add_prompts(
	schema: &str,
	json_body: &mut Value,
	prepend: &[LocalMessage],
	append: &[LocalMessage],
) -> bool {
	let mut anthropic_system_prompt = String::new();
	let mut anthropic_developer_prompt = String::new();
	// preserves the order of the prepend list as messages are inserted
	let mut offset = 0;
	for prompt in prepend {
		if schema == SCHEMA_ANTHROPIC && accumulate_anthropic_prompt(
			prompt,
			&mut anthropic_system_prompt,
			&mut anthropic_developer_prompt,
		) {
			continue;
		}
		if !insert_prompt(schema, json_body, prompt, Some(offset)) {
			return false;
		}
		offset += 1;
	}
	for prompt in append {
		if schema == SCHEMA_ANTHROPIC && accumulate_anthropic_prompt(
			prompt,
			&mut anthropic_system_prompt,
			&mut anthropic_developer_prompt,
		) {
			continue;
		}
		if !insert_prompt(schema, json_body, prompt, None) {
			return false;
		}
	}

	if !anthropic_system_prompt.is_empty() || !anthropic_developer_prompt.is_empty() {
		let combined = format!("{anthropic_system_prompt}\n{anthropic_developer_prompt}");
		// system and developer prompts accumulate into the single `system`
		// string, always appended to any existing prompt
		let new_system = match json_body.get("system").and_then(Value::as_str) {
			Some(existing) => format!("{existing}\n{combined}"),
			None => combined,
		};
		json_body["system"] = Value::String(new_system);
	}
	true
}

fn accumulate_anthropic_prompt(
	prompt: &LocalMessage,
	system: &mut String,
	developer: &mut String,
) -> bool {
	match prompt.role.as_str() {
		"system" => {
			system.push_str(&prompt.content);
			system.push('\n');
			true
		},
		"developer" => {
			developer.push_str(&prompt.content);
			developer.push('\n');
			true
		},
		_ => false,
	}
}

fn insert_prompt(
	schema: &str,
	json_body: &mut Value,
	prompt: &LocalMessage,
	prepend_offset: Option<usize>,
) -> bool {
	let (list_key, new_prompt) = if schema == SCHEMA_GEMINI {
		(
			"contents",
			json!({"role": prompt.role, "parts": [{"text": prompt.content}]}),
		)
	} else {
		(
			"messages",
			json!({"role": prompt.role, "content": prompt.content}),
		)
	};
	let Some(Value::Array(items)) = json_body.get_mut(list_key) else {
		return false;
	};
	match prepend_offset {
		Some(offset) if offset <= items.len() => items.insert(offset, new_prompt),
		Some(_) => items.push(new_prompt),
		None => items.push(new_prompt),
	}
	true
}

#[cfg(test)]
#[path = "ai_tests.rs"]
mod tests;
