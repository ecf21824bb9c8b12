use std::cell::{OnceCell, RefCell};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use minijinja::value::Value as TemplateValue;
use minijinja::{AutoEscape, Environment, ErrorKind};
use parking_lot::Mutex;
use serde_json::Value;

use crate::http::transformation::{FILTER_NAMESPACE, Metadata, TransformationError, coerce_string};
use crate::http::{HeaderMap, PseudoHeaders, header_or_pseudo};
use crate::*;

/// Per-request state the template callables read. Installed into a
/// thread-local slot for the duration of one transformation; the scope owns
/// the active header map and body so successive renders observe writes made
/// between them.
#[derive(Default)]
pub struct RequestScope {
	pub headers: HeaderMap,
	pub pseudo: PseudoHeaders,
	/// Request headers during a response transform; `None` when `headers`
	/// already is the request map.
	pub request_headers: Option<HeaderMap>,
	pub request_pseudo: Option<PseudoHeaders>,
	pub body: Bytes,
	pub(crate) body_string: OnceCell<String>,
	pub extractions: HashMap<String, String>,
	pub destructive_extractions: HashMap<String, String>,
	pub body_json: Value,
	pub environ: Arc<HashMap<String, String>>,
	pub cluster_metadata: Arc<Metadata>,
	pub dynamic_metadata: Metadata,
	pub endpoint_metadata: Option<Arc<Metadata>>,
}

impl RequestScope {
	/// The raw body as a string, materialized once per request no matter how
	/// many times `body()` appears in templates.
	pub fn body_str(&self) -> &str {
		self
			.body_string
			.get_or_init(|| String::from_utf8_lossy(&self.body).into_owned())
	}

	fn request_headers(&self) -> (&HeaderMap, &PseudoHeaders) {
		match (&self.request_headers, &self.request_pseudo) {
			(Some(headers), Some(pseudo)) => (headers, pseudo),
			_ => (&self.headers, &self.pseudo),
		}
	}
}

thread_local! {
	static SCOPE: RefCell<Option<RequestScope>> = const { RefCell::new(None) };
}

/// Binds `scope` to the current worker until `finish()` (or drop). Rendering
/// outside of an installed scope yields empty values from every callable.
pub struct ScopeGuard(());

pub fn enter(scope: RequestScope) -> ScopeGuard {
	SCOPE.with(|s| *s.borrow_mut() = Some(scope));
	ScopeGuard(())
}

impl ScopeGuard {
	pub fn finish(self) -> RequestScope {
		SCOPE.with(|s| s.borrow_mut().take()).unwrap_or_default()
	}
}

impl Drop for ScopeGuard {
	fn drop(&mut self) {
		SCOPE.with(|s| {
			s.borrow_mut().take();
		});
	}
}

pub fn with_scope<R>(f: impl FnOnce(&mut RequestScope) -> R) -> Option<R> {
	SCOPE.with(|s| s.borrow_mut().as_mut().map(f))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
	pub escape_characters: bool,
}

/// A compiled set of templates with the transformation callables bound.
/// Parsing happens only at configuration load; rendering is safe from any
/// worker provided a `RequestScope` is installed.
#[derive(Debug)]
pub struct TemplateEngine {
	env: Environment<'static>,
}

impl TemplateEngine {
	pub fn new(opts: EngineOptions) -> Self {
		let mut env = Environment::new();
		env.add_function("header", header);
		env.add_function("request_header", request_header);
		env.add_function("extraction", extraction);
		env.add_function("context", context);
		env.add_function("body", body);
		env.add_function("env", env_lookup);
		env.add_function("cluster_metadata", cluster_metadata);
		env.add_function("dynamic_metadata", dynamic_metadata);
		env.add_function("host_metadata", host_metadata);
		env.add_function("base64_encode", base64_encode);
		env.add_function("base64_decode", base64_decode);
		env.add_function("base64url_encode", base64url_encode);
		env.add_function("base64url_decode", base64url_decode);
		env.add_function("substring", substring);
		env.add_function("raw_string", raw_string);
		env.add_function("word_count", word_count);

		// Each distinct pattern maps to one random value for the lifetime of
		// the transformer instance, so repeated renders are stable.
		let replacements: Arc<Mutex<HashMap<String, String>>> = Default::default();
		env.add_function(
			"replace_with_random",
			move |source: &str, pattern: &str| -> String {
				let mut map = replacements.lock();
				let replacement = map.entry(pattern.to_string()).or_insert_with(|| {
					let random: [u8; 16] = rand::random();
					STANDARD_NO_PAD.encode(random)
				});
				source.replace(pattern, replacement.as_str())
			},
		);

		if opts.escape_characters {
			// JSON-escape interpolated strings; everything else prints as-is
			env.set_auto_escape_callback(|_| AutoEscape::Custom("json-string"));
			env.set_formatter(|out, state, value| {
				use std::fmt::Write;
				if matches!(state.auto_escape(), AutoEscape::Custom(_)) {
					if let Some(s) = value.as_str() {
						let escaped = serde_json::to_string(s)
							.map_err(|e| minijinja::Error::new(ErrorKind::BadSerialization, e.to_string()))?;
						out.write_str(&escaped[1..escaped.len() - 1])?;
					} else {
						write!(out, "{value}")?;
					}
					return Ok(());
				}
				minijinja::escape_formatter(out, state, value)
			});
		}

		TemplateEngine { env }
	}

	/// Compile a template. Only to be called while loading configuration.
	pub fn add_template(&mut self, name: impl Into<String>, text: &str) -> anyhow::Result<()> {
		self
			.env
			.add_template_owned(name.into(), text.to_string())?;
		Ok(())
	}

	/// Render a previously compiled template against the installed scope.
	/// A non-object body JSON renders against an empty root rather than
	/// failing.
	pub fn render(&self, name: &str) -> Result<String, TransformationError> {
		let tmpl = self
			.env
			.get_template(name)
			.map_err(|e| TransformationError::Template(e.to_string()))?;
		let root = with_scope(|s| {
			if s.body_json.is_object() {
				TemplateValue::from_serialize(&s.body_json)
			} else {
				TemplateValue::from(())
			}
		})
		.unwrap_or_default();
		tmpl
			.render(root)
			.map_err(|e| TransformationError::Template(e.to_string()))
	}
}

fn header(name: &str) -> String {
	with_scope(|s| {
		header_or_pseudo(&s.headers, &s.pseudo, name)
			.unwrap_or_default()
			.to_string()
	})
	.unwrap_or_default()
}

fn request_header(name: &str) -> String {
	with_scope(|s| {
		let (headers, pseudo) = s.request_headers();
		header_or_pseudo(headers, pseudo, name)
			.unwrap_or_default()
			.to_string()
	})
	.unwrap_or_default()
}

fn extraction(name: &str) -> String {
	with_scope(|s| {
		s.extractions
			.get(name)
			.or_else(|| s.destructive_extractions.get(name))
			.cloned()
			.unwrap_or_default()
	})
	.unwrap_or_default()
}

fn context() -> TemplateValue {
	with_scope(|s| TemplateValue::from_serialize(&s.body_json)).unwrap_or_default()
}

fn body() -> String {
	with_scope(|s| s.body_str().to_string()).unwrap_or_default()
}

fn env_lookup(name: &str) -> String {
	with_scope(|s| s.environ.get(name).cloned().unwrap_or_default()).unwrap_or_default()
}

fn metadata_string(metadata: Option<&Metadata>, key: &str, namespace: Option<&str>) -> String {
	let Some(metadata) = metadata else {
		return String::new();
	};
	metadata
		.value(namespace.unwrap_or(FILTER_NAMESPACE), key)
		.map(coerce_string)
		.unwrap_or_default()
}

fn cluster_metadata(key: &str, namespace: Option<&str>) -> String {
	with_scope(|s| metadata_string(Some(&s.cluster_metadata), key, namespace)).unwrap_or_default()
}

fn dynamic_metadata(key: &str, namespace: Option<&str>) -> String {
	with_scope(|s| metadata_string(Some(&s.dynamic_metadata), key, namespace)).unwrap_or_default()
}

fn host_metadata(key: &str, namespace: Option<&str>) -> String {
	with_scope(|s| metadata_string(s.endpoint_metadata.as_deref(), key, namespace))
		.unwrap_or_default()
}

fn base64_encode(input: &str) -> String {
	STANDARD.encode(input.as_bytes())
}

fn base64_decode(input: &str) -> String {
	STANDARD
		.decode(input)
		.ok()
		.and_then(|bytes| String::from_utf8(bytes).ok())
		.unwrap_or_default()
}

fn base64url_encode(input: &str) -> String {
	URL_SAFE.encode(input.as_bytes())
}

fn base64url_decode(input: &str) -> String {
	URL_SAFE
		.decode(input)
		.ok()
		.or_else(|| URL_SAFE_NO_PAD.decode(input).ok())
		.and_then(|bytes| String::from_utf8(bytes).ok())
		.unwrap_or_default()
}

// substring(s, start[, len]): a negative or out-of-range start yields "",
// a missing/negative/overflowing len extends to the end of the string, and
// non-integer arguments yield "".
fn substring(input: &str, start: TemplateValue, len: Option<TemplateValue>) -> String {
	let Ok(start) = i64::try_from(start) else {
		return String::new();
	};
	let substring_len = match len {
		None => -1,
		Some(v) => match i64::try_from(v) {
			Ok(l) => l,
			Err(_) => return String::new(),
		},
	};
	let input_len = input.len() as i64;
	if start < 0 || start >= input_len {
		return String::new();
	}
	let start = start as usize;
	if substring_len <= 0 || start as i64 + substring_len > input_len {
		return input[start..].to_string();
	}
	input[start..start + substring_len as usize].to_string()
}

// Returns string values as-is (unescaped); everything else is JSON-encoded
// with one surrounding pair of double quotes stripped, so the value drops
// into a template exactly as it appeared in the body.
fn raw_string(value: TemplateValue) -> String {
	if let Some(s) = value.as_str() {
		return s.to_string();
	}
	let dumped = serde_json::to_string(&value).unwrap_or_default();
	if dumped.len() >= 2 && dumped.starts_with('"') && dumped.ends_with('"') {
		dumped[1..dumped.len() - 1].to_string()
	} else {
		dumped
	}
}

fn word_count(value: TemplateValue) -> i64 {
	json_word_count(&serde_json::to_value(&value).unwrap_or(Value::Null))
}

fn json_word_count(value: &Value) -> i64 {
	match value {
		Value::String(s) => s.split_whitespace().count() as i64,
		Value::Array(items) => items.iter().map(json_word_count).sum(),
		Value::Object(map) => map
			.iter()
			.map(|(k, v)| k.split_whitespace().count() as i64 + json_word_count(v))
			.sum(),
		Value::Bool(_) | Value::Number(_) => 1,
		Value::Null => 0,
	}
}

#[cfg(test)]
#[path = "template_tests.rs"]
mod tests;
