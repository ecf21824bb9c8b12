use anyhow::anyhow;
use regex::Regex;

use crate::http::{HeaderMap, PseudoHeaders, header_or_pseudo};
use crate::*;

/// The material an extractor may read: the active header map (including
/// pseudo-headers) and the buffered body.
pub struct ExtractionInput<'a> {
	pub headers: &'a HeaderMap,
	pub pseudo: &'a PseudoHeaders,
	pub body: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionSource {
	Header(Strng),
	Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionMode {
	#[default]
	Extract,
	SingleReplace,
	ReplaceAll,
}

/// A compiled regex plus source selector, producing either a read-only view
/// of a capture group or a rewrite of the source value.
#[derive(Debug, Clone)]
pub struct Extraction {
	source: ExtractionSource,
	regex: Regex,
	subgroup: usize,
	mode: ExtractionMode,
	replacement: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalExtraction {
	#[serde(default)]
	pub header: Option<String>,
	#[serde(default)]
	pub body: Option<LocalBodySource>,
	pub regex: String,
	#[serde(default)]
	pub subgroup: u32,
	#[serde(default)]
	pub mode: ExtractionMode,
	#[serde(default)]
	pub replacement_text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalBodySource {}

impl TryFrom<LocalExtraction> for Extraction {
	type Error = anyhow::Error;

	fn try_from(value: LocalExtraction) -> Result<Self, Self::Error> {
		let source = match (value.header, value.body) {
			(Some(header), None) => ExtractionSource::Header(strng::new(header.to_lowercase())),
			(None, Some(_)) => ExtractionSource::Body,
			_ => return Err(anyhow!("extraction requires exactly one of header or body")),
		};
		let regex = Regex::new(&value.regex)?;
		let subgroup = value.subgroup as usize;
		// captures_len counts the implicit whole-match group 0
		if subgroup >= regex.captures_len() {
			return Err(anyhow!(
				"group {} requested for regex with only {} sub groups",
				subgroup,
				regex.captures_len() - 1
			));
		}
		match value.mode {
			ExtractionMode::Extract => {},
			ExtractionMode::SingleReplace => {
				if value.replacement_text.is_none() {
					return Err(anyhow!("SINGLE_REPLACE mode set but no replacement text provided"));
				}
			},
			ExtractionMode::ReplaceAll => {
				if value.replacement_text.is_none() {
					return Err(anyhow!("REPLACE_ALL mode set but no replacement text provided"));
				}
				if subgroup != 0 {
					return Err(anyhow!("REPLACE_ALL mode set but subgroup is not 0"));
				}
			},
		}
		Ok(Extraction {
			source,
			regex,
			subgroup,
			mode: value.mode,
			replacement: value.replacement_text,
		})
	}
}

impl Extraction {
	pub fn mode(&self) -> ExtractionMode {
		self.mode
	}

	fn resolve<'a>(&self, input: &ExtractionInput<'a>) -> &'a str {
		match &self.source {
			ExtractionSource::Body => input.body,
			ExtractionSource::Header(name) => {
				header_or_pseudo(input.headers, input.pseudo, name).unwrap_or_default()
			},
		}
	}

	/// Non-destructive extraction: the value of `subgroup` when the regex
	/// matches the entire source, `""` otherwise. Never mutates anything.
	pub fn extract<'a>(&self, input: &ExtractionInput<'a>) -> &'a str {
		self.extract_value(self.resolve(input))
	}

	/// Destructive extraction: the source value rewritten according to the
	/// configured mode. Only valid for the replace modes; the conversion
	/// rejects anything else up front.
	pub fn extract_destructive(&self, input: &ExtractionInput<'_>) -> String {
		let value = self.resolve(input);
		match self.mode {
			ExtractionMode::SingleReplace => self.replace_individual_value(value),
			ExtractionMode::ReplaceAll => self.replace_all_values(value),
			ExtractionMode::Extract => value.to_string(),
		}
	}

	fn extract_value<'a>(&self, value: &'a str) -> &'a str {
		let Some(captures) = self.regex.captures(value) else {
			debug!("extractor regex did not match input");
			return "";
		};
		// whole-input match semantics
		let full = &captures[0];
		if full.len() != value.len() {
			debug!("extractor regex did not match entire input");
			return "";
		}
		captures
			.get(self.subgroup)
			.map(|m| m.as_str())
			.unwrap_or_default()
	}

	fn replace_individual_value(&self, value: &str) -> String {
		let Some(replacement) = self.replacement.as_deref() else {
			return value.to_string();
		};
		let Some(captures) = self.regex.captures(value) else {
			debug!("replace: extractor regex did not match input, returning input");
			return value.to_string();
		};
		let Some(full) = captures.get(0) else {
			return value.to_string();
		};
		if full.len() != value.len() {
			debug!("replace: regex did not match entire input, returning input");
			return value.to_string();
		}
		let Some(group) = captures.get(self.subgroup) else {
			debug!("replace: invalid group specified for regex, returning input");
			return value.to_string();
		};
		let mut replaced = String::with_capacity(value.len() + replacement.len());
		replaced.push_str(&value[..group.start()]);
		replaced.push_str(replacement);
		replaced.push_str(&value[group.end()..]);
		replaced
	}

	fn replace_all_values(&self, value: &str) -> String {
		let Some(replacement) = self.replacement.as_deref() else {
			return value.to_string();
		};
		// skip empty matches so a permissive regex cannot inject between
		// every character
		let mut out = String::with_capacity(value.len());
		let mut last = 0;
		for m in self.regex.find_iter(value) {
			if m.is_empty() {
				continue;
			}
			out.push_str(&value[last..m.start()]);
			out.push_str(replacement);
			last = m.end();
		}
		out.push_str(&value[last..]);
		out
	}
}

/// Insert `value` into `target` at a dotted path (`a.b.c`), creating
/// intermediate objects as needed.
pub fn insert_at_dotted_path(target: &mut serde_json::Value, path: &str, value: serde_json::Value) {
	let mut current = target;
	let mut remaining = path;
	while let Some(pos) = remaining.find('.') {
		let (field, rest) = remaining.split_at(pos);
		remaining = &rest[1..];
		if !current.is_object() {
			*current = serde_json::Value::Object(Default::default());
		}
		let serde_json::Value::Object(map) = current else {
			return;
		};
		current = map
			.entry(field.to_string())
			.or_insert(serde_json::Value::Null);
	}
	if !current.is_object() {
		*current = serde_json::Value::Object(Default::default());
	}
	if let Some(map) = current.as_object_mut() {
		map.insert(remaining.to_string(), value);
	}
}

#[cfg(test)]
#[path = "extraction_tests.rs"]
mod tests;
