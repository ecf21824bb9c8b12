use anyhow::anyhow;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;

use crate::http::transformation::{Transform, Transformer};
use crate::*;

/// Builds an out-of-tree transformer from its typed configuration value.
pub trait TransformerFactory: Send + Sync {
	fn create(&self, config: &Value) -> anyhow::Result<Box<dyn Transform>>;
}

static REGISTRY: Lazy<RwLock<HashMap<Strng, Arc<dyn TransformerFactory>>>> =
	Lazy::new(Default::default);

/// Register a factory for `type_name`, process-wide. Later registrations
/// under the same name win, which lets tests install fakes.
pub fn register_transformer(type_name: &str, factory: Arc<dyn TransformerFactory>) {
	REGISTRY.write().insert(strng::new(type_name), factory);
}

pub fn create_transformer(type_name: &str, config: &Value) -> anyhow::Result<Transformer> {
	let factory = REGISTRY
		.read()
		.get(type_name)
		.cloned()
		.ok_or_else(|| anyhow!("no transformer factory registered for '{type_name}'"))?;
	Ok(Transformer::Custom(factory.create(config)?))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalExtensionTransformer {
	/// The registered config type of the transformer extension.
	pub type_name: String,
	#[serde(default)]
	pub config: Value,
}

#[cfg(test)]
#[path = "factory_tests.rs"]
mod tests;
