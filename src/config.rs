use std::{fmt, sync::Arc};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
	extension::{ExtensionRegistry, Stage, StageSet},
	query::Query,
	Error,
};

pub const DEFAULT_DATA_URL: &str = "https://data.lodestone.dev/v1";
pub const DEFAULT_STORAGE_URL: &str = "https://storage.lodestone.dev/v1";

const TOKEN_ENV_VAR: &str = "LODESTONE_TOKEN";

/// Keeps a `following`-stage future alive past the pipeline's return, for
/// request-scoped runtimes with no ambient task lifetime. Errors from
/// `following` handlers surface only through the future handed to this
/// callback.
pub type WaitUntil = Arc<dyn Fn(BoxFuture<'static, Result<(), Error>>) + Send + Sync>;

/// Compiles one operation into a native statement for the `nativeQueries`
/// wire shape.
pub type QueryCompiler = Arc<dyn Fn(&Query) -> Result<CompiledQuery, Error> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
	pub query: String,
	pub values: Vec<Value>,
}

/// Which verb classes must have a matching extension registered before the
/// pipeline agrees to execute at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequiredExtensions {
	#[default]
	None,
	All,
	Read,
	Write,
}

/// Stage set, recursion policy and required-extension policy, together.
///
/// The original source picks recursion suppression or the required-extensions
/// gate implicitly, depending on which of its three orchestrators runs; here
/// both are plain configuration and may be combined freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelinePolicy {
	pub stage_set: StageSet,
	pub suppress_recursion: bool,
	pub required: RequiredExtensions,
}

impl Default for PipelinePolicy {
	fn default() -> Self {
		Self {
			stage_set: StageSet::Full,
			suppress_recursion: false,
			required: RequiredExtensions::None,
		}
	}
}

impl PipelinePolicy {
	/// The compact `before`/`during`/`after` configuration, with the
	/// recursion suppression that stage set historically carried.
	pub fn compact() -> Self {
		Self {
			stage_set: StageSet::Compact,
			suppress_recursion: true,
			required: RequiredExtensions::None,
		}
	}
}

/// A field of a compiled model; drives date coercion in the result
/// normalizer. `slug` may be a dotted path into nested record objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelField {
	pub slug: String,
	#[serde(rename = "type")]
	pub field_type: FieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
	String,
	Number,
	Boolean,
	Date,
	Json,
	Blob,
	Link,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
	pub slug: String,
	#[serde(default)]
	pub fields: Vec<ModelField>,
}

/// Everything the pipeline recognizes; see the crate docs for the lifecycle
/// it configures.
#[derive(Clone, Default)]
pub struct ClientConfig {
	/// Bearer token for both endpoints; falls back to the `LODESTONE_TOKEN`
	/// environment variable.
	pub token: Option<String>,
	/// Default logical database all operations route to. Routed operations
	/// look up extensions under the sink key.
	pub database: Option<String>,
	pub data_url: Option<String>,
	pub storage_url: Option<String>,
	pub extensions: ExtensionRegistry,
	pub policy: PipelinePolicy,
	pub wait_until: Option<WaitUntil>,
	/// Marks invocations as implicitly issued (e.g. by generated code) so
	/// extension authors can tell them apart from user calls.
	pub implicit: bool,
	/// Compiled models; enables date coercion keyed by field type.
	pub models: Vec<Model>,
	/// When present, batches go out as `nativeQueries` instead of `queries`.
	pub compiler: Option<QueryCompiler>,
}

impl ClientConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_token(mut self, token: impl Into<String>) -> Self {
		self.token = Some(token.into());
		self
	}

	pub fn with_database(mut self, database: impl Into<String>) -> Self {
		self.database = Some(database.into());
		self
	}

	pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
		self.extensions = extensions;
		self
	}

	pub fn with_policy(mut self, policy: PipelinePolicy) -> Self {
		self.policy = policy;
		self
	}

	pub fn with_wait_until(
		mut self,
		wait_until: impl Fn(BoxFuture<'static, Result<(), Error>>) + Send + Sync + 'static,
	) -> Self {
		self.wait_until = Some(Arc::new(wait_until));
		self
	}

	pub fn with_models(mut self, models: Vec<Model>) -> Self {
		self.models = models;
		self
	}

	pub fn with_compiler(
		mut self,
		compiler: impl Fn(&Query) -> Result<CompiledQuery, Error> + Send + Sync + 'static,
	) -> Self {
		self.compiler = Some(Arc::new(compiler));
		self
	}

	pub fn data_url(&self) -> &str {
		self.data_url.as_deref().unwrap_or(DEFAULT_DATA_URL)
	}

	pub fn storage_url(&self) -> &str {
		self.storage_url.as_deref().unwrap_or(DEFAULT_STORAGE_URL)
	}

	pub(crate) fn model(&self, slug: &str) -> Option<&Model> {
		self.models.iter().find(|model| model.slug == slug)
	}

	pub(crate) fn resolved_token(&self) -> Result<String, Error> {
		if let Some(token) = &self.token {
			return Ok(token.clone());
		}
		if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
			debug!("using token from {TOKEN_ENV_VAR}");
			return Ok(token);
		}
		Err(Error::Configuration(format!(
			"no token configured and {TOKEN_ENV_VAR} is unset"
		)))
	}

	/// Fail-fast checks, run before any network activity.
	pub(crate) fn validate(&self) -> Result<(), Error> {
		if self.policy.stage_set.contains(Stage::Following)
			&& self.extensions.has_stage(Stage::Following)
			&& self.wait_until.is_none()
			&& tokio::runtime::Handle::try_current().is_err()
		{
			return Err(Error::Configuration(
				"following extensions are configured, but there is no ambient async runtime \
				 and no wait_until callback to keep their futures alive"
					.into(),
			));
		}
		Ok(())
	}
}

impl fmt::Debug for ClientConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientConfig")
			.field("token", &self.token.as_ref().map(|_| "<redacted>"))
			.field("database", &self.database)
			.field("data_url", &self.data_url())
			.field("storage_url", &self.storage_url())
			.field("extensions", &self.extensions)
			.field("policy", &self.policy)
			.field("wait_until", &self.wait_until.is_some())
			.field("implicit", &self.implicit)
			.field("models", &self.models.len())
			.field("compiler", &self.compiler.is_some())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_prefers_explicit_configuration() {
		let config = ClientConfig::new().with_token("secret");
		assert_eq!(config.resolved_token().unwrap(), "secret");
	}

	#[test]
	fn default_policy_is_the_full_stage_set() {
		let policy = PipelinePolicy::default();
		assert_eq!(policy.stage_set, StageSet::Full);
		assert!(!policy.suppress_recursion);
		assert_eq!(policy.required, RequiredExtensions::None);

		let compact = PipelinePolicy::compact();
		assert_eq!(compact.stage_set, StageSet::Compact);
		assert!(compact.suppress_recursion);
	}

	#[test]
	fn model_field_wire_shape() {
		let field: ModelField =
			serde_json::from_value(serde_json::json!({"slug": "activeAt", "type": "date"}))
				.unwrap();
		assert_eq!(field.field_type, FieldType::Date);
	}
}
