mod context;
mod invoke;

pub use context::InvocationContext;
pub(crate) use invoke::{invoke, Invocation, InvokeParams};

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::future::BoxFuture;
use serde_json::Value;
use strum::Display;

use crate::{
	error::HandlerError,
	query::Verb,
	Error,
};

/// Registry lookup key used instead of the model slug whenever a batch is
/// routed to a non-default logical database.
pub const SINK_KEY: &str = "sink";

/// A named point in the extension lifecycle around one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
	Before,
	During,
	After,
	Resolving,
	Following,
}

/// Which stages a pipeline runs. The full set is the effects/triggers shape
/// of the original; the compact set collapses to `before`/`during`/`after`,
/// with `during` returning a resolved result instead of a replacement query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageSet {
	#[default]
	Full,
	Compact,
}

impl StageSet {
	pub fn stages(self) -> &'static [Stage] {
		match self {
			Self::Full => &[
				Stage::Before,
				Stage::During,
				Stage::After,
				Stage::Resolving,
				Stage::Following,
			],
			Self::Compact => &[Stage::Before, Stage::During, Stage::After],
		}
	}

	pub fn contains(self, stage: Stage) -> bool {
		self.stages().contains(&stage)
	}

	pub(crate) fn index_of(self, stage: Stage) -> Option<usize> {
		self.stages().iter().position(|s| *s == stage)
	}

	/// Whether a `during` return value resolves the operation outright
	/// rather than replacing its query.
	pub(crate) fn during_resolves(self) -> bool {
		matches!(self, Self::Compact)
	}
}

/// One (stage, verb) handler slot. The original dispatches on dynamic method
/// names (`resolvingGet`, bare `get` for the during stage); those names parse
/// into this key exactly once, at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodKey {
	pub stage: Stage,
	pub verb: Verb,
}

impl MethodKey {
	pub fn parse(name: &str) -> Result<Self, Error> {
		if let Ok(verb) = name.parse::<Verb>() {
			return Ok(Self {
				stage: Stage::During,
				verb,
			});
		}

		for stage in [
			Stage::Before,
			Stage::After,
			Stage::Resolving,
			Stage::Following,
		] {
			let prefix = stage.to_string();
			let Some(rest) = name.strip_prefix(prefix.as_str()) else {
				continue;
			};
			let mut chars = rest.chars();
			let Some(first) = chars.next().filter(char::is_ascii_uppercase) else {
				continue;
			};
			let lowered = format!("{}{}", first.to_ascii_lowercase(), chars.as_str());
			if let Ok(verb) = lowered.parse::<Verb>() {
				return Ok(Self { stage, verb });
			}
		}

		Err(Error::Registration(name.to_string()))
	}

	pub fn method_name(&self) -> String {
		if self.stage == Stage::During {
			return self.verb.to_string();
		}
		let verb = self.verb.to_string();
		let mut chars = verb.chars();
		match chars.next() {
			Some(first) => format!("{}{}{}", self.stage, first.to_ascii_uppercase(), chars.as_str()),
			None => self.stage.to_string(),
		}
	}
}

/// Options forwarded to a handler alongside its cloned instructions.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
	/// Set only for sink-routed invocations, where the registry key no longer
	/// names the model.
	pub model: Option<String>,
	pub database: Option<String>,
	pub implicit: bool,
}

/// The argument object handed to every handler. Instructions and snapshots
/// are deep clones; a handler can never mutate caller-owned data.
#[derive(Debug, Clone)]
pub struct HandlerArgs {
	pub instructions: Value,
	pub multiple_records: bool,
	pub options: HandlerOptions,
	/// Array-normalized pre-mutation snapshot, `following` stage only.
	pub result_before: Option<Vec<Value>>,
	/// Array-normalized post-mutation snapshot, `following` stage only.
	pub result_after: Option<Vec<Value>>,
	/// Thread this through nested pipeline calls so recursion suppression can
	/// see its ancestors.
	pub context: InvocationContext,
}

pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;
pub type Handler = Arc<dyn Fn(HandlerArgs) -> HandlerFuture + Send + Sync>;

/// Handler table keyed by (model slug or [`SINK_KEY`], stage, verb).
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
	handlers: HashMap<(String, MethodKey), Handler>,
}

impl ExtensionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn on<F, Fut>(&mut self, model: impl Into<String>, stage: Stage, verb: Verb, handler: F) -> &mut Self
	where
		F: Fn(HandlerArgs) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
	{
		self.handlers.insert(
			(model.into(), MethodKey { stage, verb }),
			Arc::new(move |args| Box::pin(handler(args))),
		);
		self
	}

	/// String-named registration (`"resolvingGet"`, bare `"get"` for the
	/// during stage); unknown names are rejected here, not at invocation time.
	pub fn on_method<F, Fut>(&mut self, model: impl Into<String>, name: &str, handler: F) -> Result<&mut Self, Error>
	where
		F: Fn(HandlerArgs) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
	{
		let key = MethodKey::parse(name)?;
		Ok(self.on(model, key.stage, key.verb, handler))
	}

	pub fn is_empty(&self) -> bool {
		self.handlers.is_empty()
	}

	pub fn len(&self) -> usize {
		self.handlers.len()
	}

	pub(crate) fn get(&self, model: &str, key: MethodKey) -> Option<&Handler> {
		self.handlers.get(&(model.to_string(), key))
	}

	/// A model with any `during` handler opts out of recursion suppression.
	pub(crate) fn has_any_during(&self, model: &str) -> bool {
		self.handlers
			.keys()
			.any(|(m, key)| m == model && key.stage == Stage::During)
	}

	pub(crate) fn has_stage(&self, stage: Stage) -> bool {
		self.handlers.keys().any(|(_, key)| key.stage == stage)
	}

	pub(crate) fn has_model_verb(&self, model: &str, verb: Verb) -> bool {
		self.handlers
			.keys()
			.any(|(m, key)| m == model && key.verb == verb)
	}
}

impl fmt::Debug for ExtensionRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut methods: Vec<String> = self
			.handlers
			.keys()
			.map(|(model, key)| format!("{model}.{}", key.method_name()))
			.collect();
		methods.sort();
		f.debug_tuple("ExtensionRegistry").field(&methods).finish()
	}
}
