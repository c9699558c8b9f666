use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use super::{
	ExtensionRegistry, HandlerArgs, HandlerOptions, InvocationContext, MethodKey, Stage, SINK_KEY,
};
use crate::{
	config::PipelinePolicy,
	query::{model::ModelTarget, Query, QueryResult},
	Error,
};

/// Everything one stage invocation needs, owned, so following-stage futures
/// can outlive the orchestrator.
#[derive(Debug, Clone)]
pub(crate) struct InvokeParams {
	pub stage: Stage,
	pub query: Query,
	pub database: Option<String>,
	pub result_before: Option<Vec<Value>>,
	pub result_after: Option<Vec<Value>>,
	pub implicit: bool,
}

/// The stage-interpreted outcome of one handler call. At most one of the
/// fields is populated; a no-op invocation populates none.
#[derive(Debug, Default)]
pub(crate) struct Invocation {
	/// `before`/`after` stages: brand-new operations to splice around the
	/// origin.
	pub queries: Vec<Query>,
	/// `resolving` stage (and `during` under the compact set): the entry's
	/// final result.
	pub result: Option<QueryResult>,
	/// `during` stage under the full set: the query that replaces the
	/// operation.
	pub replacement: Option<Query>,
}

/// Looks up and calls the single handler registered for this operation's
/// (model, stage, verb) triple, applying the stage-specific output contract.
pub(crate) async fn invoke(
	params: InvokeParams,
	registry: Arc<ExtensionRegistry>,
	policy: PipelinePolicy,
	ctx: InvocationContext,
) -> Result<Invocation, Error> {
	let Some(target) = ModelTarget::resolve(&params.query) else {
		return Ok(Invocation::default());
	};

	// Operations routed to a non-default logical database look up the fixed
	// sink key rather than their model slug.
	let lookup = if params.database.is_some() {
		SINK_KEY
	} else {
		target.slug.as_str()
	};

	let key = MethodKey {
		stage: params.stage,
		verb: params.query.verb(),
	};
	let Some(handler) = registry.get(lookup, key) else {
		return Ok(Invocation::default());
	};

	let stage_index = policy.stage_set.index_of(params.stage);
	if policy.suppress_recursion {
		if let Some(stage_index) = stage_index {
			if ctx.suppresses(&target.slug, stage_index) && !registry.has_any_during(lookup) {
				debug!(
					model = %target.slug,
					stage = %params.stage,
					depth = ctx.depth(),
					"suppressing recursive extension invocation",
				);
				return Ok(Invocation::default());
			}
		}
	}

	let options = if params.database.is_some() {
		HandlerOptions {
			model: Some(target.slug.clone()),
			database: params.database.clone(),
			implicit: params.implicit,
		}
	} else {
		HandlerOptions {
			implicit: params.implicit,
			..HandlerOptions::default()
		}
	};

	// The trust boundary: handlers only ever see deep clones of the live
	// instructions and result snapshots.
	let instructions = target
		.instructions(&params.query)
		.cloned()
		.unwrap_or(Value::Null);

	let args = HandlerArgs {
		instructions,
		multiple_records: target.multiple_records,
		options,
		result_before: params.result_before.clone(),
		result_after: params.result_after.clone(),
		context: ctx.child(&target.slug, stage_index.unwrap_or(0)),
	};

	trace!(model = %target.slug, method = %key.method_name(), "invoking extension");
	let value = handler(args).await.map_err(|source| Error::Extension {
		stage: params.stage,
		source,
	})?;

	let mut invocation = Invocation::default();
	match params.stage {
		Stage::Before | Stage::After => {
			invocation.queries = parse_query_list(params.stage, value)?;
		}
		Stage::During if policy.stage_set.during_resolves() => {
			invocation.result = Some(QueryResult::Resolved(value));
		}
		Stage::During => {
			invocation.replacement = interpret_replacement(&params.query, &target, value);
		}
		Stage::Resolving => {
			invocation.result = Some(QueryResult::Resolved(value));
		}
		// Fire-and-forget: the return value is ignored by contract.
		Stage::Following => {}
	}

	Ok(invocation)
}

fn parse_query_list(stage: Stage, value: Value) -> Result<Vec<Query>, Error> {
	match value {
		Value::Null => Ok(Vec::new()),
		Value::Array(values) => values.into_iter().map(Query::from_value).collect(),
		other => Err(Error::ExtensionOutput {
			stage,
			message: format!("expected an array of operations, got {other}"),
		}),
	}
}

/// A `during` return value that already has the single-known-verb-key shape
/// is adopted as the full operation; anything else is wrapped back under the
/// original verb and model key.
fn interpret_replacement(original: &Query, target: &ModelTarget, value: Value) -> Option<Query> {
	match value {
		Value::Null => None,
		value if Query::is_query_shaped(&value) => Query::from_value(value).ok(),
		value => {
			let mut payload = serde_json::Map::with_capacity(1);
			payload.insert(target.key.clone(), value);
			Some(Query::new(original.verb(), Value::Object(payload)))
		}
	}
}
