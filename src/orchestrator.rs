use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::Arc,
};

use futures_concurrency::future::TryJoin;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::{
	config::{ClientConfig, PipelinePolicy, RequiredExtensions},
	executor,
	extension::{invoke, ExtensionRegistry, Invocation, InvocationContext, InvokeParams, Stage, SINK_KEY},
	query::{model::ModelTarget, snapshot, Query, QueryResult, Verb},
	transport::Transport,
	Error,
};

/// One slot of the operation list. `result: None` is the EMPTY sentinel; it
/// is written exactly once, by a stage or by network execution.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
	pub query: Query,
	pub result: Option<QueryResult>,
	/// Synthetic read capturing pre-mutation state for the entry at this
	/// index.
	pub diff_for: Option<usize>,
	/// Synthetic operation a before/after extension spliced in around the
	/// entry at this index.
	pub auxiliary_for: Option<usize>,
	pub database: Option<String>,
}

impl Entry {
	pub fn original(query: Query, database: Option<String>) -> Self {
		Self {
			query,
			result: None,
			diff_for: None,
			auxiliary_for: None,
			database,
		}
	}

	fn synthetic(query: Query, kind: SyntheticKind, origin: usize, database: Option<String>) -> Self {
		let mut entry = Self::original(query, database);
		match kind {
			SyntheticKind::Auxiliary => entry.auxiliary_for = Some(origin),
			SyntheticKind::Diff => entry.diff_for = Some(origin),
		}
		entry
	}

	/// Synthetic entries participate in stage invocation and execution but
	/// are filtered out of the final returned list.
	pub fn is_original(&self) -> bool {
		self.diff_for.is_none() && self.auxiliary_for.is_none()
	}
}

#[derive(Debug, Clone, Copy)]
enum SyntheticKind {
	Auxiliary,
	Diff,
}

#[derive(Debug, Clone, Copy)]
enum SplicePosition {
	Before,
	After,
}

/// Drives the full stage sequence over an operation list:
/// `before -> during -> after -> diff insertion -> resolving -> network
/// execution -> following`, then projects results back into the caller's
/// original ordering.
pub(crate) async fn run(
	mut entries: Vec<Entry>,
	config: &ClientConfig,
	token: &str,
	transport: &dyn Transport,
	ctx: InvocationContext,
) -> Result<Vec<QueryResult>, Error> {
	let policy = config.policy;
	let stage_set = policy.stage_set;
	let registry = Arc::new(config.extensions.clone());

	enforce_required_extensions(&entries, &registry, policy)?;

	if stage_set.contains(Stage::Before) {
		let outcomes =
			stage_invocations(&entries, Stage::Before, &registry, policy, &ctx, config.implicit)
				.await?;
		let additions = auxiliary_additions(outcomes);
		entries = splice(entries, additions, SplicePosition::Before, SyntheticKind::Auxiliary);
	}

	if stage_set.contains(Stage::During) {
		let outcomes =
			stage_invocations(&entries, Stage::During, &registry, policy, &ctx, config.implicit)
				.await?;
		for (index, invocation) in outcomes {
			if stage_set.during_resolves() {
				if let Some(result) = invocation.result {
					entries[index].result = Some(result);
				}
			} else if let Some(replacement) = invocation.replacement {
				debug!(index, "during extension replaced operation");
				entries[index].query = replacement;
			}
		}
	}

	if stage_set.contains(Stage::After) {
		let outcomes =
			stage_invocations(&entries, Stage::After, &registry, policy, &ctx, config.implicit)
				.await?;
		let additions = auxiliary_additions(outcomes);
		entries = splice(entries, additions, SplicePosition::After, SyntheticKind::Auxiliary);
	}

	// Diff reads only matter when a following stage will consume their
	// pre-mutation snapshots.
	if stage_set.contains(Stage::Following) && registry.has_stage(Stage::Following) {
		let additions = diff_additions(&entries);
		entries = splice(entries, additions, SplicePosition::Before, SyntheticKind::Diff);
	}

	if stage_set.contains(Stage::Resolving) {
		let unresolved: Vec<usize> = entries
			.iter()
			.enumerate()
			.filter(|(_, entry)| entry.result.is_none())
			.map(|(index, _)| index)
			.collect();
		let outcomes = indexed_invocations(
			&entries,
			&unresolved,
			Stage::Resolving,
			&registry,
			policy,
			&ctx,
			config.implicit,
		)
		.await?;
		for (index, invocation) in outcomes {
			if let Some(result) = invocation.result {
				debug!(index, "resolving extension short-circuited execution");
				entries[index].result = Some(result);
			}
		}
	}

	execute_unresolved(&mut entries, config, token, transport).await?;

	if stage_set.contains(Stage::Following) && registry.has_stage(Stage::Following) {
		dispatch_following(&entries, config, &registry, policy, &ctx)?;
	}

	Ok(entries
		.into_iter()
		.filter(Entry::is_original)
		.map(|entry| entry.result.unwrap_or(QueryResult::Record(None)))
		.collect())
}

/// The triggers-variant gate: refuse to execute at all when a covered verb
/// class has no matching extension.
fn enforce_required_extensions(
	entries: &[Entry],
	registry: &ExtensionRegistry,
	policy: PipelinePolicy,
) -> Result<(), Error> {
	if policy.required == RequiredExtensions::None {
		return Ok(());
	}

	for entry in entries {
		let verb = entry.query.verb();
		let covered = match policy.required {
			RequiredExtensions::None => false,
			RequiredExtensions::All => true,
			RequiredExtensions::Read => !verb.is_write(),
			RequiredExtensions::Write => verb.is_write(),
		};
		if !covered {
			continue;
		}
		let lookup = if entry.database.is_some() {
			SINK_KEY.to_string()
		} else {
			ModelTarget::resolve(&entry.query)
				.map(|target| target.slug)
				.unwrap_or_default()
		};
		if !registry.has_model_verb(&lookup, verb) {
			return Err(Error::MissingExtension {
				model: lookup,
				verb,
			});
		}
	}

	Ok(())
}

async fn stage_invocations(
	entries: &[Entry],
	stage: Stage,
	registry: &Arc<ExtensionRegistry>,
	policy: PipelinePolicy,
	ctx: &InvocationContext,
	implicit: bool,
) -> Result<Vec<(usize, Invocation)>, Error> {
	let indices: Vec<usize> = entries
		.iter()
		.enumerate()
		.filter(|(_, entry)| entry.is_original())
		.map(|(index, _)| index)
		.collect();
	indexed_invocations(entries, &indices, stage, registry, policy, ctx, implicit).await
}

async fn indexed_invocations(
	entries: &[Entry],
	indices: &[usize],
	stage: Stage,
	registry: &Arc<ExtensionRegistry>,
	policy: PipelinePolicy,
	ctx: &InvocationContext,
	implicit: bool,
) -> Result<Vec<(usize, Invocation)>, Error> {
	debug!(stage = %stage, entries = indices.len(), "running stage");

	indices
		.iter()
		.map(|&index| {
			let entry = &entries[index];
			let params = InvokeParams {
				stage,
				query: entry.query.clone(),
				database: entry.database.clone(),
				result_before: None,
				result_after: None,
				implicit,
			};
			let registry = Arc::clone(registry);
			let ctx = ctx.clone();
			async move {
				invoke(params, registry, policy, ctx)
					.await
					.map(|invocation| (index, invocation))
			}
		})
		.collect::<Vec<_>>()
		.try_join()
		.await
}

fn auxiliary_additions(outcomes: Vec<(usize, Invocation)>) -> HashMap<usize, Vec<Query>> {
	outcomes
		.into_iter()
		.filter(|(_, invocation)| !invocation.queries.is_empty())
		.map(|(index, invocation)| (index, invocation.queries))
		.collect()
}

/// Pairs every `set` with a synthetic `get` (same model and `with` filter)
/// and every `alter` with a `list`, so the following stage can see
/// pre-mutation state without relying on the mutation response alone.
fn diff_additions(entries: &[Entry]) -> HashMap<usize, Vec<Query>> {
	let mut additions = HashMap::new();

	for (index, entry) in entries.iter().enumerate() {
		if !entry.is_original() {
			continue;
		}
		let diff = match entry.query.verb() {
			Verb::Set => ModelTarget::resolve(&entry.query).map(|target| {
				let with = entry
					.query
					.payload()
					.get(&target.key)
					.and_then(|instructions| instructions.get("with"))
					.cloned()
					.unwrap_or_else(|| json!({}));
				let mut payload = serde_json::Map::with_capacity(1);
				payload.insert(target.key, json!({ "with": with }));
				Query::new(Verb::Get, Value::Object(payload))
			}),
			Verb::Alter => Some(Query::new(
				Verb::List,
				json!({
					"model": entry.query.payload().get("model").cloned().unwrap_or(Value::Null)
				}),
			)),
			_ => None,
		};
		if let Some(diff) = diff {
			additions.insert(index, vec![diff]);
		}
	}

	additions
}

/// Splices synthetic entries immediately before or after their origin and
/// remaps every pre-existing index tag to the shifted positions.
fn splice(
	entries: Vec<Entry>,
	mut additions: HashMap<usize, Vec<Query>>,
	position: SplicePosition,
	kind: SyntheticKind,
) -> Vec<Entry> {
	if additions.is_empty() {
		return entries;
	}

	let added: usize = additions.values().map(Vec::len).sum();
	let mut remap = vec![0usize; entries.len()];
	let mut out: Vec<Entry> = Vec::with_capacity(entries.len() + added);
	let mut fresh: HashSet<usize> = HashSet::with_capacity(added);

	for (old_index, entry) in entries.into_iter().enumerate() {
		let extra = additions.remove(&old_index).unwrap_or_default();
		let database = entry.database.clone();
		match position {
			SplicePosition::Before => {
				let origin = out.len() + extra.len();
				for query in extra {
					fresh.insert(out.len());
					out.push(Entry::synthetic(query, kind, origin, database.clone()));
				}
				remap[old_index] = out.len();
				out.push(entry);
			}
			SplicePosition::After => {
				let origin = out.len();
				remap[old_index] = origin;
				out.push(entry);
				for query in extra {
					fresh.insert(out.len());
					out.push(Entry::synthetic(query, kind, origin, database.clone()));
				}
			}
		}
	}

	for (index, entry) in out.iter_mut().enumerate() {
		if fresh.contains(&index) {
			continue;
		}
		if let Some(origin) = entry.diff_for {
			entry.diff_for = Some(remap[origin]);
		}
		if let Some(origin) = entry.auxiliary_for {
			entry.auxiliary_for = Some(remap[origin]);
		}
	}

	out
}

/// Groups still-unresolved entries by logical database and executes one
/// combined request per database, concurrently, writing results back by list
/// position.
async fn execute_unresolved(
	entries: &mut [Entry],
	config: &ClientConfig,
	token: &str,
	transport: &dyn Transport,
) -> Result<(), Error> {
	let mut groups: BTreeMap<Option<String>, Vec<usize>> = BTreeMap::new();
	for (index, entry) in entries.iter().enumerate() {
		if entry.result.is_none() {
			groups.entry(entry.database.clone()).or_default().push(index);
		}
	}
	if groups.is_empty() {
		debug!("all operations resolved by extensions, skipping network execution");
		return Ok(());
	}

	let batches: Vec<(Option<String>, Vec<usize>, Vec<Query>)> = groups
		.into_iter()
		.map(|(database, indices)| {
			let queries = indices.iter().map(|&i| entries[i].query.clone()).collect();
			(database, indices, queries)
		})
		.collect();

	let outcomes = batches
		.into_iter()
		.map(|(database, indices, queries)| async move {
			let results =
				executor::execute_batch(database.as_deref(), &queries, config, token, transport)
					.await?;
			Ok::<_, Error>((indices, results))
		})
		.collect::<Vec<_>>()
		.try_join()
		.await?;

	for (indices, results) in outcomes {
		for (index, result) in indices.into_iter().zip(results) {
			entries[index].result = Some(result);
		}
	}

	Ok(())
}

/// Fires the terminal stage for every mutating operation without awaiting it:
/// each future goes to the caller's `wait_until` callback, or to the ambient
/// runtime when one exists.
fn dispatch_following(
	entries: &[Entry],
	config: &ClientConfig,
	registry: &Arc<ExtensionRegistry>,
	policy: PipelinePolicy,
	ctx: &InvocationContext,
) -> Result<(), Error> {
	for (index, entry) in entries.iter().enumerate() {
		// Diff entries are reads by construction; auxiliary mutations spliced
		// in by before/after extensions fire like any other.
		if entry.diff_for.is_some() || !entry.query.verb().is_write() {
			continue;
		}

		// Removed records no longer exist: their own result is the "before"
		// snapshot and "after" is empty.
		let (result_before, result_after) =
			if matches!(entry.query.verb(), Verb::Remove | Verb::Drop) {
				(snapshot(entry.result.as_ref()), Vec::new())
			} else {
				let diff = entries
					.iter()
					.find(|candidate| candidate.diff_for == Some(index));
				(
					diff.map(|diff| snapshot(diff.result.as_ref()))
						.unwrap_or_default(),
					snapshot(entry.result.as_ref()),
				)
			};

		let params = InvokeParams {
			stage: Stage::Following,
			query: entry.query.clone(),
			database: entry.database.clone(),
			result_before: Some(result_before),
			result_after: Some(result_after),
			implicit: config.implicit,
		};
		let registry = Arc::clone(registry);
		let ctx = ctx.clone();
		let future = async move { invoke(params, registry, policy, ctx).await.map(|_| ()) };

		if let Some(wait_until) = &config.wait_until {
			wait_until(Box::pin(future));
		} else if let Ok(handle) = Handle::try_current() {
			handle.spawn(async move {
				if let Err(error) = future.await {
					warn!(%error, "following extension failed");
				}
			});
		} else {
			// Validated at construction; reachable only if the runtime went
			// away mid-batch.
			return Err(Error::Configuration(
				"cannot retain following extension futures without a runtime or wait_until"
					.into(),
			));
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use serde_json::json;

	use super::*;

	fn entry(verb: Verb, payload: Value) -> Entry {
		Entry::original(Query::new(verb, payload), None)
	}

	#[test]
	fn splice_before_tags_and_remaps() {
		let entries = vec![
			entry(Verb::Get, json!({"accounts": {}})),
			entry(Verb::Get, json!({"members": {}})),
		];
		let mut additions = HashMap::new();
		additions.insert(1, vec![Query::new(Verb::Get, json!({"teams": {}}))]);

		let out = splice(entries, additions, SplicePosition::Before, SyntheticKind::Auxiliary);
		assert_eq!(out.len(), 3);
		assert!(out[0].is_original());
		assert_eq!(out[1].auxiliary_for, Some(2));
		assert!(out[2].is_original());
	}

	#[test]
	fn splice_remaps_existing_diff_tags() {
		let mut entries = vec![
			entry(Verb::Set, json!({"members": {"with": {}, "to": {}}})),
			entry(Verb::Get, json!({"accounts": {}})),
		];
		// A diff already pointing at index 0.
		entries.insert(
			0,
			Entry::synthetic(
				Query::new(Verb::Get, json!({"members": {"with": {}}})),
				SyntheticKind::Diff,
				1,
				None,
			),
		);

		let mut additions = HashMap::new();
		additions.insert(0, vec![Query::new(Verb::Get, json!({"teams": {}}))]);
		let out = splice(entries, additions, SplicePosition::Before, SyntheticKind::Auxiliary);

		assert_eq!(out.len(), 4);
		// The pre-existing diff tag shifted along with its origin.
		assert_eq!(out[1].diff_for, Some(2));
	}

	#[test]
	fn diff_additions_pair_mutations_with_reads() {
		let entries = vec![
			entry(Verb::Set, json!({"members": {"with": {"id": 7}, "to": {"status": "active"}}})),
			entry(Verb::Alter, json!({"model": "account", "to": {}})),
			entry(Verb::Get, json!({"accounts": {}})),
			entry(Verb::Add, json!({"accounts": {"to": {}}})),
		];

		let additions = diff_additions(&entries);
		assert_eq!(additions.len(), 2);
		assert_eq!(
			additions[&0][0].to_value(),
			json!({"get": {"members": {"with": {"id": 7}}}})
		);
		assert_eq!(
			additions[&1][0].to_value(),
			json!({"list": {"model": "account"}})
		);
	}

	#[test]
	fn required_extensions_gate() {
		let registry = ExtensionRegistry::new();
		let entries = vec![entry(Verb::Get, json!({"accounts": {}}))];
		let policy = PipelinePolicy {
			required: RequiredExtensions::Read,
			..PipelinePolicy::default()
		};

		assert!(matches!(
			enforce_required_extensions(&entries, &registry, policy),
			Err(Error::MissingExtension { .. })
		));

		// Writes-only gating lets reads through.
		let policy = PipelinePolicy {
			required: RequiredExtensions::Write,
			..PipelinePolicy::default()
		};
		assert!(enforce_required_extensions(&entries, &registry, policy).is_ok());
	}
}
