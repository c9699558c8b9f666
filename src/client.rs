use std::{fmt, sync::Arc};

use tracing::debug;

use crate::{
	config::ClientConfig,
	extension::InvocationContext,
	orchestrator::{self, Entry},
	query::{Query, QueryResult},
	storable,
	transport::{HttpTransport, Transport},
	Error,
};

/// Per-operation options accepted alongside each query in a batch (the shape
/// the query-builder layer produces).
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
	/// Routes this operation to a named logical database; its extensions are
	/// then looked up under the sink key.
	pub database: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryWithOptions {
	pub query: Query,
	pub options: QueryOptions,
}

impl From<Query> for QueryWithOptions {
	fn from(query: Query) -> Self {
		Self {
			query,
			options: QueryOptions::default(),
		}
	}
}

/// The pipeline entry point. Construction is where every fail-fast
/// configuration check happens; no network activity occurs before a batch is
/// submitted.
pub struct Client {
	config: ClientConfig,
	token: String,
	transport: Arc<dyn Transport>,
}

impl fmt::Debug for Client {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Client")
			.field("config", &self.config)
			.field("token", &"<redacted>")
			.finish_non_exhaustive()
	}
}

impl Client {
	pub fn new(config: ClientConfig) -> Result<Self, Error> {
		Self::with_transport(config, Arc::new(HttpTransport::new()))
	}

	pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, Error> {
		let token = config.resolved_token()?;
		config.validate()?;
		Ok(Self {
			config,
			token,
			transport,
		})
	}

	pub fn config(&self) -> &ClientConfig {
		&self.config
	}

	/// Executes a batch of operations and returns their results in the
	/// original order.
	pub async fn query(
		&self,
		queries: impl IntoIterator<Item = impl Into<QueryWithOptions>>,
	) -> Result<Vec<QueryResult>, Error> {
		self.query_in_context(queries, InvocationContext::new())
			.await
	}

	/// Single-operation convenience over [`Client::query`].
	pub async fn query_one(&self, query: Query) -> Result<QueryResult, Error> {
		let mut results = self.query([query]).await?;
		results
			.pop()
			.ok_or_else(|| Error::InvalidResponse {
				status: 200,
				message: "empty result list for a single operation".into(),
			})
	}

	/// Batch execution with an explicit invocation context, for extension
	/// handlers issuing nested pipeline calls: pass
	/// [`HandlerArgs::context`](crate::HandlerArgs) back in so recursion
	/// suppression can see its ancestors.
	pub async fn query_in_context(
		&self,
		queries: impl IntoIterator<Item = impl Into<QueryWithOptions>>,
		ctx: InvocationContext,
	) -> Result<Vec<QueryResult>, Error> {
		let mut entries: Vec<Entry> = queries
			.into_iter()
			.map(Into::into)
			.map(|q| {
				let database = q.options.database.or_else(|| self.config.database.clone());
				Entry::original(q.query, database)
			})
			.collect();

		debug!(operations = entries.len(), depth = ctx.depth(), "starting batch");

		// Binary payloads leave the operation list before any stage or
		// serialization sees it.
		let storables = storable::extract(&mut entries);
		if !storables.is_empty() {
			let stored =
				storable::upload(&storables, &self.config, &self.token, self.transport.as_ref())
					.await?;
			storable::substitute(&mut entries, &storables, stored);
		}

		orchestrator::run(
			entries,
			&self.config,
			&self.token,
			self.transport.as_ref(),
			ctx,
		)
		.await
	}
}
