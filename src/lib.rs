//! Client-side query execution and lifecycle extension pipeline for the
//! Lodestone query endpoint.
//!
//! A batch of logical operations (`get`/`set`/`add`/`remove`/`count` plus the
//! DDL verbs) flows through a fixed stage sequence — `before`, `during`,
//! `after`, diff insertion, `resolving`, network execution, `following` —
//! with a single extension handler invocable per (model, stage, verb) triple
//! at every step. Extensions can inject auxiliary operations, replace or
//! resolve an operation outright, and observe before/after snapshots of
//! mutations; whatever remains unresolved is sent to the stateless query
//! endpoint as one combined request per logical database and reconciled back
//! into the caller's original ordering. Binary payloads in write operations
//! are uploaded to the storage endpoint and replaced with stored-object
//! references before any query is serialized.
//!
//! ```no_run
//! use lodestone_client::{Client, ClientConfig, Query, Verb};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), lodestone_client::Error> {
//! let client = Client::new(ClientConfig::new().with_token("token"))?;
//!
//! let results = client
//!     .query([Query::new(
//!         Verb::Get,
//!         json!({"accounts": {"with": {"email": {"endingWith": "site.co"}}}}),
//!     )])
//!     .await?;
//! # let _ = results;
//! # Ok(())
//! # }
//! ```

#![warn(
	clippy::all,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	clippy::dbg_macro
)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod client;
mod config;
mod error;
mod executor;
mod extension;
mod orchestrator;
mod query;
mod storable;
mod transport;

pub use client::{Client, QueryOptions, QueryWithOptions};
pub use config::{
	ClientConfig, CompiledQuery, FieldType, Model, ModelField, PipelinePolicy, QueryCompiler,
	RequiredExtensions, WaitUntil, DEFAULT_DATA_URL, DEFAULT_STORAGE_URL,
};
pub use error::{Error, HandlerError};
pub use extension::{
	ExtensionRegistry, Handler, HandlerArgs, HandlerFuture, HandlerOptions, InvocationContext,
	MethodKey, Stage, StageSet, SINK_KEY,
};
pub use query::{
	model::{dash_case, ModelTarget},
	Query, QueryResult, RecordList, Verb,
};
pub use storable::{StorableObject, StorableValue, StoredObject, STORABLE_TAG};
pub use transport::{HttpTransport, Transport, TransportError};
