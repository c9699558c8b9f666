use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

use crate::{
	extension::Stage,
	query::{Query, Verb},
	transport::TransportError,
};

/// Anything a handler may fail with; wrapped into [`Error::Extension`] by the
/// stage invoker.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("configuration error: {0}")]
	Configuration(String),

	#[error("unknown extension method name '{0}'")]
	Registration(String),

	#[error("invalid query shape: {0}")]
	InvalidQuery(String),

	#[error("required extension missing for model '{model}' and verb '{verb}'")]
	MissingExtension { model: String, verb: Verb },

	#[error("invalid output from '{stage}' extension: {message}")]
	ExtensionOutput { stage: Stage, message: String },

	#[error("extension failed during '{stage}' stage: {source}")]
	Extension { stage: Stage, source: HandlerError },

	/// A structured error envelope returned by the query endpoint for one
	/// result slot.
	#[error("{message}")]
	Upstream {
		message: String,
		query: Option<Box<Query>>,
		path: Option<String>,
		details: Option<Value>,
		code: Option<String>,
		fields: Option<Value>,
	},

	/// Non-2xx status from the query or storage endpoint.
	#[error("unexpected response <status='{status}'>: {message}")]
	InvalidResponse { status: u16, message: String },

	#[error("failed to read storable payload '{}': {source}", path.display())]
	StorableIo {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error(transparent)]
	Transport(#[from] TransportError),

	#[error(transparent)]
	Serialization(#[from] serde_json::Error),
}

impl Error {
	/// Convenience for extension authors returning ad-hoc failures.
	pub fn handler(message: impl Into<String>) -> HandlerError {
		message.into().into()
	}
}
