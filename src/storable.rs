use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use futures_concurrency::future::TryJoin;
use http::{header, Method, Request};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
	config::ClientConfig,
	orchestrator::Entry,
	query::{model::ModelTarget, Verb},
	transport::{Transport, TransportError},
	Error,
};

/// Reserved key marking a `to`-field value as a binary payload pending
/// upload. JSON cannot carry raw bytes, so this tag is the published contract
/// between the query-builder layer and this pipeline.
pub const STORABLE_TAG: &str = "__storable__";

#[derive(Debug, Clone, PartialEq)]
enum StorablePayload {
	Bytes(Bytes),
	/// Read from disk at upload time.
	Path(PathBuf),
}

/// A binary payload pending upload, as it travels inside `to` instructions.
#[derive(Debug, Clone, PartialEq)]
pub struct StorableValue {
	payload: StorablePayload,
	content_type: Option<String>,
	name: Option<String>,
}

impl StorableValue {
	pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
		Self {
			payload: StorablePayload::Bytes(bytes.into()),
			content_type: None,
			name: None,
		}
	}

	pub fn from_path(path: impl Into<PathBuf>) -> Self {
		Self {
			payload: StorablePayload::Path(path.into()),
			content_type: None,
			name: None,
		}
	}

	pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
		self.content_type = Some(content_type.into());
		self
	}

	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	/// The in-band wire form the DSL layer places into `to` instructions.
	pub fn into_value(self) -> Value {
		let mut inner = Map::new();
		match self.payload {
			StorablePayload::Bytes(bytes) => {
				inner.insert("bytes".into(), Value::from(BASE64.encode(&bytes)));
			}
			StorablePayload::Path(path) => {
				inner.insert("path".into(), Value::from(path.display().to_string()));
			}
		}
		if let Some(content_type) = self.content_type {
			inner.insert("contentType".into(), Value::from(content_type));
		}
		if let Some(name) = self.name {
			inner.insert("name".into(), Value::from(name));
		}
		let mut tagged = Map::with_capacity(1);
		tagged.insert(STORABLE_TAG.into(), Value::Object(inner));
		Value::Object(tagged)
	}

	fn from_value(value: &Value) -> Option<Self> {
		let inner = value.as_object()?.get(STORABLE_TAG)?.as_object()?;
		let payload = if let Some(encoded) = inner.get("bytes").and_then(Value::as_str) {
			StorablePayload::Bytes(Bytes::from(BASE64.decode(encoded).ok()?))
		} else if let Some(path) = inner.get("path").and_then(Value::as_str) {
			StorablePayload::Path(PathBuf::from(path))
		} else {
			return None;
		};
		Some(Self {
			payload,
			content_type: inner
				.get("contentType")
				.and_then(Value::as_str)
				.map(String::from),
			name: inner.get("name").and_then(Value::as_str).map(String::from),
		})
	}

	async fn read(&self) -> Result<Bytes, Error> {
		match &self.payload {
			StorablePayload::Bytes(bytes) => Ok(bytes.clone()),
			StorablePayload::Path(path) => tokio::fs::read(path)
				.await
				.map(Bytes::from)
				.map_err(|source| Error::StorableIo {
					path: path.clone(),
					source,
				}),
		}
	}
}

/// An extracted storable plus the coordinates needed to splice its uploaded
/// reference back in.
#[derive(Debug, Clone)]
pub struct StorableObject {
	pub entry_index: usize,
	pub verb: Verb,
	pub model_key: String,
	pub field: String,
	pub value: StorableValue,
}

/// The uploaded reference the storage endpoint returns, spliced back into the
/// owning operation in place of the binary payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
	pub key: String,
	#[serde(default)]
	pub name: Option<String>,
	pub src: String,
	#[serde(default)]
	pub meta: Value,
	#[serde(default)]
	pub placeholder: Option<Value>,
}

/// Walks `add`/`set` operations' `to` fields and removes every tagged binary
/// payload, leaving a hole that [`substitute`] fills after upload.
pub(crate) fn extract(entries: &mut [Entry]) -> Vec<StorableObject> {
	let mut objects = Vec::new();

	for (entry_index, entry) in entries.iter_mut().enumerate() {
		let verb = entry.query.verb();
		if !matches!(verb, Verb::Add | Verb::Set) {
			continue;
		}
		let Some(target) = ModelTarget::resolve(&entry.query) else {
			continue;
		};
		let Some(to) = entry
			.query
			.payload_mut()
			.get_mut(&target.key)
			.and_then(|instructions| instructions.get_mut("to"))
			.and_then(Value::as_object_mut)
		else {
			continue;
		};

		for (field, slot) in to.iter_mut() {
			let Some(value) = StorableValue::from_value(slot) else {
				continue;
			};
			*slot = Value::Null;
			objects.push(StorableObject {
				entry_index,
				verb,
				model_key: target.key.clone(),
				field: field.clone(),
				value,
			});
		}
	}

	objects
}

/// Uploads every extracted object concurrently; a single failure rejects the
/// aggregate and aborts the batch before any query is sent.
pub(crate) async fn upload(
	objects: &[StorableObject],
	config: &ClientConfig,
	token: &str,
	transport: &dyn Transport,
) -> Result<Vec<StoredObject>, Error> {
	debug!(objects = objects.len(), "uploading storable objects");

	objects
		.iter()
		.map(|object| upload_one(object, config, token, transport))
		.collect::<Vec<_>>()
		.try_join()
		.await
}

async fn upload_one(
	object: &StorableObject,
	config: &ClientConfig,
	token: &str,
	transport: &dyn Transport,
) -> Result<StoredObject, Error> {
	let body = object.value.read().await?;

	let mut builder = Request::builder()
		.method(Method::PUT)
		.uri(config.storage_url())
		.header(header::AUTHORIZATION, format!("Bearer {token}"));
	if let Some(content_type) = &object.value.content_type {
		builder = builder.header(header::CONTENT_TYPE, content_type);
	}
	if let Some(name) = &object.value.name {
		builder = builder.header(
			header::CONTENT_DISPOSITION,
			format!("form-data; filename=\"{}\"", percent_encode(name)),
		);
	}
	let request = builder.body(body).map_err(TransportError::from)?;

	let response = transport.send(request).await?;
	let status = response.status();
	let body = response.into_body();
	if !status.is_success() {
		return Err(Error::InvalidResponse {
			status: status.as_u16(),
			message: String::from_utf8_lossy(&body).into_owned(),
		});
	}

	Ok(serde_json::from_slice(&body)?)
}

/// Overwrites each extraction hole with its uploaded reference, in place, on
/// the operation list that is about to execute.
pub(crate) fn substitute(
	entries: &mut [Entry],
	objects: &[StorableObject],
	stored: Vec<StoredObject>,
) {
	for (object, stored) in objects.iter().zip(stored) {
		let Some(slot) = entries
			.get_mut(object.entry_index)
			.map(|entry| entry.query.payload_mut())
			.and_then(|payload| payload.get_mut(&object.model_key))
			.and_then(|instructions| instructions.get_mut("to"))
			.and_then(|to| to.get_mut(&object.field))
		else {
			continue;
		};
		*slot = serde_json::to_value(stored).unwrap_or(Value::Null);
	}
}

fn percent_encode(input: &str) -> String {
	let mut out = String::with_capacity(input.len());
	for byte in input.bytes() {
		match byte {
			b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
				out.push(byte as char);
			}
			_ => out.push_str(&format!("%{byte:02X}")),
		}
	}
	out
}
