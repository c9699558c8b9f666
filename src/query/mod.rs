pub mod model;

use std::fmt;

use serde::{de, ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// The kind of a logical database operation.
///
/// DML verbs (`get`/`set`/`add`/`remove`/`count`) address an arbitrary model
/// slug; DDL verbs (`create`/`alter`/`drop`/`list`) address the reserved
/// `"model"` model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Verb {
	Get,
	Set,
	Add,
	Remove,
	Count,
	Create,
	Alter,
	Drop,
	List,
}

impl Verb {
	pub const ALL: [Self; 9] = [
		Self::Get,
		Self::Set,
		Self::Add,
		Self::Remove,
		Self::Count,
		Self::Create,
		Self::Alter,
		Self::Drop,
		Self::List,
	];

	pub const fn is_ddl(self) -> bool {
		matches!(self, Self::Create | Self::Alter | Self::Drop | Self::List)
	}

	/// Mutating verbs get diff operations, the `following` stage and
	/// `Cache-Control: no-store` on the wire.
	pub const fn is_write(self) -> bool {
		!matches!(self, Self::Get | Self::Count | Self::List)
	}
}

/// One logical database operation: the single-key wire object
/// `{"<verb>": <instructions>}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
	verb: Verb,
	payload: Value,
}

impl Query {
	pub fn new(verb: Verb, payload: Value) -> Self {
		Self { verb, payload }
	}

	pub fn verb(&self) -> Verb {
		self.verb
	}

	pub fn payload(&self) -> &Value {
		&self.payload
	}

	pub fn payload_mut(&mut self) -> &mut Value {
		&mut self.payload
	}

	/// Parses a plain JSON value into a query, requiring exactly one
	/// top-level key naming a known verb.
	pub fn from_value(value: Value) -> Result<Self, crate::Error> {
		let Value::Object(map) = value else {
			return Err(crate::Error::InvalidQuery(
				"expected a single-key object".into(),
			));
		};
		if map.len() != 1 {
			return Err(crate::Error::InvalidQuery(format!(
				"expected exactly one verb key, found {}",
				map.len()
			)));
		}
		let (key, payload) = map
			.into_iter()
			.next()
			.unwrap_or((String::new(), Value::Null));
		let verb = key
			.parse::<Verb>()
			.map_err(|_| crate::Error::InvalidQuery(format!("unknown verb '{key}'")))?;
		Ok(Self { verb, payload })
	}

	/// Whether a plain JSON value already has the single-known-verb-key shape.
	pub fn is_query_shaped(value: &Value) -> bool {
		value
			.as_object()
			.filter(|map| map.len() == 1)
			.and_then(|map| map.keys().next())
			.is_some_and(|key| key.parse::<Verb>().is_ok())
	}

	pub fn to_value(&self) -> Value {
		let mut map = Map::with_capacity(1);
		map.insert(self.verb.to_string(), self.payload.clone());
		Value::Object(map)
	}
}

impl Serialize for Query {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serializer.serialize_map(Some(1))?;
		map.serialize_entry(&self.verb.to_string(), &self.payload)?;
		map.end()
	}
}

impl<'de> Deserialize<'de> for Query {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let value = Value::deserialize(deserializer)?;
		Self::from_value(value).map_err(de::Error::custom)
	}
}

impl fmt::Display for Query {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_value())
	}
}

/// A list of records plus the pagination cursors the endpoint returned
/// alongside them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordList {
	pub records: Vec<Value>,
	pub more_before: Option<String>,
	pub more_after: Option<String>,
}

/// The caller-facing shape of one operation's result.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
	/// `count` result.
	Amount(u64),
	/// Singular `get`/`remove`/`create`/`alter`/`drop` result.
	Record(Option<Value>),
	/// Plural `get` result with pagination cursors.
	Records(RecordList),
	/// Expanded "all models" result, keyed by model.
	Models(Map<String, Value>),
	/// Value supplied directly by a `during`/`resolving` extension.
	Resolved(Value),
}

impl QueryResult {
	/// Array-normalizes a result for the `following` stage: a missing result
	/// becomes an empty snapshot and a bare value is wrapped into a
	/// one-element one.
	pub fn to_snapshot(&self) -> Vec<Value> {
		match self {
			Self::Amount(amount) => vec![Value::from(*amount)],
			Self::Record(record) => vec![record.clone().unwrap_or(Value::Null)],
			Self::Records(list) => list.records.clone(),
			Self::Models(models) => vec![Value::Object(models.clone())],
			Self::Resolved(Value::Array(values)) => values.clone(),
			Self::Resolved(value) => vec![value.clone()],
		}
	}
}

pub(crate) fn snapshot(result: Option<&QueryResult>) -> Vec<Value> {
	result.map(QueryResult::to_snapshot).unwrap_or_default()
}
