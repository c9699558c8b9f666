use bytes::Bytes;
use chrono::DateTime;
use http::{header, Method, Request};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
	config::{ClientConfig, FieldType, Model},
	query::{model::ModelTarget, Query, QueryResult, RecordList},
	transport::{Transport, TransportError},
	Error,
};

#[derive(Deserialize)]
struct ErrorEnvelope {
	error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
	message: String,
	#[allow(dead_code)]
	code: Option<String>,
}

/// Sends one combined request for a logical database's still-unresolved
/// operations and normalizes the response envelope back into per-operation
/// results, in order.
pub(crate) async fn execute_batch(
	database: Option<&str>,
	queries: &[Query],
	config: &ClientConfig,
	token: &str,
	transport: &dyn Transport,
) -> Result<Vec<QueryResult>, Error> {
	let payload = match &config.compiler {
		Some(compiler) => {
			let native = queries
				.iter()
				.map(|query| compiler(query))
				.collect::<Result<Vec<_>, _>>()?;
			json!({ "nativeQueries": native })
		}
		None => json!({ "queries": queries }),
	};
	// A named database nests its payload under its own key on the wire.
	let body = match database {
		Some(name) => {
			let mut envelope = Map::with_capacity(1);
			envelope.insert(name.to_string(), payload);
			Value::Object(envelope)
		}
		None => payload,
	};

	let mut builder = Request::builder()
		.method(Method::POST)
		.uri(config.data_url())
		.header(header::AUTHORIZATION, format!("Bearer {token}"))
		.header(header::CONTENT_TYPE, "application/json");
	if queries.iter().any(|query| query.verb().is_write()) {
		builder = builder.header(header::CACHE_CONTROL, "no-store");
	}
	let request = builder
		.body(Bytes::from(serde_json::to_vec(&body)?))
		.map_err(TransportError::from)?;

	debug!(
		database = database.unwrap_or("default"),
		queries = queries.len(),
		"executing batch",
	);
	let response = transport.send(request).await?;
	let status = response.status();
	let body = response.into_body();

	if !status.is_success() {
		let message = serde_json::from_slice::<ErrorEnvelope>(&body)
			.map(|envelope| envelope.error.message)
			.unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
		return Err(Error::InvalidResponse {
			status: status.as_u16(),
			message,
		});
	}

	let mut parsed: Value = serde_json::from_slice(&body)?;
	if let Some(name) = database {
		parsed = parsed.get_mut(name).map(Value::take).unwrap_or(Value::Null);
	}
	let Some(results) = parsed.get_mut("results").and_then(Value::as_array_mut) else {
		return Err(Error::InvalidResponse {
			status: status.as_u16(),
			message: "response is missing the results envelope".into(),
		});
	};
	if results.len() != queries.len() {
		return Err(Error::InvalidResponse {
			status: status.as_u16(),
			message: format!(
				"expected {} results, got {}",
				queries.len(),
				results.len()
			),
		});
	}

	results
		.iter_mut()
		.zip(queries)
		.map(|(raw, query)| normalize_result(raw, query, config))
		.collect()
}

fn normalize_result(
	raw: &mut Value,
	query: &Query,
	config: &ClientConfig,
) -> Result<QueryResult, Error> {
	let Some(envelope) = raw.as_object_mut() else {
		return Err(Error::InvalidResponse {
			status: 200,
			message: format!("malformed result envelope: {raw}"),
		});
	};

	if let Some(error) = envelope.remove("error") {
		return Err(upstream_error(&error, query));
	}

	if let Some(amount) = envelope.get("amount") {
		let amount = amount
			.as_u64()
			.or_else(|| amount.as_str().and_then(|s| s.parse().ok()))
			.ok_or_else(|| Error::InvalidResponse {
				status: 200,
				message: format!("non-numeric amount: {amount}"),
			})?;
		return Ok(QueryResult::Amount(amount));
	}

	let model = ModelTarget::resolve(query).and_then(|target| config.model(&target.slug));

	if let Some(record) = envelope.get_mut("record") {
		if record.is_null() {
			return Ok(QueryResult::Record(None));
		}
		coerce_dates(record, model);
		return Ok(QueryResult::Record(Some(record.take())));
	}

	if let Some(records) = envelope.get_mut("records").and_then(Value::as_array_mut) {
		for record in records.iter_mut() {
			coerce_dates(record, model);
		}
		let records = records.iter_mut().map(Value::take).collect();
		return Ok(QueryResult::Records(RecordList {
			records,
			more_before: envelope
				.get("moreBefore")
				.and_then(Value::as_str)
				.map(String::from),
			more_after: envelope
				.get("moreAfter")
				.and_then(Value::as_str)
				.map(String::from),
		}));
	}

	if let Some(models) = envelope.get_mut("models").and_then(Value::as_object_mut) {
		return Ok(QueryResult::Models(std::mem::take(models)));
	}

	Err(Error::InvalidResponse {
		status: 200,
		message: format!("unrecognized result envelope: {}", Value::Object(envelope.clone())),
	})
}

/// Builds the typed error for a per-result `error` envelope, resolving the
/// structured issue list to a dotted field path and recovering the offending
/// sub-instruction from the original operation for a more actionable message.
fn upstream_error(error: &Value, query: &Query) -> Error {
	let mut message = error
		.get("message")
		.and_then(Value::as_str)
		.unwrap_or("unknown upstream error")
		.to_string();
	let code = error.get("code").and_then(Value::as_str).map(String::from);
	let details = error.get("issues").or_else(|| error.get("details")).cloned();
	let fields = error.get("fields").cloned();

	let path = details
		.as_ref()
		.and_then(|issues| issues.as_array())
		.and_then(|issues| issues.first())
		.and_then(|issue| issue.get("path"))
		.and_then(dotted_path);
	if let Some(path) = &path {
		if let Some(offending) = value_at_path(query.payload(), path) {
			message = format!("{message} (offending instruction at `{path}`: {offending})");
		}
	}

	Error::Upstream {
		message,
		query: Some(Box::new(query.clone())),
		path,
		details,
		code,
		fields,
	}
}

fn dotted_path(path: &Value) -> Option<String> {
	let segments = path.as_array()?;
	let mut out = String::new();
	for segment in segments {
		let piece = match segment {
			Value::String(s) => s.clone(),
			Value::Number(n) => n.to_string(),
			_ => return None,
		};
		if !out.is_empty() {
			out.push('.');
		}
		out.push_str(&piece);
	}
	(!out.is_empty()).then_some(out)
}

fn value_at_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
	root.pointer(&format!("/{}", path.replace('.', "/")))
}

/// Rewrites every declared `date` field (dotted paths included) from its
/// ISO-8601 wire form into a unix-millisecond timestamp.
fn coerce_dates(record: &mut Value, model: Option<&Model>) {
	let Some(model) = model else { return };
	for field in &model.fields {
		if field.field_type != FieldType::Date {
			continue;
		}
		let pointer = format!("/{}", field.slug.replace('.', "/"));
		let Some(slot) = record.pointer_mut(&pointer) else {
			continue;
		};
		if let Some(raw) = slot.as_str() {
			if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
				*slot = Value::from(parsed.timestamp_millis());
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use serde_json::json;

	use super::*;
	use crate::{config::ModelField, query::Verb};

	fn config_with_account_dates() -> ClientConfig {
		ClientConfig::new().with_models(vec![Model {
			slug: "account".into(),
			fields: vec![
				ModelField {
					slug: "activeAt".into(),
					field_type: FieldType::Date,
				},
				ModelField {
					slug: "billing.renewedAt".into(),
					field_type: FieldType::Date,
				},
				ModelField {
					slug: "email".into(),
					field_type: FieldType::String,
				},
			],
		}])
	}

	fn get_accounts() -> Query {
		Query::new(Verb::Get, json!({"accounts": {}}))
	}

	#[test]
	fn amount_results_coerce_to_numbers() {
		let config = ClientConfig::new();
		let query = Query::new(Verb::Count, json!({"accounts": {}}));
		assert_eq!(
			normalize_result(&mut json!({"amount": 3}), &query, &config).unwrap(),
			QueryResult::Amount(3)
		);
		assert_eq!(
			normalize_result(&mut json!({"amount": "12"}), &query, &config).unwrap(),
			QueryResult::Amount(12)
		);
	}

	#[test]
	fn null_record_stays_null() {
		let config = ClientConfig::new();
		let query = Query::new(Verb::Get, json!({"account": {"with": {"id": 1}}}));
		assert_eq!(
			normalize_result(&mut json!({"record": null}), &query, &config).unwrap(),
			QueryResult::Record(None)
		);
	}

	#[test]
	fn declared_date_fields_become_timestamps() {
		let config = config_with_account_dates();
		let query = Query::new(Verb::Get, json!({"account": {"with": {"id": 1}}}));
		let mut raw = json!({"record": {
			"email": "elaine@site.co",
			"activeAt": "2024-04-16T15:02:12.000Z",
			"billing": {"renewedAt": "2024-05-01T00:00:00.000Z"}
		}});

		let result = normalize_result(&mut raw, &query, &config).unwrap();
		let QueryResult::Record(Some(record)) = result else {
			panic!("expected a record result");
		};
		assert_eq!(record["activeAt"], json!(1_713_279_732_000_i64));
		assert_eq!(record["billing"]["renewedAt"], json!(1_714_521_600_000_i64));
		assert_eq!(record["email"], json!("elaine@site.co"));
	}

	#[test]
	fn record_lists_carry_pagination_cursors() {
		let config = config_with_account_dates();
		let mut raw = json!({
			"records": [{"activeAt": "2024-04-16T15:02:12.000Z"}, {"activeAt": null}],
			"moreBefore": "cursor-a",
			"moreAfter": "cursor-b"
		});

		let result = normalize_result(&mut raw, &get_accounts(), &config).unwrap();
		let QueryResult::Records(list) = result else {
			panic!("expected a record list");
		};
		assert_eq!(list.records.len(), 2);
		assert_eq!(list.records[0]["activeAt"], json!(1_713_279_732_000_i64));
		assert_eq!(list.more_before.as_deref(), Some("cursor-a"));
		assert_eq!(list.more_after.as_deref(), Some("cursor-b"));
	}

	#[test]
	fn error_envelopes_recover_the_offending_instruction() {
		let config = ClientConfig::new();
		let query = Query::new(
			Verb::Get,
			json!({"accounts": {"with": {"email": {"endingWith": 5}}}}),
		);
		let mut raw = json!({"error": {
			"message": "invalid instruction",
			"code": "INVALID_INSTRUCTION",
			"issues": [{"path": ["accounts", "with", "email", "endingWith"]}]
		}});

		let error = normalize_result(&mut raw, &query, &config).unwrap_err();
		let Error::Upstream {
			message,
			path,
			code,
			..
		} = error
		else {
			panic!("expected an upstream error");
		};
		assert_eq!(path.as_deref(), Some("accounts.with.email.endingWith"));
		assert_eq!(code.as_deref(), Some("INVALID_INSTRUCTION"));
		assert!(message.contains("endingWith"), "message was: {message}");
		assert!(message.contains('5'), "message was: {message}");
	}

	#[test]
	fn unrecognized_envelopes_are_rejected() {
		let config = ClientConfig::new();
		assert!(normalize_result(&mut json!({"rows": []}), &get_accounts(), &config).is_err());
		assert!(normalize_result(&mut json!(42), &get_accounts(), &config).is_err());
	}
}
