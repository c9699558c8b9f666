use serde_json::Value;

use super::Query;

/// Which model an operation addresses, derived from its single instruction
/// key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
	/// The key exactly as written in the instructions (possibly plural).
	pub key: String,
	/// Dash-cased singular model slug, e.g. `subscription-item`.
	pub slug: String,
	/// Whether the key's plural form signals "affects many records".
	pub multiple_records: bool,
}

impl ModelTarget {
	/// Resolves the target of a query. DDL verbs always address the reserved
	/// `"model"` model; DML verbs address the single top-level key of their
	/// payload. Returns `None` for a DML payload with no model key.
	pub fn resolve(query: &Query) -> Option<Self> {
		if query.verb().is_ddl() {
			return Some(Self {
				key: "model".into(),
				slug: "model".into(),
				multiple_records: false,
			});
		}

		let key = query.payload().as_object()?.keys().next()?.clone();
		let (singular, multiple_records) = match key.strip_suffix('s') {
			Some(stripped) if !stripped.is_empty() => (stripped, true),
			_ => (key.as_str(), false),
		};
		let slug = dash_case(singular);

		Some(Self {
			key,
			slug,
			multiple_records,
		})
	}

	/// The verb-specific instruction object this target owns within `query`.
	pub fn instructions<'a>(&self, query: &'a Query) -> Option<&'a Value> {
		if query.verb().is_ddl() {
			Some(query.payload())
		} else {
			query.payload().get(&self.key)
		}
	}
}

/// camelCase to dash-case: `subscriptionItems` -> `subscription-items`.
pub fn dash_case(input: &str) -> String {
	let mut out = String::with_capacity(input.len() + 4);
	for c in input.chars() {
		if c.is_ascii_uppercase() {
			if !out.is_empty() {
				out.push('-');
			}
			out.push(c.to_ascii_lowercase());
		} else {
			out.push(c);
		}
	}
	out
}
