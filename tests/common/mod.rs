#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use lodestone_client::{ClientConfig, Transport, TransportError};
use serde_json::{json, Value};

/// One request as the pipeline put it on the wire, with the body collected.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
	pub method: String,
	pub uri: String,
	pub headers: Vec<(String, String)>,
	pub body: Bytes,
}

impl RecordedRequest {
	pub fn json(&self) -> Value {
		serde_json::from_slice(&self.body).expect("request body should be JSON")
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn is_put(&self) -> bool {
		self.method == "PUT"
	}
}

/// Serializes tests that mutate process-wide environment variables.
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

type Responder = Box<dyn Fn(usize, &RecordedRequest) -> Response<Bytes> + Send + Sync>;

/// Closure-backed transport that records everything it is asked to send.
pub struct MockTransport {
	requests: Mutex<Vec<RecordedRequest>>,
	responder: Responder,
}

impl MockTransport {
	pub fn new(
		responder: impl Fn(usize, &RecordedRequest) -> Response<Bytes> + Send + Sync + 'static,
	) -> Arc<Self> {
		Arc::new(Self {
			requests: Mutex::new(Vec::new()),
			responder: Box::new(responder),
		})
	}

	/// Responds to every request with `{"results": [...]}` containing one
	/// `{"record": null}` per submitted query.
	pub fn null_records() -> Arc<Self> {
		Self::new(|_, request| {
			let queries = request.json()["queries"]
				.as_array()
				.map(Vec::len)
				.unwrap_or(0);
			results_response(vec![json!({"record": null}); queries])
		})
	}

	pub fn requests(&self) -> Vec<RecordedRequest> {
		self.requests.lock().unwrap().clone()
	}
}

#[async_trait]
impl Transport for MockTransport {
	async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
		let (parts, body) = request.into_parts();
		let recorded = RecordedRequest {
			method: parts.method.to_string(),
			uri: parts.uri.to_string(),
			headers: parts
				.headers
				.iter()
				.map(|(name, value)| {
					(
						name.to_string(),
						String::from_utf8_lossy(value.as_bytes()).into_owned(),
					)
				})
				.collect(),
			body,
		};

		let mut requests = self.requests.lock().unwrap();
		let response = (self.responder)(requests.len(), &recorded);
		requests.push(recorded);
		Ok(response)
	}
}

pub fn json_response(status: u16, body: &Value) -> Response<Bytes> {
	Response::builder()
		.status(StatusCode::from_u16(status).unwrap())
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Bytes::from(serde_json::to_vec(body).unwrap()))
		.unwrap()
}

pub fn text_response(status: u16, body: &str) -> Response<Bytes> {
	Response::builder()
		.status(StatusCode::from_u16(status).unwrap())
		.body(Bytes::from(body.to_string()))
		.unwrap()
}

pub fn results_response(results: Vec<Value>) -> Response<Bytes> {
	json_response(200, &json!({ "results": results }))
}

pub fn base_config() -> ClientConfig {
	ClientConfig::new().with_token("test-token")
}
