use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
	#[error(transparent)]
	Request(#[from] reqwest::Error),
	#[error(transparent)]
	Http(#[from] http::Error),
}

/// The injection point for all network activity: uploads and query execution
/// go through a single `(Request) -> Response` seam, so tests and embedders
/// can replace the HTTP client wholesale.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError>;
}

/// Default transport backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
	client: reqwest::Client,
}

impl HttpTransport {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_client(client: reqwest::Client) -> Self {
		Self { client }
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
		let request = reqwest::Request::try_from(request.map(reqwest::Body::from))?;
		let response = self.client.execute(request).await?;

		let mut builder = Response::builder().status(response.status());
		for (name, value) in response.headers() {
			builder = builder.header(name, value);
		}
		let body = response.bytes().await?;

		Ok(builder.body(body)?)
	}
}
