use std::io::Write;

use lodestone_client::{Client, Error, Query, StorableValue, Verb};
use pretty_assertions::assert_eq;
use serde_json::json;
use tracing_test::traced_test;

mod common;

use common::{base_config, json_response, results_response, text_response, MockTransport};

const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00];

fn stored_reference() -> serde_json::Value {
	json!({
		"key": "abc123",
		"name": "photo.png",
		"src": "https://storage.lodestone.dev/v1/abc123",
		"meta": {"size": 9, "type": "image/png"},
		"placeholder": null
	})
}

fn add_with_storable(storable: StorableValue) -> Query {
	Query::new(
		Verb::Add,
		json!({"account": {"to": {
			"avatar": storable.into_value(),
			"handle": "elaine"
		}}}),
	)
}

#[tokio::test]
#[traced_test]
async fn binary_payloads_are_uploaded_then_replaced_with_references() {
	let transport = MockTransport::new(|_, request| {
		if request.is_put() {
			json_response(200, &stored_reference())
		} else {
			results_response(vec![json!({"record": {"id": "acc_1"}})])
		}
	});
	let client = Client::with_transport(base_config(), transport.clone()).unwrap();

	let storable = StorableValue::from_bytes(PNG_BYTES)
		.with_content_type("image/png")
		.with_name("my photo.png");
	client.query([add_with_storable(storable)]).await.unwrap();

	let requests = transport.requests();
	assert_eq!(requests.len(), 2);

	// The upload goes out first, byte for byte, with its metadata headers.
	let upload = &requests[0];
	assert!(upload.is_put());
	assert_eq!(&upload.body[..], PNG_BYTES);
	assert_eq!(upload.header("authorization"), Some("Bearer test-token"));
	assert_eq!(upload.header("content-type"), Some("image/png"));
	assert_eq!(
		upload.header("content-disposition"),
		Some("form-data; filename=\"my%20photo.png\"")
	);

	// The query that follows carries the stored reference, not the payload.
	let execute = &requests[1];
	assert_eq!(execute.method, "POST");
	let body = execute.json();
	assert_eq!(
		body["queries"][0]["add"]["account"]["to"]["avatar"],
		stored_reference()
	);
	assert_eq!(
		body["queries"][0]["add"]["account"]["to"]["handle"],
		json!("elaine")
	);
	assert!(!String::from_utf8_lossy(&execute.body).contains("__storable__"));
}

#[tokio::test]
#[traced_test]
async fn path_storables_are_read_from_disk_at_upload_time() {
	let mut file = tempfile::NamedTempFile::new().unwrap();
	file.write_all(PNG_BYTES).unwrap();

	let transport = MockTransport::new(|_, request| {
		if request.is_put() {
			json_response(200, &stored_reference())
		} else {
			results_response(vec![json!({"record": null})])
		}
	});
	let client = Client::with_transport(base_config(), transport.clone()).unwrap();

	let storable = StorableValue::from_path(file.path()).with_name("photo.png");
	client.query([add_with_storable(storable)]).await.unwrap();

	let requests = transport.requests();
	assert!(requests[0].is_put());
	assert_eq!(&requests[0].body[..], PNG_BYTES);
}

#[tokio::test]
#[traced_test]
async fn a_failed_upload_aborts_the_batch_before_any_query() {
	let transport = MockTransport::new(|_, _| text_response(403, "Details here"));
	let client = Client::with_transport(base_config(), transport.clone()).unwrap();

	let error = client
		.query([add_with_storable(StorableValue::from_bytes(PNG_BYTES))])
		.await
		.unwrap_err();

	let Error::InvalidResponse { status, message } = error else {
		panic!("expected an invalid-response error, got {error:?}");
	};
	assert_eq!(status, 403);
	assert!(message.contains("Details here"));

	// Only the rejected upload went out; the batch itself never executed.
	let requests = transport.requests();
	assert_eq!(requests.len(), 1);
	assert!(requests[0].is_put());
}

#[tokio::test]
#[traced_test]
async fn a_missing_payload_file_surfaces_as_an_io_error() {
	let transport = MockTransport::null_records();
	let client = Client::with_transport(base_config(), transport.clone()).unwrap();

	let storable = StorableValue::from_path("/nonexistent/path/photo.png");
	let error = client
		.query([add_with_storable(storable)])
		.await
		.unwrap_err();

	assert!(matches!(error, Error::StorableIo { .. }));
	assert_eq!(transport.requests().len(), 0);
}
