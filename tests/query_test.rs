//! Query service against a scripted mock find SCP: identifier on the
//! wire, result streaming and the empty-result boundary.

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom_relay::cache::Cache;
use dicom_relay::config::{AppConfig, PacsNodeConfig};
use dicom_relay::dimse::association::pool::AssociationPools;
use dicom_relay::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use dicom_relay::dimse::{
	element_string, DicomMessage, DicomMessageReader, DicomMessageWriter, DATA_SET_EXISTS,
	DATA_SET_MISSING,
};
use dicom_relay::query::{MatchCriteria, QueryService};
use dicom_relay::types::QueryRetrieveRoot;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

const TIMEOUT: Duration = Duration::from_secs(30);

fn find_response(status: u16, data: Option<InMemDicomObject>) -> DicomMessage {
	let data_set_type = if data.is_some() {
		DATA_SET_EXISTS
	} else {
		DATA_SET_MISSING
	};
	let command = InMemDicomObject::command_from_element_iter([
		DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8020])),
		DataElement::new(
			tags::MESSAGE_ID_BEING_RESPONDED_TO,
			VR::US,
			dicom_value!(U16, [1]),
		),
		DataElement::new(
			tags::COMMAND_DATA_SET_TYPE,
			VR::US,
			dicom_value!(U16, [data_set_type]),
		),
		DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
	]);

	DicomMessage {
		command,
		data,
		presentation_context_id: None,
	}
}

fn study_match(study_instance_uid: &str) -> InMemDicomObject {
	let mut dataset = InMemDicomObject::new_empty();
	dataset.put(DataElement::new(
		tags::QUERY_RETRIEVE_LEVEL,
		VR::CS,
		PrimitiveValue::from("STUDY"),
	));
	dataset.put(DataElement::new(
		tags::STUDY_INSTANCE_UID,
		VR::UI,
		PrimitiveValue::from(study_instance_uid),
	));
	dataset.put(DataElement::new(
		tags::PATIENT_ID,
		VR::LO,
		PrimitiveValue::from("PAT-1"),
	));
	dataset
}

struct Harness {
	query: QueryService,
	cache: Cache,
	listener: TcpListener,
	_cache_dir: TempDir,
}

async fn start_query_service() -> Harness {
	let cache_dir = tempfile::tempdir().unwrap();
	let cache = Cache::open(cache_dir.path()).unwrap();

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();

	let mut config = AppConfig::default();
	config.pacs.nodes.push(PacsNodeConfig {
		name: "MOCK".into(),
		ae_title: "REMOTE_AE".into(),
		hostname: "127.0.0.1".into(),
		port,
		connection_timeout: 5_000,
		response_timeout: 30_000,
		association_timeout: 30_000,
		query_retrieve_root: QueryRetrieveRoot::Study,
		is_default: true,
	});

	let pools = AssociationPools::new(&config);
	let query = QueryService::new(pools, cache.clone());

	Harness {
		query,
		cache,
		listener,
		_cache_dir: cache_dir,
	}
}

async fn accept_find_scp(listener: &TcpListener) -> (ServerAssociation, DicomMessage) {
	let (stream, _) = listener.accept().await.unwrap();
	let stream = stream.into_std().unwrap();
	stream.set_nonblocking(false).unwrap();
	let association = ServerAssociation::new(ServerAssociationOptions {
		aet: "REMOTE_AE".into(),
		tcp_stream: stream,
		uncompressed: false,
	})
	.await
	.unwrap();

	let request = association.read_message(TIMEOUT).await.unwrap();
	assert_eq!(request.command_field(), Some(0x0020));
	(association, request)
}

#[tokio::test]
async fn find_studies_streams_matches_and_records_observations() {
	let harness = start_query_service().await;

	let mock = tokio::spawn({
		let listener = harness.listener;
		async move {
			let (association, request) = accept_find_scp(&listener).await;

			let identifier = request.data.expect("C-FIND-RQ identifier");
			assert_eq!(
				element_string(&identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
				Some("STUDY")
			);
			assert_eq!(
				element_string(&identifier, tags::PATIENT_ID).as_deref(),
				Some("PAT-1")
			);
			// requested return keys travel as empty attributes
			assert!(identifier.get(tags::MODALITIES_IN_STUDY).is_some());

			for study in ["1.2.3", "1.2.4"] {
				association
					.write_message(
						find_response(0xFF00, Some(study_match(study))),
						None,
						TIMEOUT,
					)
					.await
					.unwrap();
			}
			association
				.write_message(find_response(0x0000, None), None, TIMEOUT)
				.await
				.unwrap();
		}
	});

	let mut criteria = MatchCriteria::default();
	criteria.push(tags::PATIENT_ID, "PAT-1");
	let matches = harness
		.query
		.find_studies("MOCK", &criteria, 0, 100)
		.await
		.unwrap();

	assert_eq!(matches.len(), 2);
	assert_eq!(
		element_string(&matches[0], tags::STUDY_INSTANCE_UID).as_deref(),
		Some("1.2.3")
	);

	// study observations become shallow, uncached index rows
	let summary = harness
		.cache
		.study_summary("1.2.3")
		.await
		.unwrap()
		.expect("observed study row");
	assert!(!summary.cached);

	mock.await.unwrap();
}

#[tokio::test]
async fn zero_matches_is_an_empty_result_not_an_error() {
	let harness = start_query_service().await;

	let mock = tokio::spawn({
		let listener = harness.listener;
		async move {
			let (association, _request) = accept_find_scp(&listener).await;
			association
				.write_message(find_response(0x0000, None), None, TIMEOUT)
				.await
				.unwrap();
		}
	});

	let matches = harness
		.query
		.find_studies("MOCK", &MatchCriteria::default(), 0, 100)
		.await
		.unwrap();
	assert!(matches.is_empty());

	mock.await.unwrap();
}

#[tokio::test]
async fn unknown_node_is_rejected() {
	let harness = start_query_service().await;
	let result = harness
		.query
		.find_studies("NOPE", &MatchCriteria::default(), 0, 100)
		.await;
	assert!(result.is_err());
}
