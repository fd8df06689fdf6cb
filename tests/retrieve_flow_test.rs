//! End-to-end retrieve scenarios against a scripted mock PACS:
//! C-GET happy path, C-GET refusal with C-MOVE fallback, and a C-MOVE
//! destination that the remote cannot reach.

mod util;

use dicom::dictionary_std::{tags, uids};
use dicom_relay::config::{AppConfig, PacsNodeConfig};
use dicom_relay::dimse::association::client::{ClientAssociation, ClientAssociationOptions};
use dicom_relay::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use dicom_relay::dimse::association::{Association, PresentationProposal};
use dicom_relay::dimse::{element_string, DicomMessageReader, DicomMessageWriter};
use dicom_relay::retrieve::{
	RetrieveJob, RetrieveReceipt, RetrieveRequest, DESTINATION_UNKNOWN_MESSAGE,
};
use dicom_relay::sop::CORE_TRANSFER_SYNTAXES;
use dicom_relay::types::{QueryRetrieveRoot, RetrieveStatus};
use dicom_relay::AppState;
use std::net::IpAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use util::{ct_instance, free_port, retrieve_response, store_request, wait_for_port};

const TIMEOUT: Duration = Duration::from_secs(30);
const STUDY: &str = "1.2.3";

/// Presentation context ids as proposed by the orchestrator's C-GET
/// association: the retrieve context goes first, CT Image Storage is the
/// first storage class.
const GET_CONTEXT: u8 = 1;
const CT_STORAGE_CONTEXT: u8 = 3;

struct Harness {
	state: AppState,
	mock_listener: TcpListener,
	_cache_dir: TempDir,
}

async fn start_gateway(prefer_c_get: bool) -> Harness {
	let cache_dir = tempfile::tempdir().unwrap();
	let scp_port = free_port();

	let mock_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let mock_port = mock_listener.local_addr().unwrap().port();

	let mut config = AppConfig::default();
	config.dicom.local.ae_title = "RELAY-TEST".into();
	config.dicom.local.bind_address = IpAddr::from([127, 0, 0, 1]);
	config.dicom.local.port = scp_port;
	config.dicom.cache.path = cache_dir.path().to_path_buf();
	config.dicom.retrieve.prefer_c_get = prefer_c_get;
	config.dicom.retrieve.fallback_to_c_move = true;
	config.pacs.nodes.push(PacsNodeConfig {
		name: "MOCK".into(),
		ae_title: "REMOTE_AE".into(),
		hostname: "127.0.0.1".into(),
		port: mock_port,
		connection_timeout: 5_000,
		response_timeout: 30_000,
		association_timeout: 30_000,
		query_retrieve_root: QueryRetrieveRoot::Study,
		is_default: true,
	});

	let (state, scp) = AppState::wire(config).unwrap();
	tokio::spawn(async move { scp.spawn().await });
	wait_for_port(scp_port).await;

	Harness {
		state,
		mock_listener,
		_cache_dir: cache_dir,
	}
}

async fn accept_mock_association(listener: &TcpListener) -> ServerAssociation {
	let (stream, _) = listener.accept().await.unwrap();
	let stream = stream.into_std().unwrap();
	stream.set_nonblocking(false).unwrap();
	ServerAssociation::new(ServerAssociationOptions {
		aet: "REMOTE_AE".into(),
		tcp_stream: stream,
		uncompressed: false,
	})
	.await
	.unwrap()
}

/// Collects snapshots until the terminal one, asserting monotonic
/// progress counters along the way.
async fn collect_until_terminal(
	receiver: &mut tokio::sync::broadcast::Receiver<RetrieveJob>,
) -> RetrieveJob {
	let mut previous_completed = 0;
	let mut previous_failed = 0;
	loop {
		match tokio::time::timeout(TIMEOUT, receiver.recv()).await.unwrap() {
			Ok(job) => {
				assert!(job.completed_ops >= previous_completed, "completed went backwards");
				assert!(job.failed_ops >= previous_failed, "failed went backwards");
				previous_completed = job.completed_ops;
				previous_failed = job.failed_ops;
				if job.status.is_terminal() {
					return job;
				}
			}
			Err(RecvError::Lagged(_)) => continue,
			Err(RecvError::Closed) => panic!("topic closed before a terminal snapshot"),
		}
	}
}

#[tokio::test]
async fn c_get_happy_path_populates_the_cache() {
	let harness = start_gateway(true).await;

	let mock = tokio::spawn({
		let listener = harness.mock_listener;
		async move {
			let association = accept_mock_association(&listener).await;
			let request = association.read_message(TIMEOUT).await.unwrap();
			assert_eq!(request.command_field(), Some(0x0010));
			assert_eq!(
				element_string(request.data.as_ref().unwrap(), tags::STUDY_INSTANCE_UID).as_deref(),
				Some(STUDY)
			);

			for i in 1..=3u16 {
				let sop = format!("{STUDY}.1.{i}");
				let store = store_request(&sop, i, ct_instance(STUDY, "1.2.3.1", &sop));
				association
					.write_message(store, Some(CT_STORAGE_CONTEXT), TIMEOUT)
					.await
					.unwrap();

				let store_rsp = association.read_message(TIMEOUT).await.unwrap();
				assert_eq!(store_rsp.status(), Some(0x0000));

				let pending = retrieve_response(0x8010, 0xFF00, 3 - i, i, 0);
				association
					.write_message(pending, Some(GET_CONTEXT), TIMEOUT)
					.await
					.unwrap();
			}

			let done = retrieve_response(0x8010, 0x0000, 0, 3, 0);
			association
				.write_message(done, Some(GET_CONTEXT), TIMEOUT)
				.await
				.unwrap();
		}
	});

	let mut receiver = harness.state.progress.subscribe(STUDY);
	let receipt = harness
		.state
		.orchestrator
		.start(RetrieveRequest::study(STUDY, Some("MOCK".into())))
		.await
		.unwrap();
	assert!(matches!(receipt, RetrieveReceipt::Started { .. }));

	let terminal = collect_until_terminal(&mut receiver).await;
	assert_eq!(terminal.status, RetrieveStatus::Completed);
	assert_eq!(terminal.completed_ops, 3);
	assert_eq!(terminal.total_ops, 3);
	assert_eq!(terminal.failed_ops, 0);

	for i in 1..=3 {
		let path = harness
			.state
			.cache
			.root()
			.join(STUDY)
			.join("1.2.3.1")
			.join(format!("{STUDY}.1.{i}.dcm"));
		assert!(path.is_file(), "missing {}", path.display());
	}
	assert!(harness.state.cache.study_cached(STUDY).await.unwrap());

	mock.await.unwrap();
}

#[tokio::test]
async fn refused_c_get_falls_back_to_c_move() {
	let harness = start_gateway(true).await;
	let scp_port = harness.state.config.dicom.local.port;

	let mock = tokio::spawn({
		let listener = harness.mock_listener;
		async move {
			// First association: refuse the C-GET outright.
			let association = accept_mock_association(&listener).await;
			let request = association.read_message(TIMEOUT).await.unwrap();
			assert_eq!(request.command_field(), Some(0x0010));
			let refused = retrieve_response(0x8010, 0xA702, 0, 0, 0);
			association
				.write_message(refused, Some(GET_CONTEXT), TIMEOUT)
				.await
				.unwrap();

			// Second association: the C-MOVE fallback.
			let association = accept_mock_association(&listener).await;
			let request = association.read_message(TIMEOUT).await.unwrap();
			assert_eq!(request.command_field(), Some(0x0021));
			assert_eq!(
				element_string(&request.command, tags::MOVE_DESTINATION).as_deref(),
				Some("RELAY-TEST")
			);

			// Play store SCU against the gateway's Storage-SCP.
			let scu = ClientAssociation::new(ClientAssociationOptions {
				calling_aet: "REMOTE_AE".into(),
				called_aet: "RELAY-TEST".into(),
				proposals: vec![PresentationProposal::new(
					uids::CT_IMAGE_STORAGE,
					CORE_TRANSFER_SYNTAXES.iter().copied(),
				)],
				peer_address: format!("127.0.0.1:{scp_port}"),
				connect_timeout: Duration::from_secs(5),
			})
			.await
			.unwrap();
			let sop = format!("{STUDY}.1.1");
			let store = store_request(&sop, 1, ct_instance(STUDY, "1.2.3.1", &sop));
			scu.write_message(store, None, TIMEOUT).await.unwrap();
			let store_rsp = scu.read_message(TIMEOUT).await.unwrap();
			assert_eq!(store_rsp.status(), Some(0x0000));

			let done = retrieve_response(0x8021, 0x0000, 0, 1, 0);
			association
				.write_message(done, Some(GET_CONTEXT), TIMEOUT)
				.await
				.unwrap();
		}
	});

	let mut receiver = harness.state.progress.subscribe(STUDY);
	let receipt = harness
		.state
		.orchestrator
		.start(RetrieveRequest::study(STUDY, Some("MOCK".into())))
		.await
		.unwrap();
	assert!(matches!(receipt, RetrieveReceipt::Started { .. }));

	let terminal = collect_until_terminal(&mut receiver).await;
	assert_eq!(terminal.status, RetrieveStatus::Completed);
	assert_eq!(terminal.completed_ops, 1);

	let path = harness
		.state
		.cache
		.root()
		.join(STUDY)
		.join("1.2.3.1")
		.join(format!("{STUDY}.1.1.dcm"));
	assert!(path.is_file());

	mock.await.unwrap();
}

#[tokio::test]
async fn unknown_move_destination_fails_with_diagnostic() {
	let harness = start_gateway(false).await;

	let mock = tokio::spawn({
		let listener = harness.mock_listener;
		async move {
			let association = accept_mock_association(&listener).await;
			let request = association.read_message(TIMEOUT).await.unwrap();
			assert_eq!(request.command_field(), Some(0x0021));

			let unknown = retrieve_response(0x8021, 0xA702, 0, 0, 0);
			association
				.write_message(unknown, Some(GET_CONTEXT), TIMEOUT)
				.await
				.unwrap();
		}
	});

	let mut receiver = harness.state.progress.subscribe(STUDY);
	harness
		.state
		.orchestrator
		.start(RetrieveRequest::study(STUDY, Some("MOCK".into())))
		.await
		.unwrap();

	let terminal = collect_until_terminal(&mut receiver).await;
	assert_eq!(terminal.status, RetrieveStatus::Failed);
	assert_eq!(
		terminal.error_message.as_deref(),
		Some(DESTINATION_UNKNOWN_MESSAGE)
	);

	mock.await.unwrap();
}

#[tokio::test]
async fn fully_cached_studies_answer_already_cached() {
	let harness = start_gateway(true).await;

	// Seed the cache directly through the cache engine.
	let object = ct_instance(STUDY, "1.2.3.1", "1.2.3.1.1");
	let meta = dicom::object::FileMetaTableBuilder::new()
		.media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
		.media_storage_sop_instance_uid("1.2.3.1.1")
		.transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
		.build()
		.unwrap();
	harness
		.state
		.cache
		.store_instance(
			std::sync::Arc::new(object.with_exact_meta(meta)),
			"SEED".into(),
		)
		.await
		.unwrap();

	let receipt = harness
		.state
		.orchestrator
		.start(RetrieveRequest::study(STUDY, Some("MOCK".into())))
		.await
		.unwrap();
	assert!(matches!(receipt, RetrieveReceipt::AlreadyCached { .. }));
}

/// Messages written without an explicit presentation context land on the
/// first negotiated context; this pins the proposal-order assumption the
/// mock relies on.
#[tokio::test]
async fn first_negotiated_context_is_the_first_proposed() {
	let harness = start_gateway(true).await;

	let accept = tokio::spawn({
		let listener = harness.mock_listener;
		async move {
			let association = accept_mock_association(&listener).await;
			let contexts: Vec<u8> = association
				.presentation_contexts()
				.iter()
				.map(|pctx| pctx.id)
				.collect();
			contexts
		}
	});

	let node = harness.state.config.node(Some("MOCK")).unwrap().clone();
	let client = ClientAssociation::new(ClientAssociationOptions {
		calling_aet: "RELAY-TEST".into(),
		called_aet: node.ae_title.clone(),
		proposals: vec![
			PresentationProposal::new(
				uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
				CORE_TRANSFER_SYNTAXES.iter().copied(),
			),
			PresentationProposal::new(
				uids::CT_IMAGE_STORAGE,
				CORE_TRANSFER_SYNTAXES.iter().copied(),
			),
		],
		peer_address: node.address(),
		connect_timeout: Duration::from_secs(5),
	})
	.await
	.unwrap();

	assert_eq!(
		client.presentation_contexts().first().map(|pctx| pctx.id),
		Some(GET_CONTEXT)
	);
	let server_contexts = accept.await.unwrap();
	assert_eq!(server_contexts.first().copied(), Some(GET_CONTEXT));
	assert!(server_contexts.contains(&CT_STORAGE_CONTEXT));
}
