//! Storage service class provider.
//!
//! Accepts inbound associations on the configured local endpoint, answers
//! C-ECHO, ingests C-STORE requests into the cache and publishes an
//! ingest event per persisted instance. C-MOVE sub-operations from remote
//! PACS nodes land here.

use crate::cache::Cache;
use crate::config::LocalAeConfig;
use crate::dimse::association::server::{AbortHandle, ServerAssociation, ServerAssociationOptions};
use crate::dimse::association::Association;
use crate::dimse::cecho::{EchoReply, COMMAND_FIELD_ECHO_REQUEST};
use crate::dimse::cstore::{
	CompositeStoreResponse, StoreRequestIdentity, COMMAND_FIELD_COMPOSITE_STORE_REQUEST,
	STORE_STATUS_PROCESSING_FAILURE, STORE_STATUS_SUCCESS,
};
use crate::dimse::{element_uint16, DicomMessage, DicomMessageReader, DicomMessageWriter};
use crate::progress::{IngestBus, IngestEvent};
use anyhow::Context;
use dicom::dictionary_std::tags;
use dicom::object::FileMetaTableBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StoreServiceClassProvider {
	inner: Arc<InnerStoreServiceClassProvider>,
}

struct InnerStoreServiceClassProvider {
	cache: Cache,
	ingest: Arc<IngestBus>,
	config: LocalAeConfig,
	/// Transport handles of currently open inbound associations, used to
	/// abort C-MOVE sub-operations when their job is cancelled.
	peers: Mutex<HashMap<Uuid, AbortHandle>>,
}

impl StoreServiceClassProvider {
	pub fn new(cache: Cache, ingest: Arc<IngestBus>, config: LocalAeConfig) -> Self {
		Self {
			inner: Arc::new(InnerStoreServiceClassProvider {
				cache,
				ingest,
				config,
				peers: Mutex::new(HashMap::new()),
			}),
		}
	}

	/// Aborts every open inbound association initiated by `calling_aet`.
	pub fn abort_associations_from(&self, calling_aet: &str) {
		let peers = self.inner.peers.lock().unwrap();
		for handle in peers.values() {
			if handle.calling_aet() == calling_aet {
				warn!(calling_aet, "Aborting inbound association");
				handle.abort();
			}
		}
	}

	pub async fn spawn(&self) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.config.bind_address, self.inner.config.port));
		let listener = TcpListener::bind(&address).await?;
		info!("Started Store Service Class Provider on {}", address);
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let span = info_span!(
						"STORE-SCP",
						aet = &self.inner.config.ae_title,
						peer = peer.to_string()
					);
					info!("Accepted incoming connection from {peer}");
					let inner = Arc::clone(&self.inner);
					tokio::spawn(async move {
						if let Err(err) = Self::process(stream, inner).instrument(span).await {
							error!("{err}");
						}
					});
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			};
		}
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		inner: Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// The `dicom-ul` crate does not use non-blocking reads/writes.
		// The actual reading/writing happens in ServerAssociation, which
		// moves I/O operations to another thread.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.config.ae_title.clone(),
			tcp_stream,
			uncompressed: false,
		};
		let association = ServerAssociation::new(options).await?;

		let peer_id = Uuid::new_v4();
		if let Some(handle) = association.abort_handle() {
			inner.peers.lock().unwrap().insert(peer_id, handle);
		}

		// Duration::MAX to indefinitely wait for incoming messages.
		let result = async {
			while let Ok(message) = association.read_message(Duration::MAX).await {
				match message.command_field() {
					Some(COMMAND_FIELD_ECHO_REQUEST) => {
						Self::answer_echo(&association, &message).await?;
					}
					Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {
						Self::ingest(&association, message, &inner).await?;
					}
					other => {
						return Err(anyhow::anyhow!(
							"Unexpected Command Field {other:?}. Only C-STORE-RQ and C-ECHO-RQ are supported."
						));
					}
				}
			}
			Ok(())
		}
		.await;

		inner.peers.lock().unwrap().remove(&peer_id);
		result
	}

	async fn answer_echo(
		association: &ServerAssociation,
		message: &DicomMessage,
	) -> anyhow::Result<()> {
		let message_id = element_uint16(&message.command, tags::MESSAGE_ID).unwrap_or(0);
		debug!(message_id, "Answering C-ECHO-RQ");
		let reply = EchoReply {
			message_id_being_responded_to: message_id,
		};
		association
			.write_message(reply, message.presentation_context_id, RESPONSE_TIMEOUT)
			.await?;
		Ok(())
	}

	async fn ingest(
		association: &ServerAssociation,
		message: DicomMessage,
		inner: &Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		let presentation_context_id = message.presentation_context_id;
		let identity = StoreRequestIdentity::from_command(&message.command)
			.context("C-STORE-RQ without SOP identity")?;

		info!(
			sop_instance_uid = identity.sop_instance_uid.as_str(),
			sop_class_uid = identity.sop_class_uid.as_str(),
			"Received instance"
		);

		let transfer_syntax = association
			.presentation_contexts()
			.iter()
			.find(|pctx| Some(pctx.id) == presentation_context_id)
			.map(|pctx| pctx.transfer_syntax.clone())
			.context("No presentation context for inbound data")?;

		let stored = match message.data {
			Some(data) => {
				let meta = FileMetaTableBuilder::new()
					.media_storage_sop_class_uid(identity.sop_class_uid.as_str())
					.media_storage_sop_instance_uid(identity.sop_instance_uid.as_str())
					.transfer_syntax(transfer_syntax.as_str())
					.build()
					.expect("FileMetaTableBuilder should contain required data");
				let file = Arc::new(data.with_exact_meta(meta));

				Some(
					inner
						.cache
						.store_instance(file, association.calling_aet().to_string())
						.await,
				)
			}
			None => {
				error!("C-STORE-RQ without a data set");
				None
			}
		};

		let status = match &stored {
			Some(Ok(_)) => STORE_STATUS_SUCCESS,
			Some(Err(err)) => {
				error!("Failed to persist instance: {err}");
				STORE_STATUS_PROCESSING_FAILURE
			}
			None => STORE_STATUS_PROCESSING_FAILURE,
		};

		let response = CompositeStoreResponse {
			message_id: identity.message_id,
			sop_class_uid: identity.sop_class_uid,
			sop_instance_uid: identity.sop_instance_uid,
			status,
		};
		association
			.write_message(response, presentation_context_id, RESPONSE_TIMEOUT)
			.await?;

		if let Some(Ok(stored)) = stored {
			let topic = stored.study_instance_uid.clone();
			let event = IngestEvent {
				study_instance_uid: stored.study_instance_uid,
				series_instance_uid: stored.series_instance_uid,
				sop_instance_uid: stored.sop_instance_uid,
				calling_aet: association.calling_aet().to_string(),
			};
			inner.ingest.publish(&topic, event);
		}

		Ok(())
	}
}
