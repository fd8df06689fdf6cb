//! Retrieve orchestrator.
//!
//! Drives a C-GET (preferred) or C-MOVE retrieve against one remote PACS
//! node, aggregates sub-operation counters from the DIMSE response stream
//! and the Storage-SCP ingest channel, and publishes job snapshots on the
//! per-study progress topic. A recoverable C-GET failure falls back to a
//! single C-MOVE attempt.

use crate::cache::{Cache, CacheError};
use crate::config::{AppConfig, NodeError, PacsNodeConfig};
use crate::dimse::association::client::{ClientAssociation, ClientAssociationOptions};
use crate::dimse::association::{AssociationError, PresentationProposal};
use crate::dimse::cget::{CompositeGetRequest, GetError, GetEvent, GetServiceClassUser};
use crate::dimse::cmove::{
	CompositeMoveRequest, MoveError, MoveServiceClassUser, STATUS_MOVE_DESTINATION_UNKNOWN,
};
use crate::dimse::{
	next_message_id, NegotiationError, ReadError, StatusType, SubOperationCounts,
	SubOperationProgress, WriteError,
};
use crate::progress::{IngestEvent, TopicBus};
use crate::scp::StoreServiceClassProvider;
use crate::sop::{CORE_TRANSFER_SYNTAXES, STORAGE_SOP_CLASSES};
use crate::types::{
	Priority, QueryRetrieveLevel, RetrieveStatus, RetrieveStrategy, AE, UI, US,
};
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use futures::{pin_mut, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Overall deadline for one retrieve job. When it elapses the outbound
/// association is aborted and the job fails.
pub const RETRIEVE_DEADLINE: Duration = Duration::from_secs(300);

/// Diagnostic for a move SCP that cannot reach our Storage-SCP; the
/// remote is missing a registration for the local AE.
pub const DESTINATION_UNKNOWN_MESSAGE: &str =
	"Destination unknown - remote PACS cannot reach this application";

/// Per-study progress topics carrying [`RetrieveJob`] snapshots.
pub type ProgressBus = TopicBus<RetrieveJob>;

#[derive(Debug, Clone)]
pub struct RetrieveRequest {
	pub level: QueryRetrieveLevel,
	pub study_instance_uid: UI,
	pub series_instance_uid: Option<UI>,
	pub sop_instance_uid: Option<UI>,
	/// Configured node name; `None` selects the default node.
	pub node_name: Option<String>,
}

impl RetrieveRequest {
	pub fn study(study_instance_uid: impl Into<UI>, node_name: Option<String>) -> Self {
		Self {
			level: QueryRetrieveLevel::Study,
			study_instance_uid: study_instance_uid.into(),
			series_instance_uid: None,
			sop_instance_uid: None,
			node_name,
		}
	}
}

/// In-memory state of one retrieve; every mutation is published as a
/// snapshot on the study topic.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveJob {
	pub id: Uuid,
	pub study_instance_uid: UI,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub series_instance_uid: Option<UI>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub sop_instance_uid: Option<UI>,
	pub level: QueryRetrieveLevel,
	pub remote: AE,
	pub strategy: RetrieveStrategy,
	pub total_ops: u32,
	pub completed_ops: u32,
	pub failed_ops: u32,
	pub warning_ops: u32,
	pub status: RetrieveStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
}

impl RetrieveJob {
	fn new(request: &RetrieveRequest, remote: AE, strategy: RetrieveStrategy) -> Self {
		Self {
			id: Uuid::new_v4(),
			study_instance_uid: request.study_instance_uid.clone(),
			series_instance_uid: request.series_instance_uid.clone(),
			sop_instance_uid: request.sop_instance_uid.clone(),
			level: request.level,
			remote,
			strategy,
			total_ops: 0,
			completed_ops: 0,
			failed_ops: 0,
			warning_ops: 0,
			status: RetrieveStatus::Started,
			error_message: None,
		}
	}

	pub fn percent_complete(&self) -> u8 {
		if self.total_ops == 0 {
			return 0;
		}
		let done = self.completed_ops + self.failed_ops + self.warning_ops;
		((done * 100) / self.total_ops).min(100) as u8
	}

	/// Folds remote counters and locally observed instance counts into
	/// the job. Completed and failed counts never decrease, keeping
	/// progress monotonic even when a PACS reports counters sparsely.
	fn merge(&mut self, counts: &SubOperationCounts, stored: u32, local_failures: u32) {
		self.completed_ops = self
			.completed_ops
			.max(u32::from(counts.completed.unwrap_or(0)))
			.max(stored);
		self.failed_ops = self
			.failed_ops
			.max(u32::from(counts.failed.unwrap_or(0)))
			.max(local_failures);
		self.warning_ops = self.warning_ops.max(u32::from(counts.warning.unwrap_or(0)));
		self.total_ops = self
			.total_ops
			.max(counts.total().unwrap_or(0))
			.max(self.completed_ops + self.failed_ops + self.warning_ops);
	}
}

/// Immediate answer to a retrieve request; the job itself continues in
/// the background and reports through the progress topic.
#[derive(Debug, Clone)]
pub enum RetrieveReceipt {
	AlreadyCached { study_instance_uid: UI },
	Started { job: RetrieveJob },
}

#[derive(Debug, Error)]
pub enum RetrieveError {
	#[error(transparent)]
	Node(#[from] NodeError),
	#[error(transparent)]
	Cache(#[from] CacheError),
}

enum Attempt {
	/// Terminal status reached; the job fields are final.
	Finished,
	/// The remote refused C-GET with a status that allows C-MOVE.
	Recoverable(US),
	Cancelled,
}

struct ActiveJob {
	snapshot: RetrieveJob,
	cancel: watch::Sender<bool>,
}

pub struct RetrieveOrchestrator {
	config: Arc<AppConfig>,
	cache: Cache,
	progress: Arc<ProgressBus>,
	ingest: Arc<TopicBus<IngestEvent>>,
	scp: Arc<StoreServiceClassProvider>,
	active: Mutex<HashMap<UI, ActiveJob>>,
}

impl RetrieveOrchestrator {
	pub fn new(
		config: Arc<AppConfig>,
		cache: Cache,
		progress: Arc<ProgressBus>,
		ingest: Arc<TopicBus<IngestEvent>>,
		scp: Arc<StoreServiceClassProvider>,
	) -> Arc<Self> {
		Arc::new(Self {
			config,
			cache,
			progress,
			ingest,
			scp,
			active: Mutex::new(HashMap::new()),
		})
	}

	/// Starts a retrieve and returns immediately with a job handle.
	/// A study that is already fully cached is terminal; a study with a
	/// running job joins that job instead of starting a second one.
	pub async fn start(
		self: &Arc<Self>,
		request: RetrieveRequest,
	) -> Result<RetrieveReceipt, RetrieveError> {
		let node = self.config.node(request.node_name.as_deref())?.clone();

		if request.level == QueryRetrieveLevel::Study
			&& self.cache.study_cached(&request.study_instance_uid).await?
		{
			return Ok(RetrieveReceipt::AlreadyCached {
				study_instance_uid: request.study_instance_uid,
			});
		}

		let strategy = if self.config.dicom.retrieve.prefer_c_get {
			RetrieveStrategy::CGet
		} else {
			RetrieveStrategy::CMove
		};
		let job = RetrieveJob::new(&request, node.ae_title.clone(), strategy);

		{
			let mut active = self.active.lock().unwrap();
			if let Some(running) = active.get(&request.study_instance_uid) {
				return Ok(RetrieveReceipt::Started {
					job: running.snapshot.clone(),
				});
			}
			let (cancel, _) = watch::channel(false);
			active.insert(
				request.study_instance_uid.clone(),
				ActiveJob {
					snapshot: job.clone(),
					cancel,
				},
			);
		}

		self.publish(&job);

		let orchestrator = Arc::clone(self);
		let spawned_job = job.clone();
		tokio::spawn(async move {
			orchestrator.run(spawned_job, node, request).await;
		});

		Ok(RetrieveReceipt::Started { job })
	}

	/// Trips the cancellation token of a running job. The orchestrator
	/// sends C-CANCEL on its outbound association and aborts inbound
	/// associations from the job's remote.
	pub fn cancel(&self, study_instance_uid: &str) -> bool {
		let active = self.active.lock().unwrap();
		active
			.get(study_instance_uid)
			.is_some_and(|job| job.cancel.send(true).is_ok())
	}

	pub fn active_job(&self, study_instance_uid: &str) -> Option<RetrieveJob> {
		let active = self.active.lock().unwrap();
		active
			.get(study_instance_uid)
			.map(|job| job.snapshot.clone())
	}

	#[instrument(skip_all, fields(study = %job.study_instance_uid, job = %job.id))]
	async fn run(self: Arc<Self>, mut job: RetrieveJob, node: PacsNodeConfig, request: RetrieveRequest) {
		let mut cancel_rx = {
			let active = self.active.lock().unwrap();
			active
				.get(&job.study_instance_uid)
				.map(|active_job| active_job.cancel.subscribe())
		}
		.expect("job was registered in start()");

		let outcome = tokio::time::timeout(
			RETRIEVE_DEADLINE,
			self.execute(&mut job, &node, &request, &mut cancel_rx),
		)
		.await;

		match outcome {
			Ok(()) => {}
			Err(_) => {
				job.status = RetrieveStatus::Failed;
				job.error_message = Some(format!(
					"Retrieve did not finish within {} seconds",
					RETRIEVE_DEADLINE.as_secs()
				));
			}
		}

		if !job.status.is_terminal() {
			job.status = RetrieveStatus::Failed;
			job.error_message
				.get_or_insert_with(|| String::from("Retrieve ended without a terminal status"));
		}

		info!(status = ?job.status, completed = job.completed_ops, failed = job.failed_ops, "Retrieve finished");
		self.publish(&job);
		self.progress.close(&job.study_instance_uid);
		self.active.lock().unwrap().remove(&job.study_instance_uid);
	}

	async fn execute(
		&self,
		job: &mut RetrieveJob,
		node: &PacsNodeConfig,
		request: &RetrieveRequest,
		cancel_rx: &mut watch::Receiver<bool>,
	) {
		let retrieve_config = &self.config.dicom.retrieve;

		if retrieve_config.prefer_c_get {
			job.strategy = RetrieveStrategy::CGet;
			match self.attempt_get(job, node, request, cancel_rx).await {
				Ok(Attempt::Finished) => return,
				Ok(Attempt::Cancelled) => {
					Self::mark_cancelled(job);
					return;
				}
				Ok(Attempt::Recoverable(status)) => {
					if !retrieve_config.fallback_to_c_move {
						job.status = RetrieveStatus::Failed;
						job.error_message =
							Some(format!("C-GET refused with status 0x{status:04X}"));
						return;
					}
					warn!(status = format!("0x{status:04X}"), "C-GET refused, falling back to C-MOVE");
				}
				Err(message) => {
					job.status = RetrieveStatus::Failed;
					job.error_message = Some(message);
					return;
				}
			}
		}

		job.strategy = RetrieveStrategy::CMove;
		self.publish(job);
		match self.attempt_move(job, node, request, cancel_rx).await {
			Ok(Attempt::Finished) => {}
			Ok(Attempt::Cancelled) => Self::mark_cancelled(job),
			Ok(Attempt::Recoverable(status)) => {
				// No further fallback exists beyond C-MOVE.
				job.status = RetrieveStatus::Failed;
				job.error_message = Some(format!("C-MOVE failed with status 0x{status:04X}"));
			}
			Err(message) => {
				job.status = RetrieveStatus::Failed;
				job.error_message = Some(message);
			}
		}
	}

	fn mark_cancelled(job: &mut RetrieveJob) {
		job.status = RetrieveStatus::Failed;
		job.error_message = Some(String::from("Retrieve was cancelled"));
	}

	/// C-GET: sub-operations arrive as inbound C-STOREs on the same
	/// association and are persisted inline.
	async fn attempt_get(
		&self,
		job: &mut RetrieveJob,
		node: &PacsNodeConfig,
		request: &RetrieveRequest,
		cancel_rx: &mut watch::Receiver<bool>,
	) -> Result<Attempt, String> {
		let association = match self.open_get_association(node).await {
			Ok(association) => association,
			Err(err) => return Err(format!("Failed to open C-GET association: {err}")),
		};

		let scu = GetServiceClassUser::new(association, node.response_timeout(), next_message_id());
		let get_request = CompositeGetRequest {
			affected_sop_class_uid: UI::from(node.query_retrieve_root.get_sop_class()),
			identifier: create_identifier(request),
			message_id: scu.message_id(),
			priority: Priority::Medium as US,
		};

		let mut stored: u32 = 0;
		let mut local_failures: u32 = 0;

		let stream = scu.invoke(get_request);
		pin_mut!(stream);

		loop {
			let event = tokio::select! {
				changed = cancel_rx.changed() => {
					if changed.is_ok() && *cancel_rx.borrow() {
						if let Err(err) = scu.cancel().await {
							warn!("Failed to send C-CANCEL: {err}");
						}
						scu.abort();
						return Ok(Attempt::Cancelled);
					}
					continue;
				}
				event = stream.next() => event,
			};

			let Some(event) = event else {
				return Err(String::from("C-GET response stream ended unexpectedly"));
			};

			match event {
				Ok(GetEvent::Instance(object)) => {
					match self
						.cache
						.store_instance(Arc::from(object), node.ae_title.clone())
						.await
					{
						Ok(instance) => {
							stored += 1;
							info!(
								sop_instance_uid = instance.sop_instance_uid.as_str(),
								"Persisted C-GET sub-operation"
							);
						}
						Err(err) => {
							// A failed write only fails this sub-operation.
							local_failures += 1;
							error!("Failed to persist C-GET sub-operation: {err}");
						}
					}
					job.status = RetrieveStatus::Retrieving;
					job.merge(&SubOperationCounts::default(), stored, local_failures);
					self.publish(job);
				}
				Ok(GetEvent::Undecodable) => {
					local_failures += 1;
					job.status = RetrieveStatus::Retrieving;
					job.merge(&SubOperationCounts::default(), stored, local_failures);
					self.publish(job);
				}
				Ok(GetEvent::Progress(progress)) => {
					job.status = RetrieveStatus::Retrieving;
					job.merge(&progress.counts, stored, local_failures);
					self.publish(job);

					if progress.is_final() {
						return Ok(Self::conclude(job, &progress, RetrieveStrategy::CGet));
					}
				}
				Err(err) => return Self::map_get_error(&err),
			}
		}
	}

	/// C-MOVE: instances arrive on separate inbound associations handled
	/// by the Storage-SCP; ingest events fill in progress between sparse
	/// counter reports without double-counting.
	async fn attempt_move(
		&self,
		job: &mut RetrieveJob,
		node: &PacsNodeConfig,
		request: &RetrieveRequest,
		cancel_rx: &mut watch::Receiver<bool>,
	) -> Result<Attempt, String> {
		let association = match self.open_move_association(node).await {
			Ok(association) => association,
			Err(err) => return Err(format!("Failed to open C-MOVE association: {err}")),
		};

		let mut ingest_rx = self.ingest.subscribe(&job.study_instance_uid);
		let scu = MoveServiceClassUser::new(association, node.response_timeout(), next_message_id());
		let move_request = CompositeMoveRequest {
			affected_sop_class_uid: UI::from(node.query_retrieve_root.move_sop_class()),
			identifier: create_identifier(request),
			message_id: scu.message_id(),
			priority: Priority::Medium as US,
			destination: self.config.dicom.local.ae_title.clone(),
		};

		let mut ingested: u32 = 0;

		let stream = scu.invoke(move_request);
		pin_mut!(stream);

		loop {
			let item = tokio::select! {
				changed = cancel_rx.changed() => {
					if changed.is_ok() && *cancel_rx.borrow() {
						if let Err(err) = scu.cancel().await {
							warn!("Failed to send C-CANCEL: {err}");
						}
						scu.abort();
						self.scp.abort_associations_from(&node.ae_title);
						return Ok(Attempt::Cancelled);
					}
					continue;
				}
				ingest = ingest_rx.recv() => {
					if ingest.is_ok() {
						ingested += 1;
						job.status = RetrieveStatus::Retrieving;
						job.merge(&SubOperationCounts::default(), ingested, 0);
						self.publish(job);
					}
					continue;
				}
				item = stream.next() => item,
			};

			let Some(item) = item else {
				return Err(String::from("C-MOVE response stream ended unexpectedly"));
			};

			match item {
				Ok(progress) => {
					job.status = RetrieveStatus::Retrieving;
					job.merge(&progress.counts, ingested, 0);
					self.publish(job);

					if progress.is_final() {
						if progress.status == STATUS_MOVE_DESTINATION_UNKNOWN {
							job.status = RetrieveStatus::Failed;
							job.error_message = Some(String::from(DESTINATION_UNKNOWN_MESSAGE));
							return Ok(Attempt::Finished);
						}
						return Ok(Self::conclude(job, &progress, RetrieveStrategy::CMove));
					}
				}
				Err(err) => return Self::map_move_error(&err),
			}
		}
	}

	/// Applies the final response status to the job.
	fn conclude(
		job: &mut RetrieveJob,
		progress: &SubOperationProgress,
		strategy: RetrieveStrategy,
	) -> Attempt {
		match progress.status_type {
			StatusType::Success => {
				job.status = if job.failed_ops > 0 {
					RetrieveStatus::CompletedWithErrors
				} else {
					RetrieveStatus::Completed
				};
				Attempt::Finished
			}
			StatusType::Warning => {
				job.status = RetrieveStatus::CompletedWithErrors;
				Attempt::Finished
			}
			StatusType::Cancel => Attempt::Cancelled,
			StatusType::Pending => unreachable!("pending responses are not final"),
			StatusType::Failure => {
				if strategy == RetrieveStrategy::CGet && is_recoverable(progress.status) {
					return Attempt::Recoverable(progress.status);
				}
				job.status = RetrieveStatus::Failed;
				job.error_message = Some(format!(
					"{strategy} failed with status 0x{:04X}",
					progress.status
				));
				Attempt::Finished
			}
		}
	}

	fn map_get_error(err: &GetError) -> Result<Attempt, String> {
		if is_negotiation_failure_get(err) {
			// No presentation context for the retrieve; same fallback as
			// a refused C-GET.
			return Ok(Attempt::Recoverable(0x0122));
		}
		Err(format!("C-GET failed: {err}"))
	}

	fn map_move_error(err: &MoveError) -> Result<Attempt, String> {
		Err(format!("C-MOVE failed: {err}"))
	}

	async fn open_get_association(
		&self,
		node: &PacsNodeConfig,
	) -> Result<ClientAssociation, AssociationError> {
		// The retrieve context goes first so the C-GET-RQ can be written
		// on the first negotiated context; the storage contexts receive
		// the inbound sub-operations.
		let mut proposals = Vec::with_capacity(1 + STORAGE_SOP_CLASSES.len());
		proposals.push(PresentationProposal::new(
			node.query_retrieve_root.get_sop_class(),
			CORE_TRANSFER_SYNTAXES.iter().copied(),
		));
		for sop_class in STORAGE_SOP_CLASSES {
			proposals.push(PresentationProposal::new(
				*sop_class,
				CORE_TRANSFER_SYNTAXES.iter().copied(),
			));
		}

		ClientAssociation::new(ClientAssociationOptions {
			calling_aet: self.config.dicom.local.ae_title.clone(),
			called_aet: node.ae_title.clone(),
			proposals,
			peer_address: node.address(),
			connect_timeout: node.connect_timeout(),
		})
		.await
	}

	async fn open_move_association(
		&self,
		node: &PacsNodeConfig,
	) -> Result<ClientAssociation, AssociationError> {
		ClientAssociation::new(ClientAssociationOptions {
			calling_aet: self.config.dicom.local.ae_title.clone(),
			called_aet: node.ae_title.clone(),
			proposals: vec![PresentationProposal::new(
				node.query_retrieve_root.move_sop_class(),
				CORE_TRANSFER_SYNTAXES.iter().copied(),
			)],
			peer_address: node.address(),
			connect_timeout: node.connect_timeout(),
		})
		.await
	}

	fn publish(&self, job: &RetrieveJob) {
		{
			let mut active = self.active.lock().unwrap();
			if let Some(active_job) = active.get_mut(&job.study_instance_uid) {
				active_job.snapshot = job.clone();
			}
		}
		self.progress.publish(&job.study_instance_uid, job.clone());
	}
}

/// Statuses on which a refused C-GET may be retried as C-MOVE:
/// out of resources, destination unknown, SOP class not supported.
const fn is_recoverable(status: US) -> bool {
	matches!(status, 0xA701 | 0xA702 | 0x0122)
}

fn is_negotiation_failure_get(err: &GetError) -> bool {
	matches!(
		err,
		GetError::Write(WriteError::Negotiation(NegotiationError::NoPresentationContext))
			| GetError::Read(ReadError::Negotiation(NegotiationError::NoPresentationContext))
	)
}

/// Builds the retrieve identifier for the requested level.
#[rustfmt::skip]
fn create_identifier(request: &RetrieveRequest) -> InMemDicomObject {
    let mut identifier = InMemDicomObject::new_empty();

    match (
        &request.study_instance_uid,
        request.series_instance_uid.as_deref(),
        request.sop_instance_uid.as_deref(),
    ) {
        (study, None, None) => {
            identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, QueryRetrieveLevel::Study.to_string());
            identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study);
        }
        (study, Some(series), None) => {
            identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, QueryRetrieveLevel::Series.to_string());
            identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study);
            identifier.put_str(tags::SERIES_INSTANCE_UID, VR::UI, series);
        }
        (study, Some(series), Some(instance)) => {
            identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, QueryRetrieveLevel::Image.to_string());
            identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study);
            identifier.put_str(tags::SERIES_INSTANCE_UID, VR::UI, series);
            identifier.put_str(tags::SOP_INSTANCE_UID, VR::UI, instance);
        }
        (study, None, Some(instance)) => {
            // An instance without its series still addresses the image level.
            identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, QueryRetrieveLevel::Image.to_string());
            identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study);
            identifier.put_str(tags::SOP_INSTANCE_UID, VR::UI, instance);
        }
    }

    identifier
}
