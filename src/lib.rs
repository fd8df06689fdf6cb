//! DICOMweb gateway and instance cache in front of legacy PACS nodes.
//!
//! Viewers speak QIDO-RS/WADO-RS against this service; upstream
//! communication happens over DICOM upper-layer associations (C-FIND,
//! C-GET, C-MOVE with a concurrent Storage-SCP). Retrieved instances are
//! cached on disk with a relational index and retrieve progress fans out
//! to WebSocket subscribers.

pub mod api;
pub mod cache;
pub mod codec;
pub mod config;
pub mod dimse;
pub mod progress;
pub mod query;
pub mod retrieve;
pub mod scp;
pub mod sop;
pub mod sweep;
pub mod types;
pub mod volume;

use crate::cache::Cache;
use crate::config::AppConfig;
use crate::dimse::association::pool::AssociationPools;
use crate::progress::IngestBus;
use crate::query::QueryService;
use crate::retrieve::{ProgressBus, RetrieveOrchestrator};
use crate::scp::StoreServiceClassProvider;
use std::sync::Arc;

/// AE title used when none is configured.
pub const DEFAULT_AET: &str = "DICOM-RELAY";

#[derive(Clone)]
pub struct AppState {
	pub config: Arc<AppConfig>,
	pub cache: Cache,
	pub pools: AssociationPools,
	pub query: Arc<QueryService>,
	pub orchestrator: Arc<RetrieveOrchestrator>,
	pub progress: Arc<ProgressBus>,
}

impl AppState {
	/// Wires the full service graph from configuration. The returned
	/// Storage-SCP still has to be spawned and the sweeps scheduled by
	/// the caller.
	pub fn wire(config: AppConfig) -> anyhow::Result<(Self, Arc<StoreServiceClassProvider>)> {
		let config = Arc::new(config);
		let cache = Cache::open(&config.dicom.cache.path)?;
		let pools = AssociationPools::new(&config);
		let progress: Arc<ProgressBus> = Arc::new(ProgressBus::new());
		let ingest: Arc<IngestBus> = Arc::new(IngestBus::new());

		let scp = Arc::new(StoreServiceClassProvider::new(
			cache.clone(),
			Arc::clone(&ingest),
			config.dicom.local.clone(),
		));
		let query = Arc::new(QueryService::new(pools.clone(), cache.clone()));
		let orchestrator = RetrieveOrchestrator::new(
			Arc::clone(&config),
			cache.clone(),
			Arc::clone(&progress),
			ingest,
			Arc::clone(&scp),
		);

		Ok((
			Self {
				config,
				cache,
				pools,
				query,
				orchestrator,
				progress,
			},
			scp,
		))
	}
}
