use super::{AssociationError, PresentationProposal};
use crate::config::{AppConfig, PacsNodeConfig};
use crate::dimse::association::client::{ClientAssociation, ClientAssociationOptions};
use crate::dimse::cecho::EchoServiceClassUser;
use crate::types::AE;
use futures::TryFutureExt;
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

/// Idle associations kept around per remote node.
const POOL_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum PoolError {
	#[error(transparent)]
	Backend(#[from] AssociationError),
	#[error("Timed out waiting for an association to {0}")]
	Timeout(AE),
}

/// Keeps idle outbound associations to one remote PACS node for reuse.
///
/// Slots are keyed by their proposed presentation contexts; a slot is only
/// handed out again for a compatible proposal and is health-checked with a
/// C-ECHO before reuse. Used by the query service and the liveness
/// endpoint; retrieves open dedicated associations instead because their
/// negotiation differs per operation.
pub struct AssociationPool {
	inner: Arc<InnerPool>,
}

struct InnerPool {
	node: PacsNodeConfig,
	calling_aet: AE,
	slots: Mutex<VecDeque<PooledSlot>>,
	semaphore: Semaphore,
}

struct PooledSlot {
	association: ClientAssociation,
	proposal: PresentationProposal,
	metrics: Metrics,
}

#[derive(Debug)]
struct Metrics {
	created: Instant,
	recycle_count: usize,
	last_used: Instant,
}

impl PooledSlot {
	fn accepts(&self, proposal: &PresentationProposal) -> bool {
		self.proposal.abstract_syntax == proposal.abstract_syntax
			&& self
				.proposal
				.transfer_syntaxes
				.iter()
				.any(|ts| proposal.transfer_syntaxes.contains(ts))
	}
}

impl AssociationPool {
	pub fn new(calling_aet: AE, node: PacsNodeConfig) -> Self {
		Self {
			inner: Arc::new(InnerPool {
				node,
				calling_aet,
				slots: Mutex::new(VecDeque::new()),
				semaphore: Semaphore::new(POOL_SIZE),
			}),
		}
	}

	pub fn node(&self) -> &PacsNodeConfig {
		&self.inner.node
	}

	pub async fn get(
		&self,
		proposal: PresentationProposal,
	) -> Result<PooledAssociation, PoolError> {
		let acquire = tokio::time::timeout(self.inner.node.association_timeout(), async {
			self.inner
				.semaphore
				.acquire()
				.await
				.expect("Semaphore should not be closed")
				.forget();

			let slot: Option<PooledSlot> = {
				let mut slots = self.inner.slots.lock().unwrap();
				let target = slots
					.iter()
					.rposition(|slot| slot.accepts(&proposal))
					.and_then(|position| slots.remove(position));
				if target.is_none() {
					// Oldest slot makes room for the fresh association.
					slots.pop_front();
				}
				target
			};

			let slot = match slot {
				Some(mut slot) => {
					if self.recycle(&slot.association).await {
						let now = Instant::now();
						slot.metrics.recycle_count += 1;
						info!(
							backend_uuid = slot.association.uuid().to_string(),
							recycle_count = slot.metrics.recycle_count,
							idle_secs = now.duration_since(slot.metrics.last_used).as_secs(),
							age_secs = now.duration_since(slot.metrics.created).as_secs(),
							"Recycled association"
						);
						slot.metrics.last_used = now;
						slot
					} else {
						self.fresh_slot(proposal).await?
					}
				}
				None => self.fresh_slot(proposal).await?,
			};

			Ok(PooledAssociation {
				pool: Arc::downgrade(&self.inner),
				inner: Some(slot),
			})
		});

		acquire
			.unwrap_or_else(|_| Err(PoolError::Timeout(self.inner.node.ae_title.clone())))
			.await
	}

	async fn fresh_slot(&self, proposal: PresentationProposal) -> Result<PooledSlot, PoolError> {
		let association = self.connect(proposal.clone()).await?;
		let now = Instant::now();
		Ok(PooledSlot {
			association,
			proposal,
			metrics: Metrics {
				created: now,
				recycle_count: 0,
				last_used: now,
			},
		})
	}

	async fn connect(
		&self,
		proposal: PresentationProposal,
	) -> Result<ClientAssociation, PoolError> {
		let options = ClientAssociationOptions {
			calling_aet: self.inner.calling_aet.clone(),
			called_aet: self.inner.node.ae_title.clone(),
			proposals: vec![proposal],
			peer_address: self.inner.node.address(),
			connect_timeout: self.inner.node.connect_timeout(),
		};

		let association = ClientAssociation::new(options)
			.await
			.map_err(PoolError::Backend)?;

		info!(
			backend_uuid = association.uuid().to_string(),
			aet = self.inner.node.ae_title,
			"Created new client association"
		);
		Ok(association)
	}

	async fn recycle(&self, association: &ClientAssociation) -> bool {
		let verified = EchoServiceClassUser::new(association)
			.echo(Duration::from_secs(5))
			.await;
		match verified {
			Ok(true) => true,
			Ok(false) => {
				warn!(
					backend_uuid = association.uuid().to_string(),
					"Recycling failed: C-ECHO returned non-successful status"
				);
				false
			}
			Err(err) => {
				warn!(
					backend_uuid = association.uuid().to_string(),
					"Recycling failed: {err}"
				);
				false
			}
		}
	}
}

impl Clone for AssociationPool {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

/// An association checked out of the pool; returns to the pool on drop.
pub struct PooledAssociation {
	pool: Weak<InnerPool>,
	inner: Option<PooledSlot>,
}

impl Deref for PooledAssociation {
	type Target = ClientAssociation;

	fn deref(&self) -> &Self::Target {
		&self.inner.as_ref().unwrap().association
	}
}

impl Drop for PooledAssociation {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.upgrade() {
			pool.semaphore.add_permits(1);
			if let Some(slot) = self.inner.take() {
				let mut slots = pool.slots.lock().unwrap();
				slots.push_back(slot);
			}
		}
	}
}

/// One [`AssociationPool`] per configured PACS node, keyed by node name.
#[derive(Clone)]
pub struct AssociationPools(HashMap<String, AssociationPool>);

impl AssociationPools {
	pub fn new(config: &AppConfig) -> Self {
		let mut pools = HashMap::with_capacity(config.pacs.nodes.len());
		for node in &config.pacs.nodes {
			let name = node.name.clone();
			let pool = AssociationPool::new(config.dicom.local.ae_title.clone(), node.clone());
			pools.insert(name.clone(), pool);
			info!(node = name, aet = node.ae_title, "Created association pool");
		}

		Self(pools)
	}

	#[inline]
	pub fn get(&self, name: &str) -> Option<&AssociationPool> {
		self.0.get(name)
	}

	#[inline]
	pub fn names(&self) -> impl Iterator<Item = &String> {
		self.0.keys()
	}
}
