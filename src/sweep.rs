//! Retention and eviction sweeps.
//!
//! Two cooperating sweeps run on cron schedules: an age sweep that drops
//! cached studies whose last access is older than the retention window,
//! and a size sweep that evicts least-recently-used studies until the
//! cache is back under 80% of its configured cap. A per-study in-flight
//! guard keeps concurrent sweeps from deleting the same study twice.

use crate::cache::Cache;
use crate::config::CacheConfig;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Fraction of the size cap the size sweep evicts down to.
const EVICTION_TARGET: f64 = 0.8;

pub struct Sweeper {
	cache: Cache,
	retention: Duration,
	max_bytes: u64,
	in_flight: Mutex<HashSet<String>>,
}

impl Sweeper {
	pub fn new(cache: Cache, retention: Duration, max_bytes: u64) -> Arc<Self> {
		Arc::new(Self {
			cache,
			retention,
			max_bytes,
			in_flight: Mutex::new(HashSet::new()),
		})
	}

	pub fn from_config(cache: Cache, config: &CacheConfig) -> Arc<Self> {
		Self::new(cache, config.retention(), config.max_size_bytes())
	}

	/// Registers both sweeps with a scheduler and starts it.
	pub async fn schedule(
		self: &Arc<Self>,
		config: &CacheConfig,
	) -> Result<JobScheduler, tokio_cron_scheduler::JobSchedulerError> {
		let scheduler = JobScheduler::new().await?;

		let sweeper = Arc::clone(self);
		scheduler
			.add(Job::new_async(
				config.cleanup_cron.as_str(),
				move |_id, _lock| {
					let sweeper = Arc::clone(&sweeper);
					Box::pin(async move {
						sweeper.run_age_sweep().await;
					})
				},
			)?)
			.await?;

		let sweeper = Arc::clone(self);
		scheduler
			.add(Job::new_async(
				config.size_cron.as_str(),
				move |_id, _lock| {
					let sweeper = Arc::clone(&sweeper);
					Box::pin(async move {
						sweeper.run_size_sweep().await;
					})
				},
			)?)
			.await?;

		scheduler.start().await?;
		info!(
			age = config.cleanup_cron,
			size = config.size_cron,
			"Scheduled cache sweeps"
		);
		Ok(scheduler)
	}

	/// Deletes every cached study whose last access is older than the
	/// retention window. Returns the number of deleted studies.
	pub async fn run_age_sweep(&self) -> usize {
		let cutoff = Utc::now().timestamp() - self.retention.as_secs() as i64;

		let studies = match self.cache.cached_studies_by_last_access().await {
			Ok(studies) => studies,
			Err(err) => {
				error!("Age sweep could not list studies: {err}");
				return 0;
			}
		};

		let mut deleted = 0;
		for study in studies {
			let expired = study
				.last_accessed_at
				.is_some_and(|last_accessed| last_accessed < cutoff);
			if !expired {
				continue;
			}
			if self.delete_guarded(&study.study_instance_uid).await {
				deleted += 1;
			}
		}

		if deleted > 0 {
			info!(deleted, "Age sweep evicted expired studies");
		}
		deleted
	}

	/// Evicts least-recently-used studies until the cache size is at or
	/// below 80% of the cap. Size is re-sampled between deletions.
	/// Returns the number of deleted studies.
	pub async fn run_size_sweep(&self) -> usize {
		let size = match self.cache.size_bytes().await {
			Ok(size) => size,
			Err(err) => {
				error!("Size sweep could not measure the cache: {err}");
				return 0;
			}
		};
		if size <= self.max_bytes {
			return 0;
		}

		let target = (self.max_bytes as f64 * EVICTION_TARGET) as u64;
		warn!(
			size,
			max = self.max_bytes,
			target,
			"Cache over size cap, evicting by last access"
		);

		let candidates = match self.cache.cached_studies_by_last_access().await {
			Ok(candidates) => candidates,
			Err(err) => {
				error!("Size sweep could not list studies: {err}");
				return 0;
			}
		};

		let mut deleted = 0;
		for study in candidates {
			match self.cache.size_bytes().await {
				Ok(size) if size <= target => break,
				Ok(_) => {}
				Err(err) => {
					error!("Size sweep could not re-measure the cache: {err}");
					break;
				}
			}
			if self.delete_guarded(&study.study_instance_uid).await {
				deleted += 1;
			}
		}

		info!(deleted, "Size sweep finished");
		deleted
	}

	/// Deletes one study unless another sweep is already deleting it.
	async fn delete_guarded(&self, study_instance_uid: &str) -> bool {
		{
			let mut in_flight = self.in_flight.lock().unwrap();
			if !in_flight.insert(study_instance_uid.to_string()) {
				return false;
			}
		}

		let result = self.cache.delete_study(study_instance_uid).await;

		self.in_flight.lock().unwrap().remove(study_instance_uid);

		match result {
			Ok(deleted) => deleted,
			Err(err) => {
				error!(study_instance_uid, "Failed to delete study: {err}");
				false
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dictionary_std::{tags, uids};
	use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
	use smallvec::SmallVec;

	const PAYLOAD_BYTES: usize = 10_000;

	async fn seed_study(cache: &Cache, study: &str, last_accessed: i64) -> u64 {
		let mut object = InMemDicomObject::new_empty();
		let sop = format!("{study}.1.1");
		object.put(DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			PrimitiveValue::from(uids::CT_IMAGE_STORAGE),
		));
		object.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(sop.as_str()),
		));
		object.put(DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(study),
		));
		object.put(DataElement::new(
			tags::SERIES_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(format!("{study}.1")),
		));
		object.put(DataElement::new(
			tags::PATIENT_ID,
			VR::LO,
			PrimitiveValue::from("PAT-1"),
		));
		object.put(DataElement::new(
			tags::PIXEL_DATA,
			VR::OB,
			PrimitiveValue::U8(SmallVec::from_vec(vec![0u8; PAYLOAD_BYTES])),
		));

		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
			.media_storage_sop_instance_uid(sop.as_str())
			.transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
			.build()
			.unwrap();

		let stored = cache
			.store_instance(Arc::new(object.with_exact_meta(meta)), "AE1".into())
			.await
			.unwrap();
		cache.index().touch_study(study, last_accessed).unwrap();
		stored.file_size
	}

	#[tokio::test]
	async fn size_sweep_evicts_oldest_down_to_eighty_percent() {
		let dir = tempfile::tempdir().unwrap();
		let cache = Cache::open(dir.path()).unwrap();

		// ten equally sized studies with strictly increasing last access
		let mut file_size = 0;
		for i in 10..20 {
			file_size = seed_study(&cache, &format!("1.2.{i}"), i64::from(i)).await;
		}

		let max_bytes = file_size * 5;
		let sweeper = Sweeper::new(cache.clone(), Duration::from_secs(3600), max_bytes);
		let deleted = sweeper.run_size_sweep().await;

		assert_eq!(deleted, 6);
		assert!(cache.size_bytes().await.unwrap() <= (max_bytes as f64 * 0.8) as u64);
		for i in 10..16 {
			assert!(!cache.study_cached(&format!("1.2.{i}")).await.unwrap());
			assert!(!dir.path().join(format!("1.2.{i}")).exists());
		}
		for i in 16..20 {
			assert!(cache.study_cached(&format!("1.2.{i}")).await.unwrap());
		}
	}

	#[tokio::test]
	async fn size_sweep_is_a_no_op_under_the_cap() {
		let dir = tempfile::tempdir().unwrap();
		let cache = Cache::open(dir.path()).unwrap();
		seed_study(&cache, "1.2.10", 1).await;

		let sweeper = Sweeper::new(cache.clone(), Duration::from_secs(3600), u64::MAX);
		assert_eq!(sweeper.run_size_sweep().await, 0);
		assert!(cache.study_cached("1.2.10").await.unwrap());
	}

	#[tokio::test]
	async fn age_sweep_deletes_only_expired_studies() {
		let dir = tempfile::tempdir().unwrap();
		let cache = Cache::open(dir.path()).unwrap();

		let now = Utc::now().timestamp();
		let retention = Duration::from_secs(30 * 24 * 3600);
		seed_study(&cache, "1.2.10", now - 100 * 24 * 3600).await;
		seed_study(&cache, "1.2.11", now - 40 * 24 * 3600).await;
		seed_study(&cache, "1.2.12", now).await;

		let sweeper = Sweeper::new(cache.clone(), retention, u64::MAX);
		let deleted = sweeper.run_age_sweep().await;

		assert_eq!(deleted, 2);
		assert!(!cache.study_cached("1.2.10").await.unwrap());
		assert!(!cache.study_cached("1.2.11").await.unwrap());
		assert!(cache.study_cached("1.2.12").await.unwrap());
	}
}
