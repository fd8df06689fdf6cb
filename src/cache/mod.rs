//! Cache engine: content-addressed disk store plus a relational index of
//! the Patient → Study → Series → Instance hierarchy.
//!
//! Writes are idempotent per SOP instance (last writer wins) and atomic
//! on disk. Reads touch the study's last-accessed timestamp
//! asynchronously. Deletion removes files deepest-first before dropping
//! the index rows.

pub mod index;
pub mod store;

use crate::codec::CodecError;
use crate::dimse::{element_float, element_int, element_string};
use crate::types::AE;
use chrono::Utc;
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, InMemDicomObject, Tag};
use index::{CacheIndex, InstanceRecord, StudySummary};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::CacheStore;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CacheError {
	#[error("Cache I/O failed: {0}")]
	Io(#[from] std::io::Error),
	#[error("Cache index failed: {0}")]
	Index(#[from] rusqlite::Error),
	#[error(transparent)]
	Codec(#[from] CodecError),
	#[error("Dataset is missing mandatory attribute {0}")]
	MissingAttribute(Tag),
	#[error("Cache task was aborted")]
	TaskAborted,
}

/// Result of persisting one instance.
#[derive(Debug, Clone)]
pub struct StoredInstance {
	pub study_instance_uid: String,
	pub series_instance_uid: String,
	pub sop_instance_uid: String,
	pub file_path: PathBuf,
	pub file_size: u64,
}

#[derive(Clone)]
pub struct Cache {
	store: Arc<CacheStore>,
	index: Arc<CacheIndex>,
}

impl Cache {
	/// Opens the cache at `root`, creating the directory chain and the
	/// index database (`index.db` in the cache root) as needed.
	pub fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
		let store = CacheStore::new(root.as_ref())?;
		let index = CacheIndex::open(root.as_ref().join("index.db"))?;
		Ok(Self {
			store: Arc::new(store),
			index: Arc::new(index),
		})
	}

	pub fn root(&self) -> &Path {
		self.store.root()
	}

	pub fn index(&self) -> &CacheIndex {
		&self.index
	}

	/// Persists one instance: atomic file write followed by a single
	/// index transaction. Idempotent for repeated stores of the same SOP
	/// instance. Runs on the blocking pool and is deliberately not
	/// cancellable; once a write begins it completes.
	pub async fn store_instance(
		&self,
		object: Arc<FileDicomObject<InMemDicomObject>>,
		source_ae_title: AE,
	) -> Result<StoredInstance, CacheError> {
		let store = Arc::clone(&self.store);
		let index = Arc::clone(&self.index);
		tokio::task::spawn_blocking(move || {
			store_instance_blocking(&store, &index, &object, &source_ae_title)
		})
		.await
		.map_err(|_| CacheError::TaskAborted)?
	}

	/// Returns the cached file for an instance, or `None` on a miss.
	/// A hit refreshes the study's last-accessed timestamp off the
	/// request path.
	pub async fn cached_file(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<Option<PathBuf>, CacheError> {
		let row = {
			let index = Arc::clone(&self.index);
			let (study, series, sop) = (
				study_instance_uid.to_string(),
				series_instance_uid.to_string(),
				sop_instance_uid.to_string(),
			);
			tokio::task::spawn_blocking(move || index.instance(&study, &series, &sop))
				.await
				.map_err(|_| CacheError::TaskAborted)??
		};

		let Some(row) = row else {
			return Ok(None);
		};
		let path = PathBuf::from(&row.file_path);
		if !path.is_file() {
			warn!(
				sop_instance_uid,
				"Index row without file on disk, treating as miss"
			);
			return Ok(None);
		}

		let index = Arc::clone(&self.index);
		let study = study_instance_uid.to_string();
		let _touch = tokio::task::spawn_blocking(move || {
			if let Err(err) = index.touch_study(&study, Utc::now().timestamp()) {
				warn!("Failed to update last-accessed timestamp: {err}");
			}
		});

		Ok(Some(path))
	}

	pub async fn study_cached(&self, study_instance_uid: &str) -> Result<bool, CacheError> {
		let index = Arc::clone(&self.index);
		let study = study_instance_uid.to_string();
		let cached = tokio::task::spawn_blocking(move || index.study_cached(&study))
			.await
			.map_err(|_| CacheError::TaskAborted)??;
		Ok(cached)
	}

	pub async fn study_summary(
		&self,
		study_instance_uid: &str,
	) -> Result<Option<StudySummary>, CacheError> {
		let index = Arc::clone(&self.index);
		let study = study_instance_uid.to_string();
		let summary = tokio::task::spawn_blocking(move || index.study_summary(&study))
			.await
			.map_err(|_| CacheError::TaskAborted)??;
		Ok(summary)
	}

	pub async fn cached_studies_by_last_access(&self) -> Result<Vec<StudySummary>, CacheError> {
		let index = Arc::clone(&self.index);
		let studies = tokio::task::spawn_blocking(move || index.cached_studies_by_last_access())
			.await
			.map_err(|_| CacheError::TaskAborted)??;
		Ok(studies)
	}

	pub async fn series_instance_paths(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<Vec<PathBuf>, CacheError> {
		let index = Arc::clone(&self.index);
		let (study, series) = (
			study_instance_uid.to_string(),
			series_instance_uid.to_string(),
		);
		let paths = tokio::task::spawn_blocking(move || index.series_instance_paths(&study, &series))
			.await
			.map_err(|_| CacheError::TaskAborted)??;
		Ok(paths.into_iter().map(PathBuf::from).collect())
	}

	/// Deletes a study's files (deepest-first, tolerating individual file
	/// errors) and then its index rows. Returns `false` when the study
	/// was not present in the index; file-level failures alone do not
	/// fail the deletion.
	pub async fn delete_study(&self, study_instance_uid: &str) -> Result<bool, CacheError> {
		let store = Arc::clone(&self.store);
		let index = Arc::clone(&self.index);
		let study = study_instance_uid.to_string();
		let deleted = tokio::task::spawn_blocking(move || {
			store.delete_study_files(&study);
			index.delete_study(&study)
		})
		.await
		.map_err(|_| CacheError::TaskAborted)??;
		Ok(deleted)
	}

	/// Recursive size of all regular files under the cache root.
	pub async fn size_bytes(&self) -> Result<u64, CacheError> {
		let store = Arc::clone(&self.store);
		tokio::task::spawn_blocking(move || store.size_bytes())
			.await
			.map_err(|_| CacheError::TaskAborted)
	}

	/// Records a study seen in a C-FIND result as an uncached row.
	pub async fn record_study_observation(
		&self,
		study_instance_uid: String,
		patient_id: String,
		study_date: Option<String>,
		study_description: Option<String>,
		accession_number: Option<String>,
	) -> Result<(), CacheError> {
		let index = Arc::clone(&self.index);
		tokio::task::spawn_blocking(move || {
			index.record_study_observation(
				&study_instance_uid,
				&patient_id,
				study_date.as_deref(),
				study_description.as_deref(),
				accession_number.as_deref(),
			)
		})
		.await
		.map_err(|_| CacheError::TaskAborted)??;
		Ok(())
	}
}

fn store_instance_blocking(
	store: &CacheStore,
	index: &CacheIndex,
	object: &FileDicomObject<InMemDicomObject>,
	source_ae_title: &str,
) -> Result<StoredInstance, CacheError> {
	let mut record = extract_record(object)?;

	let (file_path, file_size) = store.write_instance(
		&record.study_instance_uid,
		&record.series_instance_uid,
		&record.sop_instance_uid,
		object,
	)?;
	record.file_path = file_path.to_string_lossy().into_owned();
	record.file_size = file_size;

	index.upsert_instance(&record, source_ae_title, Utc::now().timestamp())?;

	Ok(StoredInstance {
		study_instance_uid: record.study_instance_uid,
		series_instance_uid: record.series_instance_uid,
		sop_instance_uid: record.sop_instance_uid,
		file_path,
		file_size,
	})
}

/// Pulls the identifying and pixel-geometry attributes out of a dataset.
/// Only the three UIDs are mandatory; everything else degrades to NULL
/// index columns.
fn extract_record(object: &InMemDicomObject) -> Result<InstanceRecord, CacheError> {
	let study_instance_uid = element_string(object, tags::STUDY_INSTANCE_UID)
		.ok_or(CacheError::MissingAttribute(tags::STUDY_INSTANCE_UID))?;
	let series_instance_uid = element_string(object, tags::SERIES_INSTANCE_UID)
		.ok_or(CacheError::MissingAttribute(tags::SERIES_INSTANCE_UID))?;
	let sop_instance_uid = element_string(object, tags::SOP_INSTANCE_UID)
		.ok_or(CacheError::MissingAttribute(tags::SOP_INSTANCE_UID))?;

	Ok(InstanceRecord {
		patient_id: element_string(object, tags::PATIENT_ID).unwrap_or_default(),
		patient_name: element_string(object, tags::PATIENT_NAME),
		patient_birth_date: element_string(object, tags::PATIENT_BIRTH_DATE),
		patient_sex: element_string(object, tags::PATIENT_SEX),

		study_instance_uid,
		study_date: element_string(object, tags::STUDY_DATE),
		study_time: element_string(object, tags::STUDY_TIME),
		study_description: element_string(object, tags::STUDY_DESCRIPTION),
		accession_number: element_string(object, tags::ACCESSION_NUMBER),

		series_instance_uid,
		modality: element_string(object, tags::MODALITY),
		series_number: element_int(object, tags::SERIES_NUMBER),
		series_description: element_string(object, tags::SERIES_DESCRIPTION),
		body_part_examined: element_string(object, tags::BODY_PART_EXAMINED),

		sop_instance_uid,
		sop_class_uid: element_string(object, tags::SOP_CLASS_UID),
		instance_number: element_int(object, tags::INSTANCE_NUMBER),
		rows: element_int(object, tags::ROWS),
		columns: element_int(object, tags::COLUMNS),
		bits_allocated: element_int(object, tags::BITS_ALLOCATED),
		bits_stored: element_int(object, tags::BITS_STORED),
		high_bit: element_int(object, tags::HIGH_BIT),
		pixel_representation: element_int(object, tags::PIXEL_REPRESENTATION),
		samples_per_pixel: element_int(object, tags::SAMPLES_PER_PIXEL),
		photometric_interpretation: element_string(object, tags::PHOTOMETRIC_INTERPRETATION),
		number_of_frames: element_int(object, tags::NUMBER_OF_FRAMES),
		window_center: element_float(object, tags::WINDOW_CENTER),
		window_width: element_float(object, tags::WINDOW_WIDTH),
		rescale_intercept: element_float(object, tags::RESCALE_INTERCEPT),
		rescale_slope: element_float(object, tags::RESCALE_SLOPE),
		slice_thickness: element_float(object, tags::SLICE_THICKNESS),
		slice_location: element_float(object, tags::SLICE_LOCATION),
		image_position_patient: element_string(object, tags::IMAGE_POSITION_PATIENT),
		image_orientation_patient: element_string(object, tags::IMAGE_ORIENTATION_PATIENT),
		pixel_spacing: element_string(object, tags::PIXEL_SPACING),
		transfer_syntax_uid: None,
		file_path: String::new(),
		file_size: 0,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dicom_value;
	use dicom::object::FileMetaTableBuilder;
	use pretty_assertions::assert_eq;

	fn test_object(
		study: &str,
		series: &str,
		sop: &str,
		modality: &str,
	) -> Arc<FileDicomObject<InMemDicomObject>> {
		let mut object = InMemDicomObject::new_empty();
		object.put(DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			PrimitiveValue::from(dicom::dictionary_std::uids::CT_IMAGE_STORAGE),
		));
		object.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(sop),
		));
		object.put(DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(study),
		));
		object.put(DataElement::new(
			tags::SERIES_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(series),
		));
		object.put(DataElement::new(
			tags::PATIENT_ID,
			VR::LO,
			PrimitiveValue::from("PAT-1"),
		));
		object.put(DataElement::new(
			tags::MODALITY,
			VR::CS,
			PrimitiveValue::from(modality),
		));
		object.put(DataElement::new(
			tags::ROWS,
			VR::US,
			dicom_value!(U16, [16]),
		));
		object.put(DataElement::new(
			tags::COLUMNS,
			VR::US,
			dicom_value!(U16, [16]),
		));

		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(dicom::dictionary_std::uids::CT_IMAGE_STORAGE)
			.media_storage_sop_instance_uid(sop)
			.transfer_syntax(dicom::dictionary_std::uids::EXPLICIT_VR_LITTLE_ENDIAN)
			.build()
			.unwrap();
		Arc::new(object.with_exact_meta(meta))
	}

	#[tokio::test]
	async fn store_creates_canonical_path_and_rows() {
		let dir = tempfile::tempdir().unwrap();
		let cache = Cache::open(dir.path()).unwrap();

		let stored = cache
			.store_instance(test_object("1.2.3", "1.2.3.1", "1.2.3.1.1", "CT"), "AE1".into())
			.await
			.unwrap();

		assert_eq!(
			stored.file_path,
			dir.path().join("1.2.3").join("1.2.3.1").join("1.2.3.1.1.dcm")
		);
		assert!(stored.file_path.is_file());

		let row = cache
			.index()
			.instance("1.2.3", "1.2.3.1", "1.2.3.1.1")
			.unwrap()
			.expect("instance row");
		assert_eq!(row.file_path, stored.file_path.to_string_lossy());

		let summary = cache.study_summary("1.2.3").await.unwrap().unwrap();
		assert!(summary.cached);
		assert_eq!(summary.number_of_series, 1);
		assert_eq!(summary.number_of_instances, 1);
		assert_eq!(summary.modalities_in_study, "CT");
	}

	#[tokio::test]
	async fn repeated_store_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let cache = Cache::open(dir.path()).unwrap();
		let object = test_object("1.2.3", "1.2.3.1", "1.2.3.1.1", "CT");

		let first = cache
			.store_instance(Arc::clone(&object), "AE1".into())
			.await
			.unwrap();
		let second = cache.store_instance(object, "AE1".into()).await.unwrap();

		assert_eq!(first.file_path, second.file_path);
		assert_eq!(first.file_size, second.file_size);

		let summary = cache.study_summary("1.2.3").await.unwrap().unwrap();
		assert_eq!(summary.number_of_instances, 1);
		assert_eq!(summary.number_of_series, 1);
	}

	#[tokio::test]
	async fn concurrent_stores_of_same_instance_leave_one_row() {
		let dir = tempfile::tempdir().unwrap();
		let cache = Cache::open(dir.path()).unwrap();
		let object = test_object("1.2.3", "1.2.3.1", "1.2.3.1.1", "CT");

		let mut handles = Vec::new();
		for _ in 0..10 {
			let cache = cache.clone();
			let object = Arc::clone(&object);
			handles.push(tokio::spawn(async move {
				cache.store_instance(object, "AE1".into()).await
			}));
		}
		for handle in handles {
			handle.await.unwrap().unwrap();
		}

		let summary = cache.study_summary("1.2.3").await.unwrap().unwrap();
		assert_eq!(summary.number_of_instances, 1);
	}

	#[tokio::test]
	async fn modalities_in_study_keeps_first_seen_order() {
		let dir = tempfile::tempdir().unwrap();
		let cache = Cache::open(dir.path()).unwrap();

		for (series, sop, modality) in [
			("1.2.3.1", "1.2.3.1.1", "CT"),
			("1.2.3.2", "1.2.3.2.1", "SR"),
			("1.2.3.3", "1.2.3.3.1", "CT"),
		] {
			cache
				.store_instance(test_object("1.2.3", series, sop, modality), "AE1".into())
				.await
				.unwrap();
		}

		let summary = cache.study_summary("1.2.3").await.unwrap().unwrap();
		assert_eq!(summary.modalities_in_study, "CT\\SR");
		assert_eq!(summary.number_of_series, 3);
		assert_eq!(summary.number_of_instances, 3);
	}

	#[tokio::test]
	async fn delete_study_removes_files_and_rows() {
		let dir = tempfile::tempdir().unwrap();
		let cache = Cache::open(dir.path()).unwrap();
		cache
			.store_instance(test_object("1.2.3", "1.2.3.1", "1.2.3.1.1", "CT"), "AE1".into())
			.await
			.unwrap();

		assert!(cache.delete_study("1.2.3").await.unwrap());
		assert!(!dir.path().join("1.2.3").exists());
		assert!(!cache.study_cached("1.2.3").await.unwrap());
	}

	#[tokio::test]
	async fn delete_of_unknown_study_returns_false() {
		let dir = tempfile::tempdir().unwrap();
		let cache = Cache::open(dir.path()).unwrap();
		assert!(!cache.delete_study("9.9.9").await.unwrap());
	}

	#[tokio::test]
	async fn cache_miss_returns_none() {
		let dir = tempfile::tempdir().unwrap();
		let cache = Cache::open(dir.path()).unwrap();
		let file = cache.cached_file("1", "2", "3").await.unwrap();
		assert!(file.is_none());
	}
}
