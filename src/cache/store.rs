//! Content-addressed on-disk layout of the cache.
//!
//! Every instance lives at `<root>/<study>/<series>/<sop>.dcm`. Writes go
//! to a sibling temporary file first and are renamed into place, so a
//! reader never observes a half-written `.dcm`. Writers targeting the
//! same SOP instance serialize on a fingerprinted lock stripe; distinct
//! instances write concurrently and reads are never blocked.

use super::CacheError;
use dicom::object::{FileDicomObject, InMemDicomObject};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

const LOCK_STRIPES: usize = 256;

pub struct CacheStore {
	root: PathBuf,
	locks: Vec<Mutex<()>>,
}

impl CacheStore {
	pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
		let root = root.into();
		create_dir_chain(&root)?;
		Ok(Self {
			root,
			locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
		})
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn instance_path(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> PathBuf {
		self.root
			.join(study_instance_uid)
			.join(series_instance_uid)
			.join(format!("{sop_instance_uid}.dcm"))
	}

	pub fn study_path(&self, study_instance_uid: &str) -> PathBuf {
		self.root.join(study_instance_uid)
	}

	/// Writes one instance atomically and returns its path and size.
	/// An existing file for the same SOP instance is overwritten.
	pub fn write_instance(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
		object: &FileDicomObject<InMemDicomObject>,
	) -> Result<(PathBuf, u64), CacheError> {
		let _guard = self.lock_for(sop_instance_uid).lock().unwrap();

		let path = self.instance_path(study_instance_uid, series_instance_uid, sop_instance_uid);
		let directory = path.parent().expect("instance path has a parent");
		create_dir_chain(directory)?;

		let temp_path = directory.join(format!(".{sop_instance_uid}.{}.tmp", Uuid::new_v4()));
		object
			.write_to_file(&temp_path)
			.map_err(crate::codec::CodecError::Write)?;
		fs::rename(&temp_path, &path)?;

		let file_size = fs::metadata(&path)?.len();
		Ok((path, file_size))
	}

	/// Removes the study directory deepest-first, tolerating individual
	/// file errors. The `SR/` subdirectory written by the reporting path
	/// is removed along with the rest of the study.
	pub fn delete_study_files(&self, study_instance_uid: &str) {
		let path = self.study_path(study_instance_uid);
		if path.exists() {
			remove_tree(&path);
		}
	}

	/// Sum of all regular files below the study directories. Top-level
	/// files (the index database and its journals) are not study payload.
	pub fn size_bytes(&self) -> u64 {
		let Ok(entries) = fs::read_dir(&self.root) else {
			return 0;
		};
		entries
			.flatten()
			.map(|entry| entry.path())
			.filter(|path| path.is_dir())
			.map(|path| directory_size(&path))
			.sum()
	}

	fn lock_for(&self, sop_instance_uid: &str) -> &Mutex<()> {
		let mut hasher = DefaultHasher::new();
		sop_instance_uid.hash(&mut hasher);
		&self.locks[(hasher.finish() as usize) % LOCK_STRIPES]
	}
}

#[cfg(unix)]
fn create_dir_chain(path: &Path) -> std::io::Result<()> {
	use std::os::unix::fs::DirBuilderExt;
	if path.exists() {
		return Ok(());
	}
	fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
}

#[cfg(not(unix))]
fn create_dir_chain(path: &Path) -> std::io::Result<()> {
	fs::create_dir_all(path)
}

fn remove_tree(path: &Path) {
	let entries = match fs::read_dir(path) {
		Ok(entries) => entries,
		Err(err) => {
			warn!("Failed to list {}: {err}", path.display());
			return;
		}
	};

	for entry in entries.flatten() {
		let child = entry.path();
		if child.is_dir() {
			remove_tree(&child);
		} else if let Err(err) = fs::remove_file(&child) {
			warn!("Failed to remove {}: {err}", child.display());
		}
	}

	if let Err(err) = fs::remove_dir(path) {
		warn!("Failed to remove directory {}: {err}", path.display());
	}
}

fn directory_size(path: &Path) -> u64 {
	let Ok(entries) = fs::read_dir(path) else {
		return 0;
	};

	entries
		.flatten()
		.map(|entry| {
			let child = entry.path();
			if child.is_dir() {
				directory_size(&child)
			} else {
				fs::metadata(&child).map(|meta| meta.len()).unwrap_or(0)
			}
		})
		.sum()
}
