//! Relational index over the cached Patient → Study → Series → Instance
//! hierarchy, backed by an embedded SQLite database in the cache root.
//!
//! All writes happen inside transactions; aggregate counts and the
//! modalities-in-study summary are recomputed on every upsert so the index
//! invariants hold after each statement batch.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS patient (
    patient_id          TEXT PRIMARY KEY,
    patient_name        TEXT,
    patient_birth_date  TEXT,
    patient_sex         TEXT,
    number_of_studies   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS study (
    study_instance_uid  TEXT PRIMARY KEY,
    patient_id          TEXT NOT NULL,
    study_date          TEXT,
    study_time          TEXT,
    study_description   TEXT,
    accession_number    TEXT,
    modalities_in_study TEXT NOT NULL DEFAULT '',
    number_of_series    INTEGER NOT NULL DEFAULT 0,
    number_of_instances INTEGER NOT NULL DEFAULT 0,
    cached              INTEGER NOT NULL DEFAULT 0,
    cached_at           INTEGER,
    last_accessed_at    INTEGER,
    source_ae_title     TEXT
);

CREATE TABLE IF NOT EXISTS series (
    series_instance_uid TEXT PRIMARY KEY,
    study_instance_uid  TEXT NOT NULL,
    modality            TEXT,
    series_number       INTEGER,
    series_description  TEXT,
    body_part_examined  TEXT,
    number_of_instances INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS instance (
    sop_instance_uid            TEXT PRIMARY KEY,
    series_instance_uid         TEXT NOT NULL,
    study_instance_uid          TEXT NOT NULL,
    sop_class_uid               TEXT,
    instance_number             INTEGER,
    rows                        INTEGER,
    columns                     INTEGER,
    bits_allocated              INTEGER,
    bits_stored                 INTEGER,
    high_bit                    INTEGER,
    pixel_representation        INTEGER,
    samples_per_pixel           INTEGER,
    photometric_interpretation  TEXT,
    number_of_frames            INTEGER,
    window_center               REAL,
    window_width                REAL,
    rescale_intercept           REAL,
    rescale_slope               REAL,
    slice_thickness             REAL,
    slice_location              REAL,
    image_position_patient      TEXT,
    image_orientation_patient   TEXT,
    pixel_spacing               TEXT,
    transfer_syntax_uid         TEXT,
    file_path                   TEXT NOT NULL,
    file_size                   INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_series_study   ON series(study_instance_uid);
CREATE INDEX IF NOT EXISTS idx_instance_series ON instance(series_instance_uid);
CREATE INDEX IF NOT EXISTS idx_instance_study  ON instance(study_instance_uid);
";

/// Everything the index records about one stored instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceRecord {
	pub patient_id: String,
	pub patient_name: Option<String>,
	pub patient_birth_date: Option<String>,
	pub patient_sex: Option<String>,

	pub study_instance_uid: String,
	pub study_date: Option<String>,
	pub study_time: Option<String>,
	pub study_description: Option<String>,
	pub accession_number: Option<String>,

	pub series_instance_uid: String,
	pub modality: Option<String>,
	pub series_number: Option<i64>,
	pub series_description: Option<String>,
	pub body_part_examined: Option<String>,

	pub sop_instance_uid: String,
	pub sop_class_uid: Option<String>,
	pub instance_number: Option<i64>,
	pub rows: Option<i64>,
	pub columns: Option<i64>,
	pub bits_allocated: Option<i64>,
	pub bits_stored: Option<i64>,
	pub high_bit: Option<i64>,
	pub pixel_representation: Option<i64>,
	pub samples_per_pixel: Option<i64>,
	pub photometric_interpretation: Option<String>,
	pub number_of_frames: Option<i64>,
	pub window_center: Option<f64>,
	pub window_width: Option<f64>,
	pub rescale_intercept: Option<f64>,
	pub rescale_slope: Option<f64>,
	pub slice_thickness: Option<f64>,
	pub slice_location: Option<f64>,
	pub image_position_patient: Option<String>,
	pub image_orientation_patient: Option<String>,
	pub pixel_spacing: Option<String>,
	pub transfer_syntax_uid: Option<String>,
	pub file_path: String,
	pub file_size: u64,
}

/// A row of the instance table as needed by readers.
#[derive(Debug, Clone)]
pub struct InstanceRow {
	pub sop_instance_uid: String,
	pub series_instance_uid: String,
	pub study_instance_uid: String,
	pub file_path: String,
	pub file_size: u64,
}

/// Study-level digest for the retention and eviction sweeps.
#[derive(Debug, Clone)]
pub struct StudySummary {
	pub study_instance_uid: String,
	pub cached: bool,
	pub cached_at: Option<i64>,
	pub last_accessed_at: Option<i64>,
	pub number_of_series: i64,
	pub number_of_instances: i64,
	pub modalities_in_study: String,
}

pub struct CacheIndex {
	connection: Mutex<Connection>,
}

impl CacheIndex {
	pub fn open(path: impl AsRef<Path>) -> Result<Self, rusqlite::Error> {
		let connection = Connection::open(path)?;
		Self::initialize(connection)
	}

	pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
		Self::initialize(Connection::open_in_memory()?)
	}

	fn initialize(connection: Connection) -> Result<Self, rusqlite::Error> {
		connection.pragma_update(None, "journal_mode", "WAL")?;
		connection.pragma_update(None, "synchronous", "NORMAL")?;
		connection.busy_timeout(std::time::Duration::from_secs(10))?;
		connection.execute_batch(SCHEMA)?;
		Ok(Self {
			connection: Mutex::new(connection),
		})
	}

	/// Upserts the full Patient → Study → Series → Instance chain for one
	/// stored instance and recomputes the aggregate counts, all within a
	/// single transaction.
	pub fn upsert_instance(
		&self,
		record: &InstanceRecord,
		source_ae_title: &str,
		now: i64,
	) -> Result<(), rusqlite::Error> {
		let mut connection = self.connection.lock().unwrap();
		let tx = connection.transaction()?;

		tx.execute(
			"INSERT INTO patient (patient_id, patient_name, patient_birth_date, patient_sex)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(patient_id) DO UPDATE SET
                patient_name       = COALESCE(excluded.patient_name, patient.patient_name),
                patient_birth_date = COALESCE(excluded.patient_birth_date, patient.patient_birth_date),
                patient_sex        = COALESCE(excluded.patient_sex, patient.patient_sex)",
			params![
				record.patient_id,
				record.patient_name,
				record.patient_birth_date,
				record.patient_sex,
			],
		)?;

		tx.execute(
			"INSERT INTO study (study_instance_uid, patient_id, study_date, study_time,
                                study_description, accession_number, cached, cached_at,
                                last_accessed_at, source_ae_title)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7, ?8)
             ON CONFLICT(study_instance_uid) DO UPDATE SET
                patient_id        = excluded.patient_id,
                study_date        = COALESCE(excluded.study_date, study.study_date),
                study_time        = COALESCE(excluded.study_time, study.study_time),
                study_description = COALESCE(excluded.study_description, study.study_description),
                accession_number  = COALESCE(excluded.accession_number, study.accession_number),
                cached            = 1,
                cached_at         = COALESCE(study.cached_at, excluded.cached_at),
                last_accessed_at  = excluded.last_accessed_at,
                source_ae_title   = excluded.source_ae_title",
			params![
				record.study_instance_uid,
				record.patient_id,
				record.study_date,
				record.study_time,
				record.study_description,
				record.accession_number,
				now,
				source_ae_title,
			],
		)?;

		tx.execute(
			"INSERT INTO series (series_instance_uid, study_instance_uid, modality,
                                 series_number, series_description, body_part_examined)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(series_instance_uid) DO UPDATE SET
                modality           = COALESCE(excluded.modality, series.modality),
                series_number      = COALESCE(excluded.series_number, series.series_number),
                series_description = COALESCE(excluded.series_description, series.series_description),
                body_part_examined = COALESCE(excluded.body_part_examined, series.body_part_examined)",
			params![
				record.series_instance_uid,
				record.study_instance_uid,
				record.modality,
				record.series_number,
				record.series_description,
				record.body_part_examined,
			],
		)?;

		tx.execute(
			"INSERT INTO instance (sop_instance_uid, series_instance_uid, study_instance_uid,
                 sop_class_uid, instance_number, rows, columns, bits_allocated, bits_stored,
                 high_bit, pixel_representation, samples_per_pixel, photometric_interpretation,
                 number_of_frames, window_center, window_width, rescale_intercept, rescale_slope,
                 slice_thickness, slice_location, image_position_patient,
                 image_orientation_patient, pixel_spacing, transfer_syntax_uid,
                 file_path, file_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
             ON CONFLICT(sop_instance_uid) DO UPDATE SET
                series_instance_uid        = excluded.series_instance_uid,
                study_instance_uid         = excluded.study_instance_uid,
                sop_class_uid              = excluded.sop_class_uid,
                instance_number            = excluded.instance_number,
                rows                       = excluded.rows,
                columns                    = excluded.columns,
                bits_allocated             = excluded.bits_allocated,
                bits_stored                = excluded.bits_stored,
                high_bit                   = excluded.high_bit,
                pixel_representation       = excluded.pixel_representation,
                samples_per_pixel          = excluded.samples_per_pixel,
                photometric_interpretation = excluded.photometric_interpretation,
                number_of_frames           = excluded.number_of_frames,
                window_center              = excluded.window_center,
                window_width               = excluded.window_width,
                rescale_intercept          = excluded.rescale_intercept,
                rescale_slope              = excluded.rescale_slope,
                slice_thickness            = excluded.slice_thickness,
                slice_location             = excluded.slice_location,
                image_position_patient     = excluded.image_position_patient,
                image_orientation_patient  = excluded.image_orientation_patient,
                pixel_spacing              = excluded.pixel_spacing,
                transfer_syntax_uid        = excluded.transfer_syntax_uid,
                file_path                  = excluded.file_path,
                file_size                  = excluded.file_size",
			params![
				record.sop_instance_uid,
				record.series_instance_uid,
				record.study_instance_uid,
				record.sop_class_uid,
				record.instance_number,
				record.rows,
				record.columns,
				record.bits_allocated,
				record.bits_stored,
				record.high_bit,
				record.pixel_representation,
				record.samples_per_pixel,
				record.photometric_interpretation,
				record.number_of_frames,
				record.window_center,
				record.window_width,
				record.rescale_intercept,
				record.rescale_slope,
				record.slice_thickness,
				record.slice_location,
				record.image_position_patient,
				record.image_orientation_patient,
				record.pixel_spacing,
				record.transfer_syntax_uid,
				record.file_path,
				record.file_size as i64,
			],
		)?;

		tx.execute(
			"UPDATE series SET number_of_instances =
                (SELECT COUNT(*) FROM instance WHERE series_instance_uid = ?1)
             WHERE series_instance_uid = ?1",
			params![record.series_instance_uid],
		)?;

		// modalities-in-study keeps first-seen order, so append rather
		// than recompute.
		let modalities: String = tx.query_row(
			"SELECT modalities_in_study FROM study WHERE study_instance_uid = ?1",
			params![record.study_instance_uid],
			|row| row.get(0),
		)?;
		if let Some(modality) = record.modality.as_deref() {
			if !modalities.split('\\').any(|m| m == modality) {
				let updated = if modalities.is_empty() {
					modality.to_string()
				} else {
					format!("{modalities}\\{modality}")
				};
				tx.execute(
					"UPDATE study SET modalities_in_study = ?2 WHERE study_instance_uid = ?1",
					params![record.study_instance_uid, updated],
				)?;
			}
		}

		tx.execute(
			"UPDATE study SET
                number_of_series    = (SELECT COUNT(*) FROM series   WHERE study_instance_uid = ?1),
                number_of_instances = (SELECT COUNT(*) FROM instance WHERE study_instance_uid = ?1)
             WHERE study_instance_uid = ?1",
			params![record.study_instance_uid],
		)?;

		tx.execute(
			"UPDATE patient SET number_of_studies =
                (SELECT COUNT(*) FROM study WHERE patient_id = ?1)
             WHERE patient_id = ?1",
			params![record.patient_id],
		)?;

		tx.commit()
	}

	/// Records a study observed in a C-FIND result without marking it
	/// cached. Existing rows are left untouched.
	pub fn record_study_observation(
		&self,
		study_instance_uid: &str,
		patient_id: &str,
		study_date: Option<&str>,
		study_description: Option<&str>,
		accession_number: Option<&str>,
	) -> Result<(), rusqlite::Error> {
		let connection = self.connection.lock().unwrap();
		connection.execute(
			"INSERT INTO patient (patient_id) VALUES (?1)
             ON CONFLICT(patient_id) DO NOTHING",
			params![patient_id],
		)?;
		connection.execute(
			"INSERT INTO study (study_instance_uid, patient_id, study_date,
                                study_description, accession_number, cached)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT(study_instance_uid) DO NOTHING",
			params![
				study_instance_uid,
				patient_id,
				study_date,
				study_description,
				accession_number,
			],
		)?;
		Ok(())
	}

	pub fn instance(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<Option<InstanceRow>, rusqlite::Error> {
		let connection = self.connection.lock().unwrap();
		connection
			.query_row(
				"SELECT sop_instance_uid, series_instance_uid, study_instance_uid,
                        file_path, file_size
                 FROM instance
                 WHERE study_instance_uid = ?1
                   AND series_instance_uid = ?2
                   AND sop_instance_uid = ?3",
				params![study_instance_uid, series_instance_uid, sop_instance_uid],
				|row| {
					Ok(InstanceRow {
						sop_instance_uid: row.get(0)?,
						series_instance_uid: row.get(1)?,
						study_instance_uid: row.get(2)?,
						file_path: row.get(3)?,
						file_size: row.get::<_, i64>(4)? as u64,
					})
				},
			)
			.optional()
	}

	/// File paths of all instances of a series, ordered by instance number.
	pub fn series_instance_paths(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<Vec<String>, rusqlite::Error> {
		let connection = self.connection.lock().unwrap();
		let mut statement = connection.prepare(
			"SELECT file_path FROM instance
             WHERE study_instance_uid = ?1 AND series_instance_uid = ?2
             ORDER BY instance_number, sop_instance_uid",
		)?;
		let paths = statement
			.query_map(params![study_instance_uid, series_instance_uid], |row| {
				row.get(0)
			})?
			.collect::<Result<Vec<String>, _>>()?;
		Ok(paths)
	}

	pub fn study_cached(&self, study_instance_uid: &str) -> Result<bool, rusqlite::Error> {
		let connection = self.connection.lock().unwrap();
		let cached: Option<i64> = connection
			.query_row(
				"SELECT cached FROM study WHERE study_instance_uid = ?1",
				params![study_instance_uid],
				|row| row.get(0),
			)
			.optional()?;
		Ok(cached == Some(1))
	}

	pub fn touch_study(
		&self,
		study_instance_uid: &str,
		now: i64,
	) -> Result<(), rusqlite::Error> {
		let connection = self.connection.lock().unwrap();
		connection.execute(
			"UPDATE study SET last_accessed_at = ?2 WHERE study_instance_uid = ?1",
			params![study_instance_uid, now],
		)?;
		Ok(())
	}

	pub fn study_summary(
		&self,
		study_instance_uid: &str,
	) -> Result<Option<StudySummary>, rusqlite::Error> {
		let connection = self.connection.lock().unwrap();
		connection
			.query_row(
				"SELECT study_instance_uid, cached, cached_at, last_accessed_at,
                        number_of_series, number_of_instances, modalities_in_study
                 FROM study WHERE study_instance_uid = ?1",
				params![study_instance_uid],
				Self::summary_from_row,
			)
			.optional()
	}

	/// All cached studies in ascending last-accessed order; the head of
	/// the list is the first LRU eviction candidate.
	pub fn cached_studies_by_last_access(&self) -> Result<Vec<StudySummary>, rusqlite::Error> {
		let connection = self.connection.lock().unwrap();
		let mut statement = connection.prepare(
			"SELECT study_instance_uid, cached, cached_at, last_accessed_at,
                    number_of_series, number_of_instances, modalities_in_study
             FROM study WHERE cached = 1
             ORDER BY last_accessed_at ASC, study_instance_uid ASC",
		)?;
		let summaries = statement
			.query_map([], Self::summary_from_row)?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(summaries)
	}

	fn summary_from_row(row: &rusqlite::Row<'_>) -> Result<StudySummary, rusqlite::Error> {
		Ok(StudySummary {
			study_instance_uid: row.get(0)?,
			cached: row.get::<_, i64>(1)? == 1,
			cached_at: row.get(2)?,
			last_accessed_at: row.get(3)?,
			number_of_series: row.get(4)?,
			number_of_instances: row.get(5)?,
			modalities_in_study: row.get(6)?,
		})
	}

	/// Removes the study and cascades to its series and instances.
	/// Returns `false` if no such study row existed.
	pub fn delete_study(&self, study_instance_uid: &str) -> Result<bool, rusqlite::Error> {
		let mut connection = self.connection.lock().unwrap();
		let tx = connection.transaction()?;
		tx.execute(
			"DELETE FROM instance WHERE study_instance_uid = ?1",
			params![study_instance_uid],
		)?;
		tx.execute(
			"DELETE FROM series WHERE study_instance_uid = ?1",
			params![study_instance_uid],
		)?;
		let deleted = tx.execute(
			"DELETE FROM study WHERE study_instance_uid = ?1",
			params![study_instance_uid],
		)?;
		tx.execute(
			"UPDATE patient SET number_of_studies =
                (SELECT COUNT(*) FROM study WHERE patient_id = patient.patient_id)",
			[],
		)?;
		tx.commit()?;

		debug!(study_instance_uid, deleted, "Deleted study rows");
		Ok(deleted > 0)
	}
}
