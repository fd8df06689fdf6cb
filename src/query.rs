//! Query service: builds and issues C-FIND identifiers at study, series
//! and instance level and maps result datasets into tolerant DTOs.

use crate::cache::Cache;
use crate::config::NodeError;
use crate::dimse::association::pool::AssociationPools;
use crate::dimse::cfind::{FindError, FindServiceClassUser, FindServiceClassUserOptions};
use crate::dimse::{element_string, next_message_id};
use crate::types::{Priority, QueryRetrieveLevel};
use dicom::core::ops::{ApplyOp, AttributeAction, AttributeOp, AttributeSelector};
use dicom::core::{PrimitiveValue, Tag};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use futures::{StreamExt, TryStreamExt};
use thiserror::Error;
use tracing::warn;

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.html#table_10.6.3-3>
pub const STUDY_SEARCH_TAGS: &[Tag] = &[
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::ACCESSION_NUMBER,
	tags::INSTANCE_AVAILABILITY,
	tags::MODALITIES_IN_STUDY,
	tags::REFERRING_PHYSICIAN_NAME,
	tags::PATIENT_NAME,
	tags::PATIENT_ID,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_SEX,
	tags::STUDY_INSTANCE_UID,
	tags::STUDY_ID,
	tags::STUDY_DESCRIPTION,
	tags::NUMBER_OF_STUDY_RELATED_SERIES,
	tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
];

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.2.html>
pub const SERIES_SEARCH_TAGS: &[Tag] = &[
	tags::MODALITY,
	tags::SERIES_DESCRIPTION,
	tags::SERIES_INSTANCE_UID,
	tags::SERIES_NUMBER,
	tags::BODY_PART_EXAMINED,
	tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
];

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.3.html>
pub const INSTANCE_SEARCH_TAGS: &[Tag] = &[
	tags::SOP_CLASS_UID,
	tags::SOP_INSTANCE_UID,
	tags::INSTANCE_AVAILABILITY,
	tags::INSTANCE_NUMBER,
	tags::ROWS,
	tags::COLUMNS,
	tags::BITS_ALLOCATED,
	tags::NUMBER_OF_FRAMES,
];

#[derive(Debug, Error)]
pub enum QueryError {
	#[error(transparent)]
	Find(#[from] FindError),
	#[error(transparent)]
	Node(#[from] NodeError),
	#[error("Invalid date range '{0}'")]
	InvalidDateRange(String),
}

/// Matching values provided by the caller, already resolved to tags.
#[derive(Debug, Default, Clone)]
pub struct MatchCriteria(Vec<(Tag, String)>);

impl MatchCriteria {
	pub fn push(&mut self, tag: Tag, value: impl Into<String>) {
		self.0.push((tag, value.into()));
	}

	pub fn iter(&self) -> impl Iterator<Item = &(Tag, String)> {
		self.0.iter()
	}

	/// Resolves a QIDO-RS query parameter name to a tag: either the
	/// attribute keyword of a supported matching key or a literal
	/// `GGGGEEEE` pair.
	pub fn resolve_parameter(name: &str) -> Option<Tag> {
		let keyword = match name {
			"PatientName" => Some(tags::PATIENT_NAME),
			"PatientID" => Some(tags::PATIENT_ID),
			"PatientBirthDate" => Some(tags::PATIENT_BIRTH_DATE),
			"PatientSex" => Some(tags::PATIENT_SEX),
			"AccessionNumber" => Some(tags::ACCESSION_NUMBER),
			"StudyDate" => Some(tags::STUDY_DATE),
			"StudyTime" => Some(tags::STUDY_TIME),
			"StudyID" => Some(tags::STUDY_ID),
			"StudyDescription" => Some(tags::STUDY_DESCRIPTION),
			"StudyInstanceUID" => Some(tags::STUDY_INSTANCE_UID),
			"ModalitiesInStudy" => Some(tags::MODALITIES_IN_STUDY),
			"ReferringPhysicianName" => Some(tags::REFERRING_PHYSICIAN_NAME),
			"Modality" => Some(tags::MODALITY),
			"SeriesNumber" => Some(tags::SERIES_NUMBER),
			"SeriesDescription" => Some(tags::SERIES_DESCRIPTION),
			"SeriesInstanceUID" => Some(tags::SERIES_INSTANCE_UID),
			"BodyPartExamined" => Some(tags::BODY_PART_EXAMINED),
			"SOPInstanceUID" => Some(tags::SOP_INSTANCE_UID),
			"SOPClassUID" => Some(tags::SOP_CLASS_UID),
			"InstanceNumber" => Some(tags::INSTANCE_NUMBER),
			_ => None,
		};
		keyword.or_else(|| parse_tag_pair(name))
	}
}

fn parse_tag_pair(name: &str) -> Option<Tag> {
	if name.len() != 8 || !name.chars().all(|c| c.is_ascii_hexdigit()) {
		return None;
	}
	let group = u16::from_str_radix(&name[..4], 16).ok()?;
	let element = u16::from_str_radix(&name[4..], 16).ok()?;
	Some(Tag(group, element))
}

/// A DICOM date or date range in query syntax: `YYYYMMDD`,
/// `YYYYMMDD-YYYYMMDD`, `YYYYMMDD-` or `-YYYYMMDD`. A blank value is
/// omitted from the identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
	pub from: Option<String>,
	pub to: Option<String>,
}

impl DateRange {
	pub fn parse(value: &str) -> Result<Option<Self>, QueryError> {
		let value = value.trim();
		if value.is_empty() {
			return Ok(None);
		}

		let parsed = match value.split_once('-') {
			None => Self {
				from: parse_dicom_date(value)
					.ok_or_else(|| QueryError::InvalidDateRange(value.to_string()))?,
				to: parse_dicom_date(value)
					.ok_or_else(|| QueryError::InvalidDateRange(value.to_string()))?,
			},
			Some((from, to)) => {
				let from = parse_dicom_date(from)
					.ok_or_else(|| QueryError::InvalidDateRange(value.to_string()))?;
				let to = parse_dicom_date(to)
					.ok_or_else(|| QueryError::InvalidDateRange(value.to_string()))?;
				if from.is_none() && to.is_none() {
					return Err(QueryError::InvalidDateRange(value.to_string()));
				}
				Self { from, to }
			}
		};
		Ok(Some(parsed))
	}

	/// Renders the range back to DICOM query syntax.
	pub fn to_dicom(&self) -> String {
		match (&self.from, &self.to) {
			(Some(from), Some(to)) if from == to => from.clone(),
			(Some(from), Some(to)) => format!("{from}-{to}"),
			(Some(from), None) => format!("{from}-"),
			(None, Some(to)) => format!("-{to}"),
			(None, None) => String::new(),
		}
	}
}

/// Validates an eight-digit DICOM date; an empty side of a range is
/// `None`.
fn parse_dicom_date(value: &str) -> Option<Option<String>> {
	if value.is_empty() {
		return Some(None);
	}
	if value.len() == 8 && value.chars().all(|c| c.is_ascii_digit()) {
		Some(Some(value.to_string()))
	} else {
		None
	}
}

pub struct QueryService {
	pools: AssociationPools,
	cache: Cache,
}

impl QueryService {
	pub const fn new(pools: AssociationPools, cache: Cache) -> Self {
		Self { pools, cache }
	}

	pub async fn find_studies(
		&self,
		node_name: &str,
		criteria: &MatchCriteria,
		offset: usize,
		limit: usize,
	) -> Result<Vec<InMemDicomObject>, QueryError> {
		let identifier = build_identifier(
			QueryRetrieveLevel::Study,
			None,
			None,
			STUDY_SEARCH_TAGS,
			criteria,
		)?;
		let results = self.issue(node_name, identifier, offset, limit).await?;

		// Studies observed upstream become shallow index rows so the
		// cache hierarchy exists before the first retrieve.
		for dataset in &results {
			let study = StudyObservation::from_dataset(dataset);
			if let Some(study_instance_uid) = study.study_instance_uid {
				let observation = self
					.cache
					.record_study_observation(
						study_instance_uid,
						study.patient_id.unwrap_or_default(),
						study.study_date,
						study.study_description,
						study.accession_number,
					)
					.await;
				if let Err(err) = observation {
					warn!("Failed to record study observation: {err}");
				}
			}
		}

		Ok(results)
	}

	pub async fn find_series(
		&self,
		node_name: &str,
		study_instance_uid: &str,
		criteria: &MatchCriteria,
		offset: usize,
		limit: usize,
	) -> Result<Vec<InMemDicomObject>, QueryError> {
		let identifier = build_identifier(
			QueryRetrieveLevel::Series,
			Some(study_instance_uid),
			None,
			SERIES_SEARCH_TAGS,
			criteria,
		)?;
		self.issue(node_name, identifier, offset, limit).await
	}

	pub async fn find_instances(
		&self,
		node_name: &str,
		study_instance_uid: &str,
		series_instance_uid: &str,
		criteria: &MatchCriteria,
		offset: usize,
		limit: usize,
	) -> Result<Vec<InMemDicomObject>, QueryError> {
		let identifier = build_identifier(
			QueryRetrieveLevel::Image,
			Some(study_instance_uid),
			Some(series_instance_uid),
			INSTANCE_SEARCH_TAGS,
			criteria,
		)?;
		self.issue(node_name, identifier, offset, limit).await
	}

	async fn issue(
		&self,
		node_name: &str,
		identifier: InMemDicomObject,
		offset: usize,
		limit: usize,
	) -> Result<Vec<InMemDicomObject>, QueryError> {
		let pool = self
			.pools
			.get(node_name)
			.ok_or_else(|| NodeError::Unknown(node_name.to_string()))?;

		let findscu = FindServiceClassUser::new(pool.clone());
		let options = FindServiceClassUserOptions {
			identifier,
			message_id: next_message_id(),
			priority: Priority::Medium,
		};
		let results = findscu
			.invoke(options)
			.skip(offset)
			.take(limit)
			.try_collect()
			.await?;
		Ok(results)
	}
}

/// Builds a C-FIND identifier: requested return keys left empty, the
/// caller's matching values passed through, and the level keys set last
/// so they are never clobbered by criteria.
fn build_identifier(
	level: QueryRetrieveLevel,
	study_instance_uid: Option<&str>,
	series_instance_uid: Option<&str>,
	return_keys: &[Tag],
	criteria: &MatchCriteria,
) -> Result<InMemDicomObject, QueryError> {
	let mut attributes: Vec<(Tag, PrimitiveValue)> =
		Vec::with_capacity(return_keys.len() + criteria.0.len() + 3);

	for tag in return_keys {
		attributes.push((*tag, PrimitiveValue::Empty));
	}

	for (tag, value) in criteria.iter() {
		if *tag == tags::STUDY_DATE {
			match DateRange::parse(value)? {
				Some(range) => attributes.push((*tag, PrimitiveValue::from(range.to_dicom()))),
				None => continue,
			}
		} else {
			attributes.push((*tag, PrimitiveValue::from(value.as_str())));
		}
	}

	attributes.push((tags::QUERY_RETRIEVE_LEVEL, PrimitiveValue::from(level)));
	if let Some(study) = study_instance_uid {
		attributes.push((tags::STUDY_INSTANCE_UID, PrimitiveValue::from(study)));
	}
	if let Some(series) = series_instance_uid {
		attributes.push((tags::SERIES_INSTANCE_UID, PrimitiveValue::from(series)));
	}

	let mut identifier = InMemDicomObject::new_empty();
	for (tag, value) in attributes {
		if let Err(err) = identifier.apply(AttributeOp::new(
			AttributeSelector::from(tag),
			AttributeAction::Set(value),
		)) {
			warn!("Skipped attribute operation: {err}");
		}
	}
	Ok(identifier)
}

/// Study-level fields recorded opportunistically from a C-FIND match.
/// Unknown VR/value combinations yield `None` fields, never errors.
#[derive(Debug, Default, Clone)]
struct StudyObservation {
	study_instance_uid: Option<String>,
	patient_id: Option<String>,
	study_date: Option<String>,
	study_description: Option<String>,
	accession_number: Option<String>,
}

impl StudyObservation {
	fn from_dataset(dataset: &InMemDicomObject) -> Self {
		Self {
			study_instance_uid: element_string(dataset, tags::STUDY_INSTANCE_UID),
			patient_id: element_string(dataset, tags::PATIENT_ID),
			study_date: element_string(dataset, tags::STUDY_DATE),
			study_description: element_string(dataset, tags::STUDY_DESCRIPTION),
			accession_number: element_string(dataset, tags::ACCESSION_NUMBER),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::element_string;
	use pretty_assertions::assert_eq;

	#[test]
	fn date_range_formats() {
		let exact = DateRange::parse("20240131").unwrap().unwrap();
		assert_eq!(exact.to_dicom(), "20240131");

		let range = DateRange::parse("20240101-20240131").unwrap().unwrap();
		assert_eq!(range.to_dicom(), "20240101-20240131");

		let open_end = DateRange::parse("20240101-").unwrap().unwrap();
		assert_eq!(open_end.to_dicom(), "20240101-");

		let open_start = DateRange::parse("-20240131").unwrap().unwrap();
		assert_eq!(open_start.to_dicom(), "-20240131");
	}

	#[test]
	fn blank_date_is_omitted() {
		assert_eq!(DateRange::parse("").unwrap(), None);
		assert_eq!(DateRange::parse("  ").unwrap(), None);
	}

	#[test]
	fn malformed_dates_are_rejected() {
		assert!(DateRange::parse("2024").is_err());
		assert!(DateRange::parse("abcdefgh").is_err());
		assert!(DateRange::parse("-").is_err());
	}

	#[test]
	fn parameter_resolution() {
		assert_eq!(
			MatchCriteria::resolve_parameter("PatientID"),
			Some(tags::PATIENT_ID)
		);
		assert_eq!(
			MatchCriteria::resolve_parameter("00100020"),
			Some(Tag(0x0010, 0x0020))
		);
		assert_eq!(MatchCriteria::resolve_parameter("NotAKeyword"), None);
	}

	#[test]
	fn identifier_carries_level_keys_and_empty_return_keys() {
		let mut criteria = MatchCriteria::default();
		criteria.push(tags::PATIENT_ID, "PAT-1");
		criteria.push(tags::STUDY_DATE, "20240101-20240131");

		let identifier = build_identifier(
			QueryRetrieveLevel::Series,
			Some("1.2.3"),
			None,
			SERIES_SEARCH_TAGS,
			&criteria,
		)
		.unwrap();

		assert_eq!(
			element_string(&identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
			Some("SERIES")
		);
		assert_eq!(
			element_string(&identifier, tags::STUDY_INSTANCE_UID).as_deref(),
			Some("1.2.3")
		);
		assert_eq!(
			element_string(&identifier, tags::PATIENT_ID).as_deref(),
			Some("PAT-1")
		);
		assert_eq!(
			element_string(&identifier, tags::STUDY_DATE).as_deref(),
			Some("20240101-20240131")
		);
		// return keys are present but empty
		assert!(identifier.get(tags::MODALITY).is_some());
		assert_eq!(element_string(&identifier, tags::MODALITY), None);
	}

	#[test]
	fn observation_mapping_tolerates_missing_values() {
		let dataset = InMemDicomObject::new_empty();
		let study = StudyObservation::from_dataset(&dataset);
		assert!(study.study_instance_uid.is_none());
		assert!(study.patient_id.is_none());
		assert!(study.accession_number.is_none());
	}
}
