use dicom::core::PrimitiveValue;
use dicom::dictionary_std::uids;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// UL (Unsigned Long) value representation.
pub type UL = u32;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone)]
pub enum Priority {
	Low = 0x0002,
	Medium = 0x0000,
	High = 0x0001,
}

impl Default for Priority {
	fn default() -> Self {
		Self::Medium
	}
}

/// Query/retrieve information model root of a remote PACS node.
/// Determines the SOP class used for C-FIND, C-MOVE and C-GET.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryRetrieveRoot {
	Study,
	Patient,
}

impl Default for QueryRetrieveRoot {
	fn default() -> Self {
		Self::Study
	}
}

impl QueryRetrieveRoot {
	pub const fn find_sop_class(self) -> &'static str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
		}
	}

	pub const fn move_sop_class(self) -> &'static str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
		}
	}

	pub const fn get_sop_class(self) -> &'static str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryRetrieveLevel {
	Patient,
	Study,
	Series,
	Image,
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Patient => write!(f, "PATIENT"),
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Image => write!(f, "IMAGE"),
		}
	}
}

impl From<QueryRetrieveLevel> for PrimitiveValue {
	fn from(level: QueryRetrieveLevel) -> Self {
		Self::Str(level.to_string())
	}
}

/// Strategy used by the retrieve orchestrator for a single attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum RetrieveStrategy {
	CGet,
	CMove,
}

impl Display for RetrieveStrategy {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::CGet => write!(f, "C-GET"),
			Self::CMove => write!(f, "C-MOVE"),
		}
	}
}

/// Lifecycle of a retrieve job as published on the progress bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetrieveStatus {
	Started,
	Retrieving,
	Completed,
	CompletedWithErrors,
	Failed,
}

impl RetrieveStatus {
	pub const fn is_terminal(self) -> bool {
		matches!(
			self,
			Self::Completed | Self::CompletedWithErrors | Self::Failed
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn query_retrieve_level_renders_dicom_code_strings() {
		assert_eq!(QueryRetrieveLevel::Study.to_string(), "STUDY");
		assert_eq!(QueryRetrieveLevel::Image.to_string(), "IMAGE");
	}

	#[test]
	fn terminal_statuses() {
		assert!(!RetrieveStatus::Started.is_terminal());
		assert!(!RetrieveStatus::Retrieving.is_terminal());
		assert!(RetrieveStatus::Completed.is_terminal());
		assert!(RetrieveStatus::CompletedWithErrors.is_terminal());
		assert!(RetrieveStatus::Failed.is_terminal());
	}
}
