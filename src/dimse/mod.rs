//! DIMSE message plumbing on top of upper-layer associations.
//!
//! - QIDO-RS is served by a find service class user (C-FIND).
//! - Retrieves are served by a get service class user (C-GET) with a
//!   move service class user (C-MOVE) as fallback; C-MOVE depends on the
//!   Storage-SCP running in the background.
//! - Inbound instances are handled by a store service class provider.

pub mod association;
pub mod cecho;
pub mod cfind;
pub mod cget;
pub mod cmove;
pub mod cstore;

use crate::types::{UI, US};
use association::{Association, AssociationError};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
/// For reading DICOM messages, prefer checking (command_data_set_type != DATA_SET_MISSING) as
/// AEs are free to choose another value for a truthy state.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<InMemDicomObject>,
	/// The presentation context id
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

impl DicomMessage {
	pub fn command_field(&self) -> Option<US> {
		element_uint16(&self.command, tags::COMMAND_FIELD)
	}

	pub fn status(&self) -> Option<US> {
		element_uint16(&self.command, tags::STATUS)
	}
}

/// Returns an integer attribute of a command or data set, or `None` if it
/// is absent or malformed.
pub fn element_uint16(object: &InMemDicomObject, tag: Tag) -> Option<US> {
	object
		.get(tag)
		.map(InMemElement::to_int::<US>)
		.and_then(Result::ok)
}

/// Returns a string attribute with trailing padding stripped, or `None`
/// if it is absent, malformed or empty.
pub fn element_string(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	object
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim_end_matches(['\0', ' ']).to_string())
		.filter(|value| !value.is_empty())
}

/// Returns a (possibly IS-encoded) integer attribute, or `None` if it is
/// absent or malformed.
pub fn element_int(object: &InMemDicomObject, tag: Tag) -> Option<i64> {
	object
		.get(tag)
		.map(InMemElement::to_int::<i64>)
		.and_then(Result::ok)
}

/// Returns a (possibly DS-encoded) float attribute, or `None` if it is
/// absent or malformed.
pub fn element_float(object: &InMemDicomObject, tag: Tag) -> Option<f64> {
	object
		.get(tag)
		.map(InMemElement::to_float64)
		.and_then(Result::ok)
}

/// Returns a multi-valued float attribute, or `None` if it is absent or
/// malformed.
pub fn element_floats(object: &InMemDicomObject, tag: Tag) -> Option<Vec<f64>> {
	object
		.get(tag)
		.map(InMemElement::to_multi_float64)
		.and_then(Result::ok)
}

/// Sub-operation counters carried by C-GET and C-MOVE responses.
/// Absent counters stay `None`; pending responses are allowed to omit them.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SubOperationCounts {
	pub remaining: Option<US>,
	pub completed: Option<US>,
	pub failed: Option<US>,
	pub warning: Option<US>,
}

impl SubOperationCounts {
	pub fn from_command(command: &InMemDicomObject) -> Self {
		Self {
			remaining: element_uint16(command, tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
			completed: element_uint16(command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
			failed: element_uint16(command, tags::NUMBER_OF_FAILED_SUBOPERATIONS),
			warning: element_uint16(command, tags::NUMBER_OF_WARNING_SUBOPERATIONS),
		}
	}

	/// Total number of sub-operations as reported by the remote, if it
	/// reported any counter at all.
	pub fn total(&self) -> Option<u32> {
		if self.remaining.is_none()
			&& self.completed.is_none()
			&& self.failed.is_none()
			&& self.warning.is_none()
		{
			return None;
		}
		Some(
			u32::from(self.remaining.unwrap_or(0))
				+ u32::from(self.completed.unwrap_or(0))
				+ u32::from(self.failed.unwrap_or(0))
				+ u32::from(self.warning.unwrap_or(0)),
		)
	}
}

/// One C-GET-RSP or C-MOVE-RSP as observed by the retrieve orchestrator.
#[derive(Debug, Clone)]
pub struct SubOperationProgress {
	pub status: US,
	pub status_type: StatusType,
	pub counts: SubOperationCounts,
}

impl SubOperationProgress {
	pub const fn is_final(&self) -> bool {
		!matches!(self.status_type, StatusType::Pending)
	}
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF | 0xC000..=0xCFFF => {
				Ok(Self::Failure)
			}
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = Into::into(message);

		let presentation_context = match presentation_context_id {
			None => self.presentation_contexts().first(),
			Some(presentation_context_id) => self
				.presentation_contexts()
				.iter()
				.find(|pctx| pctx.id == presentation_context_id),
		}
		.ok_or(NegotiationError::NoPresentationContext)?;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		let command_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: presentation_context.id,
				is_last: true,
				data: command_buf,
			}],
		};
		self.send(command_pdu, timeout).await?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&presentation_context.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(
						&presentation_context.transfer_syntax,
					))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;

			let data_pdu = Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Data,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data: data_buf,
				}],
			};

			self.send(data_pdu, timeout).await?;
		}

		Ok(())
	}
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self.receive(timeout).await?;
			if let Pdu::PData { data } = pdu {
				for mut pdv in data {
					match pdv.value_type {
						PDataValueType::Command => {
							trace!("Received command fragment (last={})", pdv.is_last);
							if message_command.is_some() {
								// Already received the full command set.
								// Receiving another command fragment is not expected.
								return Err(ReadError::OutOfOrder);
							}
							command_fragments.append(&mut pdv.data);
							if pdv.is_last {
								let command = InMemDicomObject::read_dataset_with_ts(
									command_fragments.as_slice(),
									&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
								)?;
								let has_data_set = element_uint16(&command, tags::COMMAND_DATA_SET_TYPE)
									.is_some_and(|value| value != DATA_SET_MISSING);

								if has_data_set {
									message_command = Some(command);
								} else {
									return Ok(DicomMessage {
										command,
										data: None,
										presentation_context_id: Some(pdv.presentation_context_id),
									});
								}
							}
						}
						PDataValueType::Data => {
							trace!("Received data fragment (last={})", pdv.is_last);
							data_fragments.append(&mut pdv.data);
							if pdv.is_last {
								let presentation_context = self
									.presentation_contexts()
									.iter()
									.find(|pctx| pctx.id == pdv.presentation_context_id)
									.ok_or(NegotiationError::NoPresentationContext)?;
								let transfer_syntax = TransferSyntaxRegistry
									.get(&presentation_context.transfer_syntax)
									.ok_or_else(|| {
										NegotiationError::UnknownTransferSyntax(UI::from(
											&presentation_context.transfer_syntax,
										))
									})?;
								let data = InMemDicomObject::read_dataset_with_ts(
									data_fragments.as_slice(),
									transfer_syntax,
								)?;

								return if let Some(command) = message_command {
									Ok(DicomMessage {
										command,
										data: Some(data),
										presentation_context_id: Some(pdv.presentation_context_id),
									})
								} else {
									// Cannot handle data fragments before the entire command set is received.
									return Err(ReadError::OutOfOrder);
								};
							}
						}
					}
				}
			} else {
				return Err(ReadError::UnexpectedPdu(pdu));
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

/// Returns a new message id by incrementing a global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;

	#[test]
	fn status_classification_covers_the_retrieve_codes() {
		assert_eq!(StatusType::try_from(0x0000), Ok(StatusType::Success));
		assert_eq!(StatusType::try_from(0xFF00), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xFF01), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xB000), Ok(StatusType::Warning));
		assert_eq!(StatusType::try_from(0xA701), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xA702), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0x0122), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xC123), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xFE00), Ok(StatusType::Cancel));
	}

	#[test]
	fn sub_operation_counts_total() {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(
				tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
				VR::US,
				dicom_value!(U16, [2]),
			),
			DataElement::new(
				tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
				VR::US,
				dicom_value!(U16, [3]),
			),
			DataElement::new(
				tags::NUMBER_OF_FAILED_SUBOPERATIONS,
				VR::US,
				dicom_value!(U16, [1]),
			),
		]);
		let counts = SubOperationCounts::from_command(&command);
		assert_eq!(counts.remaining, Some(2));
		assert_eq!(counts.completed, Some(3));
		assert_eq!(counts.failed, Some(1));
		assert_eq!(counts.warning, None);
		assert_eq!(counts.total(), Some(6));
	}

	#[test]
	fn counts_total_is_none_without_any_counter() {
		let command = InMemDicomObject::command_from_element_iter([DataElement::new(
			tags::MESSAGE_ID,
			VR::US,
			dicom_value!(U16, [7]),
		)]);
		assert_eq!(SubOperationCounts::from_command(&command).total(), None);
	}
}
