use crate::dimse::association::client::ClientAssociation;
use crate::dimse::association::AssociationError;
use crate::dimse::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType,
	SubOperationCounts, SubOperationProgress, WriteError, DATA_SET_EXISTS, DATA_SET_MISSING,
};
use crate::types::{AE, UI, US};
use async_stream::try_stream;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_MOVE_REQUEST: US = 0x0021;
pub const COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE: US = 0x8021;
pub const COMMAND_FIELD_CANCEL_REQUEST: US = 0x0FFF;

/// Status signalled by a move SCP that cannot reach the configured
/// destination AE.
pub const STATUS_MOVE_DESTINATION_UNKNOWN: US = 0xA702;

/// C-MOVE-RQ
pub struct CompositeMoveRequest {
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub destination: AE,
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_REQUEST])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
            DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
        ]);

        Self {
            command,
            data: Some(request.identifier),
            presentation_context_id: None,
        }
    }
}

/// C-CANCEL-RQ for an in-flight C-MOVE or C-GET.
pub struct CancelRequest {
	pub message_id_being_responded_to: US,
}

impl From<CancelRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CancelRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_CANCEL_REQUEST])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [request.message_id_being_responded_to])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None,
        }
    }
}

pub struct MoveServiceClassUser {
	association: ClientAssociation,
	timeout: Duration,
	message_id: US,
}

impl MoveServiceClassUser {
	pub const fn new(association: ClientAssociation, timeout: Duration, message_id: US) -> Self {
		Self {
			association,
			timeout,
			message_id,
		}
	}

	pub const fn message_id(&self) -> US {
		self.message_id
	}

	/// Aborts the underlying association.
	pub fn abort(&self) {
		self.association.abort();
	}

	/// Sends a C-CANCEL-RQ for the in-flight request.
	pub async fn cancel(&self) -> Result<(), WriteError> {
		let request = CancelRequest {
			message_id_being_responded_to: self.message_id,
		};
		self.association
			.write_message(request, None, self.timeout)
			.await
	}

	/// Issues the C-MOVE-RQ and streams every response until the final
	/// (non-pending) one, inclusive. The instances themselves arrive on
	/// separate inbound associations handled by the Storage-SCP.
	#[instrument(skip_all, name = "MOVE-SCU")]
	pub fn invoke(
		&self,
		request: CompositeMoveRequest,
	) -> impl Stream<Item = Result<SubOperationProgress, MoveError>> + '_ {
		try_stream! {
			self.association
				.write_message(request, None, self.timeout)
				.await?;
			trace!("Sent C-MOVE-RQ");

			loop {
				let response = self.association.read_message(self.timeout).await?;
				trace!("Received C-MOVE-RSP");

				let status = response
					.status()
					.ok_or(ReadError::MissingAttribute(tags::STATUS))?;
				let status_type = StatusType::try_from(status).unwrap_or(StatusType::Failure);
				let progress = SubOperationProgress {
					status,
					status_type,
					counts: SubOperationCounts::from_command(&response.command),
				};
				let finished = progress.is_final();
				yield progress;

				if finished {
					break;
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum MoveError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
}
