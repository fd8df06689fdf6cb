use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::dimse::association::client::ClientAssociation;
use crate::dimse::{
	next_message_id, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType,
	WriteError, DATA_SET_MISSING,
};
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_ECHO_REQUEST: US = 0x0030;
pub const COMMAND_FIELD_ECHO_RESPONSE: US = 0x8030;

/// C-ECHO-RQ
pub struct CompositeEchoRequest {
	pub message_id: US,
}

impl From<CompositeEchoRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeEchoRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_ECHO_REQUEST])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None,
        }
    }
}

/// C-ECHO-RSP
pub struct CompositeEchoResponse {
	pub status: US,
}

/// C-ECHO-RSP as sent by the acceptor side (the Storage-SCP answers
/// verification requests on the same association).
pub struct EchoReply {
	pub message_id_being_responded_to: US,
}

impl From<EchoReply> for DicomMessage {
	#[rustfmt::skip]
	fn from(reply: EchoReply) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_ECHO_RESPONSE])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [reply.message_id_being_responded_to])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None,
        }
    }
}

impl TryFrom<DicomMessage> for CompositeEchoResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message
			.status()
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;
		Ok(Self { status })
	}
}

/// Service class user for the Verification SOP class.
/// It simply sends a C-ECHO-RQ and waits for a C-ECHO-RSP.
/// The response contains the Status attribute that indicates the current connection status.
pub struct EchoServiceClassUser<'a> {
	association: &'a ClientAssociation,
}

impl<'a> EchoServiceClassUser<'a> {
	pub const fn new(association: &'a ClientAssociation) -> Self {
		Self { association }
	}

	/// Initiates the C-ECHO protocol.
	#[instrument(skip_all)]
	pub async fn echo(&self, timeout: Duration) -> Result<bool, EchoError> {
		trace!("Initiated C-ECHO protocol");
		let request = CompositeEchoRequest {
			message_id: next_message_id(),
		};
		self.association.write_message(request, None, timeout).await?;

		let response = self.association.read_message(timeout).await?;
		let response = CompositeEchoResponse::try_from(response)?;

		let status_type = StatusType::try_from(response.status).unwrap_or(StatusType::Failure);

		debug!(
			status = response.status,
			"Received C-ECHO-RSP ({status_type:?})"
		);
		Ok(status_type == StatusType::Success)
	}
}

/// Errors that can occur for the echoscu.
#[derive(Debug, Error)]
pub enum EchoError {
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Read(#[from] ReadError),
}
