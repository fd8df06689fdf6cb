use crate::dimse::association::pool::{AssociationPool, PoolError};
use crate::dimse::association::PresentationProposal;
use crate::dimse::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError,
	DATA_SET_EXISTS,
};
use crate::sop::CORE_TRANSFER_SYNTAXES;
use crate::types::{Priority, UI, US};
use async_stream::try_stream;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use futures::Stream;
use thiserror::Error;
use tracing::trace;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;
pub const COMMAND_FIELD_COMPOSITE_FIND_RESPONSE: US = 0x8020;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
}

impl From<CompositeFindRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeFindRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
        ]);

        Self {
            command,
            data: Some(request.identifier),
            presentation_context_id: None,
        }
    }
}

/// C-FIND-RSP
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub status: US,
	pub data: Option<InMemDicomObject>,
}

impl TryFrom<DicomMessage> for CompositeFindResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message
			.status()
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

		Ok(Self {
			status,
			data: message.data,
		})
	}
}

pub struct FindServiceClassUser {
	pool: AssociationPool,
}

pub struct FindServiceClassUserOptions {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: Priority,
}

impl FindServiceClassUser {
	pub const fn new(pool: AssociationPool) -> Self {
		Self { pool }
	}

	/// Streams one dataset per match until the final (non-pending)
	/// response arrives. An empty stream is a valid result.
	pub fn invoke(
		&self,
		options: FindServiceClassUserOptions,
	) -> impl Stream<Item = Result<InMemDicomObject, FindError>> + '_ {
		let node = self.pool.node();
		let affected_sop_class_uid = UI::from(node.query_retrieve_root.find_sop_class());
		let timeout = node.response_timeout();
		let proposal = PresentationProposal::new(
			affected_sop_class_uid.clone(),
			CORE_TRANSFER_SYNTAXES.iter().copied(),
		);

		try_stream! {
			let association = self.pool.get(proposal).await?;
			let request = CompositeFindRequest {
				identifier: options.identifier,
				message_id: options.message_id,
				priority: options.priority as US,
				affected_sop_class_uid,
			};
			association.write_message(request, None, timeout).await?;
			trace!("Sent C-FIND-RQ");

			loop {
				let response = association.read_message(timeout).await?;
				let response = CompositeFindResponse::try_from(response)?;
				trace!("Received C-FIND-RSP");

				if let Some(data) = response.data {
					yield data;
				}

				let status_type = StatusType::try_from(response.status)
					.unwrap_or(StatusType::Failure);
				if status_type != StatusType::Pending {
					break;
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] PoolError),
}
