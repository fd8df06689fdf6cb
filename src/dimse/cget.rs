use crate::dimse::association::client::ClientAssociation;
use crate::dimse::association::AssociationError;
use crate::dimse::cstore::{
	CompositeStoreResponse, StoreRequestIdentity, COMMAND_FIELD_COMPOSITE_STORE_REQUEST,
	STORE_STATUS_PROCESSING_FAILURE, STORE_STATUS_SUCCESS,
};
use crate::dimse::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType,
	SubOperationCounts, SubOperationProgress, WriteError, DATA_SET_EXISTS,
};
use crate::types::{UI, US};
use async_stream::try_stream;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace, warn};

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_GET_REQUEST: US = 0x0010;
pub const COMMAND_FIELD_COMPOSITE_GET_RESPONSE: US = 0x8010;

/// C-GET-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.3.html>
pub struct CompositeGetRequest {
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
}

impl From<CompositeGetRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeGetRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_GET_REQUEST])),
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

/// Events observed while a C-GET is in flight. Sub-operations arrive as
/// inbound C-STORE requests multiplexed on the same association.
pub enum GetEvent {
	/// A complete instance delivered by the remote; already acknowledged
	/// with a successful C-STORE-RSP.
	Instance(Box<FileDicomObject<InMemDicomObject>>),
	/// An inbound C-STORE that could not be decoded or identified;
	/// answered with a processing-failure status where possible.
	Undecodable,
	/// A C-GET-RSP with status and sub-operation counters.
	Progress(SubOperationProgress),
}

pub struct GetServiceClassUser {
	association: ClientAssociation,
	timeout: Duration,
	message_id: US,
}

impl GetServiceClassUser {
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
		let request = crate::dimse::cmove::CancelRequest {
			message_id_being_responded_to: self.message_id,
		};
		self.association
			.write_message(request, None, self.timeout)
			.await
	}

	/// Issues the C-GET-RQ and streams inbound instances and progress
	/// responses until the final (non-pending) C-GET-RSP, inclusive.
	///
	/// The retrieve presentation context is proposed first when the
	/// association is opened, so the request goes out on the first
	/// negotiated context; inbound C-STOREs arrive on the storage
	/// contexts and are acknowledged in between responses.
	#[instrument(skip_all, name = "GET-SCU")]
	pub fn invoke(
		&self,
		request: CompositeGetRequest,
	) -> impl Stream<Item = Result<GetEvent, GetError>> + '_ {
		try_stream! {
			self.association
				.write_message(request, None, self.timeout)
				.await?;
			trace!("Sent C-GET-RQ");

			loop {
				let message = match self.association.read_message(self.timeout).await {
					Ok(message) => message,
					Err(ReadError::Reader(err)) => {
						// A sub-operation with an undecodable dataset only fails
						// itself; the remaining retrieve proceeds.
						warn!("Dropping undecodable inbound message: {err}");
						yield GetEvent::Undecodable;
						continue;
					}
					Err(err) => Err(err)?,
				};

				match message.command_field() {
					Some(COMMAND_FIELD_COMPOSITE_GET_RESPONSE) => {
						let status = message
							.status()
							.ok_or(ReadError::MissingAttribute(tags::STATUS))?;
						let status_type =
							StatusType::try_from(status).unwrap_or(StatusType::Failure);
						let progress = SubOperationProgress {
							status,
							status_type,
							counts: SubOperationCounts::from_command(&message.command),
						};
						trace!(status, "Received C-GET-RSP");
						let finished = progress.is_final();
						yield GetEvent::Progress(progress);

						if finished {
							break;
						}
					}
					Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {
						match self.handle_inbound_store(message).await? {
							Some(object) => yield GetEvent::Instance(Box::new(object)),
							None => yield GetEvent::Undecodable,
						}
					}
					other => {
						warn!("Ignoring unexpected command field {other:?}");
					}
				}
			}
		}
	}

	/// Acknowledges one inbound C-STORE and wraps its dataset into a
	/// Part-10 file object carrying the negotiated transfer syntax.
	async fn handle_inbound_store(
		&self,
		message: DicomMessage,
	) -> Result<Option<FileDicomObject<InMemDicomObject>>, GetError> {
		use crate::dimse::association::Association;

		let presentation_context_id = message.presentation_context_id;
		let Some(identity) = StoreRequestIdentity::from_command(&message.command) else {
			warn!("Inbound C-STORE-RQ without SOP identity");
			return Ok(None);
		};

		let transfer_syntax = self
			.association
			.presentation_contexts()
			.iter()
			.find(|pctx| Some(pctx.id) == presentation_context_id)
			.map(|pctx| pctx.transfer_syntax.clone());

		let object = match (message.data, transfer_syntax) {
			(Some(data), Some(transfer_syntax)) => {
				let meta = FileMetaTableBuilder::new()
					.media_storage_sop_class_uid(identity.sop_class_uid.as_str())
					.media_storage_sop_instance_uid(identity.sop_instance_uid.as_str())
					.transfer_syntax(transfer_syntax.as_str())
					.build()
					.expect("FileMetaTableBuilder should contain required data");
				Some(data.with_exact_meta(meta))
			}
			_ => None,
		};

		let status = if object.is_some() {
			STORE_STATUS_SUCCESS
		} else {
			STORE_STATUS_PROCESSING_FAILURE
		};
		let response = CompositeStoreResponse {
			message_id: identity.message_id,
			sop_class_uid: identity.sop_class_uid,
			sop_instance_uid: identity.sop_instance_uid,
			status,
		};
		self.association
			.write_message(response, presentation_context_id, self.timeout)
			.await?;

		Ok(object)
	}
}

#[derive(Debug, Error)]
pub enum GetError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
}
