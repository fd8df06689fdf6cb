use crate::dimse::{DicomMessage, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// C-STORE status for a persisted instance.
pub const STORE_STATUS_SUCCESS: US = 0x0000;
/// C-STORE status when ingest or persistence failed.
pub const STORE_STATUS_PROCESSING_FAILURE: US = 0x0110;

/// C-STORE-RSP, sent by both the Storage-SCP and the get service class
/// user (which plays the storage SCP role on its own association).
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None,
        }
    }
}

/// Identity of an inbound C-STORE request, read from its command set.
#[derive(Debug, Clone)]
pub struct StoreRequestIdentity {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub move_originator_aet: Option<String>,
	pub move_originator_message_id: Option<US>,
}

impl StoreRequestIdentity {
	pub fn from_command(command: &InMemDicomObject) -> Option<Self> {
		use crate::dimse::{element_string, element_uint16};

		Some(Self {
			message_id: element_uint16(command, tags::MESSAGE_ID).unwrap_or(0),
			sop_class_uid: element_string(command, tags::AFFECTED_SOP_CLASS_UID)?,
			sop_instance_uid: element_string(command, tags::AFFECTED_SOP_INSTANCE_UID)?,
			move_originator_aet: element_string(
				command,
				tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
			),
			move_originator_message_id: element_uint16(command, tags::MOVE_ORIGINATOR_MESSAGE_ID),
		})
	}
}
