//! Shared helpers for the integration tests: synthetic CT instances,
//! DIMSE message builders and socket plumbing.
#![allow(dead_code)]

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use dicom_relay::dimse::{DicomMessage, DATA_SET_EXISTS, DATA_SET_MISSING};
use smallvec::SmallVec;
use std::net::TcpListener;
use std::time::Duration;

/// A minimal CT image dataset with a small pixel matrix.
pub fn ct_instance(study: &str, series: &str, sop: &str) -> InMemDicomObject {
	let mut object = InMemDicomObject::new_empty();
	object.put(DataElement::new(
		tags::SOP_CLASS_UID,
		VR::UI,
		PrimitiveValue::from(uids::CT_IMAGE_STORAGE),
	));
	object.put(DataElement::new(
		tags::SOP_INSTANCE_UID,
		VR::UI,
		PrimitiveValue::from(sop),
	));
	object.put(DataElement::new(
		tags::STUDY_INSTANCE_UID,
		VR::UI,
		PrimitiveValue::from(study),
	));
	object.put(DataElement::new(
		tags::SERIES_INSTANCE_UID,
		VR::UI,
		PrimitiveValue::from(series),
	));
	object.put(DataElement::new(
		tags::PATIENT_ID,
		VR::LO,
		PrimitiveValue::from("PAT-1"),
	));
	object.put(DataElement::new(
		tags::PATIENT_NAME,
		VR::PN,
		PrimitiveValue::from("DOE^JOHN"),
	));
	object.put(DataElement::new(
		tags::MODALITY,
		VR::CS,
		PrimitiveValue::from("CT"),
	));
	object.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [4])));
	object.put(DataElement::new(
		tags::COLUMNS,
		VR::US,
		dicom_value!(U16, [4]),
	));
	object.put(DataElement::new(
		tags::BITS_ALLOCATED,
		VR::US,
		dicom_value!(U16, [16]),
	));
	object.put(DataElement::new(
		tags::PIXEL_REPRESENTATION,
		VR::US,
		dicom_value!(U16, [0]),
	));
	object.put(DataElement::new(
		tags::PIXEL_DATA,
		VR::OW,
		PrimitiveValue::U16(SmallVec::from_vec(vec![7u16; 16])),
	));
	object
}

/// C-STORE-RQ carrying `dataset`.
pub fn store_request(sop_instance_uid: &str, message_id: u16, dataset: InMemDicomObject) -> DicomMessage {
	let command = InMemDicomObject::command_from_element_iter([
		DataElement::new(
			tags::AFFECTED_SOP_CLASS_UID,
			VR::UI,
			dicom_value!(Str, uids::CT_IMAGE_STORAGE),
		),
		DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
		DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
		DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
		DataElement::new(
			tags::COMMAND_DATA_SET_TYPE,
			VR::US,
			dicom_value!(U16, [DATA_SET_EXISTS]),
		),
		DataElement::new(
			tags::AFFECTED_SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, sop_instance_uid),
		),
	]);

	DicomMessage {
		command,
		data: Some(dataset),
		presentation_context_id: None,
	}
}

/// A C-GET-RSP or C-MOVE-RSP with status and sub-operation counters.
pub fn retrieve_response(
	response_command_field: u16,
	status: u16,
	remaining: u16,
	completed: u16,
	failed: u16,
) -> DicomMessage {
	let command = InMemDicomObject::command_from_element_iter([
		DataElement::new(
			tags::COMMAND_FIELD,
			VR::US,
			dicom_value!(U16, [response_command_field]),
		),
		DataElement::new(
			tags::MESSAGE_ID_BEING_RESPONDED_TO,
			VR::US,
			dicom_value!(U16, [1]),
		),
		DataElement::new(
			tags::COMMAND_DATA_SET_TYPE,
			VR::US,
			dicom_value!(U16, [DATA_SET_MISSING]),
		),
		DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
		DataElement::new(
			tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
			VR::US,
			dicom_value!(U16, [remaining]),
		),
		DataElement::new(
			tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
			VR::US,
			dicom_value!(U16, [completed]),
		),
		DataElement::new(
			tags::NUMBER_OF_FAILED_SUBOPERATIONS,
			VR::US,
			dicom_value!(U16, [failed]),
		),
		DataElement::new(
			tags::NUMBER_OF_WARNING_SUBOPERATIONS,
			VR::US,
			dicom_value!(U16, [0]),
		),
	]);

	DicomMessage {
		command,
		data: None,
		presentation_context_id: None,
	}
}

/// Picks an ephemeral port by binding and immediately releasing it.
pub fn free_port() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
	let port = listener.local_addr().unwrap().port();
	drop(listener);
	port
}

/// Waits until something is listening on the port.
pub async fn wait_for_port(port: u16) {
	for _ in 0..100 {
		if tokio::net::TcpStream::connect(("127.0.0.1", port))
			.await
			.is_ok()
		{
			return;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	panic!("port {port} did not become ready");
}
