//! Dataset encoding and decoding for the three core transfer syntaxes,
//! Part-10 file I/O and raw pixel data access.
//!
//! Compressed transfer syntaxes are accepted during negotiation and their
//! datasets are stored verbatim; nothing in here transcodes pixel data.

use crate::types::UI;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{DefaultDicomObject, InMemDicomObject, OpenFileOptions};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to read DICOM object: {0}")]
	Read(#[from] dicom::object::ReadError),
	#[error("Failed to write DICOM object: {0}")]
	Write(#[from] dicom::object::WriteError),
	#[error("Failed to look up attribute: {0}")]
	Access(#[from] dicom::object::AccessError),
	#[error("Failed to convert attribute value: {0}")]
	Convert(#[from] dicom::core::value::ConvertValueError),
}

/// Decodes a dataset (no file-meta group) with the given transfer syntax.
pub fn decode_dataset(bytes: &[u8], transfer_syntax_uid: &str) -> Result<InMemDicomObject, CodecError> {
	let transfer_syntax = TransferSyntaxRegistry
		.get(transfer_syntax_uid)
		.ok_or_else(|| CodecError::UnknownTransferSyntax(UI::from(transfer_syntax_uid)))?;
	let object = InMemDicomObject::read_dataset_with_ts(bytes, transfer_syntax)?;
	Ok(object)
}

/// Encodes a dataset (no file-meta group) with the given transfer syntax.
pub fn encode_dataset(
	object: &InMemDicomObject,
	transfer_syntax_uid: &str,
) -> Result<Vec<u8>, CodecError> {
	let transfer_syntax = TransferSyntaxRegistry
		.get(transfer_syntax_uid)
		.ok_or_else(|| CodecError::UnknownTransferSyntax(UI::from(transfer_syntax_uid)))?;
	let mut buffer = Vec::new();
	object.write_dataset_with_ts(&mut buffer, transfer_syntax)?;
	Ok(buffer)
}

/// Reads a complete Part-10 file, including its file-meta group.
pub fn read_file(path: impl AsRef<Path>) -> Result<DefaultDicomObject, CodecError> {
	let object = dicom::object::open_file(path)?;
	Ok(object)
}

/// Reads a Part-10 file up to (and excluding) PixelData.
/// Used for geometry passes that must not load bulk data.
pub fn read_header(path: impl AsRef<Path>) -> Result<DefaultDicomObject, CodecError> {
	let object = OpenFileOptions::new()
		.read_until(tags::PIXEL_DATA)
		.open_file(path)?;
	Ok(object)
}

/// Writes a Part-10 file with the file-meta the object already carries.
pub fn write_file(path: impl AsRef<Path>, object: &DefaultDicomObject) -> Result<(), CodecError> {
	object.write_to_file(path)?;
	Ok(())
}

/// Returns the verbatim PixelData bytes of a dataset.
pub fn pixel_data(object: &InMemDicomObject) -> Result<Vec<u8>, CodecError> {
	let bytes = object.element(tags::PIXEL_DATA)?.to_bytes()?;
	Ok(bytes.into_owned())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sop::CORE_TRANSFER_SYNTAXES;
	use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
	use dicom::dicom_value;
	use rstest::rstest;

	fn sample_dataset() -> InMemDicomObject {
		let mut object = InMemDicomObject::new_empty();
		object.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from("1.2.3.4"),
		));
		object.put(DataElement::new(
			tags::PATIENT_NAME,
			VR::PN,
			PrimitiveValue::from("DOE^JOHN"),
		));
		object.put(DataElement::new(
			tags::ROWS,
			VR::US,
			dicom_value!(U16, [512]),
		));
		// private element, must survive a round trip untouched
		object.put(DataElement::new(
			Tag(0x0009, 0x0010),
			VR::LO,
			PrimitiveValue::from("RELAY_PRIVATE"),
		));
		object
	}

	#[rstest]
	#[case(CORE_TRANSFER_SYNTAXES[0])]
	#[case(CORE_TRANSFER_SYNTAXES[1])]
	#[case(CORE_TRANSFER_SYNTAXES[2])]
	fn dataset_round_trip_is_stable(#[case] ts: &str) {
		let original = sample_dataset();
		let encoded = encode_dataset(&original, ts).unwrap();
		let decoded = decode_dataset(&encoded, ts).unwrap();
		let re_encoded = encode_dataset(&decoded, ts).unwrap();

		assert_eq!(encoded, re_encoded);
		assert_eq!(
			decoded
				.element(Tag(0x0009, 0x0010))
				.unwrap()
				.to_str()
				.unwrap()
				.trim_end(),
			"RELAY_PRIVATE"
		);
	}

	#[test]
	fn unknown_transfer_syntax_is_rejected() {
		let err = decode_dataset(&[], "1.2.3.999").unwrap_err();
		assert!(matches!(err, CodecError::UnknownTransferSyntax(_)));
	}
}
