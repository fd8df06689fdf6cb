//! Storage SOP classes advertised by the gateway and the core transfer
//! syntaxes it encodes/decodes itself.
//!
//! The storage list is proposed with SCP role on every C-GET association
//! and advertised by the Storage-SCP acceptor. Compressed transfer
//! syntaxes are negotiable and stored verbatim; the gateway never
//! transcodes.

use dicom::dictionary_std::uids;

/// Transfer syntaxes the wire codec encodes and decodes natively.
pub const CORE_TRANSFER_SYNTAXES: &[&str] = &[
	uids::IMPLICIT_VR_LITTLE_ENDIAN,
	uids::EXPLICIT_VR_LITTLE_ENDIAN,
	uids::EXPLICIT_VR_BIG_ENDIAN,
];

/// Storage SOP classes accepted for ingest and proposed for C-GET
/// sub-operations.
#[rustfmt::skip]
pub const STORAGE_SOP_CLASSES: &[&str] = &[
	uids::CT_IMAGE_STORAGE,
	uids::ENHANCED_CT_IMAGE_STORAGE,
	uids::MR_IMAGE_STORAGE,
	uids::ENHANCED_MR_IMAGE_STORAGE,
	uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
	uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
	uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
	uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
	uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
	"1.2.840.10008.5.1.4.1.1.6.1",     // Ultrasound Image Storage
	uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
	uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
	"1.2.840.10008.5.1.4.1.1.7.1",     // Multi-frame Single Bit Secondary Capture
	uids::MULTI_FRAME_GRAYSCALE_BYTE_SECONDARY_CAPTURE_IMAGE_STORAGE,
	uids::MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE,
	uids::MULTI_FRAME_TRUE_COLOR_SECONDARY_CAPTURE_IMAGE_STORAGE,
	"1.2.840.10008.5.1.4.1.1.12.1",    // X-Ray Angiographic Image Storage
	"1.2.840.10008.5.1.4.1.1.12.2",    // X-Ray Radiofluoroscopic Image Storage
	uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
	uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
	uids::RT_IMAGE_STORAGE,
	uids::RT_DOSE_STORAGE,
	uids::RT_PLAN_STORAGE,
	uids::RT_STRUCTURE_SET_STORAGE,
	"1.2.840.10008.5.1.4.1.1.77.1.1",  // VL Endoscopic Image Storage
	"1.2.840.10008.5.1.4.1.1.77.1.2",  // VL Microscopic Image Storage
	"1.2.840.10008.5.1.4.1.1.77.1.4",  // VL Photographic Image Storage
	"1.2.840.10008.5.1.4.1.1.77.1.5.1", // Ophthalmic Photography 8 Bit
	"1.2.840.10008.5.1.4.1.1.77.1.5.4", // Ophthalmic Tomography Image Storage
	uids::BASIC_TEXT_SR_STORAGE,
	uids::ENHANCED_SR_STORAGE,
	uids::COMPREHENSIVE_SR_STORAGE,
	"1.2.840.10008.5.1.4.1.1.88.34",   // Comprehensive 3D SR Storage
	uids::GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
	uids::ENCAPSULATED_PDF_STORAGE,
	uids::ENCAPSULATED_CDA_STORAGE,
	"1.2.840.10008.5.1.4.1.1.66.1",    // Spatial Registration Storage
	"1.2.840.10008.5.1.4.1.1.66.2",    // Spatial Fiducials Storage
	"1.2.840.10008.5.1.4.1.1.66.3",    // Deformable Spatial Registration
	"1.2.840.10008.5.1.4.1.1.66.4",    // Segmentation Storage
	"1.2.840.10008.5.1.4.1.1.66.5",    // Surface Segmentation Storage
	"1.2.840.10008.5.1.4.1.1.67",      // Real World Value Mapping Storage
	uids::BREAST_TOMOSYNTHESIS_IMAGE_STORAGE,
	"1.2.840.10008.5.1.4.1.1.14.1",    // IVOCT Image Storage - For Presentation
	"1.2.840.10008.5.1.4.1.1.14.2",    // IVOCT Image Storage - For Processing
];

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;

	#[test]
	fn storage_classes_are_distinct_uids() {
		let unique: HashSet<_> = STORAGE_SOP_CLASSES.iter().collect();
		assert_eq!(unique.len(), STORAGE_SOP_CLASSES.len());
		for uid in STORAGE_SOP_CLASSES {
			assert!(uid.starts_with("1.2.840.10008.5.1.4.1.1."), "{uid}");
		}
	}
}
