//! Volume extractor.
//!
//! Assembles an ordered, rescale-aware 16-bit pixel matrix from the
//! cached instances of one series: a geometry-only pass collects slice
//! positions and dimensions, slices are sorted by position, optionally
//! subsampled by stride, and the pixel data is packed little-endian,
//! slice-major, for streaming to 3-D viewers.

use crate::codec::{self, CodecError};
use crate::dimse::{element_float, element_floats, element_int};
use dicom::dictionary_std::tags;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum VolumeError {
	#[error("Subsample factor must be a positive integer, got {0}")]
	InvalidSubsample(i64),
	#[error(transparent)]
	Codec(#[from] CodecError),
}

/// Sample format of the packed pixel buffer, following the series'
/// PixelRepresentation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum VolumeDataFormat {
	#[serde(rename = "INT16")]
	Int16,
	#[serde(rename = "UINT16")]
	Uint16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMetadata {
	pub slice_count: usize,
	pub original_slice_count: usize,
	pub subsample_factor: usize,
	pub rows: u16,
	pub columns: u16,
	pub data_format: VolumeDataFormat,
	/// Effective spacing of the emitted slices: native spacing times the
	/// subsample factor.
	pub spacing_between_slices: f64,
	pub rescale_intercept: f64,
	pub rescale_slope: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pixel_spacing: Option<Vec<f64>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub window_center: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub window_width: Option<f64>,
}

struct SliceGeometry {
	path: PathBuf,
	position: f64,
	instance_number: i64,
	rows: u16,
	columns: u16,
	bits_allocated: u16,
	pixel_representation: u16,
	rescale_intercept: f64,
	rescale_slope: f64,
	slice_thickness: Option<f64>,
	pixel_spacing: Option<Vec<f64>>,
	window_center: Option<f64>,
	window_width: Option<f64>,
}

/// Builds the volume for a series from its cached instance files.
///
/// A series yielding zero usable slices produces an empty buffer and
/// `slice_count = 0`, not an error.
pub fn extract_volume(
	paths: &[PathBuf],
	subsample: usize,
) -> Result<(VolumeMetadata, Vec<u8>), VolumeError> {
	if subsample == 0 {
		return Err(VolumeError::InvalidSubsample(0));
	}

	let mut slices = Vec::with_capacity(paths.len());
	for path in paths {
		match read_geometry(path.clone()) {
			Ok(Some(geometry)) => slices.push(geometry),
			Ok(None) => warn!("Skipping {} without pixel geometry", path.display()),
			Err(err) => warn!("Skipping unreadable {}: {err}", path.display()),
		}
	}

	slices.sort_by(|a, b| {
		a.position
			.partial_cmp(&b.position)
			.unwrap_or(Ordering::Equal)
			.then_with(|| a.instance_number.cmp(&b.instance_number))
	});

	let Some(reference) = slices.first() else {
		return Ok((empty_metadata(subsample), Vec::new()));
	};
	let (rows, columns) = (reference.rows, reference.columns);
	let (bits_allocated, pixel_representation) =
		(reference.bits_allocated, reference.pixel_representation);
	let rescale_intercept = reference.rescale_intercept;
	let rescale_slope = reference.rescale_slope;
	let pixel_spacing = reference.pixel_spacing.clone();
	let window_center = reference.window_center;
	let window_width = reference.window_width;

	let before_filter = slices.len();
	slices.retain(|slice| {
		let matches = slice.rows == rows
			&& slice.columns == columns
			&& slice.bits_allocated == bits_allocated;
		if !matches {
			warn!(
				"Dropping {}: {}x{}@{} does not match {}x{}@{}",
				slice.path.display(),
				slice.rows,
				slice.columns,
				slice.bits_allocated,
				rows,
				columns,
				bits_allocated,
			);
		}
		matches
	});
	if slices.len() != before_filter {
		debug!(
			dropped = before_filter - slices.len(),
			"Dropped dimension-mismatched slices"
		);
	}

	let original_slice_count = slices.len();
	let native_spacing = native_spacing(&slices);

	let selected: Vec<&SliceGeometry> = slices.iter().step_by(subsample).collect();

	let bytes_per_sample = usize::from(bits_allocated / 8).max(1);
	let expected_len = usize::from(rows) * usize::from(columns) * bytes_per_sample;
	let mut pixels = Vec::with_capacity(selected.len() * usize::from(rows) * usize::from(columns) * 2);
	let mut emitted = 0usize;

	for slice in &selected {
		let object = codec::read_file(&slice.path)?;
		let data = codec::pixel_data(&object)?;
		if data.len() < expected_len {
			warn!(
				"Dropping {}: pixel data is {} bytes, expected {expected_len}",
				slice.path.display(),
				data.len()
			);
			continue;
		}

		if bits_allocated == 8 {
			// widen to 16-bit signed samples
			for &byte in &data[..expected_len] {
				let sample = if pixel_representation == 1 {
					i16::from(byte as i8)
				} else {
					i16::from(byte)
				};
				pixels.extend_from_slice(&sample.to_le_bytes());
			}
		} else {
			pixels.extend_from_slice(&data[..expected_len]);
		}
		emitted += 1;
	}

	let metadata = VolumeMetadata {
		slice_count: emitted,
		original_slice_count,
		subsample_factor: subsample,
		rows,
		columns,
		data_format: if pixel_representation == 1 {
			VolumeDataFormat::Int16
		} else {
			VolumeDataFormat::Uint16
		},
		spacing_between_slices: native_spacing * subsample as f64,
		rescale_intercept,
		rescale_slope,
		pixel_spacing,
		window_center,
		window_width,
	};

	Ok((metadata, pixels))
}

const fn empty_metadata(subsample: usize) -> VolumeMetadata {
	VolumeMetadata {
		slice_count: 0,
		original_slice_count: 0,
		subsample_factor: subsample,
		rows: 0,
		columns: 0,
		data_format: VolumeDataFormat::Uint16,
		spacing_between_slices: 0.0,
		rescale_intercept: 0.0,
		rescale_slope: 1.0,
		pixel_spacing: None,
		window_center: None,
		window_width: None,
	}
}

/// Mean distance between consecutive sorted slice positions; falls back
/// to SliceThickness for series with fewer than two slices.
fn native_spacing(slices: &[SliceGeometry]) -> f64 {
	if slices.len() < 2 {
		return slices
			.first()
			.and_then(|slice| slice.slice_thickness)
			.unwrap_or(1.0);
	}
	let total: f64 = slices
		.windows(2)
		.map(|pair| (pair[1].position - pair[0].position).abs())
		.sum();
	total / (slices.len() - 1) as f64
}

/// Geometry-only read of one instance; pixel data is not loaded.
/// Returns `None` for instances without the minimal pixel module.
fn read_geometry(path: PathBuf) -> Result<Option<SliceGeometry>, CodecError> {
	let object = codec::read_header(&path)?;

	let (Some(rows), Some(columns)) = (
		element_int(&object, tags::ROWS),
		element_int(&object, tags::COLUMNS),
	) else {
		return Ok(None);
	};

	let instance_number = element_int(&object, tags::INSTANCE_NUMBER).unwrap_or(0);
	let position = slice_position(&object, instance_number);

	Ok(Some(SliceGeometry {
		position,
		instance_number,
		rows: rows as u16,
		columns: columns as u16,
		bits_allocated: element_int(&object, tags::BITS_ALLOCATED).unwrap_or(16) as u16,
		pixel_representation: element_int(&object, tags::PIXEL_REPRESENTATION).unwrap_or(0) as u16,
		rescale_intercept: element_float(&object, tags::RESCALE_INTERCEPT).unwrap_or(0.0),
		rescale_slope: element_float(&object, tags::RESCALE_SLOPE).unwrap_or(1.0),
		slice_thickness: element_float(&object, tags::SLICE_THICKNESS),
		pixel_spacing: element_floats(&object, tags::PIXEL_SPACING),
		window_center: element_float(&object, tags::WINDOW_CENTER),
		window_width: element_float(&object, tags::WINDOW_WIDTH),
		path,
	}))
}

/// Slice position: SliceLocation when present, else the projection of
/// ImagePositionPatient onto the slice normal, else InstanceNumber.
fn slice_position(object: &dicom::object::DefaultDicomObject, instance_number: i64) -> f64 {
	if let Some(location) = element_float(object, tags::SLICE_LOCATION) {
		return location;
	}

	let position = element_floats(object, tags::IMAGE_POSITION_PATIENT);
	let orientation = element_floats(object, tags::IMAGE_ORIENTATION_PATIENT);
	if let (Some(position), Some(orientation)) = (position, orientation) {
		if position.len() == 3 && orientation.len() == 6 {
			let row = &orientation[..3];
			let col = &orientation[3..];
			let normal = [
				row[1] * col[2] - row[2] * col[1],
				row[2] * col[0] - row[0] * col[2],
				row[0] * col[1] - row[1] * col[0],
			];
			return position[0] * normal[0] + position[1] * normal[1] + position[2] * normal[2];
		}
	}

	instance_number as f64
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dicom_value;
	use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
	use smallvec::SmallVec;
	use std::path::Path;

	const ROWS: u16 = 4;
	const COLS: u16 = 4;

	fn write_slice(
		dir: &Path,
		index: usize,
		z: f64,
		rows: u16,
		columns: u16,
		fill: u16,
	) -> PathBuf {
		let mut object = InMemDicomObject::new_empty();
		let sop_uid = format!("1.2.3.1.{index}");
		object.put(DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			PrimitiveValue::from(dicom::dictionary_std::uids::CT_IMAGE_STORAGE),
		));
		object.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(sop_uid.as_str()),
		));
		object.put(DataElement::new(
			tags::INSTANCE_NUMBER,
			VR::IS,
			PrimitiveValue::from(format!("{index}")),
		));
		object.put(DataElement::new(
			tags::ROWS,
			VR::US,
			dicom_value!(U16, [rows]),
		));
		object.put(DataElement::new(
			tags::COLUMNS,
			VR::US,
			dicom_value!(U16, [columns]),
		));
		object.put(DataElement::new(
			tags::BITS_ALLOCATED,
			VR::US,
			dicom_value!(U16, [16]),
		));
		object.put(DataElement::new(
			tags::BITS_STORED,
			VR::US,
			dicom_value!(U16, [16]),
		));
		object.put(DataElement::new(
			tags::HIGH_BIT,
			VR::US,
			dicom_value!(U16, [15]),
		));
		object.put(DataElement::new(
			tags::PIXEL_REPRESENTATION,
			VR::US,
			dicom_value!(U16, [0]),
		));
		object.put(DataElement::new(
			tags::IMAGE_POSITION_PATIENT,
			VR::DS,
			PrimitiveValue::from(format!("0\\0\\{z}")),
		));
		object.put(DataElement::new(
			tags::IMAGE_ORIENTATION_PATIENT,
			VR::DS,
			PrimitiveValue::from("1\\0\\0\\0\\1\\0"),
		));
		object.put(DataElement::new(
			tags::SLICE_THICKNESS,
			VR::DS,
			PrimitiveValue::from("2.5"),
		));

		let samples: Vec<u16> = vec![fill; usize::from(rows) * usize::from(columns)];
		object.put(DataElement::new(
			tags::PIXEL_DATA,
			VR::OW,
			PrimitiveValue::U16(SmallVec::from_vec(samples)),
		));

		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(dicom::dictionary_std::uids::CT_IMAGE_STORAGE)
			.media_storage_sop_instance_uid(sop_uid.as_str())
			.transfer_syntax(dicom::dictionary_std::uids::EXPLICIT_VR_LITTLE_ENDIAN)
			.build()
			.unwrap();
		let path = dir.join(format!("{sop_uid}.dcm"));
		object.with_exact_meta(meta).write_to_file(&path).unwrap();
		path
	}

	fn slice_series(dir: &Path, count: usize) -> Vec<PathBuf> {
		// written in shuffled order to prove position sorting
		let mut paths: Vec<(usize, PathBuf)> = (0..count)
			.map(|i| {
				let index = (i + count / 2) % count;
				(
					index,
					write_slice(dir, index, index as f64 * 2.5, ROWS, COLS, index as u16),
				)
			})
			.collect();
		paths.sort_by_key(|(index, _)| *index);
		paths.into_iter().map(|(_, path)| path).collect()
	}

	#[test]
	fn subsample_one_returns_all_slices_in_position_order() {
		let dir = tempfile::tempdir().unwrap();
		let paths = slice_series(dir.path(), 8);

		let (metadata, pixels) = extract_volume(&paths, 1).unwrap();
		assert_eq!(metadata.slice_count, 8);
		assert_eq!(metadata.original_slice_count, 8);
		assert_eq!(metadata.subsample_factor, 1);
		assert_eq!(metadata.rows, ROWS);
		assert_eq!(metadata.columns, COLS);
		assert_eq!(metadata.data_format, VolumeDataFormat::Uint16);
		assert!((metadata.spacing_between_slices - 2.5).abs() < 1e-9);
		assert_eq!(
			pixels.len(),
			8 * usize::from(ROWS) * usize::from(COLS) * 2
		);

		// first sample of each slice ascends with slice position
		let slice_bytes = usize::from(ROWS) * usize::from(COLS) * 2;
		for slice in 0..8 {
			let offset = slice * slice_bytes;
			let sample = u16::from_le_bytes([pixels[offset], pixels[offset + 1]]);
			assert_eq!(sample, slice as u16);
		}
	}

	#[test]
	fn stride_subsampling_starts_at_index_zero() {
		let dir = tempfile::tempdir().unwrap();
		let paths = slice_series(dir.path(), 20);

		let (metadata, pixels) = extract_volume(&paths, 4).unwrap();
		assert_eq!(metadata.slice_count, 5);
		assert_eq!(metadata.original_slice_count, 20);
		assert_eq!(metadata.subsample_factor, 4);
		assert!((metadata.spacing_between_slices - 10.0).abs() < 1e-9);
		assert_eq!(pixels.len(), 5 * usize::from(ROWS) * usize::from(COLS) * 2);

		let slice_bytes = usize::from(ROWS) * usize::from(COLS) * 2;
		for (emitted, expected) in [0u16, 4, 8, 12, 16].iter().enumerate() {
			let offset = emitted * slice_bytes;
			let sample = u16::from_le_bytes([pixels[offset], pixels[offset + 1]]);
			assert_eq!(sample, *expected);
		}
	}

	#[test]
	fn oversized_subsample_returns_one_slice() {
		let dir = tempfile::tempdir().unwrap();
		let paths = slice_series(dir.path(), 5);

		let (metadata, pixels) = extract_volume(&paths, 99).unwrap();
		assert_eq!(metadata.slice_count, 1);
		assert_eq!(pixels.len(), usize::from(ROWS) * usize::from(COLS) * 2);
	}

	#[test]
	fn zero_subsample_is_an_error() {
		assert!(matches!(
			extract_volume(&[], 0),
			Err(VolumeError::InvalidSubsample(0))
		));
	}

	#[test]
	fn empty_series_yields_empty_volume() {
		let (metadata, pixels) = extract_volume(&[], 1).unwrap();
		assert_eq!(metadata.slice_count, 0);
		assert!(pixels.is_empty());
	}

	#[test]
	fn mismatched_dimensions_are_dropped() {
		let dir = tempfile::tempdir().unwrap();
		let mut paths = slice_series(dir.path(), 4);
		paths.push(write_slice(dir.path(), 100, 250.0, 8, 8, 1));

		let (metadata, pixels) = extract_volume(&paths, 1).unwrap();
		assert_eq!(metadata.slice_count, 4);
		assert_eq!(metadata.original_slice_count, 4);
		assert_eq!(pixels.len(), 4 * usize::from(ROWS) * usize::from(COLS) * 2);
	}
}
