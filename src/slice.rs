//! Orthogonal slice extraction.
//!
//! A [`SliceSelector`] names one 2D cross-section of a normalized volume.
//! The cut dimension fixes the frames axis; the two orthogonal axes become
//! rows and columns, swapped relative to storage order because the display
//! convention is column-major while volumes are stored row-major. Geometry
//! (spacing, direction cosines, patient-space position) comes straight from
//! the volume's orientation matrix.

use crate::error::{NiftiError, Result};
use crate::header::VolumeMetaData;
use crate::selector::{ImageId, SliceDimension, SliceSelector};
use crate::utils::{multiply_matrix_and_point, normalize_vector};
use crate::volume::{FloatBuffer, Volume, VoxelBuffer};
use ndarray::{Array4, Axis};
use serde::Serialize;

/// Flattened integer slice pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PixelData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
}

impl PixelData {
    pub fn len(&self) -> usize {
        match self {
            PixelData::U8(v) => v.len(),
            PixelData::I8(v) => v.len(),
            PixelData::U16(v) => v.len(),
            PixelData::I16(v) => v.len(),
            PixelData::U32(v) => v.len(),
            PixelData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        match self {
            PixelData::U8(v) => v.len(),
            PixelData::I8(v) => v.len(),
            PixelData::U16(v) => v.len() * 2,
            PixelData::I16(v) => v.len() * 2,
            PixelData::U32(v) => v.len() * 4,
            PixelData::I32(v) => v.len() * 4,
        }
    }
}

/// Flattened float slice pixels, present only for float-typed sources.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FloatPixelData {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// One extracted cross-section with its display geometry.
#[derive(Debug, Clone)]
pub struct Slice {
    pub dimension: SliceDimension,
    pub index: usize,
    pub time_point: usize,
    pub rows: usize,
    pub columns: usize,
    pub number_of_frames: usize,
    pub row_cosines: [f64; 3],
    pub column_cosines: [f64; 3],
    pub row_pixel_spacing: f64,
    pub column_pixel_spacing: f64,
    pub slice_pixel_spacing: f64,
    pub image_position_patient: [f64; 3],
    pub pixel_data: PixelData,
    pub float_pixel_data: Option<FloatPixelData>,
}

// (rows, columns, frames) storage-axis triple for a cut dimension.
fn dimension_axes(dimension: SliceDimension) -> (usize, usize, usize) {
    match dimension {
        SliceDimension::X => (2, 1, 0),
        SliceDimension::Y => (2, 0, 1),
        SliceDimension::Z => (1, 0, 2),
    }
}

// The 2D view left after fixing the time and frames axes always has its
// columns axis first (the columns storage axis index is smaller than the
// rows one for every cut), so the flatten reads view[[c, r]] with columns
// outer and rows inner.
fn flatten_plane<T: Copy>(
    array: &Array4<T>,
    time_point: usize,
    frames_axis: usize,
    index: usize,
    rows: usize,
    columns: usize,
) -> Vec<T> {
    let timepoint = array.index_axis(Axis(3), time_point);
    let view = timepoint.index_axis(Axis(frames_axis), index);
    let mut out = Vec::with_capacity(rows * columns);
    for c in 0..columns {
        for r in 0..rows {
            out.push(view[[c, r]]);
        }
    }
    out
}

/// Extract the cross-section named by `selector` from a normalized volume.
///
/// Fails with a range error when the slice index or timepoint falls outside
/// the volume, and with a metadata error for header-only volumes.
pub fn extract_slice(volume: &Volume, selector: &SliceSelector) -> Result<Slice> {
    let meta = &volume.meta;
    let (rows_axis, columns_axis, frames_axis) = dimension_axes(selector.dimension);

    let number_of_frames = meta.voxel_length[frames_axis];
    if selector.index >= number_of_frames {
        return Err(NiftiError::Range(format!(
            "slice index {} out of bounds for dimension {} of length {}",
            selector.index,
            selector.dimension.token(),
            number_of_frames
        )));
    }
    if selector.time_point >= meta.time_slices {
        return Err(NiftiError::Range(format!(
            "timepoint {} out of bounds for volume with {} timepoints",
            selector.time_point, meta.time_slices
        )));
    }

    let data = volume.data.as_ref().ok_or_else(|| {
        NiftiError::Metadata("cannot extract a slice from a header-only volume".to_string())
    })?;

    let rows = meta.voxel_length[rows_axis];
    let columns = meta.voxel_length[columns_axis];

    let matrix = &meta.orientation_matrix;
    let row_cosines = normalize_vector([
        matrix[0][rows_axis],
        matrix[1][rows_axis],
        matrix[2][rows_axis],
    ]);
    let column_cosines = normalize_vector([
        matrix[0][columns_axis],
        matrix[1][columns_axis],
        matrix[2][columns_axis],
    ]);

    let mut origin_voxel = [0.0; 3];
    origin_voxel[frames_axis] = selector.index as f64;
    let image_position_patient = multiply_matrix_and_point(matrix, origin_voxel);

    let pixel_data = match data {
        VoxelBuffer::U8(a) => PixelData::U8(flatten_plane(
            a, selector.time_point, frames_axis, selector.index, rows, columns,
        )),
        VoxelBuffer::I8(a) => PixelData::I8(flatten_plane(
            a, selector.time_point, frames_axis, selector.index, rows, columns,
        )),
        VoxelBuffer::U16(a) => PixelData::U16(flatten_plane(
            a, selector.time_point, frames_axis, selector.index, rows, columns,
        )),
        VoxelBuffer::I16(a) => PixelData::I16(flatten_plane(
            a, selector.time_point, frames_axis, selector.index, rows, columns,
        )),
        VoxelBuffer::U32(a) => PixelData::U32(flatten_plane(
            a, selector.time_point, frames_axis, selector.index, rows, columns,
        )),
        VoxelBuffer::I32(a) => PixelData::I32(flatten_plane(
            a, selector.time_point, frames_axis, selector.index, rows, columns,
        )),
    };

    let float_pixel_data = volume.float_data.as_ref().map(|floats| match floats {
        FloatBuffer::F32(a) => FloatPixelData::F32(flatten_plane(
            a, selector.time_point, frames_axis, selector.index, rows, columns,
        )),
        FloatBuffer::F64(a) => FloatPixelData::F64(flatten_plane(
            a, selector.time_point, frames_axis, selector.index, rows, columns,
        )),
    });

    Ok(Slice {
        dimension: selector.dimension,
        index: selector.index,
        time_point: selector.time_point,
        rows,
        columns,
        number_of_frames,
        row_cosines,
        column_cosines,
        row_pixel_spacing: meta.pixel_spacing[rows_axis],
        column_pixel_spacing: meta.pixel_spacing[columns_axis],
        slice_pixel_spacing: meta.pixel_spacing[frames_axis],
        image_position_patient,
        pixel_data,
        float_pixel_data,
    })
}

/// The contract the rendering layer consumes: slice pixels plus the display
/// calibration needed to draw them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderableImage {
    pub image_id: String,
    pub color: bool,
    pub width: usize,
    pub height: usize,
    pub rows: usize,
    pub columns: usize,
    pub row_pixel_spacing: f64,
    pub column_pixel_spacing: f64,
    pub slope: f64,
    pub intercept: f64,
    pub min_pixel_value: f64,
    pub max_pixel_value: f64,
    pub window_center: f64,
    pub window_width: f64,
    pub invert: bool,
    pub size_in_bytes: usize,
    pub pixel_data: PixelData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub float_pixel_data: Option<FloatPixelData>,
}

impl Slice {
    /// Package the slice for the host viewer, pulling value calibration from
    /// the volume's metadata.
    pub fn into_renderable(self, image_id: &ImageId, meta: &VolumeMetaData) -> RenderableImage {
        let size_in_bytes = self.pixel_data.byte_len();
        RenderableImage {
            image_id: image_id.to_string(),
            color: meta.data_type.is_color,
            width: self.columns,
            height: self.rows,
            rows: self.rows,
            columns: self.columns,
            row_pixel_spacing: self.row_pixel_spacing,
            column_pixel_spacing: self.column_pixel_spacing,
            slope: meta.slope,
            intercept: meta.intercept,
            min_pixel_value: meta.min_pixel_value,
            max_pixel_value: meta.max_pixel_value,
            window_center: meta.window_center,
            window_width: meta.window_width,
            invert: false,
            size_in_bytes,
            pixel_data: self.pixel_data,
            float_pixel_data: self.float_pixel_data,
        }
    }
}
