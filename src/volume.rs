//! Volume assembly and normalization.
//!
//! A decoded payload becomes a [`Volume`] through four transforms, in order:
//! global min/max scan, float quantization to 16-bit (retaining the float
//! buffer for value fidelity), storage-order reorder to canonical XYZ, and
//! the unconditional RAS to LPS handedness flip. Voxels live in `ndarray`
//! `Array4` containers shaped `(x, y, z, t)` in Fortran order so the reorder
//! is a strided permute, never a copy.

use crate::decode::TypedPixelData;
use crate::error::{NiftiError, Result};
use crate::header::{PatientAxis, VolumeMetaData};
use crate::utils::Affine4;
use ndarray::{Array4, ShapeBuilder, ShapeError};
use tracing::debug;

/// Largest value representable after quantization.
const QUANTIZATION_STEPS: f64 = 65535.0;

/// Integer voxel storage, one `Array4` variant per supported element type.
/// Quantized float sources land in `U16`.
#[derive(Debug, Clone)]
pub enum VoxelBuffer {
    U8(Array4<u8>),
    I8(Array4<i8>),
    U16(Array4<u16>),
    I16(Array4<i16>),
    U32(Array4<u32>),
    I32(Array4<i32>),
}

impl VoxelBuffer {
    pub fn element_count(&self) -> usize {
        match self {
            VoxelBuffer::U8(a) => a.len(),
            VoxelBuffer::I8(a) => a.len(),
            VoxelBuffer::U16(a) => a.len(),
            VoxelBuffer::I16(a) => a.len(),
            VoxelBuffer::U32(a) => a.len(),
            VoxelBuffer::I32(a) => a.len(),
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            VoxelBuffer::U8(a) => a.len(),
            VoxelBuffer::I8(a) => a.len(),
            VoxelBuffer::U16(a) => a.len() * 2,
            VoxelBuffer::I16(a) => a.len() * 2,
            VoxelBuffer::U32(a) => a.len() * 4,
            VoxelBuffer::I32(a) => a.len() * 4,
        }
    }

    fn permuted(self, axes: [usize; 4]) -> Self {
        match self {
            VoxelBuffer::U8(a) => VoxelBuffer::U8(a.permuted_axes(axes)),
            VoxelBuffer::I8(a) => VoxelBuffer::I8(a.permuted_axes(axes)),
            VoxelBuffer::U16(a) => VoxelBuffer::U16(a.permuted_axes(axes)),
            VoxelBuffer::I16(a) => VoxelBuffer::I16(a.permuted_axes(axes)),
            VoxelBuffer::U32(a) => VoxelBuffer::U32(a.permuted_axes(axes)),
            VoxelBuffer::I32(a) => VoxelBuffer::I32(a.permuted_axes(axes)),
        }
    }
}

/// Original float voxels, kept alongside the quantized buffer.
#[derive(Debug, Clone)]
pub enum FloatBuffer {
    F32(Array4<f32>),
    F64(Array4<f64>),
}

impl FloatBuffer {
    pub fn byte_len(&self) -> usize {
        match self {
            FloatBuffer::F32(a) => a.len() * 4,
            FloatBuffer::F64(a) => a.len() * 8,
        }
    }

    fn permuted(self, axes: [usize; 4]) -> Self {
        match self {
            FloatBuffer::F32(a) => FloatBuffer::F32(a.permuted_axes(axes)),
            FloatBuffer::F64(a) => FloatBuffer::F64(a.permuted_axes(axes)),
        }
    }
}

/// One of the six possible assignments of patient axes to storage axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOrder {
    Xyz,
    Xzy,
    Yxz,
    Yzx,
    Zxy,
    Zyx,
}

impl StorageOrder {
    // Callers only pass orders produced by `OrientationCode::from_matrix`,
    // which always yields a permutation.
    pub(crate) fn from_order(order: [PatientAxis; 3]) -> Self {
        use PatientAxis::*;
        match order {
            [X, Y, Z] => StorageOrder::Xyz,
            [X, Z, Y] => StorageOrder::Xzy,
            [Y, X, Z] => StorageOrder::Yxz,
            [Y, Z, X] => StorageOrder::Yzx,
            [Z, X, Y] => StorageOrder::Zxy,
            [Z, Y, X] => StorageOrder::Zyx,
            _ => unreachable!("orientation order is not a permutation"),
        }
    }

    /// `perm[i]` = the storage axis that holds patient axis `i`; permuting
    /// storage axes by this takes the volume to canonical XYZ.
    pub fn permutation(&self) -> [usize; 3] {
        match self {
            StorageOrder::Xyz => [0, 1, 2],
            StorageOrder::Xzy => [0, 2, 1],
            StorageOrder::Yxz => [1, 0, 2],
            StorageOrder::Yzx => [2, 0, 1],
            StorageOrder::Zxy => [1, 2, 0],
            StorageOrder::Zyx => [2, 1, 0],
        }
    }
}

/// A fully normalized volume: canonical XYZ storage order, LPS orientation
/// matrix, integer voxels (plus the retained float buffer for float sources).
#[derive(Debug, Clone)]
pub struct Volume {
    pub meta: VolumeMetaData,
    pub data: Option<VoxelBuffer>,
    pub float_data: Option<FloatBuffer>,
    /// True when this volume holds a single extracted timepoint of a larger
    /// time series.
    pub is_single_timepoint: bool,
}

impl Volume {
    /// Assemble and normalize a full multi-timepoint volume.
    pub fn build(meta: VolumeMetaData, pixels: TypedPixelData) -> Result<Self> {
        Self::build_inner(meta, pixels, false)
    }

    /// Assemble a volume holding one timepoint extracted from a time series;
    /// `meta.time_slices` must already be 1.
    pub fn build_timepoint(meta: VolumeMetaData, pixels: TypedPixelData) -> Result<Self> {
        Self::build_inner(meta, pixels, true)
    }

    /// A volume carrying normalized metadata but no voxels, for callers that
    /// only need geometry and windowing.
    pub fn header_only(mut meta: VolumeMetaData) -> Self {
        let _ = reorder_metadata(&mut meta);
        ras_to_lps(&mut meta.orientation_matrix);
        if let Some(window) = meta.window {
            meta.window_center = (window.max + window.min) / 2.0;
            meta.window_width = window.max - window.min;
        }
        Volume {
            meta,
            data: None,
            float_data: None,
            is_single_timepoint: false,
        }
    }

    pub fn has_image_data(&self) -> bool {
        self.data.is_some()
    }

    /// Memory footprint of the voxel buffers, used for cache accounting.
    pub fn size_in_bytes(&self) -> usize {
        self.data.as_ref().map_or(0, VoxelBuffer::byte_len)
            + self.float_data.as_ref().map_or(0, FloatBuffer::byte_len)
    }

    fn build_inner(
        mut meta: VolumeMetaData,
        pixels: TypedPixelData,
        is_single_timepoint: bool,
    ) -> Result<Self> {
        if meta.data_type.channel_count != 1 {
            return Err(NiftiError::Metadata(format!(
                "multi-channel volumes are not supported ({} channels)",
                meta.data_type.channel_count
            )));
        }

        let shape = (
            meta.voxel_length[0],
            meta.voxel_length[1],
            meta.voxel_length[2],
            meta.time_slices,
        );

        let (mut data, mut float_data, min, max) = match pixels {
            TypedPixelData::U8(v) => integer_buffer(v, shape, VoxelBuffer::U8)?,
            TypedPixelData::I8(v) => integer_buffer(v, shape, VoxelBuffer::I8)?,
            TypedPixelData::U16(v) => integer_buffer(v, shape, VoxelBuffer::U16)?,
            TypedPixelData::I16(v) => integer_buffer(v, shape, VoxelBuffer::I16)?,
            TypedPixelData::U32(v) => integer_buffer(v, shape, VoxelBuffer::U32)?,
            TypedPixelData::I32(v) => integer_buffer(v, shape, VoxelBuffer::I32)?,
            TypedPixelData::F32(v) => quantize(v, shape, &mut meta, FloatBuffer::F32)?,
            TypedPixelData::F64(v) => quantize(v, shape, &mut meta, FloatBuffer::F64)?,
        };
        meta.min_pixel_value = min;
        meta.max_pixel_value = max;

        default_window(&mut meta);

        let storage_perm = reorder_metadata(&mut meta);
        let axes = [storage_perm[0], storage_perm[1], storage_perm[2], 3];
        data = data.permuted(axes);
        float_data = float_data.map(|f| f.permuted(axes));

        ras_to_lps(&mut meta.orientation_matrix);

        Ok(Volume {
            meta,
            data: Some(data),
            float_data,
            is_single_timepoint,
        })
    }
}

fn shape_error(e: ShapeError) -> NiftiError {
    NiftiError::Format(format!("voxel payload does not match header dimensions: {e}"))
}

fn scan_min_max<I: Iterator<Item = f64>>(values: I) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    (min, max)
}

type BuiltBuffers = (VoxelBuffer, Option<FloatBuffer>, f64, f64);

fn integer_buffer<T>(
    values: Vec<T>,
    shape: (usize, usize, usize, usize),
    wrap: fn(Array4<T>) -> VoxelBuffer,
) -> Result<BuiltBuffers>
where
    T: Copy + Into<f64>,
{
    let (min, max) = scan_min_max(values.iter().map(|&v| v.into()));
    let array = Array4::from_shape_vec(shape.f(), values).map_err(shape_error)?;
    Ok((wrap(array), None, min, max))
}

// Map floats onto [0, 65535] with q = floor((v - min) / slope); the header's
// rescale pair is replaced so q * slope + intercept recovers the source
// value, and the float buffer is kept.
fn quantize<T>(
    values: Vec<T>,
    shape: (usize, usize, usize, usize),
    meta: &mut VolumeMetaData,
    wrap: fn(Array4<T>) -> FloatBuffer,
) -> Result<BuiltBuffers>
where
    T: Copy + Into<f64> + 'static,
{
    let (min, max) = scan_min_max(values.iter().map(|&v| v.into()));
    let range = max - min;
    let slope = if range == 0.0 {
        1.0
    } else {
        range / QUANTIZATION_STEPS
    };

    let float_array = Array4::from_shape_vec(shape.f(), values).map_err(shape_error)?;
    let quantized =
        float_array.mapv(|v| ((v.into() - min) / slope).floor() as u16);

    meta.slope = slope;
    meta.intercept = min;
    Ok((
        VoxelBuffer::U16(quantized),
        Some(wrap(float_array)),
        ((min - min) / slope).floor(),
        ((max - min) / slope).floor(),
    ))
}

// When the header declared no calibration window, synthesize one from the
// observed value range mapped back through the rescale pair; a declared
// window is already in rescaled units.
fn default_window(meta: &mut VolumeMetaData) {
    let (slope, intercept, min, max) = match meta.window {
        None => (
            meta.slope,
            meta.intercept,
            meta.min_pixel_value,
            meta.max_pixel_value,
        ),
        Some(window) => (1.0, 0.0, window.min, window.max),
    };
    let min_voi = min * slope + intercept;
    let max_voi = max * slope + intercept;
    meta.window_center = (max_voi + min_voi) / 2.0;
    meta.window_width = max_voi - min_voi;
}

/// Rewrite the metadata for canonical XYZ storage order and return the axis
/// permutation to apply to the voxel buffers (`perm[i]` = storage axis that
/// becomes canonical axis `i`).
pub(crate) fn reorder_metadata(meta: &mut VolumeMetaData) -> [usize; 3] {
    let order = StorageOrder::from_order(meta.orientation_code.order);
    let perm = order.permutation();
    if order != StorageOrder::Xyz {
        debug!(
            order = %meta.orientation_code,
            "reordering voxel storage to canonical XYZ"
        );
    }

    let old = meta.orientation_matrix;
    let mut matrix = [[0.0; 4]; 4];
    for r in 0..3 {
        for c in 0..3 {
            matrix[r][c] = old[c][perm[r]];
        }
    }
    matrix[0][3] = old[perm[0]][3];
    matrix[1][3] = -old[perm[1]][3];
    matrix[2][3] = -old[perm[2]][3];
    matrix[3] = [0.0, 0.0, 0.0, 1.0];
    meta.orientation_matrix = matrix;

    let lengths = meta.voxel_length;
    let spacing = meta.pixel_spacing;
    let senses = meta.orientation_code.senses;
    for i in 0..3 {
        meta.voxel_length[i] = lengths[perm[i]];
        meta.pixel_spacing[i] = spacing[perm[i]];
        meta.orientation_code.senses[i] = senses[perm[i]];
    }
    meta.orientation_code.order = [PatientAxis::X, PatientAxis::Y, PatientAxis::Z];

    perm
}

/// Flip the orientation matrix from RAS to LPS by negating the X and Y rows.
pub(crate) fn ras_to_lps(matrix: &mut Affine4) {
    for cell in matrix[0].iter_mut() {
        *cell = -*cell;
    }
    for cell in matrix[1].iter_mut() {
        *cell = -*cell;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{parse_header, OrientationCode};

    fn meta_for(datatype: i16, dims: [i16; 3], time_slices: i16) -> VolumeMetaData {
        let bytes = crate::header::tests::build_nifti1_header(
            dims,
            time_slices,
            datatype,
            [1.0, 1.0, 1.0],
            2,
            None,
        );
        parse_header(&bytes).unwrap()
    }

    #[test]
    fn test_storage_order_maps_every_permutation() {
        use PatientAxis::*;
        let cases = [
            ([X, Y, Z], [0, 1, 2]),
            ([X, Z, Y], [0, 2, 1]),
            ([Y, X, Z], [1, 0, 2]),
            ([Y, Z, X], [2, 0, 1]),
            ([Z, X, Y], [1, 2, 0]),
            ([Z, Y, X], [2, 1, 0]),
        ];
        for (order, perm) in cases {
            assert_eq!(StorageOrder::from_order(order).permutation(), perm);
        }
    }

    #[test]
    fn test_build_scans_min_max_and_defaults_window() {
        let meta = meta_for(2, [2, 2, 2], 1);
        let pixels = TypedPixelData::U8(vec![5, 10, 20, 40, 80, 160, 3, 9]);
        let volume = Volume::build(meta, pixels).unwrap();
        assert_eq!(volume.meta.min_pixel_value, 3.0);
        assert_eq!(volume.meta.max_pixel_value, 160.0);
        // no declared window, slope 1, intercept 0
        assert_eq!(volume.meta.window_center, 81.5);
        assert_eq!(volume.meta.window_width, 157.0);
        assert!(volume.has_image_data());
        assert!(volume.float_data.is_none());
    }

    #[test]
    fn test_float_quantization_retains_float_buffer() {
        let meta = meta_for(16, [4, 1, 1], 1);
        let pixels = TypedPixelData::F32(vec![0.0, 1.0, 2.0, 3.0]);
        let volume = Volume::build(meta, pixels).unwrap();

        let expected_slope = 3.0 / 65535.0;
        assert!((volume.meta.slope - expected_slope).abs() < 1e-12);
        assert_eq!(volume.meta.intercept, 0.0);
        assert_eq!(volume.meta.min_pixel_value, 0.0);
        assert_eq!(volume.meta.max_pixel_value, 65535.0);

        let data = match volume.data.as_ref().unwrap() {
            VoxelBuffer::U16(a) => a,
            other => panic!("expected quantized u16 buffer, got {other:?}"),
        };
        assert_eq!(data[[0, 0, 0, 0]], 0);
        assert_eq!(data[[1, 0, 0, 0]], 21845);
        assert_eq!(data[[2, 0, 0, 0]], 43690);
        assert_eq!(data[[3, 0, 0, 0]], 65535);

        let floats = match volume.float_data.as_ref().unwrap() {
            FloatBuffer::F32(a) => a,
            other => panic!("expected f32 float buffer, got {other:?}"),
        };
        assert_eq!(floats[[2, 0, 0, 0]], 2.0);
    }

    #[test]
    fn test_constant_float_volume_quantizes_to_zero() {
        let meta = meta_for(16, [2, 1, 1], 1);
        let volume = Volume::build(meta, TypedPixelData::F32(vec![7.5, 7.5])).unwrap();
        assert_eq!(volume.meta.slope, 1.0);
        assert_eq!(volume.meta.intercept, 7.5);
        match volume.data.as_ref().unwrap() {
            VoxelBuffer::U16(a) => assert!(a.iter().all(|&q| q == 0)),
            other => panic!("expected u16, got {other:?}"),
        }
    }

    #[test]
    fn test_declared_window_drives_center_and_width() {
        let bytes = crate::header::tests::build_nifti1_header(
            [2, 2, 2],
            1,
            2,
            [1.0, 1.0, 1.0],
            2,
            Some((10.0, 90.0)),
        );
        let meta = parse_header(&bytes).unwrap();
        let volume = Volume::build(meta, TypedPixelData::U8(vec![0; 8])).unwrap();
        assert_eq!(volume.meta.window_center, 50.0);
        assert_eq!(volume.meta.window_width, 80.0);
    }

    #[test]
    fn test_reorder_zyx_to_canonical() {
        // storage axis 0 holds Z, axis 1 holds Y, axis 2 holds X
        let mut meta = meta_for(2, [2, 3, 4], 1);
        meta.orientation_matrix = [
            [0.0, 0.0, 2.0, 10.0],
            [0.0, 3.0, 0.0, 20.0],
            [4.0, 0.0, 0.0, 30.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        meta.orientation_code = OrientationCode::from_matrix(&meta.orientation_matrix);
        assert_eq!(meta.orientation_code.to_string(), "ZYX+++");

        let values: Vec<u8> = (0..24).collect();
        let volume = Volume::build(meta, TypedPixelData::U8(values)).unwrap();

        assert_eq!(volume.meta.voxel_length, [4, 3, 2]);
        assert_eq!(volume.meta.orientation_code.order[0], PatientAxis::X);

        // reordered then flipped RAS->LPS (rows 0 and 1 negated)
        let m = volume.meta.orientation_matrix;
        assert_eq!(m[0][0], -2.0);
        assert_eq!(m[0][3], -30.0);
        assert_eq!(m[1][1], -3.0);
        assert_eq!(m[1][3], 20.0);
        assert_eq!(m[2][2], 4.0);
        assert_eq!(m[2][3], -10.0);

        // canonical[i, j, k] reads storage[k, j, i]; Fortran order means
        // storage[a, b, c] = a + 2b + 6c
        let data = match volume.data.as_ref().unwrap() {
            VoxelBuffer::U8(a) => a,
            other => panic!("expected u8, got {other:?}"),
        };
        assert_eq!(data.dim(), (4, 3, 2, 1));
        assert_eq!(data[[3, 1, 0, 0]], 20);
        assert_eq!(data[[0, 0, 1, 0]], 1);
    }

    #[test]
    fn test_ras_to_lps_negates_first_two_rows() {
        let mut matrix: Affine4 = [
            [1.0, 2.0, 3.0, 4.0],
            [5.0, 6.0, 7.0, 8.0],
            [9.0, 10.0, 11.0, 12.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        ras_to_lps(&mut matrix);
        assert_eq!(matrix[0], [-1.0, -2.0, -3.0, -4.0]);
        assert_eq!(matrix[1], [-5.0, -6.0, -7.0, -8.0]);
        assert_eq!(matrix[2], [9.0, 10.0, 11.0, 12.0]);
        assert_eq!(matrix[3], [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_header_only_volume_has_no_data() {
        let bytes = crate::header::tests::build_nifti1_header(
            [2, 2, 2],
            1,
            2,
            [1.0, 1.0, 1.0],
            2,
            Some((0.0, 100.0)),
        );
        let meta = parse_header(&bytes).unwrap();
        let volume = Volume::header_only(meta);
        assert!(!volume.has_image_data());
        assert_eq!(volume.size_in_bytes(), 0);
        assert_eq!(volume.meta.window_center, 50.0);
        // LPS flip applied to the synthesized diagonal
        assert!(volume.meta.orientation_matrix[0][0] < 0.0);
    }

    #[test]
    fn test_multi_channel_volume_is_rejected() {
        let mut meta = meta_for(2, [2, 2, 2], 1);
        meta.data_type.channel_count = 3;
        let result = Volume::build(meta, TypedPixelData::U8(vec![0; 24]));
        assert!(matches!(result, Err(NiftiError::Metadata(_))));
    }
}
