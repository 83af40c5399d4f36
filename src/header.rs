//! Binary header parsing for NIFTI-1 and NIFTI-2 files.
//!
//! The two layouts are fixed-size and selected by the magic number at byte 0
//! (the `sizeof_hdr` field: 348 for NIFTI-1, 540 for NIFTI-2, read in either
//! byte order). Field extraction happens at fixed offsets with explicit
//! endianness. All spatial quantities are normalized to millimeters and the
//! orientation transform is resolved through the sform-affine / qform
//! quaternion / synthesized-diagonal fallback chain.

use crate::error::{NiftiError, Result};
use crate::utils::Affine4;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

/// NIFTI-1 `sizeof_hdr`, doubling as the format magic.
pub const NIFTI1_MAGIC_COOKIE: i32 = 348;
/// NIFTI-2 `sizeof_hdr`.
pub const NIFTI2_MAGIC_COOKIE: i32 = 540;
/// Standard NIFTI-1 header span including the 4 extension bytes; the minimum
/// prefix needed to parse metadata from a streamed file.
pub const NIFTI1_HEADER_BYTE_SPAN: usize = 352;

/// Byte order of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

/// Voxel element types supported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoxelType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
    Rgb24,
    Rgba32,
}

impl VoxelType {
    /// Map a NIFTI datatype code. Unrecognized codes are fatal; there is no
    /// fallback type.
    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            2 => Ok(VoxelType::U8),
            4 => Ok(VoxelType::I16),
            8 => Ok(VoxelType::I32),
            16 => Ok(VoxelType::F32),
            64 => Ok(VoxelType::F64),
            128 => Ok(VoxelType::Rgb24),
            256 => Ok(VoxelType::I8),
            512 => Ok(VoxelType::U16),
            768 => Ok(VoxelType::U32),
            2304 => Ok(VoxelType::Rgba32),
            other => Err(NiftiError::UnsupportedType(other)),
        }
    }

    /// Width in bytes of one stored element (one channel for color types).
    pub fn element_bytes(&self) -> usize {
        match self {
            VoxelType::U8 | VoxelType::I8 | VoxelType::Rgb24 | VoxelType::Rgba32 => 1,
            VoxelType::U16 | VoxelType::I16 => 2,
            VoxelType::U32 | VoxelType::I32 | VoxelType::F32 => 4,
            VoxelType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, VoxelType::F32 | VoxelType::F64)
    }

    /// Channels intrinsic to the element type.
    pub fn intrinsic_channels(&self) -> usize {
        match self {
            VoxelType::Rgb24 => 3,
            VoxelType::Rgba32 => 4,
            _ => 1,
        }
    }
}

/// Shape of the voxel payload: element width, float/color classification and
/// channel count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataTypeDescriptor {
    pub voxel_type: VoxelType,
    pub element_bytes: usize,
    pub is_float: bool,
    pub is_color: bool,
    pub channel_count: usize,
}

/// A patient-space axis label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatientAxis {
    X,
    Y,
    Z,
}

impl PatientAxis {
    pub fn letter(&self) -> char {
        match self {
            PatientAxis::X => 'X',
            PatientAxis::Y => 'Y',
            PatientAxis::Z => 'Z',
        }
    }

    pub fn index(&self) -> usize {
        match self {
            PatientAxis::X => 0,
            PatientAxis::Y => 1,
            PatientAxis::Z => 2,
        }
    }

    fn from_index(index: usize) -> Self {
        match index {
            0 => PatientAxis::X,
            1 => PatientAxis::Y,
            _ => PatientAxis::Z,
        }
    }
}

/// Growth direction of a storage axis relative to patient
/// right/anterior/superior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisSense {
    Positive,
    Negative,
}

impl AxisSense {
    pub fn sign_char(&self) -> char {
        match self {
            AxisSense::Positive => '+',
            AxisSense::Negative => '-',
        }
    }
}

/// Storage-order description: which patient axis each storage axis holds
/// (`order[j]` for storage axis `j`) and the growth sense of each, rendered
/// as a 6-character code such as `XYZ+--`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrientationCode {
    pub order: [PatientAxis; 3],
    pub senses: [AxisSense; 3],
}

impl OrientationCode {
    /// Canonical XYZ order with all-positive senses.
    pub fn canonical() -> Self {
        Self {
            order: [PatientAxis::X, PatientAxis::Y, PatientAxis::Z],
            senses: [AxisSense::Positive; 3],
        }
    }

    /// Derive the code from an orientation matrix: for each storage axis
    /// (matrix column) the dominant patient direction gives the letter, its
    /// sign the sense. Assignment is greedy over descending magnitude so the
    /// letters always form a permutation.
    pub fn from_matrix(matrix: &Affine4) -> Self {
        let mut order = [PatientAxis::X; 3];
        let mut senses = [AxisSense::Positive; 3];
        let mut taken_rows = [false; 3];
        let mut assigned = [false; 3];

        for _ in 0..3 {
            let mut best = (0usize, 0usize, -1.0f64);
            for col in 0..3 {
                if assigned[col] {
                    continue;
                }
                for row in 0..3 {
                    if taken_rows[row] {
                        continue;
                    }
                    let magnitude = matrix[row][col].abs();
                    if magnitude > best.2 {
                        best = (row, col, magnitude);
                    }
                }
            }
            let (row, col, _) = best;
            taken_rows[row] = true;
            assigned[col] = true;
            order[col] = PatientAxis::from_index(row);
            senses[col] = if matrix[row][col] < 0.0 {
                AxisSense::Negative
            } else {
                AxisSense::Positive
            };
        }

        Self { order, senses }
    }
}

impl fmt::Display for OrientationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for axis in &self.order {
            write!(f, "{}", axis.letter())?;
        }
        for sense in &self.senses {
            write!(f, "{}", sense.sign_char())?;
        }
        Ok(())
    }
}

/// Declared display-window calibration bounds. Absent when the header's
/// `cal_max - cal_min` is zero (the absent-window sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub min: f64,
    pub max: f64,
}

/// Typed metadata record decoded from a volume file header, later augmented
/// by the normalizer (min/max, window defaults, quantization rescale).
///
/// Invariants: `pixel_spacing` is always millimeters; after normalization the
/// `orientation_matrix` is LPS and `voxel_length` follows canonical XYZ
/// storage order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMetaData {
    pub voxel_length: [usize; 3],
    pub time_slices: usize,
    pub pixel_spacing: [f64; 3],
    pub orientation_matrix: Affine4,
    pub orientation_code: OrientationCode,
    pub data_type: DataTypeDescriptor,
    /// Value rescale slope; the header's `scl_slope` (0 means undefined and
    /// defaults to 1), replaced by the quantization slope for float sources.
    pub slope: f64,
    /// Value rescale intercept, replaced alongside `slope` for float sources.
    pub intercept: f64,
    /// Declared calibration bounds, `None` when absent.
    pub window: Option<WindowBounds>,
    /// Display window center; 0 until the normalizer computes a default.
    pub window_center: f64,
    /// Display window width; 0 until the normalizer computes a default.
    pub window_width: f64,
    /// Smallest voxel value; 0 until the voxel scan runs.
    pub min_pixel_value: f64,
    /// Largest voxel value; 0 until the voxel scan runs.
    pub max_pixel_value: f64,
    /// Byte offset of the voxel payload within the (decompressed) file.
    pub vox_offset: usize,
    pub endianness: Endianness,
}

impl VolumeMetaData {
    /// Number of elements in one timepoint of the payload.
    pub fn timepoint_element_count(&self) -> usize {
        self.voxel_length.iter().product::<usize>() * self.data_type.channel_count
    }

    /// Byte length of one timepoint of the payload.
    pub fn timepoint_byte_length(&self) -> usize {
        self.timepoint_element_count() * self.data_type.element_bytes
    }

    /// Total element count of the payload across all timepoints.
    pub fn total_element_count(&self) -> usize {
        self.timepoint_element_count() * self.time_slices
    }
}

// Raw field access with a selected byte order. Offsets follow the standard
// NIFTI-1/2 layouts.
struct FieldReader<'a> {
    bytes: &'a [u8],
    endianness: Endianness,
}

impl<'a> FieldReader<'a> {
    fn i16_at(&self, offset: usize) -> i16 {
        match self.endianness {
            Endianness::Little => LittleEndian::read_i16(&self.bytes[offset..]),
            Endianness::Big => BigEndian::read_i16(&self.bytes[offset..]),
        }
    }

    fn i32_at(&self, offset: usize) -> i32 {
        match self.endianness {
            Endianness::Little => LittleEndian::read_i32(&self.bytes[offset..]),
            Endianness::Big => BigEndian::read_i32(&self.bytes[offset..]),
        }
    }

    fn i64_at(&self, offset: usize) -> i64 {
        match self.endianness {
            Endianness::Little => LittleEndian::read_i64(&self.bytes[offset..]),
            Endianness::Big => BigEndian::read_i64(&self.bytes[offset..]),
        }
    }

    fn f32_at(&self, offset: usize) -> f32 {
        match self.endianness {
            Endianness::Little => LittleEndian::read_f32(&self.bytes[offset..]),
            Endianness::Big => BigEndian::read_f32(&self.bytes[offset..]),
        }
    }

    fn f64_at(&self, offset: usize) -> f64 {
        match self.endianness {
            Endianness::Little => LittleEndian::read_f64(&self.bytes[offset..]),
            Endianness::Big => BigEndian::read_f64(&self.bytes[offset..]),
        }
    }

    fn u8_at(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }
}

// Fields shared by both layouts, in layout-independent representation.
struct RawHeader {
    dims: [i64; 8],
    pix_dims: [f64; 8],
    datatype_code: i16,
    vox_offset: usize,
    scl_slope: f64,
    scl_inter: f64,
    cal_min: f64,
    cal_max: f64,
    xyzt_units: u8,
    qform_code: i32,
    sform_code: i32,
    quatern: [f64; 3],
    qoffset: [f64; 3],
    srows: [[f64; 4]; 3],
    endianness: Endianness,
}

pub(crate) fn detect_layout(bytes: &[u8]) -> Result<(i32, Endianness)> {
    if bytes.len() < 4 {
        return Err(NiftiError::Format(
            "file too short to contain a NIFTI header".to_string(),
        ));
    }
    let le = LittleEndian::read_i32(bytes);
    if le == NIFTI1_MAGIC_COOKIE || le == NIFTI2_MAGIC_COOKIE {
        return Ok((le, Endianness::Little));
    }
    let be = BigEndian::read_i32(bytes);
    if be == NIFTI1_MAGIC_COOKIE || be == NIFTI2_MAGIC_COOKIE {
        return Ok((be, Endianness::Big));
    }
    Err(NiftiError::Format(
        "this does not appear to be a NIFTI file".to_string(),
    ))
}

fn read_nifti1(bytes: &[u8], endianness: Endianness) -> Result<RawHeader> {
    if bytes.len() < NIFTI1_MAGIC_COOKIE as usize {
        return Err(NiftiError::Format(
            "truncated NIFTI-1 header".to_string(),
        ));
    }
    let r = FieldReader { bytes, endianness };

    let mut dims = [0i64; 8];
    for (i, dim) in dims.iter_mut().enumerate() {
        *dim = r.i16_at(40 + i * 2) as i64;
    }
    let mut pix_dims = [0f64; 8];
    for (i, pd) in pix_dims.iter_mut().enumerate() {
        *pd = r.f32_at(76 + i * 4) as f64;
    }

    Ok(RawHeader {
        dims,
        pix_dims,
        datatype_code: r.i16_at(70),
        vox_offset: r.f32_at(108).max(0.0) as usize,
        scl_slope: r.f32_at(112) as f64,
        scl_inter: r.f32_at(116) as f64,
        xyzt_units: r.u8_at(123),
        cal_max: r.f32_at(124) as f64,
        cal_min: r.f32_at(128) as f64,
        qform_code: r.i16_at(252) as i32,
        sform_code: r.i16_at(254) as i32,
        quatern: [
            r.f32_at(256) as f64,
            r.f32_at(260) as f64,
            r.f32_at(264) as f64,
        ],
        qoffset: [
            r.f32_at(268) as f64,
            r.f32_at(272) as f64,
            r.f32_at(276) as f64,
        ],
        srows: {
            let mut rows = [[0f64; 4]; 3];
            for (i, row) in rows.iter_mut().enumerate() {
                for (j, cell) in row.iter_mut().enumerate() {
                    *cell = r.f32_at(280 + (i * 4 + j) * 4) as f64;
                }
            }
            rows
        },
        endianness,
    })
}

fn read_nifti2(bytes: &[u8], endianness: Endianness) -> Result<RawHeader> {
    if bytes.len() < NIFTI2_MAGIC_COOKIE as usize {
        return Err(NiftiError::Format(
            "truncated NIFTI-2 header".to_string(),
        ));
    }
    let r = FieldReader { bytes, endianness };

    let mut dims = [0i64; 8];
    for (i, dim) in dims.iter_mut().enumerate() {
        *dim = r.i64_at(16 + i * 8);
    }
    let mut pix_dims = [0f64; 8];
    for (i, pd) in pix_dims.iter_mut().enumerate() {
        *pd = r.f64_at(104 + i * 8);
    }

    Ok(RawHeader {
        dims,
        pix_dims,
        datatype_code: r.i16_at(12),
        vox_offset: r.i64_at(168).max(0) as usize,
        scl_slope: r.f64_at(176),
        scl_inter: r.f64_at(184),
        cal_max: r.f64_at(192),
        cal_min: r.f64_at(200),
        qform_code: r.i32_at(344),
        sform_code: r.i32_at(348),
        quatern: [r.f64_at(352), r.f64_at(360), r.f64_at(368)],
        qoffset: [r.f64_at(376), r.f64_at(384), r.f64_at(392)],
        srows: {
            let mut rows = [[0f64; 4]; 3];
            for (i, row) in rows.iter_mut().enumerate() {
                for (j, cell) in row.iter_mut().enumerate() {
                    *cell = r.f64_at(400 + (i * 4 + j) * 8);
                }
            }
            rows
        },
        // low byte carries the same unit code in both layouts
        xyzt_units: (FieldReader { bytes, endianness }.i32_at(500) & 0xff) as u8,
        endianness,
    })
}

// Spatial unit code (low 3 bits of xyzt_units) to millimeter factor.
fn millimeter_factor(xyzt_units: u8) -> f64 {
    match xyzt_units & 0x07 {
        1 => 1000.0,  // meters
        2 => 1.0,     // millimeters
        3 => 0.001,   // microns
        _ => 1.0,
    }
}

fn scale_translation(matrix: &mut Affine4, factor: f64) {
    if factor != 1.0 {
        for row in matrix.iter_mut().take(3) {
            row[3] *= factor;
        }
    }
}

// Reconstruct the orientation transform from the qform quaternion, per the
// NIFTI standard's method 2.
fn matrix_from_quaternion(raw: &RawHeader) -> Affine4 {
    let [b, c, d] = raw.quatern;
    let mut a = 1.0 - (b * b + c * c + d * d);
    let (a, b, c, d) = if a < 1.0e-7 {
        let norm = (b * b + c * c + d * d).sqrt();
        if norm > 0.0 {
            (0.0, b / norm, c / norm, d / norm)
        } else {
            (1.0, 0.0, 0.0, 0.0)
        }
    } else {
        a = a.sqrt();
        (a, b, c, d)
    };

    let qfac = if raw.pix_dims[0] < 0.0 { -1.0 } else { 1.0 };
    let spacing = [
        raw.pix_dims[1].abs(),
        raw.pix_dims[2].abs(),
        raw.pix_dims[3].abs(),
    ];

    let rotation = [
        [
            a * a + b * b - c * c - d * d,
            2.0 * b * c - 2.0 * a * d,
            2.0 * b * d + 2.0 * a * c,
        ],
        [
            2.0 * b * c + 2.0 * a * d,
            a * a + c * c - b * b - d * d,
            2.0 * c * d - 2.0 * a * b,
        ],
        [
            2.0 * b * d - 2.0 * a * c,
            2.0 * c * d + 2.0 * a * b,
            a * a + d * d - b * b - c * c,
        ],
    ];

    let mut matrix = [[0.0; 4]; 4];
    for row in 0..3 {
        for col in 0..3 {
            let scale = if col == 2 { spacing[col] * qfac } else { spacing[col] };
            matrix[row][col] = rotation[row][col] * scale;
        }
        matrix[row][3] = raw.qoffset[row];
    }
    matrix[3] = [0.0, 0.0, 0.0, 1.0];
    matrix
}

// No orientation encoded at all: diagonal spacing matrix centered on the
// volume.
fn synthesized_matrix(spacing: [f64; 3], lengths: [usize; 3]) -> Affine4 {
    let mut matrix = [[0.0; 4]; 4];
    for i in 0..3 {
        matrix[i][i] = spacing[i];
        matrix[i][3] = -spacing[i] * lengths[i] as f64 / 2.0;
    }
    matrix[3] = [0.0, 0.0, 0.0, 1.0];
    matrix
}

/// Decode a file's fixed-size header into a typed metadata record.
///
/// `bytes` must hold at least the full header of the detected layout; the
/// voxel payload does not need to be present, which is what lets the
/// streaming path parse metadata from the first
/// [`NIFTI1_HEADER_BYTE_SPAN`] bytes.
pub fn parse_header(bytes: &[u8]) -> Result<VolumeMetaData> {
    let (cookie, endianness) = detect_layout(bytes)?;
    let raw = if cookie == NIFTI1_MAGIC_COOKIE {
        read_nifti1(bytes, endianness)?
    } else {
        read_nifti2(bytes, endianness)?
    };

    let voxel_type = VoxelType::from_code(raw.datatype_code)?;
    let channel_count = if raw.dims[0] >= 5 {
        (raw.dims[5].max(1)) as usize
    } else {
        voxel_type.intrinsic_channels()
    };
    let data_type = DataTypeDescriptor {
        voxel_type,
        element_bytes: voxel_type.element_bytes(),
        is_float: voxel_type.is_float(),
        is_color: matches!(
            (voxel_type, channel_count),
            (VoxelType::Rgb24, 3) | (VoxelType::Rgba32, 4)
        ),
        channel_count,
    };

    let voxel_length = [
        raw.dims[1].max(1) as usize,
        raw.dims[2].max(1) as usize,
        raw.dims[3].max(1) as usize,
    ];
    let time_slices = raw.dims[4].max(1) as usize;

    let unit_factor = millimeter_factor(raw.xyzt_units);
    let mut pixel_spacing = [
        raw.pix_dims[1].abs() * unit_factor,
        raw.pix_dims[2].abs() * unit_factor,
        raw.pix_dims[3].abs() * unit_factor,
    ];
    for spacing in pixel_spacing.iter_mut() {
        if *spacing == 0.0 {
            *spacing = 1.0;
        }
    }

    let orientation_matrix = if raw.sform_code > 0 {
        let mut matrix = [[0.0; 4]; 4];
        matrix[0] = raw.srows[0];
        matrix[1] = raw.srows[1];
        matrix[2] = raw.srows[2];
        matrix[3] = [0.0, 0.0, 0.0, 1.0];
        scale_translation(&mut matrix, unit_factor);
        matrix
    } else if raw.qform_code > 0 {
        let mut matrix = matrix_from_quaternion(&raw);
        scale_translation(&mut matrix, unit_factor);
        matrix
    } else {
        // built from the spacing above, which is already in millimeters
        synthesized_matrix(pixel_spacing, voxel_length)
    };

    let orientation_code = OrientationCode::from_matrix(&orientation_matrix);

    // scl_slope of 0 means "not defined" in the NIFTI standard
    let slope = if raw.scl_slope == 0.0 { 1.0 } else { raw.scl_slope };
    let intercept = raw.scl_inter;

    let window = if raw.cal_max - raw.cal_min == 0.0 {
        None
    } else {
        Some(WindowBounds {
            min: raw.cal_min,
            max: raw.cal_max,
        })
    };

    let vox_offset = if raw.vox_offset == 0 && cookie == NIFTI1_MAGIC_COOKIE {
        NIFTI1_HEADER_BYTE_SPAN
    } else {
        raw.vox_offset
    };

    Ok(VolumeMetaData {
        voxel_length,
        time_slices,
        pixel_spacing,
        orientation_matrix,
        orientation_code,
        data_type,
        slope,
        intercept,
        window,
        window_center: 0.0,
        window_width: 0.0,
        min_pixel_value: 0.0,
        max_pixel_value: 0.0,
        vox_offset,
        endianness,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::{Cursor, Seek, SeekFrom, Write};

    // Minimal little-endian NIFTI-1 header for tests.
    pub(crate) fn build_nifti1_header(
        dims: [i16; 3],
        time_slices: i16,
        datatype: i16,
        pix_dims: [f32; 3],
        xyzt_units: u8,
        cal: Option<(f32, f32)>,
    ) -> Vec<u8> {
        let mut bytes = vec![0u8; NIFTI1_HEADER_BYTE_SPAN];
        let mut cursor = Cursor::new(&mut bytes[..]);

        cursor.write_i32::<LittleEndian>(NIFTI1_MAGIC_COOKIE).unwrap();
        cursor.seek(SeekFrom::Start(40)).unwrap();
        cursor.write_i16::<LittleEndian>(if time_slices > 1 { 4 } else { 3 }).unwrap();
        for d in dims {
            cursor.write_i16::<LittleEndian>(d).unwrap();
        }
        cursor.write_i16::<LittleEndian>(time_slices).unwrap();
        cursor.seek(SeekFrom::Start(70)).unwrap();
        cursor.write_i16::<LittleEndian>(datatype).unwrap();
        cursor.seek(SeekFrom::Start(76)).unwrap();
        cursor.write_f32::<LittleEndian>(1.0).unwrap(); // qfac
        for pd in pix_dims {
            cursor.write_f32::<LittleEndian>(pd).unwrap();
        }
        cursor.seek(SeekFrom::Start(108)).unwrap();
        cursor.write_f32::<LittleEndian>(NIFTI1_HEADER_BYTE_SPAN as f32).unwrap();
        cursor.seek(SeekFrom::Start(123)).unwrap();
        cursor.write_all(&[xyzt_units]).unwrap();
        if let Some((min, max)) = cal {
            cursor.write_f32::<LittleEndian>(max).unwrap();
            cursor.write_f32::<LittleEndian>(min).unwrap();
        }
        cursor.seek(SeekFrom::Start(344)).unwrap();
        cursor.write_all(b"n+1\0").unwrap();
        bytes
    }

    // Minimal little-endian NIFTI-2 header for tests, padded to its 544-byte
    // vox_offset.
    pub(crate) fn build_nifti2_header(
        dims: [i64; 3],
        time_slices: i64,
        datatype: i16,
        pix_dims: [f64; 3],
        xyzt_units: u8,
    ) -> Vec<u8> {
        let mut bytes = vec![0u8; 544];
        let mut cursor = Cursor::new(&mut bytes[..]);

        cursor.write_i32::<LittleEndian>(NIFTI2_MAGIC_COOKIE).unwrap();
        cursor.write_all(b"n+2\0\r\n\x1a\n").unwrap();
        cursor.write_i16::<LittleEndian>(datatype).unwrap();
        cursor.seek(SeekFrom::Start(16)).unwrap();
        cursor.write_i64::<LittleEndian>(if time_slices > 1 { 4 } else { 3 }).unwrap();
        for d in dims {
            cursor.write_i64::<LittleEndian>(d).unwrap();
        }
        cursor.write_i64::<LittleEndian>(time_slices).unwrap();
        cursor.seek(SeekFrom::Start(104)).unwrap();
        cursor.write_f64::<LittleEndian>(1.0).unwrap(); // qfac
        for pd in pix_dims {
            cursor.write_f64::<LittleEndian>(pd).unwrap();
        }
        cursor.seek(SeekFrom::Start(168)).unwrap();
        cursor.write_i64::<LittleEndian>(544).unwrap();
        cursor.seek(SeekFrom::Start(500)).unwrap();
        cursor.write_i32::<LittleEndian>(xyzt_units as i32).unwrap();
        bytes
    }

    #[test]
    fn test_parse_basic_header() {
        let bytes = build_nifti1_header([4, 5, 6], 1, 2, [1.5, 2.0, 2.5], 2, None);
        let meta = parse_header(&bytes).unwrap();
        assert_eq!(meta.voxel_length, [4, 5, 6]);
        assert_eq!(meta.time_slices, 1);
        assert_eq!(meta.pixel_spacing, [1.5, 2.0, 2.5]);
        assert_eq!(meta.data_type.voxel_type, VoxelType::U8);
        assert!(!meta.data_type.is_float);
        assert_eq!(meta.slope, 1.0, "scl_slope of 0 defaults to 1");
        assert!(meta.window.is_none(), "zero-width window means absent");
        assert_eq!(meta.vox_offset, NIFTI1_HEADER_BYTE_SPAN);
        assert_eq!(meta.endianness, Endianness::Little);
    }

    #[test]
    fn test_parse_nifti2_header() {
        let bytes = build_nifti2_header([4, 5, 6], 2, 4, [1.5, 2.0, 2.5], 2);
        let meta = parse_header(&bytes).unwrap();
        assert_eq!(meta.voxel_length, [4, 5, 6]);
        assert_eq!(meta.time_slices, 2);
        assert_eq!(meta.pixel_spacing, [1.5, 2.0, 2.5]);
        assert_eq!(meta.data_type.voxel_type, VoxelType::I16);
        assert_eq!(meta.vox_offset, 544);
        assert_eq!(meta.endianness, Endianness::Little);
    }

    #[test]
    fn test_unit_normalization_to_millimeters() {
        // meters
        let bytes = build_nifti1_header([2, 2, 2], 1, 2, [0.001, 0.002, 0.004], 1, None);
        let meta = parse_header(&bytes).unwrap();
        assert!((meta.pixel_spacing[0] - 1.0).abs() < 1e-9);
        assert!((meta.pixel_spacing[1] - 2.0).abs() < 1e-9);
        assert!((meta.pixel_spacing[2] - 4.0).abs() < 1e-9);

        // unrecognized unit code passes through unchanged
        let bytes = build_nifti1_header([2, 2, 2], 1, 2, [3.0, 3.0, 3.0], 0, None);
        let meta = parse_header(&bytes).unwrap();
        assert_eq!(meta.pixel_spacing, [3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_synthesized_orientation_is_centered_diagonal() {
        let bytes = build_nifti1_header([10, 10, 10], 1, 2, [2.0, 2.0, 2.0], 2, None);
        let meta = parse_header(&bytes).unwrap();
        let m = meta.orientation_matrix;
        assert_eq!(m[0][0], 2.0);
        assert_eq!(m[1][1], 2.0);
        assert_eq!(m[2][2], 2.0);
        assert_eq!(m[0][3], -10.0);
        assert_eq!(m[3], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(meta.orientation_code.to_string(), "XYZ+++");
    }

    #[test]
    fn test_declared_window_bounds() {
        let bytes = build_nifti1_header([2, 2, 2], 1, 2, [1.0, 1.0, 1.0], 2, Some((10.0, 90.0)));
        let meta = parse_header(&bytes).unwrap();
        let window = meta.window.expect("declared window");
        assert_eq!(window.min, 10.0);
        assert_eq!(window.max, 90.0);
    }

    #[test]
    fn test_big_endian_detection() {
        let mut bytes = vec![0u8; NIFTI1_HEADER_BYTE_SPAN];
        BigEndian::write_i32(&mut bytes[0..], NIFTI1_MAGIC_COOKIE);
        BigEndian::write_i16(&mut bytes[40..], 3);
        BigEndian::write_i16(&mut bytes[42..], 2);
        BigEndian::write_i16(&mut bytes[44..], 2);
        BigEndian::write_i16(&mut bytes[46..], 2);
        BigEndian::write_i16(&mut bytes[70..], 4); // int16 voxels
        BigEndian::write_f32(&mut bytes[80..], 1.0);
        BigEndian::write_f32(&mut bytes[84..], 1.0);
        BigEndian::write_f32(&mut bytes[88..], 1.0);
        let meta = parse_header(&bytes).unwrap();
        assert_eq!(meta.endianness, Endianness::Big);
        assert_eq!(meta.voxel_length, [2, 2, 2]);
        assert_eq!(meta.data_type.voxel_type, VoxelType::I16);
    }

    #[test]
    fn test_neither_magic_matches() {
        let bytes = vec![0u8; NIFTI1_HEADER_BYTE_SPAN];
        assert!(matches!(parse_header(&bytes), Err(NiftiError::Format(_))));
    }

    #[test]
    fn test_unsupported_datatype_code() {
        let bytes = build_nifti1_header([2, 2, 2], 1, 1234, [1.0, 1.0, 1.0], 2, None);
        assert!(matches!(
            parse_header(&bytes),
            Err(NiftiError::UnsupportedType(1234))
        ));
    }

    #[test]
    fn test_orientation_code_from_permuted_matrix() {
        // storage axis 0 dominated by patient Y (negative), axis 1 by X,
        // axis 2 by Z
        let matrix: Affine4 = [
            [0.0, 3.0, 0.0, 0.0],
            [-2.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let code = OrientationCode::from_matrix(&matrix);
        assert_eq!(code.to_string(), "YXZ-++");
    }
}
