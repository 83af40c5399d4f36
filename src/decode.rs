//! Payload decompression and voxel decoding.
//!
//! Files may arrive gzip-wrapped; compression is detected from the two-byte
//! gzip magic rather than the file name, so renamed and transparently
//! compressed files both work. Decoded voxels are materialized as a typed
//! vector in the file's declared element type, byte-swapped to native order
//! when the source is big-endian.

use crate::error::{NiftiError, Result};
use crate::header::{Endianness, VolumeMetaData, VoxelType};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::GzDecoder;
use std::io::Read;

/// Leading bytes of a gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// True when `bytes` starts with the gzip magic.
pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0..2] == GZIP_MAGIC
}

/// Inflate a gzip stream into a fresh buffer.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| NiftiError::Decompression(e.to_string()))?;
    Ok(out)
}

/// Inflate when compressed, otherwise hand the bytes back untouched.
pub fn decompress_if_needed(bytes: Vec<u8>) -> Result<Vec<u8>> {
    if is_compressed(&bytes) {
        decompress(&bytes)
    } else {
        Ok(bytes)
    }
}

/// Voxel payload in the source's element type, native byte order.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedPixelData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TypedPixelData {
    pub fn len(&self) -> usize {
        match self {
            TypedPixelData::U8(v) => v.len(),
            TypedPixelData::I8(v) => v.len(),
            TypedPixelData::U16(v) => v.len(),
            TypedPixelData::I16(v) => v.len(),
            TypedPixelData::U32(v) => v.len(),
            TypedPixelData::I32(v) => v.len(),
            TypedPixelData::F32(v) => v.len(),
            TypedPixelData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_payload_len(payload: &[u8], element_count: usize, element_bytes: usize) -> Result<()> {
    let needed = element_count * element_bytes;
    if payload.len() < needed {
        return Err(NiftiError::Format(format!(
            "voxel payload too short: need {} bytes, have {}",
            needed,
            payload.len()
        )));
    }
    Ok(())
}

macro_rules! decode_wide {
    ($payload:expr, $count:expr, $endianness:expr, $ty:ty, $read:ident) => {{
        let mut out = vec![<$ty>::default(); $count];
        match $endianness {
            Endianness::Little => LittleEndian::$read($payload, &mut out),
            Endianness::Big => BigEndian::$read($payload, &mut out),
        }
        out
    }};
}

/// Decode `element_count` elements from the start of a raw (already
/// decompressed) payload slice.
///
/// This is the shared core of [`decode_voxels`] and the streaming path,
/// which decodes one timepoint's window at a time.
pub fn decode_payload(
    payload: &[u8],
    meta: &VolumeMetaData,
    element_count: usize,
) -> Result<TypedPixelData> {
    let element_bytes = meta.data_type.element_bytes;
    check_payload_len(payload, element_count, element_bytes)?;
    let payload = &payload[..element_count * element_bytes];
    let endianness = meta.endianness;

    let data = match meta.data_type.voxel_type {
        VoxelType::U8 | VoxelType::Rgb24 | VoxelType::Rgba32 => {
            TypedPixelData::U8(payload.to_vec())
        }
        VoxelType::I8 => TypedPixelData::I8(payload.iter().map(|&b| b as i8).collect()),
        VoxelType::U16 => TypedPixelData::U16(decode_wide!(
            payload, element_count, endianness, u16, read_u16_into
        )),
        VoxelType::I16 => TypedPixelData::I16(decode_wide!(
            payload, element_count, endianness, i16, read_i16_into
        )),
        VoxelType::U32 => TypedPixelData::U32(decode_wide!(
            payload, element_count, endianness, u32, read_u32_into
        )),
        VoxelType::I32 => TypedPixelData::I32(decode_wide!(
            payload, element_count, endianness, i32, read_i32_into
        )),
        VoxelType::F32 => TypedPixelData::F32(decode_wide!(
            payload, element_count, endianness, f32, read_f32_into
        )),
        VoxelType::F64 => TypedPixelData::F64(decode_wide!(
            payload, element_count, endianness, f64, read_f64_into
        )),
    };
    Ok(data)
}

/// Decode the full voxel payload of a decompressed file, starting at the
/// header's `vox_offset`.
pub fn decode_voxels(file_bytes: &[u8], meta: &VolumeMetaData) -> Result<TypedPixelData> {
    if file_bytes.len() < meta.vox_offset {
        return Err(NiftiError::Format(format!(
            "voxel offset {} lies beyond the file ({} bytes)",
            meta.vox_offset,
            file_bytes.len()
        )));
    }
    decode_payload(
        &file_bytes[meta.vox_offset..],
        meta,
        meta.total_element_count(),
    )
}
