//! # nifti-loader
//!
//! Progressive acquisition engine for NIfTI neuroimaging volumes: fetch
//! bytes (whole, ranged or streamed), parse NIFTI-1/NIFTI-2 headers, decode
//! and normalize 4D voxel data, cache the result and serve orthogonal 2D
//! slices to a host viewer.
//!
//! The entry point is [`VolumeAcquisition`], an explicit context object; two
//! independent instances share no state.
//!
//! ```no_run
//! use nifti_loader::{VolumeAcquisition, ImageId};
//!
//! # async fn demo() -> nifti_loader::Result<()> {
//! let acquisition = VolumeAcquisition::open_local("/data/scans");
//! let image_id: ImageId = "nifti:brain.nii#z-40,t-0".parse()?;
//! let image = acquisition.acquire(&image_id).await?;
//! assert_eq!(image.width * image.height, image.pixel_data.len());
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod cache;
pub mod decode;
pub mod error;
pub mod events;
pub mod fetch;
pub mod header;
pub mod selector;
pub mod slice;
pub mod stream;
pub mod utils;
pub mod volume;

pub use acquisition::{AcquisitionState, VolumeAcquisition};
pub use cache::{VolumeCache, DEFAULT_CACHE_CAPACITY};
pub use decode::{decode_payload, decode_voxels, decompress, decompress_if_needed, is_compressed, TypedPixelData};
pub use error::{NiftiError, Result};
pub use events::{LoaderEvent, LoaderEvents};
pub use fetch::{ByteSource, FileFetcher, FileSystemByteSource, RangedBytes, RequestShape};
#[cfg(feature = "http-client")]
pub use fetch::HttpByteSource;
pub use header::{
    parse_header, DataTypeDescriptor, Endianness, OrientationCode, VolumeMetaData, VoxelType,
    WindowBounds, NIFTI1_HEADER_BYTE_SPAN, NIFTI1_MAGIC_COOKIE, NIFTI2_MAGIC_COOKIE,
};
pub use selector::{parse_image_id, ImageId, SliceDimension, SliceSelector};
pub use slice::{extract_slice, FloatPixelData, PixelData, RenderableImage, Slice};
pub use stream::{slice_ready_threshold, ByteStream, ChunkSource, FileStreamer, FileSystemChunkSource};
pub use volume::{FloatBuffer, StorageOrder, Volume, VoxelBuffer};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
