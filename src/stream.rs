//! Progressive byte streaming with windowed reads.
//!
//! [`FileStreamer`] drives one chunked download per resource into an
//! accumulation buffer and lets callers await arbitrary byte windows. A
//! window resolves as soon as `offset + length` bytes have arrived, so the
//! header can be parsed and early slices served while the rest of the file is
//! still in flight. Progress events fire per chunk.

use crate::decode::is_compressed;
use crate::error::{NiftiError, Result};
use crate::events::LoaderEvents;
use crate::header::{detect_layout, VolumeMetaData, NIFTI1_HEADER_BYTE_SPAN, NIFTI2_MAGIC_COOKIE};
use crate::selector::{SliceDimension, SliceSelector};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A fallible stream of byte chunks in network arrival order.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Opens a resource as a chunk stream, with the total byte count when the
/// source knows it up front.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn open(&self, key: &str) -> Result<(ByteStream, Option<u64>)>;
}

/// Streams files from a base directory in fixed-size chunks.
pub struct FileSystemChunkSource {
    base_path: PathBuf,
    chunk_size: usize,
}

impl FileSystemChunkSource {
    pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self::with_chunk_size(base_path, Self::DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(base_path: impl Into<PathBuf>, chunk_size: usize) -> Self {
        FileSystemChunkSource {
            base_path: base_path.into(),
            chunk_size,
        }
    }
}

#[async_trait]
impl ChunkSource for FileSystemChunkSource {
    async fn open(&self, key: &str) -> Result<(ByteStream, Option<u64>)> {
        let path = self.base_path.join(key);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| NiftiError::fetch(key, e.to_string()))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| NiftiError::fetch(key, e.to_string()))?
            .len();

        let chunk_size = self.chunk_size;
        let stream = futures::stream::try_unfold(file, move |mut file| async move {
            let mut buf = vec![0u8; chunk_size];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                Ok(None)
            } else {
                buf.truncate(n);
                Ok(Some((Bytes::from(buf), file)))
            }
        });
        Ok((stream.boxed(), Some(total)))
    }
}

struct WindowWaiter {
    offset: usize,
    length: usize,
    tx: oneshot::Sender<Result<Bytes>>,
}

#[derive(Default)]
struct StreamState {
    buffer: BytesMut,
    finished: bool,
    error: Option<NiftiError>,
    waiters: Vec<WindowWaiter>,
}

impl StreamState {
    fn window(&self, offset: usize, length: usize) -> Bytes {
        Bytes::copy_from_slice(&self.buffer[offset..offset + length])
    }

    // Hand every satisfiable waiter its window.
    fn resolve_ready(&mut self) {
        let available = self.buffer.len();
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].offset + self.waiters[i].length <= available {
                let waiter = self.waiters.swap_remove(i);
                let data = self.window(waiter.offset, waiter.length);
                let _ = waiter.tx.send(Ok(data));
            } else {
                i += 1;
            }
        }
    }

    fn fail_all(&mut self, error: NiftiError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        self.error = Some(error);
        self.finished = true;
    }
}

type StreamEntry = Arc<Mutex<StreamState>>;

/// Streaming fetcher: one download per resource, windowed partial reads.
pub struct FileStreamer {
    source: Arc<dyn ChunkSource>,
    states: Arc<Mutex<HashMap<String, StreamEntry>>>,
    events: LoaderEvents,
}

impl FileStreamer {
    pub fn new(source: Arc<dyn ChunkSource>, events: LoaderEvents) -> Self {
        FileStreamer {
            source,
            states: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn events(&self) -> &LoaderEvents {
        &self.events
    }

    /// Await the bytes in `[offset, offset + length)`, starting the download
    /// on first use. Fails when the stream ends (or already ended) short of
    /// the window.
    pub async fn read_window(&self, key: &str, offset: usize, length: usize) -> Result<Bytes> {
        let entry = self.ensure_streaming(key);

        let rx = {
            let mut state = entry.lock();
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if state.buffer.len() >= offset + length {
                return Ok(state.window(offset, length));
            }
            if state.finished {
                return Err(NiftiError::Range(format!(
                    "stream for '{}' ended at {} bytes, window [{}, {}) unavailable",
                    key,
                    state.buffer.len(),
                    offset,
                    offset + length
                )));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(WindowWaiter { offset, length, tx });
            rx
        };

        rx.await
            .map_err(|_| NiftiError::fetch(key, "stream task dropped"))?
    }

    /// The header prefix, enough to parse metadata. The 4-byte size cookie
    /// tells which layout the file uses, so only NIFTI-2 files wait for the
    /// longer 540-byte span. Gzip-wrapped prefixes are returned as-is for
    /// the caller to reject.
    pub async fn read_header(&self, key: &str) -> Result<Bytes> {
        let prefix = self.read_window(key, 0, 4).await?;
        if is_compressed(&prefix) {
            return Ok(prefix);
        }
        let (cookie, _) = detect_layout(&prefix)?;
        let span = if cookie == NIFTI2_MAGIC_COOKIE {
            NIFTI2_MAGIC_COOKIE as usize
        } else {
            NIFTI1_HEADER_BYTE_SPAN
        };
        self.read_window(key, 0, span).await
    }

    /// Total bytes received so far for a resource.
    pub fn bytes_received(&self, key: &str) -> usize {
        self.states
            .lock()
            .get(key)
            .map_or(0, |entry| entry.lock().buffer.len())
    }

    // First caller for a key spawns the download task; everyone else attaches
    // to the existing accumulation buffer.
    fn ensure_streaming(&self, key: &str) -> StreamEntry {
        let mut states = self.states.lock();
        if let Some(entry) = states.get(key) {
            return Arc::clone(entry);
        }

        let entry: StreamEntry = Arc::new(Mutex::new(StreamState::default()));
        states.insert(key.to_string(), Arc::clone(&entry));

        let source = Arc::clone(&self.source);
        let events = self.events.clone();
        let task_entry = Arc::clone(&entry);
        let key = key.to_string();
        tokio::spawn(async move {
            events.load_start(&key);
            let (mut stream, total) = match source.open(&key).await {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(key, error = %e, "failed to open stream");
                    task_entry.lock().fail_all(e);
                    events.load_end(&key);
                    return;
                }
            };

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        let loaded = {
                            let mut state = task_entry.lock();
                            state.buffer.extend_from_slice(&chunk);
                            state.resolve_ready();
                            state.buffer.len()
                        };
                        events.load_progress(&key, loaded as u64, total);
                    }
                    Err(e) => {
                        warn!(key, error = %e, "stream failed mid-download");
                        task_entry.lock().fail_all(e);
                        events.load_end(&key);
                        return;
                    }
                }
            }

            let mut state = task_entry.lock();
            state.finished = true;
            let received = state.buffer.len();
            for waiter in state.waiters.drain(..) {
                let _ = waiter.tx.send(Err(NiftiError::Range(format!(
                    "stream for '{}' ended at {} bytes, window [{}, {}) unavailable",
                    key,
                    received,
                    waiter.offset,
                    waiter.offset + waiter.length
                ))));
            }
            drop(state);
            debug!(key, received, "stream complete");
            events.load_end(&key);
        });

        entry
    }
}

/// Byte count that must have streamed in before the slice named by `selector`
/// can be extracted.
///
/// Only axial (`z`) cuts get a genuine per-frame threshold; a row or column
/// cut touches voxels in every z plane, so its readiness collapses to the
/// last plane of the timepoint.
pub fn slice_ready_threshold(meta: &VolumeMetaData, selector: &SliceSelector) -> usize {
    let plane_bytes = meta.voxel_length[0]
        * meta.voxel_length[1]
        * meta.data_type.channel_count
        * meta.data_type.element_bytes;
    let base = meta.vox_offset + selector.time_point * meta.timepoint_byte_length();
    match selector.dimension {
        SliceDimension::Z => base + (selector.index + 1) * plane_bytes,
        SliceDimension::X | SliceDimension::Y => base + meta.voxel_length[2] * plane_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::parse_header;
    use std::time::Duration;

    // Source that releases chunks only when the test says so.
    struct GatedSource {
        chunks: Vec<Bytes>,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ChunkSource for GatedSource {
        async fn open(&self, _key: &str) -> Result<(ByteStream, Option<u64>)> {
            let total: usize = self.chunks.iter().map(Bytes::len).sum();
            let chunks = self.chunks.clone();
            let gate = Arc::clone(&self.gate);
            let stream = futures::stream::try_unfold(
                (chunks.into_iter(), gate),
                |(mut chunks, gate)| async move {
                    match chunks.next() {
                        Some(chunk) => {
                            gate.notified().await;
                            Ok(Some((chunk, (chunks, gate))))
                        }
                        None => Ok(None),
                    }
                },
            );
            Ok((stream.boxed(), Some(total as u64)))
        }
    }

    #[tokio::test]
    async fn test_window_resolves_when_enough_bytes_arrive() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let source = Arc::new(GatedSource {
            chunks: vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")],
            gate: Arc::clone(&gate),
        });
        let streamer = FileStreamer::new(source, LoaderEvents::default());

        let pending = streamer.read_window("k", 2, 4);
        tokio::pin!(pending);

        // nothing has streamed yet
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut pending)
            .await
            .is_err());

        gate.notify_one();
        // first chunk alone (4 bytes) does not cover [2, 6)
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut pending)
            .await
            .is_err());

        gate.notify_one();
        let data = pending.await.unwrap();
        assert_eq!(data, Bytes::from_static(b"cdef"));
    }

    #[tokio::test]
    async fn test_window_beyond_stream_end_fails() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let source = Arc::new(GatedSource {
            chunks: vec![Bytes::from_static(b"abcd")],
            gate: Arc::clone(&gate),
        });
        let streamer = FileStreamer::new(source, LoaderEvents::default());

        let pending = streamer.read_window("k", 0, 10);
        tokio::pin!(pending);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut pending)
            .await
            .is_err());
        gate.notify_one();

        assert!(matches!(pending.await, Err(NiftiError::Range(_))));

        // stream already over: a second oversized window fails immediately
        let result = streamer.read_window("k", 0, 10).await;
        assert!(matches!(result, Err(NiftiError::Range(_))));
        assert_eq!(streamer.bytes_received("k"), 4);
    }

    #[tokio::test]
    async fn test_filesystem_chunk_source_streams_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vol.nii"), vec![7u8; 100_000]).unwrap();
        let source = Arc::new(FileSystemChunkSource::with_chunk_size(dir.path(), 4096));
        let streamer = FileStreamer::new(source, LoaderEvents::default());

        let head = streamer.read_window("vol.nii", 0, 16).await.unwrap();
        assert_eq!(head, Bytes::from(vec![7u8; 16]));
        let tail = streamer.read_window("vol.nii", 99_990, 10).await.unwrap();
        assert_eq!(tail.len(), 10);
    }

    #[tokio::test]
    async fn test_progress_events_fire_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vol.nii"), vec![0u8; 8192]).unwrap();
        let source = Arc::new(FileSystemChunkSource::with_chunk_size(dir.path(), 4096));
        let events = LoaderEvents::default();
        let mut rx = events.subscribe();
        let streamer = FileStreamer::new(source, events);

        streamer.read_window("vol.nii", 0, 8192).await.unwrap();

        use crate::events::LoaderEvent;
        assert!(matches!(rx.recv().await.unwrap(), LoaderEvent::LoadStart { .. }));
        match rx.recv().await.unwrap() {
            LoaderEvent::LoadProgress { loaded, percent, .. } => {
                assert_eq!(loaded, 4096);
                assert_eq!(percent, Some(50));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_header_spans_match_detected_layout() {
        let dir = tempfile::tempdir().unwrap();

        let mut n2 = crate::header::tests::build_nifti2_header([2, 2, 2], 2, 2, [1.0; 3], 2);
        n2.extend_from_slice(&[0u8; 16]);
        std::fs::write(dir.path().join("vol2.nii"), &n2).unwrap();

        // a NIFTI-1 file may be shorter in total than the NIFTI-2 span
        let mut n1 =
            crate::header::tests::build_nifti1_header([2, 2, 2], 1, 2, [1.0; 3], 2, None);
        n1.extend_from_slice(&[0u8; 8]);
        std::fs::write(dir.path().join("vol1.nii"), &n1).unwrap();

        let source = Arc::new(FileSystemChunkSource::with_chunk_size(dir.path(), 64));
        let streamer = FileStreamer::new(source, LoaderEvents::default());

        let head2 = streamer.read_header("vol2.nii").await.unwrap();
        assert_eq!(head2.len(), NIFTI2_MAGIC_COOKIE as usize);
        let meta = parse_header(&head2).unwrap();
        assert_eq!(meta.time_slices, 2);

        let head1 = streamer.read_header("vol1.nii").await.unwrap();
        assert_eq!(head1.len(), NIFTI1_HEADER_BYTE_SPAN);
        assert!(parse_header(&head1).is_ok());
    }

    // The collapse of row/column readiness to the last plane is the current
    // behavior, not an accident of this test.
    #[test]
    fn test_row_column_readiness_collapses_to_last_plane() {
        let bytes = crate::header::tests::build_nifti1_header(
            [4, 4, 8],
            1,
            2,
            [1.0, 1.0, 1.0],
            2,
            None,
        );
        let meta = parse_header(&bytes).unwrap();
        let plane = 16;

        let z_first = slice_ready_threshold(
            &meta,
            &SliceSelector {
                dimension: SliceDimension::Z,
                index: 0,
                time_point: 0,
            },
        );
        assert_eq!(z_first, meta.vox_offset + plane);

        for index in [0usize, 3] {
            let x_cut = slice_ready_threshold(
                &meta,
                &SliceSelector {
                    dimension: SliceDimension::X,
                    index,
                    time_point: 0,
                },
            );
            assert_eq!(x_cut, meta.vox_offset + 8 * plane);
        }
    }
}
