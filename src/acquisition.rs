//! Acquisition orchestration.
//!
//! [`VolumeAcquisition`] is an explicit context object owning its fetcher,
//! streamer, cache and in-flight tables; independent instances share nothing.
//! Each resource key moves through a small state machine
//! (`NotRequested -> Fetching -> Parsing -> Normalizing -> Cached`, with
//! `Failed` absorbing any stage error) and concurrent callers for the same
//! key and mode attach to one shared pipeline execution. A started pipeline
//! always runs to completion; there is no caller-triggered cancellation.

use crate::cache::VolumeCache;
use crate::decode;
use crate::error::{NiftiError, Result};
use crate::events::LoaderEvents;
use crate::fetch::{ByteSource, FileFetcher, FileSystemByteSource};
use crate::header::{parse_header, NIFTI2_MAGIC_COOKIE};
use crate::selector::ImageId;
use crate::slice::{extract_slice, RenderableImage};
use crate::stream::{ChunkSource, FileStreamer, FileSystemChunkSource};
use crate::volume::Volume;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Where a resource key currently stands in the acquisition pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    NotRequested,
    Fetching,
    Parsing,
    Normalizing,
    Cached,
    Failed,
}

type VolumeFuture = Shared<BoxFuture<'static, Result<Arc<Volume>>>>;
type InFlight<K> = Arc<Mutex<HashMap<K, VolumeFuture>>>;

/// Orchestrates fetch, parse, normalize and cache for volume resources.
pub struct VolumeAcquisition {
    fetcher: Arc<FileFetcher>,
    streamer: Arc<FileStreamer>,
    cache: Arc<VolumeCache>,
    events: LoaderEvents,
    full_in_flight: InFlight<String>,
    header_in_flight: InFlight<String>,
    timepoint_in_flight: InFlight<(String, usize)>,
    states: Arc<Mutex<HashMap<String, AcquisitionState>>>,
}

impl VolumeAcquisition {
    pub fn new(byte_source: Arc<dyn ByteSource>, chunk_source: Arc<dyn ChunkSource>) -> Self {
        Self::with_cache(byte_source, chunk_source, Arc::new(VolumeCache::default()))
    }

    pub fn with_cache(
        byte_source: Arc<dyn ByteSource>,
        chunk_source: Arc<dyn ChunkSource>,
        cache: Arc<VolumeCache>,
    ) -> Self {
        let events = LoaderEvents::default();
        VolumeAcquisition {
            fetcher: Arc::new(FileFetcher::new(byte_source)),
            streamer: Arc::new(FileStreamer::new(chunk_source, events.clone())),
            cache,
            events,
            full_in_flight: Arc::new(Mutex::new(HashMap::new())),
            header_in_flight: Arc::new(Mutex::new(HashMap::new())),
            timepoint_in_flight: Arc::new(Mutex::new(HashMap::new())),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Convenience constructor for volumes under a local directory.
    pub fn open_local(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self::new(
            Arc::new(FileSystemByteSource::new(base_path.clone())),
            Arc::new(FileSystemChunkSource::new(base_path)),
        )
    }

    /// Lifecycle event bus shared by every pipeline of this context.
    pub fn events(&self) -> &LoaderEvents {
        &self.events
    }

    pub fn cache(&self) -> &Arc<VolumeCache> {
        &self.cache
    }

    /// Current pipeline state for a resource key.
    pub fn state_of(&self, key: &str) -> AcquisitionState {
        self.states
            .lock()
            .get(key)
            .copied()
            .unwrap_or(AcquisitionState::NotRequested)
    }

    /// Resolve an image id all the way to a renderable slice.
    pub async fn acquire(&self, image_id: &ImageId) -> Result<RenderableImage> {
        let volume = self.acquire_full(image_id.resource_key()).await?;
        let slice = extract_slice(&volume, &image_id.slice)?;
        Ok(slice.into_renderable(image_id, &volume.meta))
    }

    /// Acquire the complete normalized volume for a resource key.
    pub async fn acquire_full(&self, key: &str) -> Result<Arc<Volume>> {
        if let Some(volume) = self.cache.get(key) {
            if volume.has_image_data() {
                return Ok(volume);
            }
        }

        let shared = attach_or_spawn(&self.full_in_flight, key.to_string(), || {
            self.spawn_full_pipeline(key)
        });
        shared.await
    }

    /// Acquire metadata only, without downloading or decoding voxels.
    ///
    /// A cached volume for the key (full or header-only) satisfies this
    /// immediately; otherwise only the header span is fetched.
    pub async fn acquire_header_only(&self, key: &str) -> Result<Arc<Volume>> {
        if let Some(volume) = self.cache.get(key) {
            return Ok(volume);
        }

        let shared = attach_or_spawn(&self.header_in_flight, key.to_string(), || {
            self.spawn_header_pipeline(key)
        });
        shared.await
    }

    /// Acquire a single timepoint of a time series through the streaming
    /// path, without waiting for the rest of the file.
    pub async fn acquire_timepoint(&self, key: &str, time_point: usize) -> Result<Arc<Volume>> {
        if let Some(volume) = self.cache.get_timepoint(key, time_point) {
            if volume.has_image_data() {
                return Ok(volume);
            }
        }

        let shared = attach_or_spawn(
            &self.timepoint_in_flight,
            (key.to_string(), time_point),
            || self.spawn_timepoint_pipeline(key, time_point),
        );
        shared.await
    }

    fn spawn_full_pipeline(&self, key: &str) -> VolumeFuture {
        let fetcher = Arc::clone(&self.fetcher);
        let cache = Arc::clone(&self.cache);
        let events = self.events.clone();
        let states = Arc::clone(&self.states);
        let in_flight = Arc::clone(&self.full_in_flight);
        let key = key.to_string();

        spawn_pipeline(move |tx| async move {
            let set_state = |state| {
                states.lock().insert(key.clone(), state);
            };

            set_state(AcquisitionState::Fetching);
            events.load_start(&key);

            let result: Result<Arc<Volume>> = async {
                let bytes = fetcher.fetch(&key).await?;
                let total = bytes.len() as u64;
                events.load_progress(&key, total, Some(total));

                set_state(AcquisitionState::Parsing);
                let file_bytes = decode::decompress_if_needed(bytes.to_vec())?;
                let meta = parse_header(&file_bytes)?;
                let pixels = decode::decode_voxels(&file_bytes, &meta)?;

                set_state(AcquisitionState::Normalizing);
                Ok(Arc::new(Volume::build(meta, pixels)?))
            }
            .await;

            match &result {
                Ok(volume) => {
                    cache.put(&key, Arc::clone(volume));
                    set_state(AcquisitionState::Cached);
                    info!(key, bytes = volume.size_in_bytes(), "volume acquired");
                }
                Err(error) => {
                    set_state(AcquisitionState::Failed);
                    warn!(key, %error, "volume acquisition failed");
                }
            }
            events.load_end(&key);

            in_flight.lock().remove(&key);
            let _ = tx.send(result);
        })
    }

    fn spawn_header_pipeline(&self, key: &str) -> VolumeFuture {
        let fetcher = Arc::clone(&self.fetcher);
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.header_in_flight);
        let key = key.to_string();

        spawn_pipeline(move |tx| async move {
            let result: Result<Arc<Volume>> = async {
                // the NIFTI-2 span covers both layouts
                let head = fetcher
                    .fetch_range(&key, 0, NIFTI2_MAGIC_COOKIE as u64)
                    .await?;
                let meta = if decode::is_compressed(&head) {
                    // cannot range into a gzip stream, take the whole file
                    let bytes = fetcher.fetch(&key).await?;
                    let file_bytes = decode::decompress(&bytes)?;
                    parse_header(&file_bytes)?
                } else {
                    parse_header(&head)?
                };
                Ok(Arc::new(Volume::header_only(meta)))
            }
            .await;

            if let Ok(volume) = &result {
                // never shadow a cached full volume with a header-only one
                let already_full = cache.get(&key).is_some_and(|v| v.has_image_data());
                if !already_full {
                    cache.put(&key, Arc::clone(volume));
                }
            }

            in_flight.lock().remove(&key);
            let _ = tx.send(result);
        })
    }

    fn spawn_timepoint_pipeline(&self, key: &str, time_point: usize) -> VolumeFuture {
        let streamer = Arc::clone(&self.streamer);
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.timepoint_in_flight);
        let key = key.to_string();

        spawn_pipeline(move |tx| async move {
            let result: Result<Arc<Volume>> = async {
                let head = streamer.read_header(&key).await?;
                if decode::is_compressed(&head) {
                    return Err(NiftiError::Metadata(format!(
                        "'{}' is compressed and cannot be streamed per timepoint",
                        key
                    )));
                }
                let mut meta = parse_header(&head)?;
                if time_point >= meta.time_slices {
                    return Err(NiftiError::Range(format!(
                        "timepoint {} out of bounds for volume with {} timepoints",
                        time_point, meta.time_slices
                    )));
                }

                let length = meta.timepoint_byte_length();
                let offset = meta.vox_offset + time_point * length;
                let window = streamer.read_window(&key, offset, length).await?;

                meta.time_slices = 1;
                let pixels =
                    decode::decode_payload(&window, &meta, meta.timepoint_element_count())?;
                Ok(Arc::new(Volume::build_timepoint(meta, pixels)?))
            }
            .await;

            if let Ok(volume) = &result {
                cache.put_timepoint(&key, time_point, Arc::clone(volume));
            }

            in_flight.lock().remove(&(key, time_point));
            let _ = tx.send(result);
        })
    }
}

// Check-then-insert under the lock so concurrent callers for the same key
// and mode share one pipeline.
fn attach_or_spawn<K>(
    in_flight: &InFlight<K>,
    key: K,
    spawn: impl FnOnce() -> VolumeFuture,
) -> VolumeFuture
where
    K: Eq + Hash,
{
    let mut table = in_flight.lock();
    match table.entry(key) {
        Entry::Occupied(entry) => entry.get().clone(),
        Entry::Vacant(vacant) => {
            let future = spawn();
            vacant.insert(future.clone());
            future
        }
    }
}

// Run a pipeline on its own task so it finishes even when every caller goes
// away, relaying the outcome through a shared oneshot-backed future.
fn spawn_pipeline<F, Fut>(body: F) -> VolumeFuture
where
    F: FnOnce(oneshot::Sender<Result<Arc<Volume>>>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(body(tx));
    rx.map(|received| match received {
        Ok(result) => result,
        Err(_) => Err(NiftiError::Format(
            "acquisition pipeline task dropped before completing".to_string(),
        )),
    })
    .boxed()
    .shared()
}
