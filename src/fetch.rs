//! Byte acquisition with request coalescing.
//!
//! [`ByteSource`] abstracts where bytes come from (local filesystem, HTTP
//! with the `http-client` feature). [`FileFetcher`] sits on top and memoizes
//! one shared future per `(key, shape)` pair, so any number of concurrent
//! callers asking for the same bytes drive exactly one underlying read, and
//! completed whole-file reads double as a byte cache for later callers.

use crate::error::{NiftiError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// A whole-resource or bounded-window read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestShape {
    Whole,
    Range { offset: u64, length: u64 },
}

/// Bytes returned by a source, with a flag telling whether the source
/// answered a range request with the entire resource instead (an HTTP server
/// without range support answers 200 with the full body).
#[derive(Debug, Clone)]
pub struct RangedBytes {
    pub data: Bytes,
    pub is_entire_resource: bool,
}

/// Where resource bytes come from.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Read the entire resource.
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Read `length` bytes starting at `offset`. Sources may answer with the
    /// entire resource instead; the flag on the result says which happened.
    async fn read_range(&self, key: &str, offset: u64, length: u64) -> Result<RangedBytes>;
}

/// Reads resources from files under a base directory; the resource key is
/// the relative path.
pub struct FileSystemByteSource {
    base_path: PathBuf,
}

impl FileSystemByteSource {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        FileSystemByteSource {
            base_path: base_path.into(),
        }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }
}

#[async_trait]
impl ByteSource for FileSystemByteSource {
    async fn read(&self, key: &str) -> Result<Bytes> {
        let bytes = tokio::fs::read(self.resolve(key))
            .await
            .map_err(|e| NiftiError::fetch(key, e.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    async fn read_range(&self, key: &str, offset: u64, length: u64) -> Result<RangedBytes> {
        let mut file = tokio::fs::File::open(self.resolve(key))
            .await
            .map_err(|e| NiftiError::fetch(key, e.to_string()))?;
        let file_len = file
            .metadata()
            .await
            .map_err(|e| NiftiError::fetch(key, e.to_string()))?
            .len();

        let start = offset.min(file_len);
        let end = offset.saturating_add(length).min(file_len);
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;

        Ok(RangedBytes {
            data: Bytes::from(buf),
            is_entire_resource: start == 0 && end >= file_len,
        })
    }
}

/// Reads resources over HTTP; the resource key is appended to the base URL.
#[cfg(feature = "http-client")]
pub struct HttpByteSource {
    client: reqwest::Client,
    base_url: String,
}

#[cfg(feature = "http-client")]
impl HttpByteSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpByteSource {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}{}", self.base_url, key)
    }
}

#[cfg(feature = "http-client")]
#[async_trait]
impl ByteSource for HttpByteSource {
    async fn read(&self, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(self.url(key))
            .send()
            .await
            .map_err(|e| NiftiError::fetch(key, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NiftiError::fetch_status(key, status.as_u16()));
        }
        response
            .bytes()
            .await
            .map_err(|e| NiftiError::fetch(key, e.to_string()))
    }

    async fn read_range(&self, key: &str, offset: u64, length: u64) -> Result<RangedBytes> {
        let end = offset + length - 1;
        let response = self
            .client
            .get(self.url(key))
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(|e| NiftiError::fetch(key, e.to_string()))?;
        let status = response.status().as_u16();
        let is_entire_resource = match status {
            206 => false,
            // server ignored the range header and sent everything
            200 => true,
            _ => return Err(NiftiError::fetch_status(key, status)),
        };
        let data = response
            .bytes()
            .await
            .map_err(|e| NiftiError::fetch(key, e.to_string()))?;
        Ok(RangedBytes {
            data,
            is_entire_resource,
        })
    }
}

type SharedRead = Shared<BoxFuture<'static, Result<RangedBytes>>>;

/// Coalescing fetcher over a [`ByteSource`].
///
/// Completed entries stay in the table, so a repeat request for the same
/// bytes resolves from memory. [`purge`](FileFetcher::purge) drops them.
pub struct FileFetcher {
    source: Arc<dyn ByteSource>,
    in_flight: Mutex<HashMap<(String, RequestShape), SharedRead>>,
}

impl FileFetcher {
    pub fn new(source: Arc<dyn ByteSource>) -> Self {
        FileFetcher {
            source,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the entire resource.
    pub async fn fetch(&self, key: &str) -> Result<Bytes> {
        let shared = self.entry_for(key, RequestShape::Whole);
        Ok(shared.await?.data)
    }

    /// Fetch a byte window. When the source answers with the entire resource,
    /// the result is reclassified so later whole-file requests are served
    /// without touching the source, and the caller still receives only the
    /// requested window.
    pub async fn fetch_range(&self, key: &str, offset: u64, length: u64) -> Result<Bytes> {
        // a completed whole-file read already covers any window
        let whole = self
            .in_flight
            .lock()
            .get(&(key.to_string(), RequestShape::Whole))
            .cloned();
        if let Some(shared) = whole {
            let result = shared.await?;
            return Ok(window(&result.data, offset, length));
        }

        let shared = self.entry_for(key, RequestShape::Range { offset, length });
        let result = shared.await?;

        if result.is_entire_resource {
            debug!(key, "range request answered with entire resource");
            let mut in_flight = self.in_flight.lock();
            if let Entry::Vacant(vacant) =
                in_flight.entry((key.to_string(), RequestShape::Whole))
            {
                let ready: SharedRead =
                    futures::future::ready(Ok(result.clone())).boxed().shared();
                vacant.insert(ready);
            }
            return Ok(window(&result.data, offset, length));
        }

        Ok(result.data)
    }

    /// Drop all memoized results and in-flight entries.
    pub fn purge(&self) {
        self.in_flight.lock().clear();
    }

    // Check-then-insert under the lock so concurrent callers for the same
    // (key, shape) share one read.
    fn entry_for(&self, key: &str, shape: RequestShape) -> SharedRead {
        let mut in_flight = self.in_flight.lock();
        match in_flight.entry((key.to_string(), shape.clone())) {
            Entry::Occupied(entry) => {
                debug!(key, ?shape, "coalescing into in-flight request");
                entry.get().clone()
            }
            Entry::Vacant(vacant) => {
                let source = Arc::clone(&self.source);
                let key = key.to_string();
                let future: SharedRead = async move {
                    match shape {
                        RequestShape::Whole => {
                            let data = source.read(&key).await?;
                            Ok(RangedBytes {
                                data,
                                is_entire_resource: true,
                            })
                        }
                        RequestShape::Range { offset, length } => {
                            source.read_range(&key, offset, length).await
                        }
                    }
                }
                .boxed()
                .shared();
                vacant.insert(future.clone());
                future
            }
        }
    }
}

fn window(data: &Bytes, offset: u64, length: u64) -> Bytes {
    let start = (offset as usize).min(data.len());
    let end = (offset as usize).saturating_add(length as usize).min(data.len());
    data.slice(start..end)
}
