//! Acquisition lifecycle notifications.
//!
//! Three named events are emitted per acquisition, consumed by the host UI:
//! load-start, load-progress (loaded/total/percent) and load-end. The bus is
//! a tokio broadcast channel; dropped receivers and lagging subscribers never
//! block progress.

use serde::Serialize;
use tokio::sync::broadcast;

/// A lifecycle notification for one acquisition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LoaderEvent {
    LoadStart {
        image_id: String,
    },
    LoadProgress {
        image_id: String,
        loaded: u64,
        total: Option<u64>,
        percent: Option<u8>,
    },
    LoadEnd {
        image_id: String,
    },
}

/// Broadcast bus for loader events.
#[derive(Debug, Clone)]
pub struct LoaderEvents {
    tx: broadcast::Sender<LoaderEvent>,
}

impl LoaderEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.tx.subscribe()
    }

    pub fn load_start(&self, image_id: &str) {
        let _ = self.tx.send(LoaderEvent::LoadStart {
            image_id: image_id.to_string(),
        });
    }

    pub fn load_progress(&self, image_id: &str, loaded: u64, total: Option<u64>) {
        let percent = total
            .filter(|&t| t > 0)
            .map(|t| ((loaded as f64 / t as f64) * 100.0).round().min(100.0) as u8);
        let _ = self.tx.send(LoaderEvent::LoadProgress {
            image_id: image_id.to_string(),
            loaded,
            total,
            percent,
        });
    }

    pub fn load_end(&self, image_id: &str) {
        let _ = self.tx.send(LoaderEvent::LoadEnd {
            image_id: image_id.to_string(),
        });
    }
}

impl Default for LoaderEvents {
    fn default() -> Self {
        Self::new(256)
    }
}
