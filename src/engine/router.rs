// Event router: turns transport events into task registry operations.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::registry::{DrainHandler, TaskRegistry};
use super::stats::{StatsSnapshot, TransferStats};
use crate::error::TransferError;
use crate::transport::traits::{EventSink, TransferHandle, TransferKind};

/// Owns a task registry and receives every event of the sessions wired to it.
///
/// Several docks may share one router, in which case requests made through
/// any of them are coalesced together.
pub struct EventRouter {
    registry: Arc<TaskRegistry>,
    stats: Arc<TransferStats>,
}

impl EventRouter {
    pub fn new() -> Self {
        let stats = Arc::new(TransferStats::new());
        Self {
            registry: Arc::new(TaskRegistry::new(stats.clone())),
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn add_drain_handler(&self, handler: DrainHandler) {
        self.registry.add_drain_handler(handler);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventRouter {
    fn on_bytes_received(&self, handle: &TransferHandle, chunk: Bytes) {
        self.registry.append_bytes(handle, &chunk);
    }

    fn on_completed(&self, handle: &TransferHandle, error: Option<anyhow::Error>) {
        match error {
            Some(e) => {
                self.registry
                    .complete_transfer(handle, Err(TransferError::failed(e)));
            }
            // Downloads deliver their payload through `on_download_finished`.
            None if handle.kind() == TransferKind::Download => {
                if self.registry.tracked_handle(handle.key()).as_ref() == Some(handle) {
                    warn!(
                        "download {} for {} completed without a file",
                        handle.id(),
                        handle.key()
                    );
                    self.registry.complete_transfer(
                        handle,
                        Err(TransferError::failed(anyhow::anyhow!(
                            "download finished without a file"
                        ))),
                    );
                }
            }
            None => {
                self.registry.complete_with_buffer(handle);
            }
        }
    }

    fn on_download_finished(&self, handle: &TransferHandle, location: &Path) {
        let result = match fs::read(location) {
            Ok(data) => {
                debug!(
                    "download {} read {} bytes from {}",
                    handle.id(),
                    data.len(),
                    location.display()
                );
                Ok(Bytes::from(data))
            }
            Err(e) => {
                warn!(
                    "download {} could not be read from {}: {}",
                    handle.id(),
                    location.display(),
                    e
                );
                Err(TransferError::failed(e))
            }
        };
        self.registry.complete_transfer(handle, result);
    }

    fn on_background_drained(&self) {
        debug!("transport reported background work drained");
        self.registry.fire_drain_handlers();
    }
}
