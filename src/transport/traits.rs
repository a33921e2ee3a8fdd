use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use reqwest::{Method, Url};

use crate::engine::configuration::{CachePolicy, Configuration};

/// Transfers are deduplicated by the URL they target.
pub type ResourceKey = Url;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Response body streamed into memory.
    Data,
    /// Response body staged in a file, read back once finished.
    Download,
    /// Request body sent from a buffer, response streamed into memory.
    Upload,
}

/// Opaque reference to one transfer issued to a transport.
///
/// Ids are unique per process, so events from a cancelled transfer can never
/// be mistaken for its replacement, even across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    id: u64,
    key: ResourceKey,
    kind: TransferKind,
}

impl TransferHandle {
    pub fn new(key: ResourceKey, kind: TransferKind) -> Self {
        Self {
            id: NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed),
            key,
            kind,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }
}

/// Everything a transport needs to issue one transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: Url,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub cache_policy: CachePolicy,
    pub timeout: Duration,
}

impl TransferRequest {
    /// A GET request carrying the configuration's cache policy and timeout.
    pub fn new(url: Url, configuration: &Configuration) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            cache_policy: configuration.cache_policy,
            timeout: configuration.timeout,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// The HTTP client the coalescing layer drives.
///
/// Transfers are created suspended and only hit the network after `resume`.
pub trait Transport: Send + Sync {
    fn create_data_transfer(&self, request: TransferRequest) -> TransferHandle;
    fn create_download_transfer(&self, request: TransferRequest) -> TransferHandle;
    fn create_upload_transfer(&self, request: TransferRequest, body: Bytes) -> TransferHandle;
    fn resume(&self, handle: &TransferHandle);
    /// No-op for handles this transport did not create or has already finished.
    fn cancel(&self, handle: &TransferHandle);
    fn set_priority(&self, handle: &TransferHandle, priority: f32);
    /// True while `handle` was created here and has not completed.
    fn owns(&self, handle: &TransferHandle) -> bool;
    /// Cancel everything outstanding and stop delivering events.
    fn invalidate_and_cancel(&self);
}

/// Receiver of transport events. Calls for one session arrive serially, in delivery order.
pub trait EventSink: Send + Sync {
    fn on_bytes_received(&self, handle: &TransferHandle, chunk: Bytes);
    fn on_completed(&self, handle: &TransferHandle, error: Option<anyhow::Error>);
    /// `location` is only valid for the duration of the call.
    fn on_download_finished(&self, handle: &TransferHandle, location: &Path);
    fn on_background_drained(&self);
}

/// Builds one transport per session, wired to the session's event sink.
pub trait TransportFactory: Send + Sync {
    fn connect(
        &self,
        configuration: &Configuration,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn Transport>>;
}
