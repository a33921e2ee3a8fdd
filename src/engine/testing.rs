// In-memory transport that records every call, for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;

use super::configuration::Configuration;
use crate::transport::traits::{
    EventSink, TransferHandle, TransferKind, TransferRequest, Transport, TransportFactory,
};

#[derive(Default)]
pub struct RecordingFactory {
    transports: Mutex<Vec<Arc<RecordingTransport>>>,
}

impl RecordingFactory {
    pub fn connected(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn transport(&self, index: usize) -> Arc<RecordingTransport> {
        self.transports.lock()[index].clone()
    }
}

impl TransportFactory for RecordingFactory {
    fn connect(
        &self,
        _configuration: &Configuration,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn Transport>> {
        let transport = Arc::new(RecordingTransport::new(sink));
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

pub struct RecordingTransport {
    sink: Arc<dyn EventSink>,
    created: Mutex<Vec<TransferHandle>>,
    resumed: Mutex<Vec<TransferHandle>>,
    cancelled: Mutex<Vec<TransferHandle>>,
    priorities: Mutex<Vec<(u64, f32)>>,
    uploads: Mutex<Vec<Bytes>>,
    outstanding: Mutex<HashSet<u64>>,
    invalidations: AtomicUsize,
}

impl RecordingTransport {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            created: Mutex::new(Vec::new()),
            resumed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            priorities: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            outstanding: Mutex::new(HashSet::new()),
            invalidations: AtomicUsize::new(0),
        }
    }

    fn create(&self, request: TransferRequest, kind: TransferKind) -> TransferHandle {
        let handle = TransferHandle::new(request.url, kind);
        self.outstanding.lock().insert(handle.id());
        self.created.lock().push(handle.clone());
        handle
    }

    /// Push a chunk through the sink as the transport would.
    pub fn deliver(&self, handle: &TransferHandle, chunk: &'static [u8]) {
        self.sink.on_bytes_received(handle, Bytes::from_static(chunk));
    }

    /// Finish `handle` through the sink as the transport would.
    pub fn finish(&self, handle: &TransferHandle, error: Option<anyhow::Error>) {
        self.outstanding.lock().remove(&handle.id());
        self.sink.on_completed(handle, error);
    }

    pub fn created(&self) -> Vec<TransferHandle> {
        self.created.lock().clone()
    }

    pub fn resumed(&self) -> Vec<TransferHandle> {
        self.resumed.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<TransferHandle> {
        self.cancelled.lock().clone()
    }

    pub fn priority_of(&self, handle: &TransferHandle) -> Option<f32> {
        self.priorities
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| *id == handle.id())
            .map(|(_, priority)| *priority)
    }

    pub fn uploads(&self) -> Vec<Bytes> {
        self.uploads.lock().clone()
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn create_data_transfer(&self, request: TransferRequest) -> TransferHandle {
        self.create(request, TransferKind::Data)
    }

    fn create_download_transfer(&self, request: TransferRequest) -> TransferHandle {
        self.create(request, TransferKind::Download)
    }

    fn create_upload_transfer(&self, request: TransferRequest, body: Bytes) -> TransferHandle {
        self.uploads.lock().push(body);
        self.create(request, TransferKind::Upload)
    }

    fn resume(&self, handle: &TransferHandle) {
        self.resumed.lock().push(handle.clone());
    }

    fn cancel(&self, handle: &TransferHandle) {
        if self.outstanding.lock().remove(&handle.id()) {
            self.cancelled.lock().push(handle.clone());
        }
    }

    fn set_priority(&self, handle: &TransferHandle, priority: f32) {
        self.priorities.lock().push((handle.id(), priority));
    }

    fn owns(&self, handle: &TransferHandle) -> bool {
        self.outstanding.lock().contains(&handle.id())
    }

    fn invalidate_and_cancel(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.outstanding.lock().clear();
    }
}
