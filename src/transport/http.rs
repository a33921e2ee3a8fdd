// reqwest transport: suspended transfers, priority permits, and one serial event dispatcher per session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::CACHE_CONTROL;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::{
    EventSink, TransferHandle, TransferKind, TransferRequest, Transport, TransportFactory,
};
use crate::config::{clamp_priority, EngineConfig, DEFAULT_PRIORITY, URGENT_PRIORITY_THRESHOLD};
use crate::engine::configuration::Configuration;

const CANCELLED: &str = "transfer cancelled";

enum TransportEvent {
    BytesReceived(TransferHandle, Bytes),
    DownloadFinished(TransferHandle, PathBuf),
    Completed(TransferHandle, Option<anyhow::Error>),
}

struct TransferSlot {
    request: TransferRequest,
    upload_body: Option<Bytes>,
    priority: f32,
    token: CancellationToken,
    started: bool,
}

struct TransferJob {
    handle: TransferHandle,
    request: TransferRequest,
    upload_body: Option<Bytes>,
    token: CancellationToken,
    urgent: bool,
}

/// Builds an [`HttpTransport`] per session on the runtime it was created in.
pub struct HttpTransportFactory {
    engine: EngineConfig,
    runtime: Handle,
}

impl HttpTransportFactory {
    /// Must be called from within a tokio runtime.
    pub fn new(engine: EngineConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| anyhow!("http transport requires a tokio runtime: {}", e))?;
        Ok(Self::with_runtime(engine, runtime))
    }

    pub fn with_runtime(engine: EngineConfig, runtime: Handle) -> Self {
        Self { engine, runtime }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn connect(
        &self,
        configuration: &Configuration,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn Transport>> {
        let transport = HttpTransport::new(configuration, &self.engine, sink, self.runtime.clone())?;
        Ok(Arc::new(transport))
    }
}

pub struct HttpTransport {
    label: String,
    client: Client,
    runtime: Handle,
    transfers: Arc<Mutex<HashMap<u64, TransferSlot>>>,
    urgent_semaphore: Arc<Semaphore>,
    background_semaphore: Arc<Semaphore>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown_token: CancellationToken,
    download_dir: PathBuf,
}

impl HttpTransport {
    pub fn new(
        configuration: &Configuration,
        engine: &EngineConfig,
        sink: Arc<dyn EventSink>,
        runtime: Handle,
    ) -> Result<Self> {
        let client = Client::builder().timeout(configuration.timeout).build()?;

        let download_dir = if engine.download_dir.is_empty() {
            std::env::temp_dir().join("transfer_dock")
        } else {
            PathBuf::from(&engine.download_dir)
        };
        std::fs::create_dir_all(&download_dir)?;

        let (events, rx) = mpsc::unbounded_channel();
        let transfers = Arc::new(Mutex::new(HashMap::new()));
        let shutdown_token = CancellationToken::new();

        runtime.spawn(dispatch_events(
            rx,
            sink,
            Arc::clone(&transfers),
            shutdown_token.clone(),
            configuration.is_background,
            configuration.id.clone(),
        ));

        info!(
            "http transport for {} ready: urgent_permits={} background_permits={} download_dir={}",
            configuration.id,
            engine.urgent_permits(),
            engine.background_permits(),
            download_dir.display()
        );

        Ok(Self {
            label: configuration.id.clone(),
            client,
            runtime,
            transfers,
            urgent_semaphore: Arc::new(Semaphore::new(engine.urgent_permits())),
            background_semaphore: Arc::new(Semaphore::new(engine.background_permits())),
            events,
            shutdown_token,
            download_dir,
        })
    }

    fn create(
        &self,
        request: TransferRequest,
        kind: TransferKind,
        upload_body: Option<Bytes>,
    ) -> TransferHandle {
        let handle = TransferHandle::new(request.url.clone(), kind);
        self.transfers.lock().insert(
            handle.id(),
            TransferSlot {
                request,
                upload_body,
                priority: DEFAULT_PRIORITY,
                token: self.shutdown_token.child_token(),
                started: false,
            },
        );
        handle
    }

    /// Number of transfers created and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.transfers.lock().len()
    }
}

impl Transport for HttpTransport {
    fn create_data_transfer(&self, request: TransferRequest) -> TransferHandle {
        self.create(request, TransferKind::Data, None)
    }

    fn create_download_transfer(&self, request: TransferRequest) -> TransferHandle {
        self.create(request, TransferKind::Download, None)
    }

    fn create_upload_transfer(&self, request: TransferRequest, body: Bytes) -> TransferHandle {
        self.create(request, TransferKind::Upload, Some(body))
    }

    fn resume(&self, handle: &TransferHandle) {
        if self.shutdown_token.is_cancelled() {
            return;
        }

        let job = {
            let mut transfers = self.transfers.lock();
            let Some(slot) = transfers.get_mut(&handle.id()) else {
                return;
            };
            if slot.started {
                return;
            }
            slot.started = true;
            TransferJob {
                handle: handle.clone(),
                request: slot.request.clone(),
                upload_body: slot.upload_body.clone(),
                token: slot.token.clone(),
                urgent: slot.priority >= URGENT_PRIORITY_THRESHOLD,
            }
        };

        let semaphore = if job.urgent {
            Arc::clone(&self.urgent_semaphore)
        } else {
            Arc::clone(&self.background_semaphore)
        };
        self.runtime.spawn(run_transfer(
            job,
            self.client.clone(),
            semaphore,
            self.events.clone(),
            self.download_dir.clone(),
        ));
    }

    fn cancel(&self, handle: &TransferHandle) {
        let mut transfers = self.transfers.lock();
        let Some(slot) = transfers.get(&handle.id()) else {
            return;
        };
        slot.token.cancel();
        // A running transfer reports its own cancellation; a suspended one never will.
        if !slot.started {
            transfers.remove(&handle.id());
            drop(transfers);
            let _ = self.events.send(TransportEvent::Completed(
                handle.clone(),
                Some(anyhow!(CANCELLED)),
            ));
        }
        debug!("transfer {} on {} cancelled", handle.id(), self.label);
    }

    fn set_priority(&self, handle: &TransferHandle, priority: f32) {
        if let Some(slot) = self.transfers.lock().get_mut(&handle.id()) {
            slot.priority = clamp_priority(priority);
        }
    }

    fn owns(&self, handle: &TransferHandle) -> bool {
        self.transfers.lock().contains_key(&handle.id())
    }

    fn invalidate_and_cancel(&self) {
        self.shutdown_token.cancel();
        let abandoned = {
            let mut transfers = self.transfers.lock();
            let count = transfers.len();
            transfers.clear();
            count
        };
        info!(
            "http transport for {} invalidated, {} transfers abandoned",
            self.label, abandoned
        );
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        debug!("HttpTransport {} dropped, cancelling transfers", self.label);
        self.shutdown_token.cancel();
    }
}

/// The serial event context: one event at a time, in the order transfers produced them.
async fn dispatch_events(
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    sink: Arc<dyn EventSink>,
    transfers: Arc<Mutex<HashMap<u64, TransferSlot>>>,
    shutdown_token: CancellationToken,
    background: bool,
    label: String,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            TransportEvent::BytesReceived(handle, chunk) => {
                sink.on_bytes_received(&handle, chunk);
            }
            TransportEvent::DownloadFinished(handle, path) => {
                // The sink reads the whole file. Awaiting it keeps events serial.
                let sink = Arc::clone(&sink);
                let handoff = tokio::task::spawn_blocking(move || {
                    sink.on_download_finished(&handle, &path);
                    remove_staged(&path);
                });
                if let Err(e) = handoff.await {
                    warn!("download handoff on {} did not finish: {}", label, e);
                }
            }
            TransportEvent::Completed(handle, error) => {
                sink.on_completed(&handle, error);
                let drained = {
                    let mut transfers = transfers.lock();
                    transfers.remove(&handle.id());
                    transfers.is_empty()
                };
                if background && drained && !shutdown_token.is_cancelled() {
                    sink.on_background_drained();
                }
            }
        }
    }

    // Staged downloads nobody will read.
    while let Ok(event) = rx.try_recv() {
        if let TransportEvent::DownloadFinished(_, path) = event {
            remove_staged(&path);
        }
    }
    debug!("event dispatcher for {} stopped", label);
}

fn remove_staged(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!("could not remove staged download {}: {}", path.display(), e);
    }
}

async fn run_transfer(
    job: TransferJob,
    client: Client,
    semaphore: Arc<Semaphore>,
    events: mpsc::UnboundedSender<TransportEvent>,
    download_dir: PathBuf,
) {
    let TransferJob {
        handle,
        request,
        upload_body,
        token,
        urgent,
    } = job;
    let priority_label = if urgent { "urgent" } else { "background" };

    // Bail if cancelled while waiting for a permit.
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(e) => {
                let _ = events.send(TransportEvent::Completed(handle, Some(anyhow!("{}", e))));
                return;
            }
        },
        _ = token.cancelled() => {
            debug!("transfer {} cancelled while waiting for {} permit", handle.id(), priority_label);
            let _ = events.send(TransportEvent::Completed(handle, Some(anyhow!(CANCELLED))));
            return;
        }
    };
    debug!(
        "transfer {} for {} acquired {} permit",
        handle.id(),
        handle.key(),
        priority_label
    );

    let staging = download_dir.join(format!("{}.download", handle.id()));
    let outcome = tokio::select! {
        result = perform(&client, &handle, request, upload_body, &events, &staging) => result,
        _ = token.cancelled() => Err(anyhow!(CANCELLED)),
    };

    match outcome {
        Ok(()) => {
            if handle.kind() == TransferKind::Download {
                let _ = events.send(TransportEvent::DownloadFinished(handle.clone(), staging));
            }
            let _ = events.send(TransportEvent::Completed(handle, None));
        }
        Err(e) => {
            if handle.kind() == TransferKind::Download {
                let _ = tokio::fs::remove_file(&staging).await;
            }
            if token.is_cancelled() {
                debug!("transfer {} for {} cancelled", handle.id(), handle.key());
            } else {
                warn!("transfer {} for {} failed: {}", handle.id(), handle.key(), e);
            }
            let _ = events.send(TransportEvent::Completed(handle, Some(e)));
        }
    }
}

async fn perform(
    client: &Client,
    handle: &TransferHandle,
    request: TransferRequest,
    upload_body: Option<Bytes>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    staging: &Path,
) -> Result<()> {
    let mut builder = client
        .request(request.method, request.url)
        .timeout(request.timeout);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(value) = request.cache_policy.cache_control() {
        builder = builder.header(CACHE_CONTROL, value);
    }
    if let Some(body) = upload_body.or(request.body) {
        builder = builder.body(body);
    }

    let mut resp = builder.send().await?;
    let status = resp.status();
    debug!("transfer {} status={}", handle.id(), status.as_u16());
    if !status.is_success() {
        return Err(anyhow!("HTTP {}", status.as_u16()));
    }

    match handle.kind() {
        TransferKind::Download => {
            let mut file = tokio::fs::File::create(staging).await?;
            let mut written = 0u64;
            while let Some(chunk) = resp.chunk().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            debug!(
                "download {} staged {} bytes at {}",
                handle.id(),
                written,
                staging.display()
            );
        }
        TransferKind::Data | TransferKind::Upload => {
            while let Some(chunk) = resp.chunk().await? {
                if events
                    .send(TransportEvent::BytesReceived(handle.clone(), chunk))
                    .is_err()
                {
                    return Err(anyhow!("event dispatcher closed"));
                }
            }
        }
    }
    Ok(())
}
