// Transfer orchestrator: decides per request whether to start a transfer or join one in flight.

use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use reqwest::{Method, Url};
use tokio::sync::oneshot;
use tracing::debug;

use super::configuration::Configuration;
use super::registry::Admission;
use super::router::EventRouter;
use super::session::{Session, SessionFactory};
use super::stats::StatsSnapshot;
use crate::config::clamp_priority;
use crate::error::{TransferCallback, TransferError, TransferResult};
use crate::transport::traits::{TransferHandle, TransferKind, TransferRequest};

/// Entry point for callers: fetch, download and upload through one configuration.
///
/// Every method returns `Ok(Some(handle))` when it started a new transfer and
/// `Ok(None)` when the request joined one already in flight. `callback`, if
/// given, receives the transfer's result exactly once.
#[derive(Clone)]
pub struct Dock {
    configuration: Arc<Configuration>,
    router: Arc<EventRouter>,
    sessions: Arc<SessionFactory>,
}

impl Dock {
    pub fn new(
        configuration: Arc<Configuration>,
        router: Arc<EventRouter>,
        sessions: Arc<SessionFactory>,
    ) -> Self {
        Self {
            configuration,
            router,
            sessions,
        }
    }

    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    /// The router tracking this dock's transfers.
    ///
    /// Once a session exists for the configuration, that is the router it was
    /// built with, which may belong to another dock.
    pub fn router(&self) -> Arc<EventRouter> {
        self.sessions
            .session(&self.configuration)
            .map(|session| session.router().clone())
            .unwrap_or_else(|| self.router.clone())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.router().snapshot()
    }

    /// A GET request for `url` carrying this dock's cache policy and timeout.
    pub fn request(&self, url: &str) -> Result<TransferRequest, TransferError> {
        let url = Url::parse(url).map_err(|_| TransferError::NoHandle(url.to_string()))?;
        Ok(TransferRequest::new(url, &self.configuration))
    }

    pub fn fetch(
        &self,
        url: &str,
        priority: Option<f32>,
        callback: Option<TransferCallback>,
    ) -> Result<Option<TransferHandle>, TransferError> {
        let request = self.request(url)?;
        self.fetch_request(request, priority, callback)
    }

    pub fn fetch_request(
        &self,
        request: TransferRequest,
        priority: Option<f32>,
        callback: Option<TransferCallback>,
    ) -> Result<Option<TransferHandle>, TransferError> {
        self.request_transfer(request, TransferKind::Data, priority, callback)
    }

    pub fn download(
        &self,
        url: &str,
        priority: Option<f32>,
        callback: Option<TransferCallback>,
    ) -> Result<Option<TransferHandle>, TransferError> {
        let request = self.request(url)?;
        self.download_request(request, priority, callback)
    }

    pub fn download_request(
        &self,
        request: TransferRequest,
        priority: Option<f32>,
        callback: Option<TransferCallback>,
    ) -> Result<Option<TransferHandle>, TransferError> {
        self.request_transfer(request, TransferKind::Download, priority, callback)
    }

    /// POST `body` to `url`.
    pub fn upload(
        &self,
        url: &str,
        body: Bytes,
        priority: Option<f32>,
        callback: Option<TransferCallback>,
    ) -> Result<Option<TransferHandle>, TransferError> {
        let request = self.request(url)?.with_method(Method::POST).with_body(body);
        self.upload_request(request, priority, callback)
    }

    /// Send `request` with its own body (empty if it has none).
    pub fn upload_request(
        &self,
        request: TransferRequest,
        priority: Option<f32>,
        callback: Option<TransferCallback>,
    ) -> Result<Option<TransferHandle>, TransferError> {
        self.request_transfer(request, TransferKind::Upload, priority, callback)
    }

    /// Fetch `url` and wait for the shared result.
    ///
    /// If the session is terminated before the transfer completes, this
    /// returns `TransferFailed` instead of waiting forever. A plain callback
    /// passed to [`Dock::fetch`] is dropped without being called in that case.
    pub async fn fetch_bytes(&self, url: &str, priority: Option<f32>) -> TransferResult {
        let request = self.request(url)?;
        self.wait_for(|callback| self.fetch_request(request, priority, Some(callback)))
            .await
    }

    /// Download `url` and wait for the shared result. Termination is handled
    /// as in [`Dock::fetch_bytes`].
    pub async fn download_bytes(&self, url: &str, priority: Option<f32>) -> TransferResult {
        let request = self.request(url)?;
        self.wait_for(|callback| self.download_request(request, priority, Some(callback)))
            .await
    }

    async fn wait_for<F>(&self, start: F) -> TransferResult
    where
        F: FnOnce(TransferCallback) -> Result<Option<TransferHandle>, TransferError>,
    {
        let (tx, rx) = oneshot::channel();
        start(Box::new(move |result| {
            let _ = tx.send(result);
        }))?;
        // The callback, and the sender with it, is dropped unanswered when the
        // session is terminated and the transfer abandoned.
        rx.await
            .map_err(|_| TransferError::failed(anyhow!("transfer abandoned before completion")))?
    }

    fn session(&self) -> Result<Arc<Session>, TransferError> {
        self.sessions
            .session_for(&self.configuration, &self.router)
            .map_err(TransferError::session_unavailable)
    }

    fn request_transfer(
        &self,
        request: TransferRequest,
        kind: TransferKind,
        priority: Option<f32>,
        callback: Option<TransferCallback>,
    ) -> Result<Option<TransferHandle>, TransferError> {
        let priority = clamp_priority(priority.unwrap_or(self.configuration.priority));
        let key = request.url.clone();
        let mut callback = callback;

        loop {
            let session = self.session()?;
            let transport = session.transport();

            // Events are routed to the session's router, so that is where the transfer is tracked.
            let admission = session
                .router()
                .registry()
                .admit(&key, priority, callback, || {
                    if session.is_retired() {
                        return None;
                    }
                    let request = request.clone();
                    Some(match kind {
                        TransferKind::Data => transport.create_data_transfer(request),
                        TransferKind::Download => transport.create_download_transfer(request),
                        TransferKind::Upload => {
                            let body = request.body.clone().unwrap_or_default();
                            transport.create_upload_transfer(request, body)
                        }
                    })
                });

            match admission {
                Admission::Attached => return Ok(None),
                Admission::Refused(returned) => {
                    debug!(
                        "session for {} retired during admission, retrying",
                        self.configuration.id
                    );
                    callback = returned;
                }
                Admission::Started { handle, superseded } => {
                    if let Some(previous) = superseded {
                        self.sessions.cancel(&previous);
                    }
                    transport.set_priority(&handle, priority);
                    transport.resume(&handle);
                    debug!(
                        "{:?} transfer {} started for {} at priority {}",
                        kind,
                        handle.id(),
                        key,
                        priority
                    );
                    return Ok(Some(handle));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::engine::testing::{RecordingFactory, RecordingTransport};

    const IMG: &str = "https://x/img.png";

    fn dock() -> (Dock, Arc<RecordingFactory>) {
        let transports = Arc::new(RecordingFactory::default());
        let sessions = SessionFactory::new(transports.clone());
        let dock = Dock::new(
            Arc::new(Configuration::default_preset()),
            Arc::new(EventRouter::new()),
            sessions,
        );
        (dock, transports)
    }

    fn collect(results: &Arc<Mutex<Vec<(&'static str, TransferResult)>>>, name: &'static str) -> TransferCallback {
        let results = Arc::clone(results);
        Box::new(move |result| results.lock().push((name, result)))
    }

    fn transport(transports: &RecordingFactory) -> Arc<RecordingTransport> {
        transports.transport(0)
    }

    #[test]
    fn test_second_fetch_joins_first() {
        let (dock, transports) = dock();
        let results = Arc::new(Mutex::new(Vec::new()));

        let first = dock.fetch(IMG, Some(0.5), Some(collect(&results, "cb1"))).unwrap();
        let second = dock.fetch(IMG, Some(0.5), Some(collect(&results, "cb2"))).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        let t = transport(&transports);
        let handle = first.unwrap();
        assert_eq!(t.created().len(), 1);
        assert_eq!(t.resumed(), vec![handle.clone()]);
        assert_eq!(t.priority_of(&handle), Some(0.5));

        t.deliver(&handle, b"chunk-1;");
        t.deliver(&handle, b"chunk-2;");
        t.deliver(&handle, b"chunk-3");
        t.finish(&handle, None);

        let results = results.lock();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "cb1");
        assert_eq!(results[1].0, "cb2");
        for (_, result) in results.iter() {
            assert_eq!(&result.as_ref().unwrap()[..], b"chunk-1;chunk-2;chunk-3");
        }
        assert_eq!(dock.snapshot().coalesced, 1);
    }

    #[test]
    fn test_priority_upgrade_restarts_transfer() {
        let (dock, transports) = dock();
        let results = Arc::new(Mutex::new(Vec::new()));

        let low = dock
            .fetch(IMG, Some(0.3), Some(collect(&results, "low")))
            .unwrap()
            .unwrap();
        let high = dock
            .fetch(IMG, Some(0.8), Some(collect(&results, "high")))
            .unwrap()
            .unwrap();
        assert_ne!(low.id(), high.id());

        let t = transport(&transports);
        assert_eq!(t.cancelled(), vec![low.clone()]);
        assert_eq!(t.priority_of(&high), Some(0.8));

        let lower = dock.fetch(IMG, Some(0.1), Some(collect(&results, "later"))).unwrap();
        assert!(lower.is_none());
        assert_eq!(t.created().len(), 2);

        // The cancelled transfer's late completion must not settle the replacement.
        t.finish(&low, Some(anyhow!("cancelled")));
        assert!(results.lock().is_empty());

        t.deliver(&high, b"payload");
        t.finish(&high, None);
        let results = results.lock();
        let names: Vec<_> = results.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["low", "high", "later"]);
        assert!(results.iter().all(|(_, r)| &r.as_ref().unwrap()[..] == b"payload"));
    }

    #[test]
    fn test_new_request_after_completion_starts_fresh() {
        let (dock, transports) = dock();
        let first = dock.fetch(IMG, None, None).unwrap().unwrap();
        transport(&transports).finish(&first, None);

        let second = dock.fetch(IMG, None, None).unwrap();
        assert!(second.is_some());
        assert_ne!(second.unwrap().id(), first.id());
        assert_eq!(transport(&transports).created().len(), 2);
    }

    #[test]
    fn test_failure_reaches_all_waiters() {
        let (dock, transports) = dock();
        let results = Arc::new(Mutex::new(Vec::new()));
        let handle = dock
            .download(IMG, None, Some(collect(&results, "a")))
            .unwrap()
            .unwrap();
        dock.download(IMG, None, Some(collect(&results, "b"))).unwrap();

        transport(&transports).finish(&handle, Some(anyhow!("timed out")));
        let results = results.lock();
        assert_eq!(results.len(), 2);
        for (_, result) in results.iter() {
            assert_eq!(result.as_ref().unwrap_err().to_string(), "transfer failed: timed out");
        }
    }

    #[test]
    fn test_malformed_url_has_no_handle() {
        let (dock, transports) = dock();
        let err = dock.fetch("not a url", None, None).unwrap_err();
        assert!(matches!(err, TransferError::NoHandle(ref target) if target == "not a url"));
        assert_eq!(transports.connected(), 0);
    }

    #[test]
    fn test_upload_sends_body_as_post() {
        let (dock, transports) = dock();
        let handle = dock
            .upload("https://x/upload", Bytes::from_static(b"form"), None, None)
            .unwrap()
            .unwrap();
        assert_eq!(handle.kind(), TransferKind::Upload);
        assert_eq!(transport(&transports).uploads(), vec![Bytes::from_static(b"form")]);
    }

    #[test]
    fn test_priority_defaults_to_configuration() {
        let transports = Arc::new(RecordingFactory::default());
        let dock = Dock::new(
            Arc::new(Configuration::named("prefetch").with_priority(0.2)),
            Arc::new(EventRouter::new()),
            SessionFactory::new(transports.clone()),
        );
        let handle = dock.fetch(IMG, None, None).unwrap().unwrap();
        assert_eq!(transport(&transports).priority_of(&handle), Some(0.2));

        let clamped = dock.fetch("https://x/other", Some(7.0), None).unwrap().unwrap();
        assert_eq!(transport(&transports).priority_of(&clamped), Some(1.0));
    }

    #[test]
    fn test_drain_fires_once_for_two_keys() {
        let (dock, transports) = dock();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        dock.router().add_drain_handler(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let a = dock.fetch("https://x/a", None, None).unwrap().unwrap();
        let b = dock.fetch("https://x/b", None, None).unwrap().unwrap();
        let t = transport(&transports);
        t.finish(&b, None);
        t.finish(&a, Some(anyhow!("reset")));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_docks_sharing_a_router_coalesce() {
        let transports = Arc::new(RecordingFactory::default());
        let sessions = SessionFactory::new(transports.clone());
        let router = Arc::new(EventRouter::new());
        let foreground = Dock::new(
            Arc::new(Configuration::default_preset()),
            router.clone(),
            sessions.clone(),
        );
        let background = Dock::new(
            Arc::new(Configuration::background_preset()),
            router.clone(),
            sessions,
        );

        let started = foreground.fetch(IMG, None, None).unwrap();
        let joined = background.fetch(IMG, None, None).unwrap();
        assert!(started.is_some());
        assert!(joined.is_none());
        assert_eq!(transports.connected(), 2);
        assert_eq!(router.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_bytes_resolves_with_shared_result() {
        let (dock, transports) = dock();
        let waiter = {
            let dock = dock.clone();
            tokio::spawn(async move { dock.fetch_bytes(IMG, None).await })
        };

        // Wait for the spawned request to register.
        while !dock.router().registry().has_transfer(&Url::parse(IMG).unwrap(), 0.0) {
            tokio::task::yield_now().await;
        }
        let handle = transport(&transports).created()[0].clone();
        transport(&transports).deliver(&handle, b"bytes");
        transport(&transports).finish(&handle, None);

        let result = waiter.await.unwrap();
        assert_eq!(&result.unwrap()[..], b"bytes");
    }

    #[tokio::test]
    async fn test_terminated_session_abandons_waiters() {
        let transports = Arc::new(RecordingFactory::default());
        let sessions = SessionFactory::new(transports.clone());
        let configuration = sessions.configurations().get_or_create("sync");
        let dock = Dock::new(configuration, Arc::new(EventRouter::new()), sessions.clone());

        let waiter = {
            let dock = dock.clone();
            tokio::spawn(async move { dock.fetch_bytes(IMG, None).await })
        };
        while dock.router().registry().is_empty() {
            tokio::task::yield_now().await;
        }
        sessions.terminate("sync");

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransferError::TransferFailed(_))));
        assert!(dock.router().registry().is_empty());
        assert_eq!(transport(&transports).invalidations(), 1);
    }

    #[test]
    fn test_terminated_session_drops_plain_callbacks() {
        let transports = Arc::new(RecordingFactory::default());
        let sessions = SessionFactory::new(transports.clone());
        let configuration = sessions.configurations().get_or_create("sync");
        let dock = Dock::new(configuration, Arc::new(EventRouter::new()), sessions.clone());
        let results = Arc::new(Mutex::new(Vec::new()));

        let handle = dock
            .fetch(IMG, None, Some(collect(&results, "plain")))
            .unwrap()
            .unwrap();
        sessions.terminate("sync");

        // Late events for the abandoned transfer reach nobody.
        transport(&transports).finish(&handle, None);
        assert!(results.lock().is_empty());
    }
}
