// Session factory: one transport session per configuration, created lazily and torn down on request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::configuration::{Configuration, ConfigurationRegistry};
use super::registry::DrainHandler;
use super::router::EventRouter;
use crate::transport::traits::{EventSink, TransferHandle, Transport, TransportFactory};

/// A live transport bound to one configuration and one event router.
pub struct Session {
    configuration: Arc<Configuration>,
    transport: Arc<dyn Transport>,
    router: Arc<EventRouter>,
    retired: AtomicBool,
}

impl Session {
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// A retired session takes no new transfers; the factory builds a replacement.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn owns(&self, handle: &TransferHandle) -> bool {
        self.transport.owns(handle)
    }
}

pub struct SessionFactory {
    transport_factory: Arc<dyn TransportFactory>,
    configurations: ConfigurationRegistry,
    routers: Mutex<HashMap<String, Arc<EventRouter>>>,
    sessions: Mutex<HashMap<Configuration, Arc<Session>>>,
    this: Weak<SessionFactory>,
}

impl SessionFactory {
    pub fn new(transport_factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport_factory,
            configurations: ConfigurationRegistry::new(),
            routers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn configurations(&self) -> &ConfigurationRegistry {
        &self.configurations
    }

    /// The event router owned by `id`, created on first use.
    pub fn router_for(&self, id: &str) -> Arc<EventRouter> {
        self.routers
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(EventRouter::new()))
            .clone()
    }

    /// Return the cached session for `configuration`, or build one wired to `router`.
    ///
    /// A cached session keeps the router it was created with. A retired one
    /// is replaced.
    pub fn session_for(
        &self,
        configuration: &Arc<Configuration>,
        router: &Arc<EventRouter>,
    ) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(configuration.as_ref()) {
            if !session.is_retired() {
                return Ok(session.clone());
            }
        }

        let sink: Arc<dyn EventSink> = router.clone();
        let transport = self.transport_factory.connect(configuration, sink)?;
        let session = Arc::new(Session {
            configuration: configuration.clone(),
            transport,
            router: router.clone(),
            retired: AtomicBool::new(false),
        });

        if configuration.is_background {
            router.add_drain_handler(self.teardown_handler(&session));
        }

        info!(
            "session created for {} (background={}, discretionary={}, cellular={})",
            configuration.id,
            configuration.is_background,
            configuration.is_discretionary,
            configuration.allows_cellular_access
        );
        sessions.insert(configuration.as_ref().clone(), session.clone());
        Ok(session)
    }

    /// Drain handler that retires a background session once its own work is done.
    fn teardown_handler(&self, session: &Arc<Session>) -> DrainHandler {
        let factory = self.this.clone();
        let session = Arc::downgrade(session);
        Box::new(move || {
            if let (Some(factory), Some(session)) = (factory.upgrade(), session.upgrade()) {
                factory.retire_when_drained(&session);
            }
        })
    }

    /// Retire `session` if none of the transfers tracked by its router belong to it.
    ///
    /// The router may be shared with other sessions, so draining it says
    /// nothing about this session's transfers. If work remains, the check is
    /// queued again for the next drain.
    pub fn retire_when_drained(&self, session: &Arc<Session>) -> bool {
        if session.is_retired() {
            return false;
        }
        // Admission refuses retired sessions under the same lock, so no
        // transfer can slip onto the session between the check and the flag.
        let drained = session
            .router
            .registry()
            .when_idle(|handle| session.owns(handle), || session.retire());
        if !drained {
            debug!(
                "session for {} still has transfers, teardown deferred",
                session.configuration.id
            );
            session
                .router
                .add_drain_handler(self.teardown_handler(session));
            return false;
        }

        debug!("background work drained for {}", session.configuration.id);
        {
            let mut sessions = self.sessions.lock();
            let cached = sessions
                .get(session.configuration.as_ref())
                .is_some_and(|cached| Arc::ptr_eq(cached, session));
            if cached {
                sessions.remove(session.configuration.as_ref());
            }
        }
        Self::shut_down(session);
        true
    }

    /// Resolve the configuration for `id`, queue `on_drain` on the router of
    /// its session, and return the session.
    ///
    /// Used to reattach to a background transfer set, e.g. after a relaunch.
    pub fn launch(&self, id: &str, on_drain: DrainHandler) -> Result<Arc<Session>> {
        let configuration = self.configurations.get_or_create(id);
        let router = match self.session(&configuration) {
            Some(session) => session.router.clone(),
            None => self.router_for(id),
        };
        let session = self.session_for(&configuration, &router)?;
        session.router.add_drain_handler(on_drain);
        Ok(session)
    }

    /// Cancel everything on the session for `id` and forget its configuration.
    ///
    /// Waiters of transfers still pending on that session are never called.
    pub fn terminate(&self, id: &str) {
        if let Some(configuration) = self.configurations.get(id) {
            self.evict(&configuration);
        }
        self.configurations.destroy(id);
        self.routers.lock().remove(id);
    }

    /// Invalidate the session for `configuration` and drop it from the cache.
    ///
    /// Its pending transfers stop being tracked, so later requests for the
    /// same resources start fresh instead of joining a dead transfer.
    pub fn evict(&self, configuration: &Configuration) -> bool {
        let session = self.sessions.lock().remove(configuration);
        match session {
            Some(session) => {
                session.retire();
                Self::shut_down(&session);
                true
            }
            None => false,
        }
    }

    fn shut_down(session: &Session) {
        let abandoned = session
            .router
            .registry()
            .abandon_where(|handle| session.owns(handle));
        session.transport.invalidate_and_cancel();
        info!(
            "session for {} terminated, {} pending transfers abandoned",
            session.configuration.id, abandoned
        );
    }

    /// Cancel `handle` on whichever cached session issued it.
    pub fn cancel(&self, handle: &TransferHandle) {
        let transports: Vec<Arc<dyn Transport>> = self
            .sessions
            .lock()
            .values()
            .map(|session| session.transport.clone())
            .collect();
        for transport in transports {
            if transport.owns(handle) {
                transport.cancel(handle);
                return;
            }
        }
        debug!("transfer {} not owned by any session", handle.id());
    }

    pub fn session(&self, configuration: &Configuration) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .get(configuration)
            .filter(|session| !session.is_retired())
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::engine::testing::RecordingFactory;
    use crate::transport::traits::TransferKind;

    #[test]
    fn test_session_is_cached_per_configuration() {
        let transports = Arc::new(RecordingFactory::default());
        let factory = SessionFactory::new(transports.clone());
        let router = Arc::new(EventRouter::new());
        let config = Arc::new(Configuration::default_preset());

        let first = factory.session_for(&config, &router).unwrap();
        let again = factory
            .session_for(&Arc::new(Configuration::default_preset()), &router)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(transports.connected(), 1);

        let other = Arc::new(Configuration::default_preset().with_priority(0.9));
        factory.session_for(&other, &router).unwrap();
        assert_eq!(transports.connected(), 2);
        assert_eq!(factory.session_count(), 2);
    }

    #[test]
    fn test_terminate_invalidates_and_evicts() {
        let transports = Arc::new(RecordingFactory::default());
        let factory = SessionFactory::new(transports.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let session = factory
            .launch(
                "sync",
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(session.configuration().id, "dock.transfer.sync");
        assert!(factory.configurations().get("sync").is_some());

        factory.terminate("sync");
        assert_eq!(transports.transport(0).invalidations(), 1);
        assert_eq!(factory.session_count(), 0);
        assert!(factory.configurations().get("sync").is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // The next launch builds a fresh session.
        factory.launch("sync", Box::new(|| {})).unwrap();
        assert_eq!(transports.connected(), 2);
    }

    #[test]
    fn test_launch_handler_runs_on_drain() {
        let transports = Arc::new(RecordingFactory::default());
        let factory = SessionFactory::new(transports.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let session = factory
            .launch(
                "sync",
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        session.router().on_background_drained();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_session_retires_after_drain() {
        let transports = Arc::new(RecordingFactory::default());
        let factory = SessionFactory::new(transports.clone());
        let router = Arc::new(EventRouter::new());
        let config = Arc::new(Configuration::background_preset());
        factory.session_for(&config, &router).unwrap();

        let handle = TransferHandle::new(
            reqwest::Url::parse("https://x/a").unwrap(),
            TransferKind::Data,
        );
        router.registry().register_new_transfer(handle.clone(), 0.5);
        router.on_completed(&handle, None);

        assert_eq!(factory.session_count(), 0);
        assert_eq!(transports.transport(0).invalidations(), 1);
    }
}
