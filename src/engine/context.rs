// Process-wide transfer context: owns the session factory and the preset docks.

use std::sync::Arc;

use anyhow::Result;

use super::configuration::Configuration;
use super::dock::Dock;
use super::router::EventRouter;
use super::session::{Session, SessionFactory};
use crate::config::{BACKGROUND_CONFIGURATION_ID, DEFAULT_CONFIGURATION_ID, EngineConfig};
use crate::error::TransferError;
use crate::transport::http::HttpTransportFactory;
use crate::transport::traits::TransportFactory;

/// Explicit owner of every cache the layer keeps: configurations by id,
/// sessions by configuration, routers by id. Create one per process and
/// share it; dropping it drops all sessions.
pub struct TransferEngine {
    sessions: Arc<SessionFactory>,
    default_dock: Dock,
    background_dock: Dock,
}

impl TransferEngine {
    /// Seeds the `default` and `background` preset records, so both presets
    /// are reachable by id through the session lifecycle calls.
    pub fn new(transport_factory: Arc<dyn TransportFactory>) -> Self {
        let sessions = SessionFactory::new(transport_factory);
        let default_dock = Self::registered_dock(&sessions, DEFAULT_CONFIGURATION_ID);
        let background_dock = Self::registered_dock(&sessions, BACKGROUND_CONFIGURATION_ID);
        Self {
            sessions,
            default_dock,
            background_dock,
        }
    }

    fn registered_dock(sessions: &Arc<SessionFactory>, id: &str) -> Dock {
        Dock::new(
            sessions.configurations().get_or_create(id),
            sessions.router_for(id),
            sessions.clone(),
        )
    }

    /// An engine backed by reqwest. Must be called from within a tokio runtime.
    pub fn with_http(config: EngineConfig) -> Result<Self> {
        let factory = HttpTransportFactory::new(config)?;
        Ok(Self::new(Arc::new(factory)))
    }

    /// Foreground transfers.
    pub fn default_dock(&self) -> &Dock {
        &self.default_dock
    }

    /// Long-lived transfers that keep running while the process is suspended.
    pub fn background_dock(&self) -> &Dock {
        &self.background_dock
    }

    /// A dock for `configuration` with its own router.
    pub fn dock(&self, configuration: Configuration) -> Dock {
        self.dock_with_router(configuration, Arc::new(EventRouter::new()))
    }

    /// A dock that shares `router` (and so its in-flight transfers) with other docks.
    pub fn dock_with_router(&self, configuration: Configuration, router: Arc<EventRouter>) -> Dock {
        Dock::new(Arc::new(configuration), router, self.sessions.clone())
    }

    /// A dock for the named configuration and its router, both created on first use.
    pub fn named_dock(&self, id: &str) -> Dock {
        Self::registered_dock(&self.sessions, id)
    }

    pub fn configuration_for(&self, id: &str) -> Arc<Configuration> {
        self.sessions.configurations().get_or_create(id)
    }

    /// Reattach to the session for `id`; `on_drain` runs once its work has drained.
    pub fn launch_session<F>(&self, id: &str, on_drain: F) -> Result<Arc<Session>, TransferError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sessions
            .launch(id, Box::new(on_drain))
            .map_err(TransferError::session_unavailable)
    }

    /// Invalidate the session for `id`, abandoning its pending transfers.
    pub fn terminate_session(&self, id: &str) {
        self.sessions.terminate(id);
    }

    pub fn sessions(&self) -> &Arc<SessionFactory> {
        &self.sessions
    }
}
