//! Request-coalescing transfer layer.
//!
//! At most one transfer is in flight per URL. Every caller that asks for the
//! same resource joins it and receives the same result. Transport sessions
//! are cached per [`Configuration`] and torn down on request.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod transport;

pub use config::EngineConfig;
pub use engine::configuration::{CachePolicy, Configuration, ConfigurationRegistry};
pub use engine::context::TransferEngine;
pub use engine::dock::Dock;
pub use engine::router::EventRouter;
pub use engine::session::{Session, SessionFactory};
pub use engine::stats::StatsSnapshot;
pub use error::{TransferCallback, TransferError, TransferResult};
pub use transport::http::{HttpTransport, HttpTransportFactory};
pub use transport::traits::{
    EventSink, ResourceKey, TransferHandle, TransferKind, TransferRequest, Transport,
    TransportFactory,
};
