// Engine: dedup registry, event routing, session lifecycle and the public docks.

pub mod configuration;
pub mod context;
pub mod dock;
pub mod registry;
pub mod router;
pub mod session;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;
