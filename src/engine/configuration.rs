// Transfer policy records and the registry that hands out one record per id.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{
    clamp_priority, BACKGROUND_CONFIGURATION_ID, CONFIGURATION_NAMESPACE,
    DEFAULT_CONFIGURATION_ID, DEFAULT_PRIORITY, DEFAULT_TIMEOUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CachePolicy {
    /// Let the protocol's caching headers decide.
    #[default]
    UseProtocolCachePolicy,
    /// Always go to the origin.
    ReloadIgnoringCache,
    /// Accept stale cached data rather than loading.
    ReturnCacheDataElseLoad,
}

impl CachePolicy {
    /// `Cache-Control` value sent with requests, if the policy needs one.
    pub fn cache_control(&self) -> Option<&'static str> {
        match self {
            CachePolicy::UseProtocolCachePolicy => None,
            CachePolicy::ReloadIgnoringCache => Some("no-cache"),
            CachePolicy::ReturnCacheDataElseLoad => Some("max-stale"),
        }
    }
}

/// Immutable transfer policy. Equal field sets compare and hash equal,
/// so a configuration can key the session cache directly.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub id: String,
    pub priority: f32,
    pub is_background: bool,
    pub is_discretionary: bool,
    pub allows_cellular_access: bool,
    pub cache_policy: CachePolicy,
    pub timeout: Duration,
}

impl Configuration {
    /// Foreground preset with the given id, namespaced.
    pub fn named(id: &str) -> Self {
        Self {
            id: format!("{}{}", CONFIGURATION_NAMESPACE, id),
            priority: DEFAULT_PRIORITY,
            is_background: false,
            is_discretionary: false,
            allows_cellular_access: true,
            cache_policy: CachePolicy::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn default_preset() -> Self {
        Self::named(DEFAULT_CONFIGURATION_ID)
    }

    /// Long-lived transfers that keep running while the process is suspended.
    pub fn background_preset() -> Self {
        Self::named(BACKGROUND_CONFIGURATION_ID).with_background(true)
    }

    /// The record `id` starts from: the background preset for the background
    /// id, the foreground preset otherwise.
    pub fn preset(id: &str) -> Self {
        if id == BACKGROUND_CONFIGURATION_ID {
            Self::background_preset()
        } else {
            Self::named(id)
        }
    }

    pub fn with_priority(mut self, priority: f32) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    pub fn with_background(mut self, is_background: bool) -> Self {
        self.is_background = is_background;
        self
    }

    pub fn with_discretionary(mut self, is_discretionary: bool) -> Self {
        self.is_discretionary = is_discretionary;
        self
    }

    pub fn with_cellular_access(mut self, allows_cellular_access: bool) -> Self {
        self.allows_cellular_access = allows_cellular_access;
        self
    }

    pub fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::default_preset()
    }
}

// Priority is compared bitwise so Eq and Hash agree.
impl PartialEq for Configuration {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.priority.to_bits() == other.priority.to_bits()
            && self.is_background == other.is_background
            && self.is_discretionary == other.is_discretionary
            && self.allows_cellular_access == other.allows_cellular_access
            && self.cache_policy == other.cache_policy
            && self.timeout == other.timeout
    }
}

impl Eq for Configuration {}

impl Hash for Configuration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.priority.to_bits().hash(state);
        self.is_background.hash(state);
        self.is_discretionary.hash(state);
        self.allows_cellular_access.hash(state);
        self.cache_policy.hash(state);
        self.timeout.hash(state);
    }
}

/// Caches one configuration per caller-chosen id.
#[derive(Default)]
pub struct ConfigurationRegistry {
    entries: Mutex<HashMap<String, Arc<Configuration>>>,
}

impl ConfigurationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the record for `id`, creating it from [`Configuration::preset`] on first use.
    pub fn get_or_create(&self, id: &str) -> Arc<Configuration> {
        self.get_or_insert_with(id, |preset| preset)
    }

    /// Like `get_or_create`, but `customize` shapes the record if it has to be created.
    /// Lookup and insertion share one critical section, so concurrent callers
    /// always observe the same record.
    pub fn get_or_insert_with<F>(&self, id: &str, customize: F) -> Arc<Configuration>
    where
        F: FnOnce(Configuration) -> Configuration,
    {
        let mut entries = self.entries.lock();
        entries
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!("configuration {} created", id);
                Arc::new(customize(Configuration::preset(id)))
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Configuration>> {
        self.entries.lock().get(id).cloned()
    }

    pub fn destroy(&self, id: &str) -> Option<Arc<Configuration>> {
        self.entries.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
