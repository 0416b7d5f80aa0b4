//! Watcher and provider registries.
//!
//! Both are mutated by `watch`/`provide` RPCs and read during
//! `set`/`get`/`prune` dispatch; readers take a read lock, copy out a
//! snapshot `Vec`, and release the lock before any RPC is dispatched
//! against it (see the reentrancy note on the server dispatch side).

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// A registered watcher: fires whenever a path matching `pattern` changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEntry {
    pub pattern: String,
    pub owner: u64,
    pub cb: u64,
    pub priv_: u64,
    pub endpoint: String,
}

/// A registered provider: claims read-resolution for an exact path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    pub path: String,
    pub owner: u64,
    pub cb: u64,
    pub priv_: u64,
    pub endpoint: String,
}

/// At most one entry per `(pattern, owner, cb)`. Re-registering that
/// triple replaces `priv`/`endpoint`. A `cb` of `None` unregisters every
/// entry for `(pattern, owner)` regardless of which `cb` it was
/// registered with, matching the server's `watch` RPC semantics.
#[derive(Default)]
pub struct WatcherRegistry {
    // Insertion order is preserved so dispatch order is deterministic
    // across equal registrations, as required for testability.
    entries: RwLock<Vec<WatcherEntry>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pattern: String, owner: u64, cb: Option<u64>, priv_: u64, endpoint: String) {
        let mut entries = self.entries.write();
        match cb {
            Some(cb) => {
                if let Some(existing) = entries
                    .iter_mut()
                    .find(|e| e.pattern == pattern && e.owner == owner && e.cb == cb)
                {
                    existing.priv_ = priv_;
                    existing.endpoint = endpoint;
                } else {
                    entries.push(WatcherEntry {
                        pattern,
                        owner,
                        cb,
                        priv_,
                        endpoint,
                    });
                }
            }
            None => entries.retain(|e| !(e.pattern == pattern && e.owner == owner)),
        }
    }

    /// Every watcher whose pattern matches `path`, in registration order.
    pub fn lookup_matching(&self, path: &str) -> Vec<WatcherEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| apteryx_path::matches(&e.pattern, path))
            .cloned()
            .collect()
    }

    /// Drop every watcher whose endpoint is no longer reachable. Optional
    /// cleanup hook; the central registry is never required to call this.
    pub fn retain_endpoint(&self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.write().retain(|e| keep(&e.endpoint));
    }
}

/// At most one provider wins per exact path: most-recent-registration
/// wins globally (see the design note on provider collision policy).
/// Keyed internally by path -> registration-ordered list so that an
/// owner unregistering lets the previous owner's registration, if any,
/// reappear.
#[derive(Default)]
pub struct ProviderRegistry {
    by_path: RwLock<BTreeMap<String, Vec<ProviderEntry>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: String, owner: u64, cb: Option<u64>, priv_: u64, endpoint: String) {
        let mut by_path = self.by_path.write();
        match cb {
            Some(cb) => {
                let list = by_path.entry(path.clone()).or_default();
                if let Some(existing) = list.iter_mut().find(|e| e.owner == owner) {
                    existing.cb = cb;
                    existing.priv_ = priv_;
                    existing.endpoint = endpoint;
                } else {
                    list.push(ProviderEntry {
                        path,
                        owner,
                        cb,
                        priv_,
                        endpoint,
                    });
                }
            }
            None => {
                if let Some(list) = by_path.get_mut(&path) {
                    list.retain(|e| e.owner != owner);
                    if list.is_empty() {
                        by_path.remove(&path);
                    }
                }
            }
        }
    }

    /// The most-recently-registered provider for `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<ProviderEntry> {
        self.by_path.read().get(path).and_then(|l| l.last().cloned())
    }
}
