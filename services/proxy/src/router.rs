//! Alias table and routing decisions.
//!
//! - Exact hostname match only (no wildcards)
//! - Hostnames normalized to lowercase, trailing dot trimmed, port removed
//! - Every alias has at most one owner
//! - Misses fall back to the default owner

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::debug;

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase().trim_end_matches('.').to_string()
}

/// Remove a `:port` suffix from a sniffed hostname.
///
/// Bracketed IPv6 literals keep their brackets; a bare IPv6 address is
/// returned unchanged.
pub fn strip_port(hostname: &str) -> &str {
    if hostname.starts_with('[') {
        return match hostname.find(']') {
            Some(end) => &hostname[..=end],
            None => hostname,
        };
    }
    match hostname.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => hostname,
    }
}

/// Immutable snapshot of routing data for lock-free reads.
struct RouteSnapshot<T> {
    aliases: HashMap<String, Arc<T>>,
    default: Option<Arc<T>>,
}

impl<T> Clone for RouteSnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            aliases: self.aliases.clone(),
            default: self.default.clone(),
        }
    }
}

impl<T> Default for RouteSnapshot<T> {
    fn default() -> Self {
        Self {
            aliases: HashMap::new(),
            default: None,
        }
    }
}

/// Maps aliases to their owners.
///
/// Uses ArcSwap so lookups never block and never block each other.
/// Writers are serialized and atomically swap in new snapshots. Owners
/// are compared by identity.
pub struct RouteTable<T> {
    snapshot: ArcSwap<RouteSnapshot<T>>,
    write: Mutex<()>,
}

impl<T> RouteTable<T> {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
            write: Mutex::new(()),
        }
    }

    /// Apply `f` to a copy of the current snapshot and publish the result.
    fn update<R>(&self, f: impl FnOnce(&mut RouteSnapshot<T>) -> R) -> R {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = RouteSnapshot::clone(&self.snapshot.load());
        let result = f(&mut next);
        self.snapshot.store(Arc::new(next));
        result
    }

    /// Register `alias` for `owner`.
    ///
    /// Returns `false` if another owner holds it. Claiming an alias the
    /// owner already holds succeeds.
    pub fn claim(&self, alias: &str, owner: &Arc<T>) -> bool {
        let alias = normalize_hostname(alias);
        self.update(|snapshot| match snapshot.aliases.get(&alias) {
            Some(current) => Arc::ptr_eq(current, owner),
            None => {
                debug!(alias = %alias, "Alias registered");
                snapshot.aliases.insert(alias, Arc::clone(owner));
                true
            }
        })
    }

    /// Drop `alias` if `owner` holds it. Returns whether it was removed.
    pub fn release(&self, alias: &str, owner: &Arc<T>) -> bool {
        let alias = normalize_hostname(alias);
        self.update(|snapshot| match snapshot.aliases.get(&alias) {
            Some(current) if Arc::ptr_eq(current, owner) => {
                snapshot.aliases.remove(&alias);
                debug!(alias = %alias, "Alias released");
                true
            }
            _ => false,
        })
    }

    /// Owner of `alias`, if any. `alias` must already be normalized.
    pub fn owner(&self, alias: &str) -> Option<Arc<T>> {
        self.snapshot.load().aliases.get(alias).cloned()
    }

    /// Owner for a sniffed hostname, falling back to the default.
    pub fn route(&self, hostname: &str) -> Option<Arc<T>> {
        let snapshot = self.snapshot.load();
        if !hostname.is_empty() {
            let normalized = normalize_hostname(strip_port(hostname));
            if let Some(owner) = snapshot.aliases.get(&normalized) {
                return Some(Arc::clone(owner));
            }
        }
        snapshot.default.clone()
    }

    pub fn set_default(&self, owner: Arc<T>) {
        self.update(|snapshot| snapshot.default = Some(owner));
    }

    pub fn default_owner(&self) -> Option<Arc<T>> {
        self.snapshot.load().default.clone()
    }

    pub fn is_default(&self, owner: &Arc<T>) -> bool {
        self.snapshot
            .load()
            .default
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, owner))
    }

    /// Number of registered aliases.
    pub fn len(&self) -> usize {
        self.snapshot.load().aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
