//! Registries of long-lived streams multiplexed over the tunnel.
//!
//! - [`exec`]: interactive shells (bidirectional, resizable)
//! - [`logs`]: follow-mode container logs (one-directional, cancellable)
//!
//! Both are built on [`SessionTable`], a lock-protected map keyed by the
//! caller-chosen session id. A bridge task registers its entry and receives a
//! [`SessionGuard`]; the entry lives exactly as long as the guard.
//!
//! ## Concurrency
//!
//! Every lookup and mutation takes the table mutex. The lock is never held
//! across an `.await`, so a plain `std::sync::Mutex` is enough. Each slot is
//! stamped with a unique token so a guard can only ever remove the entry it
//! created, never a later one that reused the id.

pub mod exec;
pub mod logs;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

pub use exec::ExecSessions;
pub use logs::LogSessions;

/// Opening a session whose id is still registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("session {0} already exists")]
pub struct SessionExists(pub String);

struct Slot<T> {
    token: u64,
    value: T,
}

struct Table<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
    next_token: AtomicU64,
}

/// Shared session map. Cloneable; clones share the same map.
pub struct SessionTable<T> {
    inner: Arc<Table<T>>,
}

impl<T> Clone for SessionTable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for SessionTable<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Table {
                slots: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }
}

impl<T> SessionTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `id`. Fails without touching the existing entry
    /// if `id` is taken.
    pub fn register(&self, id: &str, value: T) -> Result<SessionGuard<T>, SessionExists> {
        let mut slots = self.lock();
        if slots.contains_key(id) {
            return Err(SessionExists(id.to_string()));
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        slots.insert(id.to_string(), Slot { token, value });
        debug!(session_id = id, "Session registered");
        Ok(SessionGuard {
            table: self.clone(),
            id: id.to_string(),
            token,
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot<T>>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_if(&self, id: &str, token: u64) -> bool {
        let mut slots = self.lock();
        if slots.get(id).is_some_and(|slot| slot.token == token) {
            slots.remove(id);
            true
        } else {
            false
        }
    }
}

impl<T: Clone> SessionTable<T> {
    pub fn get(&self, id: &str) -> Option<T> {
        self.lock().get(id).map(|slot| slot.value.clone())
    }
}

/// Ownership of one registered entry; dropping it unregisters the entry.
pub struct SessionGuard<T> {
    table: SessionTable<T>,
    id: String,
    token: u64,
}

impl<T> SessionGuard<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> Drop for SessionGuard<T> {
    fn drop(&mut self) {
        if self.table.remove_if(&self.id, self.token) {
            debug!(session_id = %self.id, "Session unregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_entry_on_drop() {
        let table = SessionTable::new();
        let guard = table.register("s1", 7_u32).unwrap();
        assert_eq!(table.get("s1"), Some(7));
        assert_eq!(guard.id(), "s1");
        drop(guard);
        assert!(!table.contains("s1"));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected_and_original_kept() {
        let table = SessionTable::new();
        let _guard = table.register("s1", "first").unwrap();
        let err = table.register("s1", "second").err().unwrap();
        assert_eq!(err.to_string(), "session s1 already exists");
        assert_eq!(table.get("s1"), Some("first"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_guard_does_not_remove_reused_id() {
        let table = SessionTable::new();
        let old = table.register("s1", 1).unwrap();
        // Simulate the slot being replaced behind the old guard's back.
        table.lock().remove("s1");
        let _new = table.register("s1", 2).unwrap();
        drop(old);
        assert_eq!(table.get("s1"), Some(2));
    }
}
