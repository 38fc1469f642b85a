//! Live connection table.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::connection::{lock, Connection};
use crate::router::MethodRouter;

/// All connections of one broker, keyed by connection id.
///
/// Enumeration copies the set and releases the lock before running the
/// callback, so callbacks may do I/O or re-enter the registry.
pub struct ConnectionRegistry {
    connections: Mutex<BTreeMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    router: Arc<MethodRouter>,
}

impl ConnectionRegistry {
    /// Empty registry; removals also unregister methods from `router`.
    pub fn new(router: Arc<MethodRouter>) -> Self {
        Self {
            connections: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            router,
        }
    }

    /// Allocate an id for a new connection.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a new connection.
    pub fn add(&self, conn: Arc<Connection>) {
        let id = conn.id();
        let count = {
            let mut connections = lock(&self.connections);
            connections.insert(id, conn);
            connections.len()
        };
        debug!(conn = id, connections = count, "Connection added");
    }

    /// Close and forget a connection, sweeping its method registrations.
    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        let conn = lock(&self.connections).remove(&id)?;
        conn.close();
        let methods = self.router.unregister_connection(id);
        debug!(conn = id, pid = ?conn.pid(), methods, "Connection removed");
        Some(conn)
    }

    /// Connection with this id, open or not.
    pub fn find_by_id(&self, id: u64) -> Option<Arc<Connection>> {
        lock(&self.connections).get(&id).cloned()
    }

    /// The open connection registered by process `pid`.
    pub fn find_by_pid(&self, pid: u32) -> Option<Arc<Connection>> {
        lock(&self.connections)
            .values()
            .find(|conn| conn.pid() == Some(pid) && !conn.is_closed())
            .cloned()
    }

    /// Snapshot of the open connections.
    pub fn open_connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.connections)
            .values()
            .filter(|conn| !conn.is_closed())
            .cloned()
            .collect()
    }

    /// Run `f` on every open connection without holding the lock.
    pub fn for_each_open(&self, mut f: impl FnMut(&Arc<Connection>)) {
        for conn in self.open_connections() {
            f(&conn);
        }
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Whether no connection is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every connection already marked closed. Returns the removed ones.
    pub fn collect_closed(&self) -> Vec<Arc<Connection>> {
        let closed: Vec<u64> = lock(&self.connections)
            .values()
            .filter(|conn| conn.is_closed())
            .map(|conn| conn.id())
            .collect();
        closed.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Close every connection.
    pub fn close_all(&self) {
        let ids: Vec<u64> = lock(&self.connections).keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{Correlator, CorrelatorConfig};
    use crate::router::Route;
    use tokio::net::UnixStream;

    fn registry() -> (ConnectionRegistry, Arc<MethodRouter>) {
        let router = MethodRouter::new(Correlator::new(CorrelatorConfig::default()));
        (ConnectionRegistry::new(Arc::clone(&router)), router)
    }

    fn add(registry: &ConnectionRegistry) -> (Arc<Connection>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let (conn, _reader) = Connection::new(registry.next_id(), a);
        registry.add(Arc::clone(&conn));
        (conn, b)
    }

    #[tokio::test]
    async fn find_and_remove() {
        let (registry, router) = registry();
        let (a, _pa) = add(&registry);
        let (b, _pb) = add(&registry);
        assert_ne!(a.id(), b.id());
        assert!(b.set_pid(4242));
        router.register_remote(&b, "foo", vec![]);

        assert_eq!(registry.find_by_pid(4242).map(|c| c.id()), Some(b.id()));
        assert!(registry.find_by_pid(1).is_none());
        assert_eq!(registry.len(), 2);

        let removed = registry.remove(b.id()).unwrap();
        assert!(removed.is_closed());
        assert!(matches!(router.resolve("foo"), Route::Unknown));
        assert!(registry.find_by_id(b.id()).is_none());
        assert!(registry.remove(b.id()).is_none());
    }

    #[tokio::test]
    async fn enumeration_skips_closed_and_allows_reentry() {
        let (registry, _router) = registry();
        let (a, _pa) = add(&registry);
        let (b, _pb) = add(&registry);
        b.close();

        let mut seen = Vec::new();
        registry.for_each_open(|conn| {
            // Re-entering the registry must not deadlock.
            assert!(registry.find_by_id(conn.id()).is_some());
            seen.push(conn.id());
        });
        assert_eq!(seen, vec![a.id()]);

        let collected = registry.collect_closed();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].id(), b.id());
        assert!(registry.collect_closed().is_empty());
        assert_eq!(registry.len(), 1);

        registry.close_all();
        assert!(registry.is_empty());
        assert!(a.is_closed());
    }
}
