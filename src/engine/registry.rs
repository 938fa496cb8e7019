use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use anyhow::bail;
use tracing::debug;
use crate::engine::connection::Connection;
use crate::ids::ConnectionId;

/// Keeps the connection table in 'iterating' state while it is alive
pub(crate) struct IterationGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for IterationGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// All connections, by id. While the table is being iterated (i.e. an [IterationGuard] is
///  alive), insertions fail and removals are deferred until [ConnectionTable::settle] is called
///  after the last guard is dropped. Deferred removals are invisible to lookups right away.
#[derive(Default)]
pub(crate) struct ConnectionTable {
    entries: BTreeMap<ConnectionId, Connection>,
    iterating: Arc<AtomicUsize>,
    deferred: Vec<ConnectionId>,
}

impl ConnectionTable {
    /// Returns a snapshot of the ids, together with a guard that keeps the table stable
    pub fn iterate(&self) -> (IterationGuard, Vec<ConnectionId>) {
        self.iterating.fetch_add(1, Ordering::AcqRel);
        let guard = IterationGuard { depth: self.iterating.clone() };
        let ids = self.entries.keys()
            .filter(|id| !self.deferred.contains(id))
            .cloned()
            .collect();
        (guard, ids)
    }

    pub fn is_iterating(&self) -> bool {
        self.iterating.load(Ordering::Acquire) > 0
    }

    pub fn insert(&mut self, conn: Connection) -> anyhow::Result<()> {
        if self.is_iterating() {
            bail!("can not add connection {} while iterating connections", conn.id);
        }
        self.entries.insert(conn.id, conn);
        Ok(())
    }

    /// Returns the removed connection, or `None` if there was none or the removal is deferred
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        if self.is_iterating() {
            if self.entries.contains_key(&id) && !self.deferred.contains(&id) {
                debug!(conn = %id, "deferring removal while iterating");
                self.deferred.push(id);
            }
            return None;
        }
        self.entries.remove(&id)
    }

    /// Performs deferred removals once iteration is over
    pub fn settle(&mut self) -> Vec<Connection> {
        if self.is_iterating() {
            return Vec::new();
        }
        let deferred = std::mem::take(&mut self.deferred);
        deferred.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        if self.deferred.contains(&id) {
            return None;
        }
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        if self.deferred.contains(&id) {
            return None;
        }
        self.entries.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.keys()
            .filter(|id| !self.deferred.contains(id))
            .cloned()
            .collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &Connection> {
        self.entries.values()
            .filter(|c| !self.deferred.contains(&c.id))
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use crate::engine::config::{ChannelOptions, ChannelSettings};
    use crate::protocol::versions::ProtocolVersions;
    use crate::transport::memory::MemoryLink;
    use crate::transport::Transport;

    fn connection(id: u64) -> Connection {
        let (events, _) = mpsc::unbounded_channel();
        let (link, _peer) = MemoryLink::pair(ConnectionId(id), false, events);
        let settings = ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::ALL, None);
        Connection::new(ConnectionId(id), Transport::Memory(link), settings, None, false, 0, Instant::now())
    }

    #[test]
    fn test_insert_and_remove() {
        let mut table = ConnectionTable::default();
        table.insert(connection(1)).unwrap();
        table.insert(connection(2)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.ids(), vec![ConnectionId(1), ConnectionId(2)]);

        assert!(table.remove(ConnectionId(1)).is_some());
        assert!(table.remove(ConnectionId(1)).is_none());
        assert!(table.get(ConnectionId(1)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_iteration_guard() {
        let mut table = ConnectionTable::default();
        table.insert(connection(1)).unwrap();
        table.insert(connection(2)).unwrap();

        let (guard, ids) = table.iterate();
        assert_eq!(ids, vec![ConnectionId(1), ConnectionId(2)]);
        assert!(table.is_iterating());

        assert!(table.insert(connection(3)).is_err());
        assert!(table.remove(ConnectionId(1)).is_none());
        assert!(table.get(ConnectionId(1)).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.settle().is_empty());

        let (inner_guard, ids) = table.iterate();
        assert_eq!(ids, vec![ConnectionId(2)]);
        drop(guard);
        assert!(table.is_iterating());
        drop(inner_guard);
        assert!(!table.is_iterating());

        let removed = table.settle();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, ConnectionId(1));
        assert_eq!(table.ids(), vec![ConnectionId(2)]);
        table.insert(connection(3)).unwrap();
        assert_eq!(table.len(), 2);
    }
}
