// Copyright 2020 Joyent, Inc.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::{Connection, Transport};
use crate::node::NodeAddress;

// Per-node deques of idle connections. Each deque is guarded by its map
// shard, so operations on different nodes rarely contend. Connections are
// pushed and popped at the front; the back holds the longest idle.
pub(crate) struct IdleConnections<T>
where
    T: Transport,
{
    by_address: DashMap<NodeAddress, VecDeque<Arc<Connection<T>>>>,
}

impl<T> IdleConnections<T>
where
    T: Transport,
{
    pub(crate) fn new() -> Self {
        IdleConnections {
            by_address: DashMap::new(),
        }
    }

    pub(crate) fn push(&self, conn: Arc<Connection<T>>) {
        self.by_address
            .entry(conn.address().clone())
            .or_default()
            .push_front(conn);
    }

    // Most recently released first.
    pub(crate) fn pop(&self, address: &NodeAddress) -> Option<Arc<Connection<T>>> {
        self.by_address.get_mut(address)?.pop_front()
    }

    pub(crate) fn pop_oldest(
        &self,
        address: &NodeAddress,
    ) -> Option<Arc<Connection<T>>> {
        self.by_address.get_mut(address)?.pop_back()
    }

    /// Remove this exact handle. False if it is not queued.
    pub(crate) fn remove(&self, conn: &Arc<Connection<T>>) -> bool {
        match self.by_address.get_mut(conn.address()) {
            Some(mut queue) => {
                match queue.iter().position(|c| Arc::ptr_eq(c, conn)) {
                    Some(idx) => queue.remove(idx).is_some(),
                    None => false,
                }
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, conn: &Arc<Connection<T>>) -> bool {
        self.by_address
            .get(conn.address())
            .map(|queue| queue.iter().any(|c| Arc::ptr_eq(c, conn)))
            .unwrap_or(false)
    }

    pub(crate) fn has_idle(&self, address: &NodeAddress) -> bool {
        self.by_address
            .get(address)
            .map(|queue| !queue.is_empty())
            .unwrap_or(false)
    }

    /// Take every idle connection to `address`.
    pub(crate) fn drain(&self, address: &NodeAddress) -> Vec<Arc<Connection<T>>> {
        match self.by_address.get_mut(address) {
            Some(mut queue) => queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn drain_all(&self) -> Vec<Arc<Connection<T>>> {
        let addresses: Vec<NodeAddress> =
            self.by_address.iter().map(|e| e.key().clone()).collect();
        addresses.iter().flat_map(|a| self.drain(a)).collect()
    }

    /// Nodes with at least one idle connection.
    pub(crate) fn addresses(&self) -> Vec<NodeAddress> {
        self.by_address
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drop the deques of nodes that no longer have idle connections.
    pub(crate) fn prune_empty(&self) -> usize {
        let before = self.by_address.len();
        self.by_address.retain(|_, queue| !queue.is_empty());
        before.saturating_sub(self.by_address.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.by_address.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use crate::connection::SharedTransport;
    use crate::node::ServiceType;

    struct NullTransport;

    impl Transport for NullTransport {
        type Error = io::Error;
        type Service = ();

        fn bind(&self, _service: &ServiceType) -> io::Result<()> {
            Ok(())
        }

        fn ping(&self, _probe: &(), _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn conn(port: u16) -> Arc<Connection<NullTransport>> {
        let addr = NodeAddress::new(&IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        Arc::new(Connection::new(
            addr,
            ServiceType::from("query"),
            Arc::new(SharedTransport::new(NullTransport)),
            (),
        ))
    }

    #[test]
    fn newest_first_oldest_last() {
        let idle = IdleConnections::new();
        let (a, b, c) = (conn(9000), conn(9000), conn(9000));
        let addr = a.address().clone();
        idle.push(Arc::clone(&a));
        idle.push(Arc::clone(&b));
        idle.push(Arc::clone(&c));
        assert_eq!(idle.len(), 3);

        assert!(Arc::ptr_eq(&idle.pop(&addr).unwrap(), &c));
        assert!(Arc::ptr_eq(&idle.pop_oldest(&addr).unwrap(), &a));
        assert!(Arc::ptr_eq(&idle.pop(&addr).unwrap(), &b));
        assert!(idle.pop(&addr).is_none());
        assert!(!idle.has_idle(&addr));
    }

    #[test]
    fn remove_is_exact_and_prune_drops_empty_nodes() {
        let idle = IdleConnections::new();
        let (a, b) = (conn(9001), conn(9002));
        idle.push(Arc::clone(&a));
        idle.push(Arc::clone(&b));
        assert!(idle.contains(&a));
        assert_eq!(idle.addresses().len(), 2);

        assert!(idle.remove(&a));
        assert!(!idle.remove(&a));
        assert!(!idle.contains(&a));
        assert_eq!(idle.addresses(), vec![b.address().clone()]);
        assert_eq!(idle.prune_empty(), 1);

        let drained = idle.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(idle.len(), 0);
    }
}
