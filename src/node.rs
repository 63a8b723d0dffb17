// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use derive_more::{Display, From, Into};

/// The port number of a node. This is a type alias for u16.
pub type NodePort = u16;
/// The concatenation of the node address and port with a colon
/// delimiter. This is a type alias for String.
pub type NodeName = String;

/// The network location of a remote cluster node.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialOrd, PartialEq)]
pub struct NodeAddress {
    /// The concatenation of the node address and port with a colon delimiter.
    pub name: NodeName,
    /// The IP address of the node.
    pub address: IpAddr,
    /// The port of the node.
    pub port: NodePort,
}

impl NodeAddress {
    /// Return a new `NodeAddress` given an IP address and port.
    pub fn new(address: &IpAddr, port: NodePort) -> Self {
        NodeAddress {
            name: node_name(&SocketAddr::new(*address, port)),
            address: *address,
            port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        NodeAddress::new(&addr.ip(), addr.port())
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.name.fmt(fmt)
    }
}

// IPv6 addresses are bracketed so the name stays parseable as a socket address.
fn node_name(addr: &SocketAddr) -> NodeName {
    addr.to_string()
}

/// The logical RPC service bound onto a transport, e.g. `"query-exchange"`.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct ServiceType(String);

impl ServiceType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceType {
    fn from(name: &str) -> Self {
        ServiceType(String::from(name))
    }
}

/// Correlates every reservation made on behalf of one distributed query
/// execution.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct ExecutionId(String);

impl From<&str> for ExecutionId {
    fn from(id: &str) -> Self {
        ExecutionId(String::from(id))
    }
}

impl From<u64> for ExecutionId {
    fn from(id: u64) -> Self {
        ExecutionId(id.to_string())
    }
}

/// Identifies one transport for its whole life. Every connection handle
/// produced by rebinding a transport carries the transport's identifier.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn node_address_names() {
        let v4 = NodeAddress::new(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 5433);
        assert_eq!(v4.name, "10.0.0.7:5433");
        assert_eq!(v4.to_string(), "10.0.0.7:5433");

        let v6 = NodeAddress::new(&IpAddr::V6(Ipv6Addr::LOCALHOST), 8080);
        assert_eq!(v6.name, "[::1]:8080");
        assert_eq!(v6.socket_addr(), "[::1]:8080".parse().unwrap());
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }
}
