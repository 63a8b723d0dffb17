// Copyright 2020 Joyent, Inc.

//! A connection pool for the nodes of a distributed query engine
//!
//! Nodes of the cluster talk to each other over long-lived transports that
//! carry one logical RPC service at a time. This crate keeps a pool of those
//! transports per node so that executing a distributed query does not pay for
//! a new handshake on every call. It relies on two primary traits: the
//! [`Connector`](connection/trait.Connector.html) trait opens transports and
//! the [`Transport`](connection/trait.Transport.html) trait binds services
//! onto them, pings them, and closes them.
//!
//! ## Services and rebinding
//!
//! A transport is opened once and may then be *rebound* to a different
//! logical service without opening a new socket. Rebinding consumes the old
//! [`Connection`](connection/struct.Connection.html) handle: it is disabled
//! and every accessor on it fails with
//! [`Error::ConnectionDisabled`](error/enum.Error.html). The new handle shares
//! the transport and inherits the old handle's bookkeeping.
//!
//! Before an idle connection is handed back out it is rebound to the
//! [liveness probe](liveness/index.html) service and pinged. Connections that
//! fail the ping are closed, the registered
//! [`NodeStatusListener`](listener/trait.NodeStatusListener.html)s are told the
//! node died, and the caller transparently receives a fresh connection.
//!
//! ## Soft limit
//!
//! The pool tracks the total number of open transports and blocks
//! reservations once that number reaches the configured soft limit. The limit
//! is advisory. A reservation tagged with an
//! [`ExecutionId`](node/struct.ExecutionId.html) that already holds a
//! connection is never blocked, since a query that needs two connections at
//! once must not wait on its own first connection. Such reservations may take
//! the pool past the limit.
//!
//! When the number of open transports reaches `early_close_level` of the
//! soft limit, a reservation that finds no idle connection to its node closes
//! the idle connection nearest to expiry anywhere in the pool to make room.
//!
//! ## Maintenance
//!
//! Once started, the pool runs a maintenance thread that closes connections
//! that have been idle longer than `idle_timeout` and, every
//! `keep_alive_interval`, pings one idle connection per node so dead peers
//! are discovered even when no query is using them. A round that panics is
//! retried with exponential backoff; if the rounds keep failing the worker
//! gives up and the pool reports itself unhealthy.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Mutex;
//!
//! use slog::{o, Drain, Logger};
//!
//! use cueball_rpc_pool::connection_pool::types::ConnectionPoolOptions;
//! use cueball_rpc_pool::connection_pool::ConnectionPool;
//! use cueball_rpc_pool::node::{ExecutionId, NodeAddress, ServiceType};
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let pool_opts = ConnectionPoolOptions {
//!     soft_limit: Some(32),
//!     idle_timeout: Some(60_000),
//!     log: Some(log),
//!     ..Default::default()
//! };
//!
//! // `connector` is some implementation of the Connector trait.
//! let pool = ConnectionPool::new(pool_opts, connector);
//! pool.start()?;
//!
//! let node = NodeAddress::new(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 7701);
//! let query = ExecutionId::from("query-1138");
//! let conn = pool.claim(&ServiceType::from("fragment-exec"), &node, Some(&query))?;
//! let service = conn.get_service()?;
//! // Issue calls through `service`. The connection is returned to the pool
//! // when `conn` falls out of scope.
//! ```
//!
//! The `cueball-rpc-tcp-connection` crate in this workspace implements the
//! traits over plain TCP streams.

#![allow(missing_docs)]

pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod factory;
pub mod listener;
pub mod liveness;
pub mod node;
