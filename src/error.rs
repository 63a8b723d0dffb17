// Copyright 2020 Joyent, Inc.

use thiserror::Error;

use crate::node::{ConnectionId, NodeAddress, ServiceType};

/// The errors returned by the connection pool and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// A new transport to the node could not be opened.
    #[error("unable to connect to {address}: {reason}")]
    ConnectionFailed { address: NodeAddress, reason: String },
    /// The node rejected binding a service onto an open transport.
    #[error("unable to bind service {service} on connection to {address}: {reason}")]
    BindFailed {
        address: NodeAddress,
        service: ServiceType,
        reason: String,
    },
    /// The liveness probe found the transport dead. Never surfaced from
    /// `reserve`; the pool recovers from it internally.
    #[error("liveness probe to {address} failed: {reason}")]
    ProbeFailed { address: NodeAddress, reason: String },
    /// The connection handle was replaced by a service switch (or discarded)
    /// and may no longer be used.
    #[error("connection {0} has been replaced and is no longer usable")]
    ConnectionDisabled(ConnectionId),
    /// The configured claim timeout elapsed while waiting for admission.
    #[error("timed out waiting for a connection to {0}")]
    ClaimTimeout(NodeAddress),
    /// The caller cancelled its wait.
    #[error("connection reservation cancelled")]
    Cancelled,
    /// The pool is stopping or stopped.
    #[error("connection pool is stopped")]
    PoolStopped,
    /// The maintenance worker thread could not be spawned.
    #[error("unable to spawn maintenance worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

impl Error {
    /// True for the errors that mean the remote node could not be reached.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. } | Error::BindFailed { .. }
        )
    }
}
