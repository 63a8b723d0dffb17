// Copyright 2020 Joyent, Inc.

use std::sync::Arc;
use std::time::Duration;

use slog::{debug, warn, Logger};

use crate::connection::{Connection, Connector, SharedTransport, Transport};
use crate::error::Error;
use crate::node::{NodeAddress, ServiceType};

/// Opens transports through a `Connector` and binds services onto them.
pub struct ConnectionFactory<C>
where
    C: Connector,
{
    connector: C,
    log: Logger,
}

impl<C> ConnectionFactory<C>
where
    C: Connector,
{
    pub fn new(connector: C, log: Logger) -> Self {
        ConnectionFactory { connector, log }
    }

    /// Open a new transport to `address` and bind `service` onto it. The
    /// returned connection is checked out (not pooled).
    pub fn open(
        &self,
        address: &NodeAddress,
        service: &ServiceType,
        timeout: Duration,
    ) -> Result<Arc<Connection<C::Transport>>, Error> {
        let transport =
            self.connector.connect(address, timeout).map_err(|e| {
                Error::ConnectionFailed {
                    address: address.clone(),
                    reason: e.to_string(),
                }
            })?;
        let transport = Arc::new(SharedTransport::new(transport));

        match transport.get().bind(service) {
            Ok(handle) => {
                let conn = Connection::new(
                    address.clone(),
                    service.clone(),
                    transport,
                    handle,
                );
                debug!(
                    self.log,
                    "opened connection {} to {} for service {}",
                    conn.id(),
                    address,
                    service
                );
                Ok(Arc::new(conn))
            }
            Err(e) => {
                if let Some(Err(close_err)) = transport.close_once() {
                    warn!(
                        self.log,
                        "failed to close rejected transport to {}: {}",
                        address,
                        close_err
                    );
                }
                Err(Error::BindFailed {
                    address: address.clone(),
                    service: service.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Switch the transport behind `existing` to `service` without opening a
    /// new socket. `existing` is disabled whether or not the bind succeeds;
    /// on success the returned handle takes over its transport, execution
    /// and timeout state.
    pub fn rebind(
        &self,
        existing: &Connection<C::Transport>,
        service: &ServiceType,
    ) -> Result<Arc<Connection<C::Transport>>, Error> {
        if !existing.disable() {
            return Err(Error::ConnectionDisabled(existing.id()));
        }

        let transport = existing.shared_transport();
        if transport.is_closed() {
            return Err(Error::ConnectionDisabled(existing.id()));
        }

        let handle = transport.get().bind(service).map_err(|e| {
            Error::BindFailed {
                address: existing.address().clone(),
                service: service.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(Arc::new(existing.successor(service.clone(), handle)))
    }
}

/// Close the transport behind `conn` unless another handle already did.
/// Returns true if this call closed it.
pub(crate) fn close_transport<T>(log: &Logger, conn: &Connection<T>) -> bool
where
    T: Transport,
{
    match conn.shared_transport().close_once() {
        Some(Ok(())) => {
            debug!(log, "closed connection {} to {}", conn.id(), conn.address());
            true
        }
        Some(Err(e)) => {
            warn!(
                log,
                "failed to properly close connection {} to {}. Reason: {}",
                conn.id(),
                conn.address(),
                e
            );
            true
        }
        None => false,
    }
}
