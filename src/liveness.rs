// Copyright 2020 Joyent, Inc.

//! The liveness probe: a minimal service every node exposes, used to check
//! that an idle transport still reaches a responsive peer.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::{Connection, Connector, Transport};
use crate::error::Error;
use crate::factory::ConnectionFactory;
use crate::node::ServiceType;

/// Name of the service bound onto a transport to ping it.
pub const LIVENESS_PROBE_SERVICE: &str = "liveness-probe";

pub fn liveness_probe_service() -> ServiceType {
    ServiceType::from(LIVENESS_PROBE_SERVICE)
}

/// Rebind the transport behind `conn` to the liveness probe and ping it.
/// On success the probe-bound handle is returned so the caller can rebind it
/// onward; `conn` itself is disabled either way.
pub(crate) fn probe<C>(
    factory: &ConnectionFactory<C>,
    conn: &Connection<C::Transport>,
    timeout: Duration,
) -> Result<Arc<Connection<C::Transport>>, Error>
where
    C: Connector,
{
    let probe = factory.rebind(conn, &liveness_probe_service())?;
    let handle = probe.get_service()?;
    probe
        .transport()?
        .ping(handle, timeout)
        .map_err(|e| Error::ProbeFailed {
            address: probe.address().clone(),
            reason: e.to_string(),
        })?;
    Ok(probe)
}
