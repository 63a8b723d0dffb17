// Copyright 2020 Joyent, Inc.

mod idle;
mod maintenance;
mod timeouts;
pub mod types;

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use slog::{debug, info, o, trace, warn, Drain, Logger};

use crate::connection::{Connection, Connector};
use crate::connection_pool::idle::IdleConnections;
use crate::connection_pool::maintenance::{Maintain, MaintenanceWorker};
use crate::connection_pool::timeouts::TimeoutIndex;
use crate::connection_pool::types::{
    AvailabilitySignal, CancelToken, ConnectionCount, ConnectionPoolOptions,
    ConnectionPoolState, ConnectionPoolStats, PoolSettings,
};
use crate::error::Error;
use crate::factory::{close_transport, ConnectionFactory};
use crate::listener::{NodeStatusListener, NodeStatusListeners};
use crate::liveness;
use crate::node::{ExecutionId, NodeAddress, ServiceType};

/// A connection handle as handed out by the pool.
pub type PooledConnection<C> = Arc<Connection<<C as Connector>::Transport>>;

/// A pool of reusable connections to the nodes of a cluster
///
/// Cloning the pool is cheap; all clones share the same connections. The
/// pool is shut down when `stop` is called or the last clone is dropped.
pub struct ConnectionPool<C>
where
    C: Connector,
{
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ConnectionPool<C>
where
    C: Connector,
{
    fn clone(&self) -> ConnectionPool<C> {
        ConnectionPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Debug for ConnectionPool<C>
where
    C: Connector,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ConnectionPool")
            .field("state", &self.inner.state())
            .field("settings", &self.inner.settings)
            .field("total_open", &self.inner.total_open())
            .field("idle", &self.inner.idle.len())
            .field("timeouts", &self.inner.timeouts.len())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl<C> ConnectionPool<C>
where
    C: Connector,
{
    /// Create a pool that opens transports through `connector`. The
    /// maintenance worker does not run until `start` is called, but the pool
    /// accepts reservations immediately.
    pub fn new(cpo: ConnectionPoolOptions, connector: C) -> Self {
        let settings = PoolSettings::from_options(&cpo);

        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        ConnectionPool {
            inner: Arc::new(PoolInner {
                factory: ConnectionFactory::new(connector, logger.clone()),
                settings,
                idle: IdleConnections::new(),
                timeouts: TimeoutIndex::new(),
                executions: DashMap::new(),
                total_open: AtomicUsize::new(0),
                available: AvailabilitySignal::default(),
                listeners: NodeStatusListeners::default(),
                state: Mutex::new(ConnectionPoolState::Running),
                healthy: AtomicBool::new(true),
                worker: Mutex::new(None),
                log: logger,
            }),
        }
    }

    /// Spawn the maintenance worker. Calling `start` on a pool whose worker
    /// is already running does nothing.
    pub fn start(&self) -> Result<(), Error> {
        let mut worker = lock(&self.inner.worker);
        if self.inner.state() != ConnectionPoolState::Running {
            return Err(Error::PoolStopped);
        }
        if worker.is_none() {
            *worker = Some(MaintenanceWorker::spawn(
                Arc::downgrade(&self.inner),
                self.inner.log.clone(),
            )?);
            debug!(
                self.inner.log,
                "started maintenance worker, interval {:?}",
                self.inner.settings.sweep_interval()
            );
        }
        Ok(())
    }

    /// Stop the maintenance worker and close every idle connection. Blocked
    /// reservations fail with `Error::PoolStopped`. Connections that are
    /// checked out are left alone and closed when they are released.
    pub fn stop(&self) -> Result<(), Error> {
        self.inner.shutdown(true);
        Ok(())
    }

    /// Reserve a connection bound to `service` on `address`, blocking while
    /// the pool is at its soft limit. Reservations tagged with an execution
    /// that already holds a connection are never blocked.
    pub fn reserve(
        &self,
        service: &ServiceType,
        address: &NodeAddress,
        execution_id: Option<&ExecutionId>,
    ) -> Result<PooledConnection<C>, Error> {
        self.inner
            .reserve(service, address, execution_id, None, true)?
            .ok_or(Error::PoolStopped)
    }

    /// As `reserve`, but a blocked wait gives up with `Error::Cancelled` once
    /// `cancel` is triggered.
    pub fn reserve_cancellable(
        &self,
        service: &ServiceType,
        address: &NodeAddress,
        execution_id: Option<&ExecutionId>,
        cancel: &CancelToken,
    ) -> Result<PooledConnection<C>, Error> {
        self.inner
            .reserve(service, address, execution_id, Some(cancel), true)?
            .ok_or(Error::PoolStopped)
    }

    /// Reserve a connection without blocking. Returns `Ok(None)` if the
    /// reservation would have to wait for capacity.
    pub fn try_reserve(
        &self,
        service: &ServiceType,
        address: &NodeAddress,
        execution_id: Option<&ExecutionId>,
    ) -> Result<Option<PooledConnection<C>>, Error> {
        self.inner
            .reserve(service, address, execution_id, None, false)
    }

    /// Reserve a connection wrapped in a guard that releases it on drop.
    pub fn claim(
        &self,
        service: &ServiceType,
        address: &NodeAddress,
        execution_id: Option<&ExecutionId>,
    ) -> Result<PoolConnection<C>, Error> {
        let connection = self.reserve(service, address, execution_id)?;
        Ok(PoolConnection {
            connection_pool: self.clone(),
            connection,
        })
    }

    /// Return a connection to the pool. Releasing a connection that is
    /// already pooled, or one that has been replaced, does nothing.
    pub fn release(&self, connection: &PooledConnection<C>) {
        self.inner.release(connection)
    }

    /// Report that an RPC on a checked-out connection failed. The
    /// connection is closed, listeners are told the node died, and every
    /// idle connection to the node is closed.
    pub fn discard(&self, connection: &PooledConnection<C>) {
        self.inner.discard(connection)
    }

    pub fn add_listener(&self, listener: Arc<dyn NodeStatusListener>) {
        self.inner.listeners.add(listener)
    }

    /// Close every idle connection whose idle timeout has passed. Returns
    /// the number closed.
    pub fn evict_expired(&self) -> usize {
        self.inner.evict_expired()
    }

    /// Ping one idle connection per node, closing the ones that fail.
    /// Returns the number found alive.
    pub fn keep_alive(&self) -> usize {
        self.inner.keep_alive()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn get_stats(&self) -> Option<ConnectionPoolStats> {
        match self.inner.state() {
            ConnectionPoolState::Running => Some(self.inner.stats()),
            _ => None,
        }
    }

    pub fn get_state(&self) -> String {
        self.inner.state().to_string()
    }

    /// Number of connections `execution_id` currently has checked out, or
    /// `None` if it holds none.
    pub fn execution_connections(
        &self,
        execution_id: &ExecutionId,
    ) -> Option<ConnectionCount> {
        self.inner.executions.get(execution_id).map(|count| *count)
    }

    /// False once the maintenance worker has given up after repeated
    /// failures.
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(AtomicOrdering::Acquire)
    }
}

struct PoolInner<C>
where
    C: Connector,
{
    factory: ConnectionFactory<C>,
    settings: PoolSettings,
    idle: IdleConnections<C::Transport>,
    timeouts: TimeoutIndex<Connection<C::Transport>>,
    executions: DashMap<ExecutionId, ConnectionCount>,
    total_open: AtomicUsize,
    available: AvailabilitySignal,
    listeners: NodeStatusListeners,
    state: Mutex<ConnectionPoolState>,
    healthy: AtomicBool,
    worker: Mutex<Option<MaintenanceWorker>>,
    log: Logger,
}

impl<C> PoolInner<C>
where
    C: Connector,
{
    fn state(&self) -> ConnectionPoolState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionPoolState) {
        *lock(&self.state) = state;
    }

    fn ensure_running(&self) -> Result<(), Error> {
        match self.state() {
            ConnectionPoolState::Running => Ok(()),
            _ => Err(Error::PoolStopped),
        }
    }

    fn total_open(&self) -> usize {
        self.total_open.load(AtomicOrdering::Acquire)
    }

    fn stats(&self) -> ConnectionPoolStats {
        let total = self.total_open() as u32;
        let idle = self.idle.len() as u32;
        ConnectionPoolStats {
            total_connections: total.into(),
            idle_connections: idle.into(),
            in_use_connections: total.saturating_sub(idle).into(),
            executions: self.executions.len(),
        }
    }

    fn holds_connections(&self, execution_id: Option<&ExecutionId>) -> bool {
        execution_id.map_or(false, |id| self.executions.contains_key(id))
    }

    // Returns Ok(None) only when `block` is false and admission would have
    // required waiting.
    fn reserve(
        &self,
        service: &ServiceType,
        address: &NodeAddress,
        execution_id: Option<&ExecutionId>,
        cancel: Option<&CancelToken>,
        block: bool,
    ) -> Result<Option<PooledConnection<C>>, Error> {
        self.ensure_running()?;

        let mut reused = None;

        // An execution that already holds a connection skips admission
        // control entirely, so it can never wait on its own connections.
        if self.holds_connections(execution_id) {
            trace!(
                self.log,
                "execution {:?} already holds connections, skipping admission",
                execution_id
            );
        } else {
            reused = self.reuse_idle(service, address);

            if reused.is_none()
                && self.settings.at_early_close_level(self.total_open())
            {
                if self.evict_nearest() {
                    debug!(
                        self.log,
                        "closed an idle connection early to make room for {}",
                        address
                    );
                }
                reused = self.reuse_idle(service, address);
            }

            if reused.is_none() && self.settings.at_soft_limit(self.total_open())
            {
                if !block {
                    return Ok(None);
                }
                reused = self.wait_for_admission(
                    service,
                    address,
                    execution_id,
                    cancel,
                )?;
            }
        }

        // Admitted, but the caller may have given up in the meantime.
        if cancel.map_or(false, CancelToken::is_cancelled) {
            if let Some(conn) = reused {
                self.release(&conn);
            }
            debug!(self.log, "reservation for {} cancelled", address);
            return Err(Error::Cancelled);
        }

        let conn = match reused {
            Some(conn) => conn,
            None => match self.reuse_idle(service, address) {
                Some(conn) => conn,
                None => self.open(service, address)?,
            },
        };

        if let Some(id) = execution_id {
            self.record_execution(&conn, id);
        }

        Ok(Some(conn))
    }

    // Block until the soft limit admits another connection, this execution
    // becomes exempt, or an idle connection to `address` can be reused (in
    // which case it is returned).
    fn wait_for_admission(
        &self,
        service: &ServiceType,
        address: &NodeAddress,
        execution_id: Option<&ExecutionId>,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<PooledConnection<C>>, Error> {
        let started = Instant::now();
        let claim_timeout = self.settings.claim_timeout();
        debug!(
            self.log,
            "at soft limit ({} open), waiting for a connection to {}",
            self.total_open(),
            address
        );

        loop {
            if cancel.map_or(false, CancelToken::is_cancelled) {
                debug!(self.log, "reservation for {} cancelled", address);
                return Err(Error::Cancelled);
            }
            self.ensure_running()?;

            let mut wait = self.settings.wait_poll_interval();
            if let Some(limit) = claim_timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    return Err(Error::ClaimTimeout(address.clone()));
                }
                wait = wait.min(limit - elapsed);
            }

            {
                let guard = self.available.lock();
                if self.admitted(execution_id) {
                    return Ok(None);
                }
                if !self.idle.has_idle(address) {
                    drop(self.available.wait(guard, wait));
                }
            }

            if self.admitted(execution_id) {
                return Ok(None);
            }
            if let Some(conn) = self.reuse_idle(service, address) {
                return Ok(Some(conn));
            }
            // Idle connections to other nodes may be holding the capacity.
            if self.settings.at_early_close_level(self.total_open())
                && self.evict_nearest()
                && self.admitted(execution_id)
            {
                return Ok(None);
            }
        }
    }

    fn admitted(&self, execution_id: Option<&ExecutionId>) -> bool {
        self.holds_connections(execution_id)
            || !self.settings.at_soft_limit(self.total_open())
    }

    // Pop idle connections to `address` until one passes the liveness
    // probe, then rebind it to `service`.
    fn reuse_idle(
        &self,
        service: &ServiceType,
        address: &NodeAddress,
    ) -> Option<PooledConnection<C>> {
        while let Some(candidate) = self.idle.pop(address) {
            self.forget_timeout(&candidate);

            let result = liveness::probe(
                &self.factory,
                &candidate,
                self.settings.socket_timeout(),
            )
            .and_then(|probe| {
                self.listeners.node_alive(address);
                self.factory.rebind(&probe, service)
            });

            match result {
                Ok(conn) => {
                    debug!(
                        self.log,
                        "reusing idle connection {} to {} for {}",
                        conn.id(),
                        address,
                        service
                    );
                    return Some(conn);
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "idle connection {} to {} is dead: {}",
                        candidate.id(),
                        address,
                        e
                    );
                    self.peer_died(&candidate);
                }
            }
        }
        None
    }

    fn open(
        &self,
        service: &ServiceType,
        address: &NodeAddress,
    ) -> Result<PooledConnection<C>, Error> {
        match self
            .factory
            .open(address, service, self.settings.socket_timeout())
        {
            Ok(conn) => {
                let total =
                    self.total_open.fetch_add(1, AtomicOrdering::AcqRel) + 1;
                info!(
                    self.log,
                    "opened connection {} to {} ({} open)",
                    conn.id(),
                    address,
                    total
                );
                Ok(conn)
            }
            Err(e) => {
                warn!(self.log, "failed to open connection to {}: {}", address, e);
                self.node_died(address);
                Err(e)
            }
        }
    }

    fn record_execution(&self, conn: &PooledConnection<C>, id: &ExecutionId) {
        conn.set_execution_id(Some(id.clone()));
        let created = match self.executions.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() += 1.into();
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(1.into());
                true
            }
        };
        // Other threads of this execution may be waiting for the exemption.
        if created {
            self.available.notify_all();
        }
    }

    fn forget_execution(&self, id: &ExecutionId) {
        if let Entry::Occupied(mut entry) = self.executions.entry(id.clone()) {
            if *entry.get() <= 1.into() {
                entry.remove();
            } else {
                *entry.get_mut() -= 1.into();
            }
        }
    }

    fn release(&self, conn: &PooledConnection<C>) {
        if !conn.is_enabled() {
            trace!(
                self.log,
                "ignoring release of replaced connection {}",
                conn.id()
            );
            return;
        }
        if !conn.mark_pooled() {
            trace!(self.log, "connection {} already released", conn.id());
            return;
        }

        if let Some(id) = conn.take_execution_id() {
            self.forget_execution(&id);
        }

        if conn.has_broken() {
            warn!(
                self.log,
                "connection {} to {} has broken, not returning it to the pool",
                conn.id(),
                conn.address()
            );
            self.peer_died(conn);
            return;
        }

        if self.state() != ConnectionPoolState::Running {
            self.cleanup(conn);
            return;
        }

        let deadline = Instant::now() + self.settings.idle_timeout();
        self.requeue(conn, deadline);

        // A shutdown that drained the idle deques before the requeue would
        // otherwise never see this connection.
        if self.state() != ConnectionPoolState::Running {
            self.cleanup(conn);
        }
    }

    // Put a pooled connection back in its idle deque and give it a timeout
    // entry. The deque push comes first so an eviction can never pop the
    // entry of a connection that is not yet queued.
    fn requeue(&self, conn: &PooledConnection<C>, deadline: Instant) {
        self.forget_timeout(conn);
        debug_assert!(!self.idle.contains(conn));
        self.idle.push(Arc::clone(conn));
        self.timeouts
            .insert(deadline, conn, |d| conn.set_deadline(Some(d)));
        self.available.notify_all();
    }

    // Drop the timeout entry recorded for this transport, if it is still
    // indexed.
    fn forget_timeout(&self, conn: &PooledConnection<C>) {
        if let Some(deadline) = conn.deadline() {
            let id = conn.id();
            self.timeouts.remove(deadline, |c| c.id() == id);
        }
    }

    fn discard(&self, conn: &PooledConnection<C>) {
        if conn.is_pooled() {
            warn!(
                self.log,
                "ignoring discard of pooled connection {}",
                conn.id()
            );
            return;
        }
        // Only the first discard of a handle reports the failure.
        if !conn.disable() {
            return;
        }
        if let Some(id) = conn.take_execution_id() {
            self.forget_execution(&id);
        }
        warn!(
            self.log,
            "connection {} to {} failed in use",
            conn.id(),
            conn.address()
        );
        self.peer_died(conn);
    }

    // The shared dead-connection path: close `dead`, tell listeners its
    // node died, and close every idle connection to that node. Connections
    // checked out by others are left to discover the failure themselves.
    fn peer_died(&self, dead: &PooledConnection<C>) {
        self.cleanup(dead);
        self.node_died(dead.address());
    }

    fn node_died(&self, address: &NodeAddress) {
        self.listeners.node_died(address);
        let idle = self.idle.drain(address);
        if !idle.is_empty() {
            debug!(
                self.log,
                "closing {} idle connections to dead node {}",
                idle.len(),
                address
            );
        }
        idle.iter().for_each(|conn| self.cleanup(conn));
    }

    // Close the transport and remove the handle from all bookkeeping. Safe
    // to call more than once.
    fn cleanup(&self, conn: &PooledConnection<C>) {
        conn.disable();
        self.forget_timeout(conn);
        self.idle.remove(conn);
        if close_transport(&self.log, conn) {
            self.total_open.fetch_sub(1, AtomicOrdering::AcqRel);
        }
        self.available.notify_all();
    }

    // Evict a popped timeout entry unless it has gone stale: the handle was
    // replaced, it is no longer idle, or it was released again with a new
    // deadline.
    fn evict(&self, deadline: Instant, conn: PooledConnection<C>) -> bool {
        if !conn.is_enabled() || !self.idle.remove(&conn) {
            return false;
        }
        if conn.deadline() != Some(deadline) {
            self.idle.push(conn);
            return false;
        }
        debug!(
            self.log,
            "closing idle connection {} to {}",
            conn.id(),
            conn.address()
        );
        self.cleanup(&conn);
        true
    }

    // Close the idle connection nearest to expiry, skipping stale entries.
    fn evict_nearest(&self) -> bool {
        while let Some((deadline, conn)) = self.timeouts.pop_nearest() {
            if self.evict(deadline, conn) {
                return true;
            }
        }
        false
    }

    fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        while let Some((deadline, conn)) = self.timeouts.pop_expired(now) {
            if self.evict(deadline, conn) {
                evicted += 1;
            }
        }
        self.idle.prune_empty();
        evicted
    }

    fn keep_alive(&self) -> usize {
        let mut alive = 0;
        for address in self.idle.addresses() {
            let candidate = match self.idle.pop_oldest(&address) {
                Some(candidate) => candidate,
                None => continue,
            };
            let original = candidate.service_type().clone();
            // The connection keeps its original deadline; keep-alive proves
            // liveness but is not use.
            let deadline = candidate.deadline().unwrap_or_else(|| {
                Instant::now() + self.settings.idle_timeout()
            });

            let result = liveness::probe(
                &self.factory,
                &candidate,
                self.settings.socket_timeout(),
            )
            .and_then(|probe| self.factory.rebind(&probe, &original));

            match result {
                Ok(conn) => {
                    self.listeners.node_alive(&address);
                    conn.mark_pooled();
                    self.requeue(&conn, deadline);
                    alive += 1;
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "keep-alive to {} failed on connection {}: {}",
                        address,
                        candidate.id(),
                        e
                    );
                    self.peer_died(&candidate);
                }
            }
        }
        alive
    }

    fn shutdown(&self, join: bool) {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionPoolState::Stopped {
                return;
            }
            *state = ConnectionPoolState::Stopping;
        }
        self.available.notify_all();

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if join {
                worker.stop();
            } else {
                worker.signal_stop();
            }
        }

        let idle = self.idle.drain_all();
        info!(self.log, "stopping pool, closing {} idle connections", idle.len());
        idle.iter().for_each(|conn| self.cleanup(conn));
        self.idle.prune_empty();
        self.timeouts.clear();

        self.set_state(ConnectionPoolState::Stopped);
        self.available.notify_all();
    }
}

impl<C> Maintain for PoolInner<C>
where
    C: Connector,
{
    fn sweep_interval(&self) -> Duration {
        self.settings.sweep_interval()
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        self.settings.keep_alive_interval()
    }

    fn evict_expired(&self) -> usize {
        PoolInner::evict_expired(self)
    }

    fn keep_alive(&self) -> usize {
        PoolInner::keep_alive(self)
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, AtomicOrdering::Release)
    }
}

impl<C> Drop for PoolInner<C>
where
    C: Connector,
{
    fn drop(&mut self) {
        // The last handle may be dropped on the worker thread itself, so
        // only signal it.
        self.shutdown(false);
    }
}

/// A reserved connection that is returned to the pool when it falls out of
/// scope.
pub struct PoolConnection<C>
where
    C: Connector,
{
    connection_pool: ConnectionPool<C>,
    connection: PooledConnection<C>,
}

impl<C> PoolConnection<C>
where
    C: Connector,
{
    pub fn connection(&self) -> &PooledConnection<C> {
        &self.connection
    }

    /// Report the connection as failed instead of returning it to the pool.
    pub fn discard(self) {
        self.connection_pool.discard(&self.connection);
    }
}

impl<C> Debug for PoolConnection<C>
where
    C: Connector,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("PoolConnection")
            .field("connection", &self.connection)
            .finish()
    }
}

impl<C> Drop for PoolConnection<C>
where
    C: Connector,
{
    fn drop(&mut self) {
        self.connection_pool.release(&self.connection);
    }
}

impl<C> Deref for PoolConnection<C>
where
    C: Connector,
{
    type Target = Connection<C::Transport>;

    fn deref(&self) -> &Connection<C::Transport> {
        &self.connection
    }
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<V> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
