// Copyright 2020 Joyent, Inc.

use std::error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::node::{ConnectionId, ExecutionId, NodeAddress, ServiceType};

/// An open transport to a remote node
///
/// The `Transport` trait defines the interface that must be implemented by the
/// underlying socket (or any other logical notion of a connection) in order to
/// be managed by the pool. A transport carries one logical RPC service at a
/// time, but may be rebound to a different service without a new handshake.
pub trait Transport: Send + Sync + Sized + 'static {
    /// The error type returned by transport operations. Each implementation
    /// may choose the concrete error type relevant to its protocol as long as
    /// it implements the standard library
    /// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) trait.
    type Error: error::Error + Send + Sync + 'static;
    /// The handle through which callers issue calls to a bound service.
    type Service: Send + Sync + 'static;
    /// Bind a logical service onto this open transport and return a handle
    /// for it. No new socket is opened.
    fn bind(&self, service: &ServiceType) -> Result<Self::Service, Self::Error>;
    /// Issue a liveness ping through a handle bound to the liveness probe
    /// service. Must give up after `timeout`.
    fn ping(
        &self,
        probe: &Self::Service,
        timeout: Duration,
    ) -> Result<(), Self::Error>;
    /// Report whether the transport is known to be unusable without doing
    /// any I/O.
    fn has_broken(&self) -> bool {
        false
    }
    /// Close the transport.
    fn close(&self) -> Result<(), Self::Error>;
}

/// Opens new transports to remote nodes.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;
    /// Attempt to establish a transport to `address`, giving up after
    /// `timeout`.
    fn connect(
        &self,
        address: &NodeAddress,
        timeout: Duration,
    ) -> Result<Self::Transport, <Self::Transport as Transport>::Error>;
}

// A transport shared by every handle produced from it. Only the first close
// reaches the underlying transport.
pub(crate) struct SharedTransport<T> {
    transport: T,
    closed: AtomicBool,
}

impl<T> SharedTransport<T>
where
    T: Transport,
{
    pub(crate) fn new(transport: T) -> Self {
        SharedTransport {
            transport,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn get(&self) -> &T {
        &self.transport
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // Returns None when another handle already closed the transport.
    pub(crate) fn close_once(&self) -> Option<Result<(), T::Error>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(self.transport.close())
        }
    }
}

/// A pooled connection: an open transport with one bound service.
///
/// Handles are shared between the caller and the pool's bookkeeping. The
/// `pooled` flag decides who owns the handle at any instant: `true` while it
/// sits idle in the pool, `false` while a caller has it checked out. Once a
/// handle is rebound to another service, or discarded, it is permanently
/// disabled and every accessor fails.
pub struct Connection<T>
where
    T: Transport,
{
    id: ConnectionId,
    address: NodeAddress,
    service_type: ServiceType,
    transport: Arc<SharedTransport<T>>,
    service: T::Service,
    pooled: AtomicBool,
    enabled: AtomicBool,
    execution_id: Mutex<Option<ExecutionId>>,
    deadline: Mutex<Option<Instant>>,
}

impl<T> Connection<T>
where
    T: Transport,
{
    pub(crate) fn new(
        address: NodeAddress,
        service_type: ServiceType,
        transport: Arc<SharedTransport<T>>,
        service: T::Service,
    ) -> Self {
        Connection {
            id: ConnectionId::next(),
            address,
            service_type,
            transport,
            service,
            pooled: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            execution_id: Mutex::new(None),
            deadline: Mutex::new(None),
        }
    }

    // Build the handle that replaces this one after a service switch. The
    // successor starts checked out and inherits the execution and timeout
    // state.
    pub(crate) fn successor(
        &self,
        service_type: ServiceType,
        service: T::Service,
    ) -> Self {
        Connection {
            id: self.id,
            address: self.address.clone(),
            service_type,
            transport: Arc::clone(&self.transport),
            service,
            pooled: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            execution_id: Mutex::new(self.execution_id()),
            deadline: Mutex::new(self.deadline()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    /// Return the handle of the bound service. Fails if this connection has
    /// been replaced by a service switch or discarded.
    pub fn get_service(&self) -> Result<&T::Service, Error> {
        self.check_enabled()?;
        Ok(&self.service)
    }

    /// Return the underlying transport. Fails under the same conditions as
    /// `get_service`.
    pub fn transport(&self) -> Result<&T, Error> {
        self.check_enabled()?;
        Ok(self.transport.get())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// The execution currently holding this connection, if any.
    pub fn execution_id(&self) -> Option<ExecutionId> {
        lock(&self.execution_id).clone()
    }

    /// The instant after which this connection, while idle, may be evicted.
    pub fn deadline(&self) -> Option<Instant> {
        *lock(&self.deadline)
    }

    fn check_enabled(&self) -> Result<(), Error> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(Error::ConnectionDisabled(self.id))
        }
    }

    pub(crate) fn has_broken(&self) -> bool {
        self.transport.get().has_broken()
    }

    pub(crate) fn shared_transport(&self) -> &SharedTransport<T> {
        &self.transport
    }

    // Transition checked out -> pooled. False if already pooled.
    pub(crate) fn mark_pooled(&self) -> bool {
        self.pooled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // Returns true only for the call that performed the transition.
    pub(crate) fn disable(&self) -> bool {
        self.enabled.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_execution_id(&self, execution_id: Option<ExecutionId>) {
        *lock(&self.execution_id) = execution_id;
    }

    pub(crate) fn take_execution_id(&self) -> Option<ExecutionId> {
        lock(&self.execution_id).take()
    }

    pub(crate) fn set_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.deadline) = deadline;
    }
}

impl<T> fmt::Debug for Connection<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("service_type", &self.service_type)
            .field("pooled", &self.is_pooled())
            .field("enabled", &self.is_enabled())
            .field("closed", &self.is_closed())
            .field("execution_id", &self.execution_id())
            .finish()
    }
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<V> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
