// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::io::{Error as IOError, ErrorKind};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{o, Drain, Logger};

use cueball_rpc_pool::connection::{Connector, Transport};
use cueball_rpc_pool::connection_pool::types::ConnectionPoolOptions;
use cueball_rpc_pool::connection_pool::ConnectionPool;
use cueball_rpc_pool::listener::{ChannelListener, NodeStatusMsg};
use cueball_rpc_pool::liveness::liveness_probe_service;
use cueball_rpc_pool::node::{NodeAddress, ServiceType};

#[derive(Debug)]
pub struct DummyService {
    pub service: ServiceType,
}

#[derive(Debug)]
pub struct DummyTransport {
    alive: Arc<AtomicBool>,
    broken: Arc<AtomicBool>,
    state: Arc<ConnectorState>,
}

impl Transport for DummyTransport {
    type Error = IOError;
    type Service = DummyService;

    fn bind(&self, service: &ServiceType) -> Result<DummyService, IOError> {
        let rejected = self.state.rejected.lock().unwrap();
        if rejected.as_ref() == Some(service) {
            return Err(IOError::new(
                ErrorKind::InvalidInput,
                format!("service {} rejected", service),
            ));
        }
        Ok(DummyService {
            service: service.clone(),
        })
    }

    fn ping(
        &self,
        probe: &DummyService,
        _timeout: Duration,
    ) -> Result<(), IOError> {
        assert_eq!(probe.service, liveness_probe_service());
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IOError::new(ErrorKind::ConnectionReset, "peer gone"))
        }
    }

    fn has_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<(), IOError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    pings: AtomicUsize,
    refuse: AtomicBool,
    rejected: Mutex<Option<ServiceType>>,
    alive: Mutex<Vec<Arc<AtomicBool>>>,
    broken: Mutex<Vec<Arc<AtomicBool>>>,
}

/// A connector that hands out in-memory transports and counts what the pool
/// does with them. Clones share their counters.
#[derive(Clone, Debug, Default)]
pub struct DummyConnector {
    state: Arc<ConnectorState>,
}

impl DummyConnector {
    pub fn new() -> Self {
        DummyConnector::default()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst)
    }

    pub fn reject_service(&self, service: &ServiceType) {
        *self.state.rejected.lock().unwrap() = Some(service.clone());
    }

    /// Silently kill the peer of every transport opened so far.
    pub fn kill_all(&self) {
        for alive in self.state.alive.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    /// Mark every transport opened so far as locally broken.
    pub fn break_all(&self) {
        for broken in self.state.broken.lock().unwrap().iter() {
            broken.store(true, Ordering::SeqCst);
        }
    }
}

impl Connector for DummyConnector {
    type Transport = DummyTransport;

    fn connect(
        &self,
        address: &NodeAddress,
        _timeout: Duration,
    ) -> Result<DummyTransport, IOError> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(IOError::new(
                ErrorKind::ConnectionRefused,
                format!("{} refused", address),
            ));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let alive = Arc::new(AtomicBool::new(true));
        let broken = Arc::new(AtomicBool::new(false));
        self.state.alive.lock().unwrap().push(Arc::clone(&alive));
        self.state.broken.lock().unwrap().push(Arc::clone(&broken));

        Ok(DummyTransport {
            alive,
            broken,
            state: Arc::clone(&self.state),
        })
    }
}

pub fn node(port: u16) -> NodeAddress {
    NodeAddress::new(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

pub fn service(name: &str) -> ServiceType {
    ServiceType::from(name)
}

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn pool_with(
    cpo: ConnectionPoolOptions,
) -> (ConnectionPool<DummyConnector>, DummyConnector) {
    let connector = DummyConnector::new();
    let pool = ConnectionPool::new(cpo, connector.clone());
    (pool, connector)
}

pub fn listen(pool: &ConnectionPool<DummyConnector>) -> Receiver<NodeStatusMsg> {
    let (tx, rx) = mpsc::channel();
    pool.add_listener(Arc::new(ChannelListener::new(tx)));
    rx
}
