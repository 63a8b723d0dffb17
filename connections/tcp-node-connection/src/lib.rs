// Copyright 2020 Joyent, Inc.

use std::io::{Error as IOError, ErrorKind};
use std::net::{Shutdown, TcpStream};
use std::ops::Deref;
use std::time::Duration;

use cueball_rpc_pool::connection::{Connector, Transport};
use cueball_rpc_pool::node::{NodeAddress, ServiceType};

/// Opens plain TCP streams to cluster nodes.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        TcpConnector { nodelay: true }
    }

    /// Disable or enable Nagle's algorithm on every stream opened.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        TcpConnector::new()
    }
}

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    fn connect(
        &self,
        address: &NodeAddress,
        timeout: Duration,
    ) -> Result<TcpTransport, IOError> {
        let stream = TcpStream::connect_timeout(&address.socket_addr(), timeout)?;
        stream.set_nodelay(self.nodelay)?;
        Ok(TcpTransport { stream })
    }
}

/// An open TCP stream to a node.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    type Error = IOError;
    type Service = TcpService;

    // The stream is framed by the RPC layer above; binding only hands out a
    // tagged handle to the same socket.
    fn bind(&self, service: &ServiceType) -> Result<TcpService, IOError> {
        Ok(TcpService {
            service: service.clone(),
            stream: self.stream.try_clone()?,
        })
    }

    // An idle stream has nothing to read. A zero-length peek means the peer
    // sent FIN; an error means the peer reset the connection.
    fn ping(&self, probe: &TcpService, timeout: Duration) -> Result<(), IOError> {
        probe.stream.set_read_timeout(Some(timeout))?;
        probe.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1];
        let result = match probe.stream.peek(&mut buf) {
            Ok(0) => Err(IOError::new(
                ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        };
        probe.stream.set_nonblocking(false)?;
        probe.stream.set_read_timeout(None)?;
        result
    }

    fn has_broken(&self) -> bool {
        match self.stream.take_error() {
            Ok(None) => false,
            Ok(Some(_)) | Err(_) => true,
        }
    }

    fn close(&self) -> Result<(), IOError> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(ref e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }
}

/// A service bound onto a `TcpTransport`. Derefs to the underlying stream.
#[derive(Debug)]
pub struct TcpService {
    service: ServiceType,
    stream: TcpStream,
}

impl TcpService {
    pub fn service_type(&self) -> &ServiceType {
        &self.service
    }
}

impl Deref for TcpService {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        &self.stream
    }
}
