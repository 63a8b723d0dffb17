// Copyright 2020 Joyent, Inc.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Mutex;
use std::thread;

use slog::{info, o, Drain, Logger};

use cueball_rpc_pool::connection_pool::types::ConnectionPoolOptions;
use cueball_rpc_pool::connection_pool::ConnectionPool;
use cueball_rpc_pool::node::{ExecutionId, NodeAddress, ServiceType};
use cueball_rpc_tcp_connection::TcpConnector;

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    // A toy node that echoes whatever it reads.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let node = NodeAddress::from(listener.local_addr().expect("local addr"));
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            thread::spawn(move || {
                let mut stream = stream;
                let mut buf = [0u8; 64];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 || stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            });
        }
    });

    let pool_opts = ConnectionPoolOptions {
        soft_limit: Some(4),
        log: Some(log.clone()),
        ..Default::default()
    };
    let pool = ConnectionPool::new(pool_opts, TcpConnector::new());
    pool.start().expect("start pool");

    let query = ExecutionId::from("query-1");
    for svc in &["scan", "shuffle", "scan"] {
        let conn = pool
            .claim(&ServiceType::from(*svc), &node, Some(&query))
            .expect("claim connection");
        let service = conn.get_service().expect("bound service");

        let mut stream = &**service;
        stream.write_all(svc.as_bytes()).expect("write");
        let mut buf = vec![0u8; svc.len()];
        stream.read_exact(&mut buf).expect("read");
        info!(
            log,
            "connection {} ({}) echoed {}",
            conn.id(),
            service.service_type().as_str(),
            String::from_utf8_lossy(&buf)
        );
    }

    info!(log, "pool stats: {:?}", pool.get_stats());
    pool.stop().expect("stop pool");
}
