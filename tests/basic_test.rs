// Copyright 2020 Joyent, Inc.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use cueball_rpc_pool::connection_pool::types::{
    ConnectionCount, ConnectionPoolOptions,
};
use cueball_rpc_pool::error::Error;
use cueball_rpc_pool::listener::NodeStatusMsg;
use cueball_rpc_pool::node::ExecutionId;

use common::{listen, node, pool_with, service, test_logger};

#[test]
fn released_connection_is_reused() {
    let pool_opts = ConnectionPoolOptions {
        soft_limit: Some(1),
        idle_timeout: Some(1000),
        log: Some(test_logger()),
        ..Default::default()
    };
    let (pool, connector) = pool_with(pool_opts);
    let svc = service("fragment-exec");
    let addr = node(55555);

    let c1 = pool.reserve(&svc, &addr, None).unwrap();
    pool.release(&c1);

    let c2 = pool.reserve(&svc, &addr, None).unwrap();
    assert_eq!(c2.id(), c1.id());
    assert_eq!(connector.connects(), 1);
    assert_eq!(pool.get_stats().unwrap().total_connections, 1.into());

    // The old handle was consumed by the service switch.
    match c1.get_service() {
        Err(Error::ConnectionDisabled(id)) => assert_eq!(id, c1.id()),
        other => panic!("expected a disabled connection, got {:?}", other),
    }
    assert_eq!(c2.get_service().unwrap().service, svc);
}

#[test]
fn execution_holding_a_connection_is_never_blocked() {
    let pool_opts = ConnectionPoolOptions {
        soft_limit: Some(1),
        claim_timeout: Some(200),
        ..Default::default()
    };
    let (pool, connector) = pool_with(pool_opts);
    let svc = service("fragment-exec");
    let addr = node(55555);
    let query = ExecutionId::from("query-1");

    let c1 = pool.reserve(&svc, &addr, Some(&query)).unwrap();
    let c2 = pool.reserve(&svc, &addr, Some(&query)).unwrap();

    assert_ne!(c1.id(), c2.id());
    assert_eq!(connector.connects(), 2);
    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.total_connections, 2.into());
    assert_eq!(stats.in_use_connections, 2.into());
    assert_eq!(pool.execution_connections(&query), Some(2.into()));

    // Any other caller is still held to the limit.
    match pool.reserve(&svc, &addr, None) {
        Err(Error::ClaimTimeout(a)) => assert_eq!(a, addr),
        other => panic!("expected a claim timeout, got {:?}", other),
    }
}

#[test]
fn dead_idle_connection_is_replaced_transparently() {
    let (pool, connector) = pool_with(ConnectionPoolOptions::default());
    let rx = listen(&pool);
    let svc = service("fragment-exec");
    let addr = node(55555);

    let c1 = pool.reserve(&svc, &addr, None).unwrap();
    pool.release(&c1);
    connector.kill_all();

    let c2 = pool.reserve(&svc, &addr, None).unwrap();
    assert_ne!(c2.id(), c1.id());
    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.closes(), 1);
    assert_eq!(pool.get_stats().unwrap().total_connections, 1.into());

    let msgs: Vec<NodeStatusMsg> = rx.try_iter().collect();
    assert_eq!(msgs, vec![NodeStatusMsg::Died(addr)]);
}

#[test]
fn live_idle_connection_reports_node_alive() {
    let (pool, connector) = pool_with(ConnectionPoolOptions::default());
    let rx = listen(&pool);
    let svc = service("fragment-exec");
    let addr = node(55555);

    let c1 = pool.reserve(&svc, &addr, None).unwrap();
    pool.release(&c1);
    let _c2 = pool.reserve(&svc, &addr, None).unwrap();

    assert_eq!(connector.pings(), 1);
    let msgs: Vec<NodeStatusMsg> = rx.try_iter().collect();
    assert_eq!(msgs, vec![NodeStatusMsg::Alive(addr)]);
}

#[test]
fn service_switch_rebinds_the_same_transport() {
    let (pool, connector) = pool_with(ConnectionPoolOptions::default());
    let addr = node(55555);

    let c1 = pool.reserve(&service("scan"), &addr, None).unwrap();
    pool.release(&c1);

    let c2 = pool.reserve(&service("shuffle"), &addr, None).unwrap();
    assert_eq!(c2.id(), c1.id());
    assert_eq!(c2.service_type(), &service("shuffle"));
    assert_eq!(c2.get_service().unwrap().service, service("shuffle"));
    assert!(c1.get_service().is_err());
    assert!(!c1.is_enabled());
    assert_eq!(connector.connects(), 1);

    // Releasing the replaced handle must not touch the live one.
    pool.release(&c1);
    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.idle_connections, 0.into());
    assert_eq!(stats.in_use_connections, 1.into());
}

#[test]
fn double_release_is_a_noop() {
    let (pool, _connector) = pool_with(ConnectionPoolOptions::default());
    let svc = service("fragment-exec");
    let addr = node(55555);
    let query = ExecutionId::from("query-2");

    let c1 = pool.reserve(&svc, &addr, Some(&query)).unwrap();
    let c2 = pool.reserve(&svc, &addr, Some(&query)).unwrap();

    pool.release(&c1);
    pool.release(&c1);
    assert_eq!(pool.execution_connections(&query), Some(1.into()));

    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.total_connections, 2.into());
    assert_eq!(stats.idle_connections, 1.into());
    assert!(c1.is_pooled());
    assert!(!c2.is_pooled());
}

#[test]
fn execution_counts_are_not_leaked() {
    let (pool, _connector) = pool_with(ConnectionPoolOptions::default());
    let svc = service("fragment-exec");
    let query = ExecutionId::from("query-3");

    let conns: Vec<_> = (0..5)
        .map(|i| pool.reserve(&svc, &node(55555 + i), Some(&query)).unwrap())
        .collect();
    assert_eq!(pool.execution_connections(&query), Some(5.into()));
    assert_eq!(pool.get_stats().unwrap().executions, 1);

    conns.iter().for_each(|c| pool.release(c));
    assert_eq!(pool.execution_connections(&query), None);
    assert_eq!(pool.get_stats().unwrap().executions, 0);
    assert!(conns.iter().all(|c| c.execution_id().is_none()));
}

#[test]
fn connection_pool_claim() {
    let pool_opts = ConnectionPoolOptions {
        soft_limit: Some(3),
        claim_timeout: Some(1000),
        ..Default::default()
    };
    let (pool, _connector) = pool_with(pool_opts);
    let svc = service("fragment-exec");
    let addr = node(55555);

    let barrier1 = Arc::new(Barrier::new(4));
    let barrier2 = Arc::new(Barrier::new(4));

    let threads: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            let (svc, addr) = (svc.clone(), addr.clone());
            let barrier1 = Arc::clone(&barrier1);
            let barrier2 = Arc::clone(&barrier2);
            thread::spawn(move || {
                let conn_result = pool.claim(&svc, &addr, None);
                assert!(conn_result.is_ok());
                barrier1.wait();
                barrier2.wait();
            })
        })
        .collect();

    barrier1.wait();

    let m_claim1 = pool.try_reserve(&svc, &addr, None);
    assert!(m_claim1.unwrap().is_none());

    // This will time out after one second based on the claim_timeout
    // specified in the pool options.
    let m_claim2 = pool.claim(&svc, &addr, None);
    assert!(m_claim2.is_err());

    barrier2.wait();
    threads.into_iter().for_each(|t| t.join().unwrap());

    // Every guard returned its connection when it was dropped.
    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.total_connections, 3.into());
    assert_eq!(stats.idle_connections, 3.into());

    let m_claim3 = pool.try_reserve(&svc, &addr, None);
    assert!(m_claim3.unwrap().is_some());
}

#[test]
fn connection_pool_accounting() {
    let (pool, _connector) = pool_with(ConnectionPoolOptions::default());
    let svc = service("fragment-exec");
    let addr = node(55555);

    let conn1 = pool.claim(&svc, &addr, None).unwrap();
    let conn2 = pool.claim(&svc, &addr, None).unwrap();

    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.total_connections, 2.into());
    assert_eq!(stats.idle_connections, 0.into());
    assert_eq!(stats.in_use_connections, 2.into());

    drop(conn1);
    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.idle_connections, 1.into());
    assert_eq!(stats.in_use_connections, 1.into());

    drop(conn2);
    let stats = pool.get_stats().unwrap();
    let total: ConnectionCount = 2.into();
    assert_eq!(stats.total_connections, total);
    assert_eq!(stats.idle_connections, total);
    assert_eq!(stats.in_use_connections, 0.into());
}

#[test]
fn open_failure_reports_node_died() {
    let (pool, connector) = pool_with(ConnectionPoolOptions::default());
    let rx = listen(&pool);
    let addr = node(55555);
    connector.set_refuse(true);

    let err = pool.reserve(&service("scan"), &addr, None).unwrap_err();
    assert!(err.is_connection_error());
    match err {
        Error::ConnectionFailed { address, .. } => assert_eq!(address, addr),
        other => panic!("expected a connection failure, got {:?}", other),
    }
    assert_eq!(pool.get_stats().unwrap().total_connections, 0.into());
    assert_eq!(rx.try_recv().unwrap(), NodeStatusMsg::Died(addr.clone()));

    connector.set_refuse(false);
    assert!(pool.reserve(&service("scan"), &addr, None).is_ok());
}

#[test]
fn rejected_bind_closes_the_new_transport() {
    let (pool, connector) = pool_with(ConnectionPoolOptions::default());
    let rx = listen(&pool);
    let addr = node(55555);
    connector.reject_service(&service("forbidden"));

    let err = pool.reserve(&service("forbidden"), &addr, None).unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.closes(), 1);
    assert_eq!(pool.get_stats().unwrap().total_connections, 0.into());
    assert_eq!(rx.try_recv().unwrap(), NodeStatusMsg::Died(addr));
}

#[test]
fn discard_closes_idle_connections_to_the_node() {
    let (pool, connector) = pool_with(ConnectionPoolOptions::default());
    let rx = listen(&pool);
    let svc = service("fragment-exec");
    let addr = node(55555);
    let other = node(55556);

    let c1 = pool.reserve(&svc, &addr, None).unwrap();
    let c2 = pool.reserve(&svc, &addr, None).unwrap();
    let c3 = pool.reserve(&svc, &other, None).unwrap();
    pool.release(&c2);
    pool.release(&c3);

    pool.discard(&c1);
    pool.discard(&c1);
    pool.release(&c1);

    assert_eq!(connector.closes(), 2);
    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.total_connections, 1.into());
    assert_eq!(stats.idle_connections, 1.into());

    let msgs: Vec<NodeStatusMsg> = rx.try_iter().collect();
    assert_eq!(msgs, vec![NodeStatusMsg::Died(addr)]);
}

#[test]
fn discarding_a_guard_does_not_release_it() {
    let (pool, connector) = pool_with(ConnectionPoolOptions::default());
    let conn = pool.claim(&service("scan"), &node(55555), None).unwrap();
    assert!(conn.get_service().is_ok());

    conn.discard();
    assert_eq!(connector.closes(), 1);
    let stats = pool.get_stats().unwrap();
    assert_eq!(stats.total_connections, 0.into());
    assert_eq!(stats.idle_connections, 0.into());
}

#[test]
fn broken_connection_is_not_pooled() {
    let (pool, connector) = pool_with(ConnectionPoolOptions::default());
    let rx = listen(&pool);
    let addr = node(55555);

    let c1 = pool.reserve(&service("scan"), &addr, None).unwrap();
    connector.break_all();
    pool.release(&c1);

    assert_eq!(connector.closes(), 1);
    assert_eq!(pool.get_stats().unwrap().total_connections, 0.into());
    assert_eq!(rx.try_recv().unwrap(), NodeStatusMsg::Died(addr));
}

#[test]
fn connection_pool_stop() {
    let pool_opts = ConnectionPoolOptions {
        log: Some(test_logger()),
        ..Default::default()
    };
    let (pool, connector) = pool_with(pool_opts);
    let svc = service("fragment-exec");
    let addr = node(55555);

    assert!(pool.start().is_ok());
    assert!(pool.start().is_ok());
    assert_eq!(pool.get_state(), "running");

    let c1 = pool.reserve(&svc, &addr, None).unwrap();
    let c2 = pool.reserve(&svc, &addr, None).unwrap();
    pool.release(&c2);

    assert!(pool.stop().is_ok());
    assert!(pool.stop().is_ok());
    assert_eq!(pool.get_state(), "stopped");
    assert!(pool.get_stats().is_none());

    // Idle connections are closed; checked-out ones are left alone.
    assert_eq!(connector.closes(), 1);
    assert!(c1.get_service().is_ok());

    match pool.reserve(&svc, &addr, None) {
        Err(Error::PoolStopped) => (),
        other => panic!("expected a stopped pool, got {:?}", other),
    }
    assert!(pool.start().is_err());

    pool.release(&c1);
    assert_eq!(connector.closes(), 2);
}

#[test]
fn dropping_the_pool_closes_idle_connections() {
    let (pool, connector) = pool_with(ConnectionPoolOptions::default());

    let c1 = pool.reserve(&service("scan"), &node(55555), None).unwrap();
    pool.release(&c1);
    drop(c1);

    let clone = pool.clone();
    drop(pool);
    assert_eq!(connector.closes(), 0);
    drop(clone);
    assert_eq!(connector.closes(), 1);
}
