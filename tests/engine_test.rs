//! Engine lifecycle tests

mod common;

use std::net::SocketAddr;

use anyhow::bail;
use async_trait::async_trait;
use common::*;
use portrelay::transport::{BoxedStream, Listener, Transport, TransportFactory};
use portrelay::{Engine, ForwardEvent, ListenerExit, ListenerManager, ListenerState, ProxyConfig, TransportKind};
use std::sync::Arc;
use tokio::time::timeout;

/// Listener whose socket fails on the first accept
struct DeadListener;

#[async_trait]
impl Listener for DeadListener {
    fn local_addr(&self) -> portrelay::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 9)))
    }

    async fn accept(&mut self) -> portrelay::Result<(BoxedStream, SocketAddr)> {
        bail!("listening socket went away")
    }
}

struct DeadTransport;

#[async_trait]
impl Transport for DeadTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn copy_buffer_size(&self) -> usize {
        1024
    }

    async fn listen(&self, _addr: &str) -> portrelay::Result<Box<dyn Listener>> {
        Ok(Box::new(DeadListener))
    }

    async fn dial(&self, addr: &str) -> portrelay::Result<BoxedStream> {
        bail!("no route to {}", addr)
    }
}

fn config(forward: Vec<portrelay::ForwardRule>) -> ProxyConfig {
    ProxyConfig {
        forward,
        silent: false,
        disable: false,
    }
}

#[tokio::test]
async fn test_disabled_rule_never_binds() {
    // Holding the port means any bind attempt would fail and be reported
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let src = occupied.local_addr().unwrap().to_string();

    let mut disabled = rule("off", src, "127.0.0.1:1".to_string(), TransportKind::Tcp);
    disabled.disable = true;

    let sink = RecordingSink::new();
    let summary = timeout(WAIT, Engine::new(config(vec![disabled]), sink.clone()).run())
        .await
        .expect("engine with no enabled rules must return");

    assert_eq!(summary.started, 0);
    assert_eq!(summary.disabled, 1);
    assert_eq!(sink.count(|e| matches!(e, ForwardEvent::RuleDisabled { label, .. } if label == "off")), 1);
    assert_eq!(sink.count(|e| matches!(e, ForwardEvent::BindFailed { .. })), 0);
}

#[tokio::test]
async fn test_engine_returns_once_every_listener_stopped() {
    let occupied_a = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let occupied_b = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

    let rules = vec![
        rule("a", occupied_a.local_addr().unwrap().to_string(), "127.0.0.1:1".to_string(), TransportKind::Tcp),
        rule("b", occupied_b.local_addr().unwrap().to_string(), "127.0.0.1:1".to_string(), TransportKind::Tcp),
    ];

    let sink = RecordingSink::new();
    let summary = timeout(WAIT, Engine::new(config(rules), sink.clone()).run())
        .await
        .expect("engine must return when all listeners fail to bind");

    assert_eq!(summary.started, 2);
    assert_eq!(summary.stopped, 2);
    assert_eq!(sink.count(|e| matches!(e, ForwardEvent::BindFailed { .. })), 2);
}

#[tokio::test]
async fn test_bind_failure_does_not_affect_siblings() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let echo = spawn_echo_server().await;
    let port = free_tcp_port();

    let rules = vec![
        rule("broken", occupied.local_addr().unwrap().to_string(), echo.to_string(), TransportKind::Tcp),
        rule("healthy", format!(":{}", port), echo.to_string(), TransportKind::Tcp),
    ];

    let sink = RecordingSink::new();
    let engine = tokio::spawn(Engine::new(config(rules), sink.clone()).run());

    assert!(sink.wait_for(1, |e| matches!(e, ForwardEvent::BindFailed { label, .. } if label == "broken")).await);

    let stream = connect_when_ready(SocketAddr::from(([127, 0, 0, 1], port))).await;
    assert_eq!(exchange(stream, b"still here").await, b"still here");
    assert!(!engine.is_finished());
}

#[tokio::test]
async fn test_listener_manager_reports_bound_address() {
    let echo = spawn_echo_server().await;
    let sink = RecordingSink::new();
    let forward = Arc::new(rule("ephemeral", "127.0.0.1:0".to_string(), echo.to_string(), TransportKind::Tcp));

    let mut manager = ListenerManager::new(Arc::clone(&forward), sink.clone());
    assert_eq!(manager.state(), ListenerState::Unstarted);
    assert_eq!(manager.rule().label, "ephemeral");
    tokio::spawn(async move { manager.run().await });

    assert!(sink.wait_for(1, |e| matches!(e, ForwardEvent::ListenerBound { .. })).await);
    let bound = sink
        .events()
        .into_iter()
        .find_map(|e| match e {
            ForwardEvent::ListenerBound { local_addr, .. } => Some(local_addr),
            _ => None,
        })
        .unwrap();

    let stream = connect_when_ready(bound).await;
    assert_eq!(exchange(stream, b"via ephemeral port").await, b"via ephemeral port");
}

#[tokio::test]
async fn test_accept_failure_stops_listener() {
    let sink = RecordingSink::new();
    let forward = Arc::new(rule("dead", ":7000".to_string(), "127.0.0.1:7001".to_string(), TransportKind::Tcp));

    let mut manager = ListenerManager::with_transport(forward, Arc::new(DeadTransport), sink.clone());
    let exit = timeout(WAIT, manager.run()).await.expect("listener kept running after accept failed");

    assert!(matches!(exit, ListenerExit::AcceptFailed(_)));
    assert_eq!(manager.state(), ListenerState::Stopped);
    assert!(manager.local_addr().is_some());
    assert_eq!(sink.count(|e| matches!(e, ForwardEvent::ListenerBound { .. })), 1);
    assert_eq!(
        sink.count(|e| matches!(e, ForwardEvent::AcceptFailed { label, error, .. }
            if label == "dead" && error.contains("went away"))),
        1
    );
}

#[tokio::test]
async fn test_engine_returns_after_accept_failures() {
    let rules = vec![
        rule("one", ":7000".to_string(), "127.0.0.1:7001".to_string(), TransportKind::Tcp),
        rule("two", ":7002".to_string(), "127.0.0.1:7003".to_string(), TransportKind::Udp),
    ];
    let transports: TransportFactory = Arc::new(|_kind: TransportKind| Arc::new(DeadTransport) as Arc<dyn Transport>);

    let sink = RecordingSink::new();
    let summary = timeout(WAIT, Engine::new(config(rules), sink.clone()).with_transports(transports).run())
        .await
        .expect("engine must return once every listener stopped accepting");

    assert_eq!(summary.started, 2);
    assert_eq!(summary.stopped, summary.started);
    assert_eq!(sink.count(|e| matches!(e, ForwardEvent::AcceptFailed { .. })), 2);
    assert_eq!(sink.count(|e| matches!(e, ForwardEvent::BindFailed { .. })), 0);
}
