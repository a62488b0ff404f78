//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use portrelay::{ForwardEvent, ForwardRule, StatusSink, TransportKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

/// Sink that keeps every event for later inspection
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ForwardEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ForwardEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&ForwardEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    /// Wait until at least `n` recorded events match
    pub async fn wait_for(&self, n: usize, predicate: impl Fn(&ForwardEvent) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.count(&predicate) >= n {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl StatusSink for RecordingSink {
    fn emit(&self, event: ForwardEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn rule(label: &str, src: String, dst: String, transport: TransportKind) -> ForwardRule {
    ForwardRule {
        src,
        dst,
        transport,
        label: label.to_string(),
        silent: false,
        log: None,
        disable: false,
    }
}

/// Echo server that answers every connection until the client hangs up
pub async fn spawn_echo_server_on(addr: &str) -> SocketAddr {
    let listener = TcpListener::bind(addr).await.unwrap();
    let local = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    local
}

pub async fn spawn_echo_server() -> SocketAddr {
    spawn_echo_server_on("127.0.0.1:0").await
}

/// Connect once the forwarder has bound its listener
pub async fn connect_when_ready(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + WAIT;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return stream,
            Err(e) if Instant::now() >= deadline => panic!("forwarder never listened on {}: {}", addr, e),
            Err(_) => sleep(Duration::from_millis(20)).await,
        }
    }
}

/// Send `payload` and read back as many bytes. The stream is dropped
/// afterwards; a half-close would tear the forwarded pair down early.
pub async fn exchange(stream: TcpStream, payload: &[u8]) -> Vec<u8> {
    let (mut reader, mut writer) = stream.into_split();
    let payload = payload.to_vec();
    let expected = payload.len();
    let sender = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut received = vec![0u8; expected];
    timeout(WAIT, reader.read_exact(&mut received))
        .await
        .expect("timed out waiting for the reply")
        .unwrap();
    drop(sender.await.unwrap());
    received
}

/// Read until the peer closes; a reset counts as closed
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let _ = timeout(WAIT, stream.read_to_end(&mut received))
        .await
        .expect("connection was never closed");
    received
}

/// Poll a file until it holds exactly `expected`
pub async fn wait_for_file(path: &Path, expected: &[u8]) {
    let deadline = Instant::now() + WAIT;
    loop {
        let contents = std::fs::read(path).unwrap_or_default();
        if contents == expected {
            return;
        }
        if Instant::now() >= deadline {
            panic!(
                "{} holds {:?}, expected {:?}",
                path.display(),
                String::from_utf8_lossy(&contents),
                String::from_utf8_lossy(expected)
            );
        }
        sleep(Duration::from_millis(20)).await;
    }
}
