//! Transport Module
//!
//! A rule's transport is chosen once, when its listener manager is built.
//! Everything downstream works on [`BoxedStream`]s and never looks at the
//! transport type again.

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{split_host_port, TransportKind};
use crate::Result;

pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// A connected, bidirectional byte stream
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ForwardStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn ForwardStream>;

/// Listen and dial capability for one transport family
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Size of the per-direction copy buffer used by relays
    fn copy_buffer_size(&self) -> usize;

    /// Bind a listener on `addr`. An empty host listens on all interfaces.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;

    /// Open a stream to `addr`. An empty host dials the local machine.
    async fn dial(&self, addr: &str) -> Result<BoxedStream>;
}

/// A bound socket handing out inbound streams
#[async_trait]
pub trait Listener: Send {
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Wait for the next inbound stream. An error here is fatal to the listener.
    async fn accept(&mut self) -> Result<(BoxedStream, SocketAddr)>;
}

/// Chooses the transport each rule's listener manager is built with
pub type TransportFactory = Arc<dyn Fn(TransportKind) -> Arc<dyn Transport> + Send + Sync>;

/// Pick the transport implementation for a rule
pub fn for_kind(kind: TransportKind) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Tcp => Arc::new(TcpTransport),
        TransportKind::Udp => Arc::new(UdpTransport::default()),
    }
}

/// Address to hand to the OS when binding.
///
/// An empty host binds the IPv4 wildcard only; IPv6 clients need an
/// explicit `[::]` source.
pub(crate) fn listen_target(addr: &str) -> Result<String> {
    with_default_host(addr, "0.0.0.0")
}

/// Address to hand to the OS when dialing
pub(crate) fn dial_target(addr: &str) -> Result<String> {
    with_default_host(addr, "127.0.0.1")
}

fn with_default_host(addr: &str, default_host: &str) -> Result<String> {
    let (host, port) = split_host_port(addr)?;
    Ok(match host {
        "" => format!("{}:{}", default_host, port),
        host if host.contains(':') => format!("[{}]:{}", host, port),
        host => format!("{}:{}", host, port),
    })
}
