//! UDP Transport
//!
//! UDP has no connections, so the listener fakes them: every remote peer
//! address becomes one inbound session, fed by the listener's receive loop
//! through a bounded queue. Replies go out of the shared listening socket.
//! The outbound side is an ephemeral socket connected to the destination.
//!
//! A datagram stream has no end of its own. A session reads as EOF once no
//! datagram has moved in either direction for the session idle time, which
//! ends its relay and frees the outbound socket.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{sleep, Instant, Sleep};

use super::{dial_target, listen_target, BoxedStream, Listener, Transport};
use crate::config::TransportKind;
use crate::Result;

/// Largest datagram payload we forward
const MAX_DATAGRAM: usize = 65535;

/// Datagrams buffered per session before new ones are dropped
const SESSION_QUEUE: usize = 256;

/// Quiet time after which a peer session ends
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(60);

struct SessionEntry {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

type SessionTable = Arc<Mutex<HashMap<SocketAddr, SessionEntry>>>;

#[derive(Debug, Clone, Copy)]
pub struct UdpTransport {
    session_idle: Duration,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::with_session_idle(DEFAULT_SESSION_IDLE)
    }
}

impl UdpTransport {
    /// Transport whose peer sessions end after `session_idle` without traffic
    pub fn with_session_idle(session_idle: Duration) -> Self {
        Self { session_idle }
    }

    pub fn session_idle(&self) -> Duration {
        self.session_idle
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn copy_buffer_size(&self) -> usize {
        MAX_DATAGRAM
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let target = listen_target(addr)?;
        let socket = UdpSocket::bind(&target)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {}", addr))?;
        Ok(Box::new(UdpForwardListener::new(
            Arc::new(socket),
            self.session_idle,
        )))
    }

    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        let target = dial_target(addr)?;
        let remote = lookup_host(&target)
            .await
            .with_context(|| format!("Failed to resolve {}", addr))?
            .next()
            .ok_or_else(|| anyhow!("No addresses resolved for {}", addr))?;

        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .await
            .context("Failed to bind outbound UDP socket")?;
        socket
            .connect(remote)
            .await
            .with_context(|| format!("Failed to connect UDP socket to {}", addr))?;

        Ok(Box::new(UdpOutbound { socket }))
    }
}

struct UdpForwardListener {
    socket: Arc<UdpSocket>,
    sessions: SessionTable,
    buf: Vec<u8>,
    session_idle: Duration,
    next_id: u64,
}

impl UdpForwardListener {
    fn new(socket: Arc<UdpSocket>, session_idle: Duration) -> Self {
        Self {
            socket,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            buf: vec![0u8; MAX_DATAGRAM],
            session_idle,
            next_id: 0,
        }
    }

    /// Hand a datagram to its peer's session. Returns the id and receiving
    /// end of a new session when the peer has no live one.
    fn route(
        &mut self,
        peer: SocketAddr,
        datagram: Bytes,
    ) -> Result<Option<(u64, mpsc::Receiver<Bytes>)>> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("UDP session table poisoned"))?;

        let datagram = match sessions.get(&peer) {
            Some(entry) => match entry.tx.try_send(datagram) {
                Ok(()) => return Ok(None),
                // Dropped, as the network would
                Err(TrySendError::Full(_)) => return Ok(None),
                // Session is ending; start a fresh one
                Err(TrySendError::Closed(datagram)) => datagram,
            },
            None => datagram,
        };

        self.next_id += 1;
        let id = self.next_id;
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        // Queue is empty, so the first datagram always fits
        let _ = tx.try_send(datagram);
        sessions.insert(peer, SessionEntry { id, tx });
        Ok(Some((id, rx)))
    }

    fn session(&self, peer: SocketAddr, id: u64, rx: mpsc::Receiver<Bytes>) -> UdpInbound {
        UdpInbound {
            socket: Arc::clone(&self.socket),
            peer,
            id,
            rx,
            pending: Bytes::new(),
            sessions: Arc::clone(&self.sessions),
            idle_after: self.session_idle,
            last_activity: Instant::now(),
            idle: Box::pin(sleep(self.session_idle)),
            expired: false,
        }
    }
}

#[async_trait]
impl Listener for UdpForwardListener {
    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("Failed to read UDP socket address")
    }

    async fn accept(&mut self) -> Result<(BoxedStream, SocketAddr)> {
        loop {
            let (len, peer) = self
                .socket
                .recv_from(&mut self.buf)
                .await
                .context("UDP receive failed")?;
            let datagram = Bytes::copy_from_slice(&self.buf[..len]);

            if let Some((id, rx)) = self.route(peer, datagram)? {
                return Ok((Box::new(self.session(peer, id, rx)), peer));
            }
        }
    }
}

/// One remote peer of a UDP listener, seen as a stream
struct UdpInbound {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    id: u64,
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    sessions: SessionTable,
    idle_after: Duration,
    last_activity: Instant,
    idle: Pin<Box<Sleep>>,
    expired: bool,
}

impl UdpInbound {
    /// Ready once the session has been quiet for `idle_after`
    fn poll_idle(&mut self, cx: &mut TaskContext<'_>) -> Poll<()> {
        loop {
            ready!(self.idle.as_mut().poll(cx));
            let deadline = self.last_activity + self.idle_after;
            if Instant::now() >= deadline {
                return Poll::Ready(());
            }
            self.idle.as_mut().reset(deadline);
        }
    }
}

impl AsyncRead for UdpInbound {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(datagram)) => {
                    this.pending = datagram;
                    this.last_activity = Instant::now();
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending if this.expired => return Poll::Pending,
                Poll::Pending => {
                    ready!(this.poll_idle(cx));
                    // Refuse new datagrams, hand out what is queued, then EOF
                    this.expired = true;
                    this.rx.close();
                }
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpInbound {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = ready!(this.socket.poll_send_to(cx, buf, this.peer))?;
        this.last_activity = Instant::now();
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for UdpInbound {
    fn drop(&mut self) {
        // A newer session for the same peer may already own the entry
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions.get(&self.peer).is_some_and(|entry| entry.id == self.id) {
                sessions.remove(&self.peer);
            }
        }
    }
}

/// Ephemeral socket connected to the destination
struct UdpOutbound {
    socket: UdpSocket,
}

impl AsyncRead for UdpOutbound {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpOutbound {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
