//! TCP Transport

use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{dial_target, listen_target, BoxedStream, Listener, Transport};
use crate::config::TransportKind;
use crate::Result;

const COPY_BUFFER_SIZE: usize = 8192;

/// Plain TCP; also serves the `http` and `https` rule aliases
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn copy_buffer_size(&self) -> usize {
        COPY_BUFFER_SIZE
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let target = listen_target(addr)?;
        let listener = TcpListener::bind(&target)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {}", addr))?;
        Ok(Box::new(TcpForwardListener { inner: listener }))
    }

    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        let target = dial_target(addr)?;
        let stream = TcpStream::connect(&target)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        // Latency hint only
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

struct TcpForwardListener {
    inner: TcpListener,
}

#[async_trait]
impl Listener for TcpForwardListener {
    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .local_addr()
            .context("Failed to read TCP listener address")
    }

    async fn accept(&mut self) -> Result<(BoxedStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await.context("TCP accept failed")?;
        Ok((Box::new(stream), peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_listen_accept_dial() {
        let transport = TcpTransport;
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dial = tokio::spawn(async move {
            let mut stream = TcpTransport.dial(&addr.to_string()).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let (mut inbound, _peer) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        dial.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let first = TcpTransport.listen("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap();
        assert!(TcpTransport.listen(&addr.to_string()).await.is_err());
    }
}
