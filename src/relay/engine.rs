//! Relay Engine

use std::io;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{ConnectionStats, Direction, RelaySession, TeeFile};
use crate::config::ForwardRule;
use crate::report::{ForwardEvent, RuleReporter};
use crate::transport::BoxedStream;
use crate::Result;

/// Moves bytes between the two streams of a connection pair.
///
/// Each direction runs in its own task. Whichever direction ends first
/// signals the pair closed; the other stops at its next read or write, and
/// both streams are released once both tasks have returned. Only the
/// upstream direction is teed to the rule's log file.
pub struct Relay {
    rule: Arc<ForwardRule>,
    reporter: RuleReporter,
    buffer_size: usize,
}

impl Relay {
    pub fn new(rule: Arc<ForwardRule>, reporter: RuleReporter, buffer_size: usize) -> Self {
        Self {
            rule,
            reporter,
            buffer_size,
        }
    }

    /// Relay until either side ends.
    ///
    /// Fails only when the session cannot start (the log file cannot be
    /// opened); both streams are dropped in that case. Errors in the middle
    /// of a session are reported and the stats are still returned.
    pub async fn run(
        &self,
        session: RelaySession,
        inbound: BoxedStream,
        outbound: BoxedStream,
    ) -> Result<ConnectionStats> {
        let tee = match &self.rule.log {
            Some(path) => Some(
                TeeFile::open(path)
                    .await
                    .with_context(|| format!("Failed to open log file {}", path.display()))?,
            ),
            None => None,
        };

        let session = Arc::new(session);
        let (inbound_read, inbound_write) = tokio::io::split(inbound);
        let (outbound_read, outbound_write) = tokio::io::split(outbound);
        let (closed_tx, _) = broadcast::channel(1);

        let upstream = self.spawn_direction(
            Direction::Upstream,
            inbound_read,
            outbound_write,
            tee,
            &session,
            &closed_tx,
        );
        let downstream = self.spawn_direction(
            Direction::Downstream,
            outbound_read,
            inbound_write,
            None,
            &session,
            &closed_tx,
        );

        let (up, down) = tokio::join!(upstream, downstream);
        for result in [up, down] {
            let error = match result {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("relay task failed: {}", e),
            };
            self.reporter.emit(ForwardEvent::RelayFailed {
                label: self.rule.label.clone(),
                session_id: session.session_id.clone(),
                error,
            });
        }

        let stats = session.to_stats();
        self.reporter.emit(ForwardEvent::RelayFinished {
            label: self.rule.label.clone(),
            stats: stats.clone(),
        });
        Ok(stats)
    }

    fn spawn_direction<R, W>(
        &self,
        direction: Direction,
        reader: R,
        writer: W,
        tee: Option<TeeFile>,
        session: &Arc<RelaySession>,
        closed: &broadcast::Sender<()>,
    ) -> JoinHandle<io::Result<u64>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.reporter.emit(ForwardEvent::DirectionStarted {
            label: self.rule.label.clone(),
            session_id: session.session_id.clone(),
            direction,
            src: self.rule.src.clone(),
            dst: self.rule.dst.clone(),
        });

        let pump = Pump {
            direction,
            label: self.rule.label.clone(),
            session: Arc::clone(session),
            reporter: self.reporter.clone(),
            closed: closed.clone(),
            closed_rx: closed.subscribe(),
            buffer_size: self.buffer_size,
        };
        tokio::spawn(pump.run(reader, writer, tee))
    }
}

/// One copy direction of a relay
struct Pump {
    direction: Direction,
    label: String,
    session: Arc<RelaySession>,
    reporter: RuleReporter,
    closed: broadcast::Sender<()>,
    closed_rx: broadcast::Receiver<()>,
    buffer_size: usize,
}

impl Pump {
    async fn run<R, W>(
        mut self,
        mut reader: R,
        mut writer: W,
        mut tee: Option<TeeFile>,
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = self.copy(&mut reader, &mut writer, &mut tee).await;
        let _ = writer.shutdown().await;
        let _ = self.closed.send(());
        result
    }

    async fn copy<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        tee: &mut Option<TeeFile>,
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => read?,
                _ = self.closed_rx.recv() => return Ok(total),
            };
            if n == 0 {
                return Ok(total);
            }

            // Teed first: anything the destination may receive is in the log
            self.record(tee, &buf[..n]).await;

            tokio::select! {
                written = writer.write_all(&buf[..n]) => written?,
                _ = self.closed_rx.recv() => return Ok(total),
            }

            total += n as u64;
            self.session.add_bytes(self.direction, n as u64);
        }
    }

    /// Tee a chunk about to be forwarded. A failed write stops teeing for this session only.
    async fn record(&self, tee: &mut Option<TeeFile>, bytes: &[u8]) {
        let Some(file) = tee.as_mut() else {
            return;
        };

        if let Err(e) = file.record(bytes).await {
            self.reporter.emit(ForwardEvent::TeeWriteFailed {
                label: self.label.clone(),
                session_id: self.session.session_id.clone(),
                path: file.path().to_path_buf(),
                error: e.to_string(),
            });
            *tee = None;
        }
    }
}
