//! Status Reporting
//!
//! The engine never writes log lines itself. Every notice is a
//! [`ForwardEvent`] handed to an injected [`StatusSink`], so the binary can
//! route events through `tracing` while tests record them.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::TransportKind;
use crate::relay::{ConnectionStats, Direction};

/// Severity an event is logged at
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Status notices emitted by the forwarding engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardEvent {
    RuleRunning {
        label: String,
        src: String,
        dst: String,
        transport: TransportKind,
    },
    RuleDisabled {
        label: String,
        src: String,
        dst: String,
        transport: TransportKind,
    },
    ListenerBound {
        label: String,
        local_addr: SocketAddr,
    },
    BindFailed {
        label: String,
        src: String,
        error: String,
    },
    AcceptFailed {
        label: String,
        src: String,
        error: String,
    },
    ListenerCrashed {
        error: String,
    },
    DialFailed {
        label: String,
        dst: String,
        error: String,
    },
    DirectionStarted {
        label: String,
        session_id: String,
        direction: Direction,
        src: String,
        dst: String,
    },
    RelayFailed {
        label: String,
        session_id: String,
        error: String,
    },
    TeeWriteFailed {
        label: String,
        session_id: String,
        path: PathBuf,
        error: String,
    },
    RelayFinished {
        label: String,
        stats: ConnectionStats,
    },
}

impl ForwardEvent {
    pub fn label(&self) -> Option<&str> {
        match self {
            ForwardEvent::RuleRunning { label, .. }
            | ForwardEvent::RuleDisabled { label, .. }
            | ForwardEvent::ListenerBound { label, .. }
            | ForwardEvent::BindFailed { label, .. }
            | ForwardEvent::AcceptFailed { label, .. }
            | ForwardEvent::DialFailed { label, .. }
            | ForwardEvent::DirectionStarted { label, .. }
            | ForwardEvent::RelayFailed { label, .. }
            | ForwardEvent::TeeWriteFailed { label, .. }
            | ForwardEvent::RelayFinished { label, .. } => Some(label),
            ForwardEvent::ListenerCrashed { .. } => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ForwardEvent::ListenerBound { .. } | ForwardEvent::RelayFinished { .. } => {
                Severity::Debug
            }
            ForwardEvent::RuleRunning { .. }
            | ForwardEvent::RuleDisabled { .. }
            | ForwardEvent::DirectionStarted { .. } => Severity::Info,
            ForwardEvent::DialFailed { .. }
            | ForwardEvent::RelayFailed { .. }
            | ForwardEvent::TeeWriteFailed { .. } => Severity::Warn,
            ForwardEvent::BindFailed { .. }
            | ForwardEvent::AcceptFailed { .. }
            | ForwardEvent::ListenerCrashed { .. } => Severity::Error,
        }
    }

    /// Events about a single connection; a silent rule drops these
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            ForwardEvent::DialFailed { .. }
                | ForwardEvent::DirectionStarted { .. }
                | ForwardEvent::RelayFailed { .. }
                | ForwardEvent::TeeWriteFailed { .. }
                | ForwardEvent::RelayFinished { .. }
        )
    }
}

impl fmt::Display for ForwardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardEvent::RuleRunning { label, src, dst, transport } => write!(
                f,
                "{} Proxy Running on {} Forwarding to {} Type:{}",
                label, src, dst, transport
            ),
            ForwardEvent::RuleDisabled { label, src, dst, transport } => write!(
                f,
                "{} Proxy Disabled Src: {} Dst: {} Type:{}",
                label, src, dst, transport
            ),
            ForwardEvent::ListenerBound { label, local_addr } => {
                write!(f, "{} listening on {}", label, local_addr)
            }
            ForwardEvent::BindFailed { label, src, error } => {
                write!(f, "{} failed to listen on {}: {}", label, src, error)
            }
            ForwardEvent::AcceptFailed { label, src, error } => {
                write!(f, "{} stopped accepting on {}: {}", label, src, error)
            }
            ForwardEvent::ListenerCrashed { error } => {
                write!(f, "Listener task crashed: {}", error)
            }
            ForwardEvent::DialFailed { label, dst, error } => {
                write!(f, "Error: Failed: {} dial {}: {}", label, dst, error)
            }
            ForwardEvent::DirectionStarted { direction, src, dst, .. } => match direction {
                Direction::Upstream => write!(f, "{} -> {}", src, dst),
                Direction::Downstream => write!(f, "{} <- {}", dst, src),
            },
            ForwardEvent::RelayFailed { label, session_id, error } => {
                write!(f, "{} session {} failed: {}", label, session_id, error)
            }
            ForwardEvent::TeeWriteFailed { label, session_id, path, error } => write!(
                f,
                "{} session {} stopped logging to {}: {}",
                label,
                session_id,
                path.display(),
                error
            ),
            ForwardEvent::RelayFinished { label, stats } => write!(
                f,
                "{} session {} closed: {} | Duration: {}ms | Up: {} bytes | Down: {} bytes",
                label,
                stats.session_id,
                stats.peer_addr,
                stats.duration_ms,
                stats.bytes_up,
                stats.bytes_down
            ),
        }
    }
}

/// Receiver of engine status events
pub trait StatusSink: Send + Sync {
    fn emit(&self, event: ForwardEvent);
}

/// Renders events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn emit(&self, event: ForwardEvent) {
        let label = event.label().unwrap_or("-");
        match event.severity() {
            Severity::Debug => debug!(label, "{}", event),
            Severity::Info => info!(label, "{}", event),
            Severity::Warn => warn!(label, "{}", event),
            Severity::Error => error!(label, "{}", event),
        }
    }
}

/// Discards every event; used when output is globally silenced
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn emit(&self, _event: ForwardEvent) {}
}

/// Per-rule view of a sink that honours the rule's `silent` flag
#[derive(Clone)]
pub struct RuleReporter {
    sink: Arc<dyn StatusSink>,
    silent: bool,
}

impl RuleReporter {
    pub fn new(sink: Arc<dyn StatusSink>, silent: bool) -> Self {
        Self { sink, silent }
    }

    pub fn emit(&self, event: ForwardEvent) {
        if self.silent && event.is_connection_scoped() {
            return;
        }
        self.sink.emit(event);
    }
}
