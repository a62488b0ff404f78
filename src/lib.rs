//! portrelay Library
//!
//! Configuration-driven port forwarder: every enabled rule gets its own
//! listener, and every accepted connection is relayed byte-for-byte to the
//! rule's destination.

pub mod config;
pub mod engine;
pub mod listener;
pub mod relay;
pub mod report;
pub mod shutdown;
pub mod transport;

pub use config::{ConfigManager, ForwardRule, ProxyConfig, TransportKind};
pub use engine::{Engine, EngineSummary};
pub use listener::{ListenerExit, ListenerManager, ListenerState};
pub use report::{ForwardEvent, NullSink, StatusSink, TracingSink};

/// Common error type for the forwarder
pub type Result<T> = anyhow::Result<T>;
