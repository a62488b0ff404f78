//! Data Relay Module
//!
//! Handles bidirectional data relay between an accepted connection and its
//! destination.

pub mod engine;
pub mod session;
pub mod tee;

pub use engine::Relay;
pub use session::{ConnectionStats, Direction, RelaySession};
pub use tee::TeeFile;
