//! Listener Module
//!
//! One listener manager per enabled forward rule.

pub mod manager;

pub use manager::{ListenerExit, ListenerManager, ListenerState};
