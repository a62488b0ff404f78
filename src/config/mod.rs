//! Configuration Module
//!
//! Handles configuration loading, variable substitution and rule validation.

pub mod manager;
pub mod types;

pub use manager::{substitute_variables, ConfigFormat, ConfigManager};
pub use types::*;
