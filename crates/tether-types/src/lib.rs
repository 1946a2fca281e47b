//! Shared types and error hierarchy for Tether.

pub mod error;
pub mod tool;

pub use error::{ConfigError, DiscoveryError, LinkError};
pub use tool::*;
