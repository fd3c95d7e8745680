//! Tally core crate - error type, configuration and shared domain types.

pub mod config;
pub mod error;
pub mod types;

pub use config::TallyConfig;
pub use error::{Result, TallyError};
pub use types::*;
