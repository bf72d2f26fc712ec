//! `Tether` Core Library
//!
//! Shared functionality for `Tether` components:
//! - NDJSON wire protocol spoken between the control plane and its agents
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and timestamp conversions
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
