//! Tether Control Plane Library
//!
//! Core functionality for the Tether server:
//! - Session registry for connected agents
//! - Command and script dispatch with reply correlation
//! - Capability tokens handed to agents with each instruction
//! - Recurring schedules and deferred runs
//! - Chunked file transfer in both directions
//! - SQLite storage for devices, scripts, runs, results, and schedules
//! - Agent hub speaking the NDJSON wire protocol

pub mod auth;
pub mod dispatch;
pub mod hub;
pub mod registry;
pub mod schedule;
pub mod service;
pub mod storage;
pub mod transfer;

pub use service::{ControlPlane, ControlPlaneOptions, ServiceError};
