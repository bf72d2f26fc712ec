//! SQLite storage for the Tether control plane.
//!
//! Provides persistence for devices and groups, saved scripts, script runs
//! and their results, schedules, and runs deferred until a device reconnects.

mod db;
mod models;
mod queries;
mod queries_runs;
mod queries_schedules;
mod queries_scripts;


pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries_runs::{NewScriptResult, NewScriptRun};
pub use queries_schedules::{NewSchedule, ScheduleUpdate};
pub use queries_scripts::{NewSavedScript, SavedScriptUpdate};
