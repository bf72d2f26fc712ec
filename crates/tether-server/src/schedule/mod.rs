//! Recurring script schedules.

pub mod engine;
pub mod next_run;


pub use engine::{CreateSchedule, ScheduleEngine, ScheduleFiring, UpdateSchedule};
pub use next_run::{RepeatInterval, compute_next_run};

use crate::dispatch::DispatchError;
use crate::storage::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Unknown repeat interval '{0}'. Use Hourly, Daily, Weekly, or Monthly.")]
    InvalidInterval(String),

    #[error("Next run falls outside the representable time range")]
    OutOfRange,

    #[error("Schedule not found: {0}")]
    NotFound(String),

    #[error("Saved script not found: {0}")]
    ScriptNotFound(String),

    #[error("Invalid schedule: {0}")]
    Invalid(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<DatabaseError> for ScheduleError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Storage(other.to_string()),
        }
    }
}
