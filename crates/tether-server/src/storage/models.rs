//! Data models for Tether control plane storage.

use serde::{Deserialize, Serialize};

use tether_core::db::DatabaseError;
use tether_core::protocol::{ScriptInputType, Shell};

use crate::schedule::RepeatInterval;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub organization_id: String,
    pub device_name: String,
    pub alias: Option<String>,
    pub last_online: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceGroup {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SavedScript {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub content: String,
    pub shell: String,
    pub folder_path: Option<String>,
    pub creator_id: String,
    pub is_public: bool,
    pub is_quick_script: bool,
    pub generate_alert_on_error: bool,
    pub send_email_on_error: bool,
    pub send_error_email_to: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SavedScript {
    pub fn shell(&self) -> Result<Shell, DatabaseError> {
        self.shell
            .parse()
            .map_err(|_| DatabaseError::Corrupt(format!("shell '{}'", self.shell)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScriptRun {
    pub id: i64,
    pub organization_id: String,
    pub saved_script_id: Option<String>,
    pub initiator: String,
    pub input_type: String,
    /// Shell and content are copied from the saved script when the run is
    /// created; later edits to the script do not reach this run.
    pub shell: String,
    pub script_content: String,
    pub run_at: i64,
    pub run_on_next_connect: bool,
    pub success_count: i64,
    pub failure_count: i64,
}

impl ScriptRun {
    pub fn shell(&self) -> Result<Shell, DatabaseError> {
        self.shell
            .parse()
            .map_err(|_| DatabaseError::Corrupt(format!("shell '{}'", self.shell)))
    }

    pub fn input_type(&self) -> Result<ScriptInputType, DatabaseError> {
        self.input_type
            .parse()
            .map_err(|_| DatabaseError::Corrupt(format!("input type '{}'", self.input_type)))
    }
}

/// A run as shown in history listings.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScriptRunSummary {
    pub id: i64,
    pub run_at: i64,
    pub initiator: String,
    pub input_type: String,
    pub saved_script_id: Option<String>,
    pub saved_script_name: Option<String>,
    pub device_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
}

/// One device's outcome within a run detail.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScriptRunResultRow {
    pub id: String,
    pub device_id: String,
    pub device_name: Option<String>,
    pub had_errors: bool,
    pub standard_output: String,
    pub error_output: String,
    pub run_time_ms: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRunDetail {
    pub summary: ScriptRunSummary,
    pub results: Vec<ScriptRunResultRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScriptResult {
    pub id: String,
    pub organization_id: String,
    pub device_id: String,
    pub script_run_id: Option<i64>,
    pub saved_script_id: Option<String>,
    pub shell: String,
    pub script_input: String,
    pub input_type: String,
    pub sender_user_name: Option<String>,
    pub had_errors: bool,
    /// JSON array of lines.
    pub standard_output: String,
    /// JSON array of lines.
    pub error_output: String,
    pub run_time_ms: i64,
    pub timestamp: i64,
}

impl ScriptResult {
    pub fn standard_output_lines(&self) -> Vec<String> {
        serde_json::from_str(&self.standard_output).unwrap_or_default()
    }

    pub fn error_output_lines(&self) -> Vec<String> {
        serde_json::from_str(&self.error_output).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScriptSchedule {
    pub id: i64,
    pub organization_id: String,
    pub name: String,
    pub saved_script_id: String,
    pub creator_id: String,
    pub created_at: i64,
    pub start_at: i64,
    pub repeat_interval: String,
    pub next_run: i64,
    pub last_run: Option<i64>,
    pub run_on_next_connect: bool,
}

impl ScriptSchedule {
    pub fn interval(&self) -> Result<RepeatInterval, DatabaseError> {
        self.repeat_interval
            .parse()
            .map_err(|_| DatabaseError::Corrupt(format!("interval '{}'", self.repeat_interval)))
    }
}

/// A schedule together with its target sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDetail {
    pub schedule: ScriptSchedule,
    pub saved_script_name: Option<String>,
    pub device_ids: Vec<String>,
    pub device_group_ids: Vec<String>,
}

/// Query filter for run history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptRunFilter {
    pub saved_script_id: Option<String>,
    pub device_id: Option<String>,
    /// Inclusive lower bound, unix seconds.
    pub start_date: Option<i64>,
    /// Inclusive upper bound, unix seconds.
    pub end_date: Option<i64>,
    pub page: u32,
    pub page_size: u32,
}

impl ScriptRunFilter {
    pub const DEFAULT_PAGE_SIZE: u32 = 20;
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Clamp paging: page is at least 1, page size falls back to 20 and is capped at 100.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.page_size = match self.page_size {
            0 => Self::DEFAULT_PAGE_SIZE,
            n => n.min(Self::MAX_PAGE_SIZE),
        };
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub total_count: i64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> PagedResult<T> {
    pub fn total_pages(&self) -> i64 {
        if self.page_size == 0 {
            return 0;
        }
        let size = i64::from(self.page_size);
        (self.total_count + size - 1) / size
    }

    pub fn has_next_page(&self) -> bool {
        i64::from(self.page) < self.total_pages()
    }

    pub const fn has_previous_page(&self) -> bool {
        self.page > 1
    }
}
