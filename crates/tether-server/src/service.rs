//! `ControlPlane`: the single entry point the boundary layer talks to.
//!
//! Wires the registry, dispatcher, schedule engine and file transfer over one
//! database, validates management input, and owns the background loops.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tether_core::protocol::{ScriptInputType, ScriptResultReport, ServerMessage};

use crate::auth::TokenIssuer;
use crate::dispatch::{AdHocCommand, DispatchError, Dispatcher, FanOutOutcome, FanOutRequest};
use crate::hub::AgentHub;
use crate::registry::{AgentSession, SessionRegistry};
use crate::schedule::{CreateSchedule, ScheduleEngine, ScheduleError, ScheduleFiring, UpdateSchedule};
use crate::storage::{
    Database, DatabaseError, Device, NewSavedScript, PagedResult, SavedScript, SavedScriptUpdate,
    ScheduleDetail, ScriptResult, ScriptRunDetail, ScriptRunFilter, ScriptRunSummary,
};
use crate::transfer::{ChunkReceiver, FileSender, ReceiveProgress, SendOutcome, TransferError};

pub const MAX_SCRIPT_NAME_LEN: usize = 100;
pub const MAX_FOLDER_PATH_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<DatabaseError> for ServiceError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Tunables for a [`ControlPlane`].
#[derive(Debug, Clone)]
pub struct ControlPlaneOptions {
    pub command_timeout: Duration,
    pub token_ttl_secs: i64,
    pub transfer_dir: PathBuf,
    pub chunk_size: usize,
    pub outbound_queue_depth: usize,
}

/// A device row plus its live connection state.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    #[serde(flatten)]
    pub device: Device,
    pub online: bool,
}

#[derive(Clone)]
pub struct ControlPlane {
    db: Database,
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    schedules: ScheduleEngine,
    receiver: Arc<ChunkReceiver>,
    sender: FileSender,
    outbound_queue_depth: usize,
}

impl ControlPlane {
    pub fn new(db: Database, tokens: Arc<dyn TokenIssuer>, options: ControlPlaneOptions) -> Self {
        let registry = SessionRegistry::new();
        let dispatcher = Dispatcher::new(
            db.clone(),
            registry.clone(),
            tokens,
            options.command_timeout,
            options.token_ttl_secs,
        );
        let schedules = ScheduleEngine::new(db.clone(), dispatcher.clone());
        let receiver = Arc::new(ChunkReceiver::new(options.transfer_dir));
        let sender = FileSender::new(registry.clone(), options.chunk_size);
        Self {
            db,
            registry,
            dispatcher,
            schedules,
            receiver,
            sender,
            outbound_queue_depth: options.outbound_queue_depth,
        }
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub const fn schedules(&self) -> &ScheduleEngine {
        &self.schedules
    }

    pub fn receiver(&self) -> &ChunkReceiver {
        &self.receiver
    }

    /// An agent hub wired to this control plane.
    pub fn hub(&self) -> AgentHub {
        AgentHub::new(
            self.db.clone(),
            self.registry.clone(),
            self.dispatcher.clone(),
            Arc::clone(&self.receiver),
            self.outbound_queue_depth,
        )
    }

    /// Start the schedule trigger and the correlation reaper.
    pub fn spawn_background(
        &self,
        schedule_tick: Option<Duration>,
        reap_interval: Duration,
        shutdown: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(tick) = schedule_tick {
            info!(tick_secs = tick.as_secs(), "Starting schedule trigger");
            handles.push(tokio::spawn(
                self.schedules.clone().run_trigger_loop(tick, shutdown.clone()),
            ));
        }
        handles.push(tokio::spawn(
            self.dispatcher
                .correlations()
                .clone()
                .run_reaper(reap_interval, shutdown.clone()),
        ));
        handles
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub async fn register_agent(
        &self,
        device_id: &str,
        connection_id: &str,
        organization_id: &str,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Arc<AgentSession> {
        self.registry
            .register(
                device_id.to_string(),
                connection_id.to_string(),
                organization_id.to_string(),
                outbound,
            )
            .await
    }

    /// Returns whether the connection still owned a session.
    pub async fn deregister_agent(&self, connection_id: &str) -> bool {
        self.registry.unregister(connection_id).await.is_some()
    }

    pub async fn list_devices(&self, organization_id: &str) -> Result<Vec<DeviceStatus>, ServiceError> {
        let online = self.registry.devices_for_org(organization_id).await;
        Ok(self
            .db
            .list_devices(organization_id)
            .await?
            .into_iter()
            .map(|device| DeviceStatus {
                online: online.contains(&device.id),
                device,
            })
            .collect())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    pub async fn run_ad_hoc_command(
        &self,
        command: &AdHocCommand<'_>,
    ) -> Result<ScriptResult, ServiceError> {
        if command.command.trim().is_empty() {
            return Err(ServiceError::Validation("command is empty".into()));
        }
        Ok(self.dispatcher.run_ad_hoc_command(command).await?)
    }

    pub async fn run_saved_script(
        &self,
        request: &FanOutRequest<'_>,
    ) -> Result<FanOutOutcome, ServiceError> {
        Ok(self.dispatcher.run_saved_script(request).await?)
    }

    pub async fn submit_result(
        &self,
        auth_token: &str,
        request_id: &str,
        input_type: ScriptInputType,
        report: &ScriptResultReport,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .dispatcher
            .submit_result(auth_token, request_id, input_type, report)
            .await?)
    }

    pub async fn submit_run_result(
        &self,
        auth_token: &str,
        script_run_id: i64,
        report: &ScriptResultReport,
    ) -> Result<ScriptResult, ServiceError> {
        Ok(self
            .dispatcher
            .record_run_result(auth_token, script_run_id, report)
            .await?)
    }

    // =========================================================================
    // File transfer
    // =========================================================================

    /// `owner` identifies the sender; only it may continue a transfer it started.
    pub async fn receive_chunk(
        &self,
        owner: &str,
        transfer_id: &str,
        file_name: &str,
        bytes: &[u8],
        is_start: bool,
        is_end: bool,
    ) -> Result<ReceiveProgress, ServiceError> {
        Ok(self
            .receiver
            .receive_chunk(owner, transfer_id, file_name, bytes, is_start, is_end)
            .await?)
    }

    pub async fn send_file(
        &self,
        device_id: &str,
        path: &Path,
        progress: impl Fn(f64) + Send,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, ServiceError> {
        Ok(self
            .sender
            .send_file(device_id, path, progress, cancel)
            .await?)
    }

    // =========================================================================
    // Saved scripts
    // =========================================================================

    pub async fn create_saved_script(
        &self,
        script: &NewSavedScript<'_>,
    ) -> Result<SavedScript, ServiceError> {
        validate_script_fields(Some(script.name), script.folder_path)?;
        let created = self.db.create_saved_script(script).await?;
        info!(script_id = %created.id, name = %created.name, "Saved script created");
        Ok(created)
    }

    pub async fn get_saved_script(
        &self,
        id: &str,
        organization_id: &str,
    ) -> Result<SavedScript, ServiceError> {
        Ok(self.db.get_saved_script(id, organization_id).await?)
    }

    /// Partial update; creator and organization never change.
    pub async fn update_saved_script(
        &self,
        id: &str,
        organization_id: &str,
        update: SavedScriptUpdate,
    ) -> Result<SavedScript, ServiceError> {
        validate_script_fields(
            update.name.as_deref(),
            update.folder_path.as_ref().and_then(Option::as_deref),
        )?;
        Ok(self
            .db
            .update_saved_script(id, organization_id, update)
            .await?)
    }

    /// Deleting a script removes its schedules and keeps its run history.
    pub async fn delete_saved_script(&self, id: &str, organization_id: &str) -> Result<(), ServiceError> {
        if self.db.delete_saved_script(id, organization_id).await? {
            info!(script_id = %id, "Saved script deleted");
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("Saved script {id}")))
        }
    }

    pub async fn list_saved_scripts(
        &self,
        organization_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<SavedScript>, ServiceError> {
        Ok(self.db.list_saved_scripts(organization_id, user_id).await?)
    }

    pub async fn list_quick_scripts(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Vec<SavedScript>, ServiceError> {
        Ok(self.db.list_quick_scripts(organization_id, user_id).await?)
    }

    // =========================================================================
    // Run history
    // =========================================================================

    pub async fn list_script_runs(
        &self,
        organization_id: &str,
        filter: ScriptRunFilter,
    ) -> Result<PagedResult<ScriptRunSummary>, ServiceError> {
        Ok(self.db.list_script_runs(organization_id, filter).await?)
    }

    pub async fn get_script_run(
        &self,
        id: i64,
        organization_id: &str,
    ) -> Result<ScriptRunDetail, ServiceError> {
        Ok(self.db.get_script_run_detail(id, organization_id).await?)
    }

    pub async fn delete_script_run(&self, id: i64, organization_id: &str) -> Result<(), ServiceError> {
        if self.db.delete_script_run(id, organization_id).await? {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("Script run {id}")))
        }
    }

    pub async fn delete_script_runs(
        &self,
        ids: &[i64],
        organization_id: &str,
    ) -> Result<u64, ServiceError> {
        if ids.is_empty() {
            return Err(ServiceError::Validation("no run ids given".into()));
        }
        Ok(self.db.delete_script_runs(ids, organization_id).await?)
    }

    pub async fn clear_script_runs(&self, organization_id: &str) -> Result<u64, ServiceError> {
        let removed = self.db.clear_script_runs(organization_id).await?;
        info!(organization_id = %organization_id, removed, "Run history cleared");
        Ok(removed)
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    pub async fn create_schedule(
        &self,
        request: &CreateSchedule<'_>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleDetail, ServiceError> {
        Ok(self.schedules.create(request, now).await?)
    }

    pub async fn get_schedule(
        &self,
        id: i64,
        organization_id: &str,
    ) -> Result<ScheduleDetail, ServiceError> {
        Ok(self.schedules.get(id, organization_id).await?)
    }

    pub async fn list_schedules(
        &self,
        organization_id: &str,
    ) -> Result<Vec<ScheduleDetail>, ServiceError> {
        Ok(self.schedules.list(organization_id).await?)
    }

    pub async fn update_schedule(
        &self,
        id: i64,
        organization_id: &str,
        update: UpdateSchedule,
        now: DateTime<Utc>,
    ) -> Result<ScheduleDetail, ServiceError> {
        Ok(self.schedules.update(id, organization_id, update, now).await?)
    }

    pub async fn delete_schedule(&self, id: i64, organization_id: &str) -> Result<(), ServiceError> {
        Ok(self.schedules.delete(id, organization_id).await?)
    }

    pub async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleDetail>, ServiceError> {
        Ok(self.schedules.list_due_schedules(now).await?)
    }

    pub async fn mark_run_and_advance(
        &self,
        schedule_id: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ServiceError> {
        Ok(self.schedules.mark_run_and_advance(schedule_id, now).await?)
    }

    pub async fn run_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleFiring>, ServiceError> {
        Ok(self.schedules.run_due_schedules(now).await?)
    }
}

fn validate_script_fields(name: Option<&str>, folder_path: Option<&str>) -> Result<(), ServiceError> {
    if let Some(name) = name {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation("script name is required".into()));
        }
        if name.chars().count() > MAX_SCRIPT_NAME_LEN {
            return Err(ServiceError::Validation(format!(
                "script name exceeds {MAX_SCRIPT_NAME_LEN} characters"
            )));
        }
    }
    if let Some(folder) = folder_path
        && folder.chars().count() > MAX_FOLDER_PATH_LEN
    {
        return Err(ServiceError::Validation(format!(
            "folder path exceeds {MAX_FOLDER_PATH_LEN} characters"
        )));
    }
    Ok(())
}
