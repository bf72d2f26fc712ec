//! Command and script dispatch to connected agents.
//!
//! Ad-hoc commands go to one device and the caller waits (bounded) for the
//! correlated reply. Saved scripts fan out to every reachable device and
//! return at once; per-device results arrive later and update the run.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout_at};
use tracing::{info, instrument, warn};

use tether_core::db::unix_timestamp;
use tether_core::protocol::{ScriptInputType, ScriptResultReport, ServerMessage, Shell};

use super::correlation::CorrelationTable;
use crate::auth::{CapabilityClaims, TokenError, TokenIssuer};
use crate::registry::{AgentSession, SessionRegistry};
use crate::storage::{
    Database, DatabaseError, NewScriptResult, NewScriptRun, ScriptResult, ScriptRun,
};

/// A single command for a single device.
pub struct AdHocCommand<'a> {
    pub organization_id: &'a str,
    pub device_id: &'a str,
    pub shell: Shell,
    pub command: &'a str,
    /// Shown to the agent as the requester.
    pub sender: &'a str,
    pub input_type: ScriptInputType,
}

/// A saved script sent to many devices.
pub struct FanOutRequest<'a> {
    pub organization_id: &'a str,
    pub saved_script_id: &'a str,
    pub device_ids: &'a [String],
    pub initiator: &'a str,
    pub input_type: ScriptInputType,
    /// Offline devices of the organization get the run when they next connect.
    pub run_on_next_connect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanOutStatus {
    Queued,
    /// Nothing reachable and nothing deferred; no run was created.
    NoDevicesAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutOutcome {
    pub run_id: Option<i64>,
    /// Devices the script was pushed to now.
    pub device_count: usize,
    /// Offline devices that will receive the run on reconnect.
    pub deferred_count: usize,
    pub status: FanOutStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Device not online: {0}")]
    NotOnline(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Timed out waiting for result: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Result already reported: {0}")]
    AlreadyReported(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<DatabaseError> for DispatchError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            DatabaseError::Conflict(what) => Self::AlreadyReported(what),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Pushes instructions to agents and collects their replies.
#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    registry: SessionRegistry,
    correlations: CorrelationTable<String>,
    tokens: Arc<dyn TokenIssuer>,
    command_timeout: Duration,
    token_ttl_secs: i64,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        registry: SessionRegistry,
        tokens: Arc<dyn TokenIssuer>,
        command_timeout: Duration,
        token_ttl_secs: i64,
    ) -> Self {
        Self {
            db,
            registry,
            correlations: CorrelationTable::new(),
            tokens,
            command_timeout,
            token_ttl_secs,
        }
    }

    pub const fn correlations(&self) -> &CorrelationTable<String> {
        &self.correlations
    }

    fn mint(&self, organization_id: &str, scope: &str) -> Result<String, TokenError> {
        self.tokens
            .issue(organization_id, scope, unix_timestamp() + self.token_ttl_secs)
    }

    /// Check that `token` was minted for `organization_id` and covers `scope`.
    fn authorize(
        &self,
        token: &str,
        organization_id: &str,
        scope: &str,
    ) -> Result<(), DispatchError> {
        let claims = self
            .tokens
            .validate(token)
            .map_err(|e| DispatchError::Unauthorized(e.to_string()))?;
        if !claims.allows(organization_id, scope) {
            return Err(DispatchError::Unauthorized(format!(
                "token for '{}' in {} does not cover '{scope}' in {organization_id}",
                claims.scope, claims.sub
            )));
        }
        Ok(())
    }

    /// Run one command on one device and wait for its result.
    ///
    /// Waits at most the configured command timeout, counted from the start
    /// of the push, so a stalled outbound queue times out too. A device that
    /// drops off mid-wait is only noticed through that timeout.
    #[instrument(skip(self, command), fields(device_id = %command.device_id))]
    pub async fn run_ad_hoc_command(
        &self,
        command: &AdHocCommand<'_>,
    ) -> Result<ScriptResult, DispatchError> {
        let session = self
            .registry
            .get(command.device_id)
            .await
            .ok_or_else(|| DispatchError::NotOnline(command.device_id.to_string()))?;
        if session.organization_id != command.organization_id {
            return Err(DispatchError::Unauthorized(format!(
                "device {} is not in organization {}",
                command.device_id, command.organization_id
            )));
        }

        let deadline = Instant::now() + self.command_timeout;
        let request_id = uuid::Uuid::new_v4().to_string();
        let auth_token = self.mint(
            command.organization_id,
            &CapabilityClaims::command_scope(&request_id),
        )?;

        let reply = self
            .correlations
            .register(
                request_id.clone(),
                session.connection_id.clone(),
                self.command_timeout,
            )
            .await;

        let frame = ServerMessage::ExecuteCommand {
            shell: command.shell,
            auth_token,
            request_id: request_id.clone(),
            command: command.command.to_string(),
            sender: command.sender.to_string(),
            input_type: command.input_type,
        };
        match timeout_at(deadline, session.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.correlations.remove(&request_id).await;
                return Err(DispatchError::NotOnline(command.device_id.to_string()));
            }
            Err(_) => {
                self.correlations.remove(&request_id).await;
                warn!(request_id = %request_id, "Outbound queue full, command not sent");
                return Err(DispatchError::Timeout(request_id));
            }
        }
        info!(request_id = %request_id, shell = %command.shell, "Command dispatched");

        match timeout_at(deadline, reply).await {
            Ok(Ok(result_id)) => Ok(self.db.get_script_result(&result_id).await?),
            Ok(Err(_)) => {
                self.correlations.remove(&request_id).await;
                Err(DispatchError::NotFound(request_id))
            }
            Err(_) => {
                self.correlations.remove(&request_id).await;
                warn!(request_id = %request_id, "Command timed out");
                Err(DispatchError::Timeout(request_id))
            }
        }
    }

    /// Accept an agent's reply to an ad-hoc command.
    ///
    /// Returns `Ok(false)` when nobody is waiting for `request_id` any more;
    /// nothing is kept in that case. The waiter is claimed before the result
    /// is stored, so concurrent replies store at most one row.
    #[instrument(skip(self, auth_token, report), fields(device_id = %report.device_id))]
    pub async fn submit_result(
        &self,
        auth_token: &str,
        request_id: &str,
        input_type: ScriptInputType,
        report: &ScriptResultReport,
    ) -> Result<bool, DispatchError> {
        let device = match self.db.get_device(&report.device_id).await {
            Ok(device) => device,
            Err(DatabaseError::NotFound(_)) => {
                return Err(DispatchError::Unauthorized(format!(
                    "unknown device {}",
                    report.device_id
                )));
            }
            Err(e) => return Err(e.into()),
        };
        self.authorize(
            auth_token,
            &device.organization_id,
            &CapabilityClaims::command_scope(request_id),
        )?;
        let Some(reply) = self.correlations.take(request_id).await else {
            info!(request_id = %request_id, "Result for unknown or expired request dropped");
            return Ok(false);
        };

        let result_id = uuid::Uuid::new_v4().to_string();
        self.db
            .record_script_result(&NewScriptResult {
                id: &result_id,
                organization_id: &device.organization_id,
                script_run_id: None,
                saved_script_id: None,
                input_type,
                report,
            })
            .await?;

        if reply.deliver(result_id.clone()) {
            return Ok(true);
        }
        info!(request_id = %request_id, "Waiter left before the result was stored");
        self.db.delete_script_result(&result_id).await?;
        Ok(false)
    }

    /// Send a saved script to every reachable device among `request.device_ids`.
    ///
    /// Returns as soon as the run exists; pushes happen concurrently in the background.
    #[instrument(skip(self, request), fields(saved_script_id = %request.saved_script_id))]
    pub async fn run_saved_script(
        &self,
        request: &FanOutRequest<'_>,
    ) -> Result<FanOutOutcome, DispatchError> {
        let script = self
            .db
            .get_saved_script(request.saved_script_id, request.organization_id)
            .await?;
        let shell = script.shell()?;

        let online = self
            .registry
            .online_in_org(request.organization_id, request.device_ids)
            .await;
        let deferred = if request.run_on_next_connect {
            self.offline_members(request.organization_id, request.device_ids, &online)
                .await?
        } else {
            Vec::new()
        };

        if online.is_empty() && deferred.is_empty() {
            info!("No devices available for script run");
            return Ok(FanOutOutcome {
                run_id: None,
                device_count: 0,
                deferred_count: 0,
                status: FanOutStatus::NoDevicesAvailable,
            });
        }

        let online_ids: Vec<String> = online.iter().map(|s| s.device_id.clone()).collect();
        let run = self
            .db
            .create_script_run(&NewScriptRun {
                organization_id: request.organization_id,
                saved_script_id: Some(&script.id),
                initiator: request.initiator,
                input_type: request.input_type,
                shell,
                script_content: &script.content,
                run_on_next_connect: request.run_on_next_connect,
                device_ids: &online_ids,
            })
            .await?;

        if !deferred.is_empty() {
            self.db.add_deferred_runs(run.id, &deferred).await?;
        }

        if !online.is_empty() {
            let frame = self.run_script_frame(&run, shell)?;
            push_all(online, frame);
        }

        info!(
            run_id = run.id,
            device_count = online_ids.len(),
            deferred_count = deferred.len(),
            "Script run queued"
        );
        Ok(FanOutOutcome {
            run_id: Some(run.id),
            device_count: online_ids.len(),
            deferred_count: deferred.len(),
            status: FanOutStatus::Queued,
        })
    }

    /// Known devices of the organization in `device_ids` that are not in `online`.
    async fn offline_members(
        &self,
        organization_id: &str,
        device_ids: &[String],
        online: &[Arc<AgentSession>],
    ) -> Result<Vec<String>, DispatchError> {
        let devices = self.db.get_devices(device_ids).await?;
        Ok(devices
            .into_iter()
            .filter(|d| d.organization_id == organization_id)
            .filter(|d| !online.iter().any(|s| s.device_id == d.id))
            .map(|d| d.id)
            .collect())
    }

    fn run_script_frame(&self, run: &ScriptRun, shell: Shell) -> Result<ServerMessage, DispatchError> {
        let auth_token = self.mint(
            &run.organization_id,
            &CapabilityClaims::script_run_scope(run.id),
        )?;
        Ok(ServerMessage::RunScript {
            saved_script_id: run.saved_script_id.clone(),
            script_run_id: run.id,
            initiator: run.initiator.clone(),
            input_type: run.input_type()?,
            auth_token,
            shell,
            content: run.script_content.clone(),
        })
    }

    /// Store one device's result for a script run and bump the run's counters.
    ///
    /// Only devices the run was sent to may report, once each.
    #[instrument(skip(self, auth_token, report), fields(device_id = %report.device_id))]
    pub async fn record_run_result(
        &self,
        auth_token: &str,
        script_run_id: i64,
        report: &ScriptResultReport,
    ) -> Result<ScriptResult, DispatchError> {
        let run = self.db.get_script_run_by_id(script_run_id).await?;
        self.authorize(
            auth_token,
            &run.organization_id,
            &CapabilityClaims::script_run_scope(run.id),
        )?;
        if !self.db.is_run_device(run.id, &report.device_id).await? {
            return Err(DispatchError::Unauthorized(format!(
                "device {} is not part of run {}",
                report.device_id, run.id
            )));
        }

        let result_id = uuid::Uuid::new_v4().to_string();
        let result = self
            .db
            .record_script_result(&NewScriptResult {
                id: &result_id,
                organization_id: &run.organization_id,
                script_run_id: Some(run.id),
                saved_script_id: run.saved_script_id.as_deref(),
                input_type: run.input_type()?,
                report,
            })
            .await?;

        info!(
            run_id = run.id,
            had_errors = report.had_errors,
            "Script run result recorded"
        );
        Ok(result)
    }

    /// Push every run deferred for `device_id` now that it is connected.
    ///
    /// A run stays deferred until its push succeeds. Returns how many were pushed.
    #[instrument(skip(self))]
    pub async fn replay_deferred(&self, device_id: &str) -> Result<usize, DispatchError> {
        let runs = self.db.deferred_runs_for_device(device_id).await?;
        if runs.is_empty() {
            return Ok(0);
        }

        let session = self
            .registry
            .get(device_id)
            .await
            .ok_or_else(|| DispatchError::NotOnline(device_id.to_string()))?;

        let mut pushed = 0;
        for run in runs {
            let frame = self.run_script_frame(&run, run.shell()?)?;
            if session.send(frame).await.is_err() {
                warn!(run_id = run.id, "Connection closed while replaying deferred runs");
                break;
            }
            self.db.add_run_device(run.id, device_id).await?;
            self.db.delete_deferred_run(run.id, device_id).await?;
            pushed += 1;
        }

        info!(count = pushed, "Deferred runs replayed");
        Ok(pushed)
    }
}

/// Push `frame` to every session concurrently without waiting.
fn push_all(sessions: Vec<Arc<AgentSession>>, frame: ServerMessage) {
    for session in sessions {
        let frame = frame.clone();
        tokio::spawn(async move {
            if session.send(frame).await.is_err() {
                warn!(device_id = %session.device_id, "Failed to push script to agent");
            }
        });
    }
}
