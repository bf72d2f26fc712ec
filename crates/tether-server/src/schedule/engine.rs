//! Schedule management and the time-driven trigger that fires due schedules.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use tether_core::db::to_datetime;
use tether_core::protocol::ScriptInputType;

use super::next_run::{RepeatInterval, compute_next_run};
use super::ScheduleError;
use crate::dispatch::{Dispatcher, FanOutOutcome, FanOutRequest};
use crate::storage::{Database, DatabaseError, NewSchedule, ScheduleDetail, ScheduleUpdate};

/// Fields for a new schedule.
pub struct CreateSchedule<'a> {
    pub organization_id: &'a str,
    pub name: &'a str,
    pub saved_script_id: &'a str,
    pub creator_id: &'a str,
    pub start_at: DateTime<Utc>,
    pub interval: RepeatInterval,
    pub run_on_next_connect: bool,
    pub device_ids: &'a [String],
    pub group_ids: &'a [String],
}

/// Partial schedule update. `None` leaves a field unchanged; target lists
/// replace the stored set wholesale when present.
#[derive(Debug, Clone, Default)]
pub struct UpdateSchedule {
    pub name: Option<String>,
    pub saved_script_id: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub interval: Option<RepeatInterval>,
    pub run_on_next_connect: Option<bool>,
    pub device_ids: Option<Vec<String>>,
    pub group_ids: Option<Vec<String>>,
}

/// What happened when one due schedule fired.
#[derive(Debug, Clone)]
pub struct ScheduleFiring {
    pub schedule_id: i64,
    /// `None` when the fan-out itself failed.
    pub outcome: Option<FanOutOutcome>,
    pub next_run: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ScheduleEngine {
    db: Database,
    dispatcher: Dispatcher,
}

impl ScheduleEngine {
    pub const fn new(db: Database, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    async fn ensure_script(
        &self,
        saved_script_id: &str,
        organization_id: &str,
    ) -> Result<(), ScheduleError> {
        self.db
            .get_saved_script(saved_script_id, organization_id)
            .await
            .map(|_| ())
            .map_err(|_| ScheduleError::ScriptNotFound(saved_script_id.to_string()))
    }

    /// Keep only device IDs known to belong to the organization.
    async fn scoped_devices(
        &self,
        organization_id: &str,
        device_ids: &[String],
    ) -> Result<Vec<String>, ScheduleError> {
        Ok(self
            .db
            .get_devices(device_ids)
            .await?
            .into_iter()
            .filter(|d| d.organization_id == organization_id)
            .map(|d| d.id)
            .collect())
    }

    /// Keep only group IDs known to belong to the organization.
    async fn scoped_groups(
        &self,
        organization_id: &str,
        group_ids: &[String],
    ) -> Result<Vec<String>, ScheduleError> {
        let mut scoped = Vec::new();
        for id in group_ids.iter().collect::<BTreeSet<_>>() {
            match self.db.get_device_group(id).await {
                Ok(group) if group.organization_id == organization_id => scoped.push(group.id),
                Ok(_) | Err(DatabaseError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(scoped)
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(
        &self,
        request: &CreateSchedule<'_>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleDetail, ScheduleError> {
        if request.name.trim().is_empty() {
            return Err(ScheduleError::Invalid("schedule name is required".into()));
        }
        self.ensure_script(request.saved_script_id, request.organization_id)
            .await?;

        let device_ids = self
            .scoped_devices(request.organization_id, request.device_ids)
            .await?;
        let group_ids = self
            .scoped_groups(request.organization_id, request.group_ids)
            .await?;
        let next_run = compute_next_run(request.start_at, request.interval, now)?;

        let detail = self
            .db
            .create_schedule(&NewSchedule {
                organization_id: request.organization_id,
                name: request.name,
                saved_script_id: request.saved_script_id,
                creator_id: request.creator_id,
                start_at: request.start_at.timestamp(),
                interval: request.interval,
                next_run: next_run.timestamp(),
                run_on_next_connect: request.run_on_next_connect,
                device_ids: &device_ids,
                group_ids: &group_ids,
            })
            .await?;

        info!(
            schedule_id = detail.schedule.id,
            next_run = %next_run,
            "Schedule created"
        );
        Ok(detail)
    }

    pub async fn get(
        &self,
        id: i64,
        organization_id: &str,
    ) -> Result<ScheduleDetail, ScheduleError> {
        Ok(self.db.get_schedule(id, organization_id).await?)
    }

    pub async fn list(&self, organization_id: &str) -> Result<Vec<ScheduleDetail>, ScheduleError> {
        Ok(self.db.list_schedules(organization_id).await?)
    }

    /// Apply a partial update. Next run is recomputed only when the start or interval changes.
    #[instrument(skip(self, update))]
    pub async fn update(
        &self,
        id: i64,
        organization_id: &str,
        update: UpdateSchedule,
        now: DateTime<Utc>,
    ) -> Result<ScheduleDetail, ScheduleError> {
        let mut schedule = self.db.get_schedule(id, organization_id).await?.schedule;

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(ScheduleError::Invalid("schedule name is required".into()));
            }
            schedule.name = name;
        }
        if let Some(script_id) = update.saved_script_id {
            schedule.saved_script_id = script_id;
        }
        self.ensure_script(&schedule.saved_script_id, organization_id)
            .await?;

        let old_start = schedule.start_at;
        let old_interval = schedule.interval()?;
        let start_at = update.start_at.map_or(old_start, |s| s.timestamp());
        let interval = update.interval.unwrap_or(old_interval);
        if start_at != old_start || interval != old_interval {
            schedule.start_at = start_at;
            schedule.repeat_interval = interval.as_str().to_string();
            schedule.next_run = compute_next_run(to_datetime(start_at)?, interval, now)?.timestamp();
        }
        if let Some(flag) = update.run_on_next_connect {
            schedule.run_on_next_connect = flag;
        }

        let device_ids = match update.device_ids {
            Some(ids) => Some(self.scoped_devices(organization_id, &ids).await?),
            None => None,
        };
        let group_ids = match update.group_ids {
            Some(ids) => Some(self.scoped_groups(organization_id, &ids).await?),
            None => None,
        };

        let detail = self
            .db
            .update_schedule(&ScheduleUpdate {
                schedule: &schedule,
                device_ids: device_ids.as_deref(),
                group_ids: group_ids.as_deref(),
            })
            .await?;
        info!(schedule_id = id, "Schedule updated");
        Ok(detail)
    }

    pub async fn delete(&self, id: i64, organization_id: &str) -> Result<(), ScheduleError> {
        if self.db.delete_schedule(id, organization_id).await? {
            info!(schedule_id = id, "Schedule deleted");
            Ok(())
        } else {
            Err(ScheduleError::NotFound(format!("Schedule {id}")))
        }
    }

    /// Schedules whose next run is at or before `now`.
    pub async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleDetail>, ScheduleError> {
        Ok(self.db.list_due_schedules(now.timestamp()).await?)
    }

    /// Record a firing at `now` and move the schedule to its next slot after `now`.
    pub async fn mark_run_and_advance(
        &self,
        schedule_id: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let schedule = self.db.get_schedule_by_id(schedule_id).await?;
        let next_run = compute_next_run(to_datetime(schedule.start_at)?, schedule.interval()?, now)?;
        self.db
            .mark_schedule_run(schedule_id, now.timestamp(), next_run.timestamp())
            .await?;
        Ok(next_run)
    }

    /// Fire every due schedule once.
    ///
    /// A schedule whose fan-out fails is still advanced so it does not fire
    /// again on every tick. A schedule that cannot be resolved or advanced is
    /// logged and skipped; the others still fire.
    #[instrument(skip(self))]
    pub async fn run_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleFiring>, ScheduleError> {
        let due = self.list_due_schedules(now).await?;
        let mut firings = Vec::with_capacity(due.len());

        for detail in due {
            let schedule = &detail.schedule;
            let targets = match self.resolve_targets(&detail).await {
                Ok(targets) => targets,
                Err(e) => {
                    warn!(schedule_id = schedule.id, error = %e, "Schedule targets unavailable, skipped");
                    continue;
                }
            };

            let outcome = match self
                .dispatcher
                .run_saved_script(&FanOutRequest {
                    organization_id: &schedule.organization_id,
                    saved_script_id: &schedule.saved_script_id,
                    device_ids: &targets,
                    initiator: &schedule.creator_id,
                    input_type: ScriptInputType::ScheduledScript,
                    run_on_next_connect: schedule.run_on_next_connect,
                })
                .await
            {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(schedule_id = schedule.id, error = %e, "Scheduled fan-out failed");
                    None
                }
            };

            let next_run = match self.mark_run_and_advance(schedule.id, now).await {
                Ok(next_run) => next_run,
                Err(e) => {
                    warn!(schedule_id = schedule.id, error = %e, "Schedule could not be advanced");
                    continue;
                }
            };
            info!(
                schedule_id = schedule.id,
                targets = targets.len(),
                next_run = %next_run,
                "Schedule fired"
            );
            firings.push(ScheduleFiring {
                schedule_id: schedule.id,
                outcome,
                next_run,
            });
        }

        Ok(firings)
    }

    /// Direct devices plus current members of the schedule's groups, deduplicated.
    async fn resolve_targets(&self, detail: &ScheduleDetail) -> Result<Vec<String>, ScheduleError> {
        let mut targets: BTreeSet<String> = detail.device_ids.iter().cloned().collect();
        targets.extend(self.db.group_member_ids(&detail.device_group_ids).await?);
        Ok(targets.into_iter().collect())
    }

    /// Fire due schedules every `tick` until `shutdown` is cancelled.
    pub async fn run_trigger_loop(self, tick: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(tick);
        interval.tick().await; // skip first immediate tick
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Schedule trigger stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_due_schedules(Utc::now()).await {
                        warn!(error = %e, "Schedule tick failed");
                    }
                }
            }
        }
    }
}
