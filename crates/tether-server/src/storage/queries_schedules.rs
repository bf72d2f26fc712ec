//! Script schedule queries.

use tether_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{ScheduleDetail, ScriptSchedule};
use crate::schedule::RepeatInterval;

/// Parameters for creating a schedule. Target IDs must already be scoped to the organization.
pub struct NewSchedule<'a> {
    pub organization_id: &'a str,
    pub name: &'a str,
    pub saved_script_id: &'a str,
    pub creator_id: &'a str,
    pub start_at: i64,
    pub interval: RepeatInterval,
    pub next_run: i64,
    pub run_on_next_connect: bool,
    pub device_ids: &'a [String],
    pub group_ids: &'a [String],
}

/// Stored form of a schedule after an update has been applied.
///
/// `None` target sets are left as they are; `Some` replaces the whole set.
pub struct ScheduleUpdate<'a> {
    pub schedule: &'a ScriptSchedule,
    pub device_ids: Option<&'a [String]>,
    pub group_ids: Option<&'a [String]>,
}

impl Database {
    pub async fn create_schedule(
        &self,
        params: &NewSchedule<'_>,
    ) -> Result<ScheduleDetail, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "INSERT INTO script_schedules (organization_id, name, saved_script_id, creator_id, created_at, start_at, repeat_interval, next_run, run_on_next_connect)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.organization_id)
        .bind(params.name)
        .bind(params.saved_script_id)
        .bind(params.creator_id)
        .bind(unix_timestamp())
        .bind(params.start_at)
        .bind(params.interval.as_str())
        .bind(params.next_run)
        .bind(params.run_on_next_connect)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        for device_id in params.device_ids {
            sqlx::query("INSERT OR IGNORE INTO schedule_devices (schedule_id, device_id) VALUES (?, ?)")
                .bind(id)
                .bind(device_id)
                .execute(&mut *tx)
                .await?;
        }
        for group_id in params.group_ids {
            sqlx::query("INSERT OR IGNORE INTO schedule_groups (schedule_id, group_id) VALUES (?, ?)")
                .bind(id)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.get_schedule(id, params.organization_id).await
    }

    pub async fn get_schedule(
        &self,
        id: i64,
        organization_id: &str,
    ) -> Result<ScheduleDetail, DatabaseError> {
        let schedule = sqlx::query_as::<_, ScriptSchedule>(
            "SELECT * FROM script_schedules WHERE id = ? AND organization_id = ?",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Schedule {id}")))?;

        self.schedule_detail(schedule).await
    }

    pub async fn list_schedules(
        &self,
        organization_id: &str,
    ) -> Result<Vec<ScheduleDetail>, DatabaseError> {
        let schedules = sqlx::query_as::<_, ScriptSchedule>(
            "SELECT * FROM script_schedules WHERE organization_id = ? ORDER BY name, id",
        )
        .bind(organization_id)
        .fetch_all(self.pool())
        .await?;

        let mut details = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            details.push(self.schedule_detail(schedule).await?);
        }
        Ok(details)
    }

    /// Every schedule, across organizations, whose next run is at or before `now`.
    pub async fn list_due_schedules(&self, now: i64) -> Result<Vec<ScheduleDetail>, DatabaseError> {
        let schedules = sqlx::query_as::<_, ScriptSchedule>(
            "SELECT * FROM script_schedules WHERE next_run <= ? ORDER BY next_run, id",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;

        let mut details = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            details.push(self.schedule_detail(schedule).await?);
        }
        Ok(details)
    }

    pub async fn update_schedule(
        &self,
        update: &ScheduleUpdate<'_>,
    ) -> Result<ScheduleDetail, DatabaseError> {
        let schedule = update.schedule;
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "UPDATE script_schedules SET name = ?, saved_script_id = ?, start_at = ?, repeat_interval = ?, next_run = ?, last_run = ?, run_on_next_connect = ?
             WHERE id = ? AND organization_id = ?",
        )
        .bind(&schedule.name)
        .bind(&schedule.saved_script_id)
        .bind(schedule.start_at)
        .bind(&schedule.repeat_interval)
        .bind(schedule.next_run)
        .bind(schedule.last_run)
        .bind(schedule.run_on_next_connect)
        .bind(schedule.id)
        .bind(&schedule.organization_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Schedule {}", schedule.id)));
        }

        if let Some(device_ids) = update.device_ids {
            sqlx::query("DELETE FROM schedule_devices WHERE schedule_id = ?")
                .bind(schedule.id)
                .execute(&mut *tx)
                .await?;
            for device_id in device_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO schedule_devices (schedule_id, device_id) VALUES (?, ?)",
                )
                .bind(schedule.id)
                .bind(device_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        if let Some(group_ids) = update.group_ids {
            sqlx::query("DELETE FROM schedule_groups WHERE schedule_id = ?")
                .bind(schedule.id)
                .execute(&mut *tx)
                .await?;
            for group_id in group_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO schedule_groups (schedule_id, group_id) VALUES (?, ?)",
                )
                .bind(schedule.id)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        self.get_schedule(schedule.id, &schedule.organization_id)
            .await
    }

    pub async fn delete_schedule(
        &self,
        id: i64,
        organization_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("DELETE FROM script_schedules WHERE id = ? AND organization_id = ?")
                .bind(id)
                .bind(organization_id)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record that a schedule fired at `last_run` and will next fire at `next_run`.
    pub async fn mark_schedule_run(
        &self,
        id: i64,
        last_run: i64,
        next_run: i64,
    ) -> Result<(), DatabaseError> {
        let result =
            sqlx::query("UPDATE script_schedules SET last_run = ?, next_run = ? WHERE id = ?")
                .bind(last_run)
                .bind(next_run)
                .bind(id)
                .execute(self.pool())
                .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Schedule {id}")));
        }
        Ok(())
    }

    /// Load a schedule by ID regardless of organization (scheduler use only).
    pub async fn get_schedule_by_id(&self, id: i64) -> Result<ScriptSchedule, DatabaseError> {
        sqlx::query_as::<_, ScriptSchedule>("SELECT * FROM script_schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Schedule {id}")))
    }

    async fn schedule_detail(
        &self,
        schedule: ScriptSchedule,
    ) -> Result<ScheduleDetail, DatabaseError> {
        let saved_script_name =
            sqlx::query_scalar::<_, String>("SELECT name FROM saved_scripts WHERE id = ?")
                .bind(&schedule.saved_script_id)
                .fetch_optional(self.pool())
                .await?;
        let device_ids = sqlx::query_scalar::<_, String>(
            "SELECT device_id FROM schedule_devices WHERE schedule_id = ? ORDER BY device_id",
        )
        .bind(schedule.id)
        .fetch_all(self.pool())
        .await?;
        let device_group_ids = sqlx::query_scalar::<_, String>(
            "SELECT group_id FROM schedule_groups WHERE schedule_id = ? ORDER BY group_id",
        )
        .bind(schedule.id)
        .fetch_all(self.pool())
        .await?;

        Ok(ScheduleDetail {
            schedule,
            saved_script_name,
            device_ids,
            device_group_ids,
        })
    }
}
