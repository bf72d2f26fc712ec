//! Script run, result, and deferred-run queries.

use sqlx::{QueryBuilder, Sqlite};
use tether_core::db::unix_timestamp;
use tether_core::protocol::{ScriptInputType, ScriptResultReport, Shell};

use super::db::{Database, DatabaseError};
use super::models::{
    PagedResult, ScriptResult, ScriptRun, ScriptRunDetail, ScriptRunFilter, ScriptRunResultRow,
    ScriptRunSummary,
};

/// Parameters for creating a script run.
pub struct NewScriptRun<'a> {
    pub organization_id: &'a str,
    pub saved_script_id: Option<&'a str>,
    pub initiator: &'a str,
    pub input_type: ScriptInputType,
    pub shell: Shell,
    pub script_content: &'a str,
    pub run_on_next_connect: bool,
    pub device_ids: &'a [String],
}

/// Parameters for recording one device's result.
pub struct NewScriptResult<'a> {
    pub id: &'a str,
    pub organization_id: &'a str,
    pub script_run_id: Option<i64>,
    pub saved_script_id: Option<&'a str>,
    pub input_type: ScriptInputType,
    pub report: &'a ScriptResultReport,
}

const RUN_SUMMARY_SELECT: &str = "SELECT r.id, r.run_at, r.initiator, r.input_type, r.saved_script_id,
        s.name AS saved_script_name,
        (SELECT COUNT(*) FROM script_run_devices d WHERE d.run_id = r.id) AS device_count,
        r.success_count, r.failure_count
     FROM script_runs r
     LEFT JOIN saved_scripts s ON s.id = r.saved_script_id
     WHERE r.organization_id = ";

fn push_run_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &ScriptRunFilter) {
    if let Some(script_id) = &filter.saved_script_id {
        query.push(" AND r.saved_script_id = ");
        query.push_bind(script_id.clone());
    }
    if let Some(device_id) = &filter.device_id {
        query.push(
            " AND EXISTS (SELECT 1 FROM script_run_devices d WHERE d.run_id = r.id AND d.device_id = ",
        );
        query.push_bind(device_id.clone());
        query.push(")");
    }
    if let Some(start) = filter.start_date {
        query.push(" AND r.run_at >= ");
        query.push_bind(start);
    }
    if let Some(end) = filter.end_date {
        query.push(" AND r.run_at <= ");
        query.push_bind(end);
    }
}

impl Database {
    // =========================================================================
    // Script run queries
    // =========================================================================

    /// Create a run covering exactly `device_ids`.
    pub async fn create_script_run(
        &self,
        params: &NewScriptRun<'_>,
    ) -> Result<ScriptRun, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "INSERT INTO script_runs (organization_id, saved_script_id, initiator, input_type, shell, script_content, run_at, run_on_next_connect)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.organization_id)
        .bind(params.saved_script_id)
        .bind(params.initiator)
        .bind(params.input_type.as_str())
        .bind(params.shell.as_str())
        .bind(params.script_content)
        .bind(unix_timestamp())
        .bind(params.run_on_next_connect)
        .execute(&mut *tx)
        .await?;
        let run_id = result.last_insert_rowid();

        for device_id in params.device_ids {
            sqlx::query("INSERT OR IGNORE INTO script_run_devices (run_id, device_id) VALUES (?, ?)")
                .bind(run_id)
                .bind(device_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.get_script_run_by_id(run_id).await
    }

    pub async fn get_script_run_by_id(&self, id: i64) -> Result<ScriptRun, DatabaseError> {
        sqlx::query_as::<_, ScriptRun>("SELECT * FROM script_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Script run {id}")))
    }

    pub async fn get_script_run(
        &self,
        id: i64,
        organization_id: &str,
    ) -> Result<ScriptRun, DatabaseError> {
        sqlx::query_as::<_, ScriptRun>(
            "SELECT * FROM script_runs WHERE id = ? AND organization_id = ?",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Script run {id}")))
    }

    pub async fn run_device_ids(&self, run_id: i64) -> Result<Vec<String>, DatabaseError> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT device_id FROM script_run_devices WHERE run_id = ? ORDER BY device_id",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn is_run_device(&self, run_id: i64, device_id: &str) -> Result<bool, DatabaseError> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM script_run_devices WHERE run_id = ? AND device_id = ?",
        )
        .bind(run_id)
        .bind(device_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(found.is_some())
    }

    /// Attach a device to an existing run (used when a deferred run is replayed).
    pub async fn add_run_device(&self, run_id: i64, device_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("INSERT OR IGNORE INTO script_run_devices (run_id, device_id) VALUES (?, ?)")
            .bind(run_id)
            .bind(device_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Run history, newest first.
    pub async fn list_script_runs(
        &self,
        organization_id: &str,
        filter: ScriptRunFilter,
    ) -> Result<PagedResult<ScriptRunSummary>, DatabaseError> {
        let filter = filter.normalized();

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM script_runs r WHERE r.organization_id = ");
        count.push_bind(organization_id.to_string());
        push_run_filter(&mut count, &filter);
        let total_count = count
            .build_query_scalar::<i64>()
            .fetch_one(self.pool())
            .await?;

        let mut query = QueryBuilder::<Sqlite>::new(RUN_SUMMARY_SELECT);
        query.push_bind(organization_id.to_string());
        push_run_filter(&mut query, &filter);
        query.push(" ORDER BY r.run_at DESC, r.id DESC LIMIT ");
        query.push_bind(i64::from(filter.page_size));
        query.push(" OFFSET ");
        query.push_bind(i64::from(filter.page - 1) * i64::from(filter.page_size));
        let items = query
            .build_query_as::<ScriptRunSummary>()
            .fetch_all(self.pool())
            .await?;

        Ok(PagedResult {
            items,
            total_count,
            page: filter.page,
            page_size: filter.page_size,
        })
    }

    /// One run with every per-device result it has collected so far.
    pub async fn get_script_run_detail(
        &self,
        id: i64,
        organization_id: &str,
    ) -> Result<ScriptRunDetail, DatabaseError> {
        let mut query = QueryBuilder::<Sqlite>::new(RUN_SUMMARY_SELECT);
        query.push_bind(organization_id.to_string());
        query.push(" AND r.id = ");
        query.push_bind(id);
        let summary = query
            .build_query_as::<ScriptRunSummary>()
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Script run {id}")))?;

        let results = sqlx::query_as::<_, ScriptRunResultRow>(
            "SELECT sr.id, sr.device_id, d.device_name, sr.had_errors, sr.standard_output,
                    sr.error_output, sr.run_time_ms, sr.timestamp
             FROM script_results sr
             LEFT JOIN devices d ON d.id = sr.device_id
             WHERE sr.script_run_id = ?
             ORDER BY sr.timestamp",
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;

        Ok(ScriptRunDetail { summary, results })
    }

    pub async fn delete_script_run(
        &self,
        id: i64,
        organization_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM script_runs WHERE id = ? AND organization_id = ?")
            .bind(id)
            .bind(organization_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete several runs at once. Returns how many existed.
    pub async fn delete_script_runs(
        &self,
        ids: &[i64],
        organization_id: &str,
    ) -> Result<u64, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let mut deleted = 0;
        for &id in ids {
            deleted += sqlx::query("DELETE FROM script_runs WHERE id = ? AND organization_id = ?")
                .bind(id)
                .bind(organization_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    /// Delete the whole run history of an organization.
    pub async fn clear_script_runs(&self, organization_id: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM script_runs WHERE organization_id = ?")
            .bind(organization_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Script result queries
    // =========================================================================

    /// Store one device's result. When it belongs to a run, the run's
    /// success or failure counter moves in the same transaction.
    ///
    /// A device reports at most once per run; a repeat is a `Conflict` and
    /// leaves the counters alone.
    pub async fn record_script_result(
        &self,
        params: &NewScriptResult<'_>,
    ) -> Result<ScriptResult, DatabaseError> {
        let report = params.report;
        let standard_output = serde_json::to_string(&report.standard_output)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let error_output = serde_json::to_string(&report.error_output)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let run_time_ms = i64::try_from(report.run_time_ms).unwrap_or(i64::MAX);

        let mut tx = self.pool().begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO script_results (id, organization_id, device_id, script_run_id, saved_script_id, shell, script_input, input_type, sender_user_name, had_errors, standard_output, error_output, run_time_ms, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(params.id)
        .bind(params.organization_id)
        .bind(&report.device_id)
        .bind(params.script_run_id)
        .bind(params.saved_script_id)
        .bind(report.shell.as_str())
        .bind(&report.script_input)
        .bind(params.input_type.as_str())
        .bind(&report.sender_user_name)
        .bind(report.had_errors)
        .bind(standard_output)
        .bind(error_output)
        .bind(run_time_ms)
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Err(DatabaseError::Conflict(format!(
                "Result from {} for run {:?}",
                report.device_id, params.script_run_id
            )));
        }

        if let Some(run_id) = params.script_run_id {
            let (success, failure) = if report.had_errors { (0, 1) } else { (1, 0) };
            sqlx::query(
                "UPDATE script_runs SET success_count = success_count + ?, failure_count = failure_count + ? WHERE id = ?",
            )
            .bind(success)
            .bind(failure)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get_script_result(params.id).await
    }

    /// Drop a stored result. Counters are not touched, so only use this for
    /// results outside a run.
    pub async fn delete_script_result(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM script_results WHERE id = ? AND script_run_id IS NULL")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_script_result(&self, id: &str) -> Result<ScriptResult, DatabaseError> {
        sqlx::query_as::<_, ScriptResult>("SELECT * FROM script_results WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Script result {id}")))
    }

    // =========================================================================
    // Deferred run queries
    // =========================================================================

    /// Remember that `device_ids` should receive `run_id` when they next connect.
    pub async fn add_deferred_runs(
        &self,
        run_id: i64,
        device_ids: &[String],
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        for device_id in device_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO deferred_runs (run_id, device_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(run_id)
            .bind(device_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Runs waiting for `device_id`, oldest first.
    pub async fn deferred_runs_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<ScriptRun>, DatabaseError> {
        Ok(sqlx::query_as::<_, ScriptRun>(
            "SELECT r.* FROM deferred_runs dr
             JOIN script_runs r ON r.id = dr.run_id
             WHERE dr.device_id = ?
             ORDER BY dr.created_at, r.id",
        )
        .bind(device_id)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn delete_deferred_run(
        &self,
        run_id: i64,
        device_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM deferred_runs WHERE run_id = ? AND device_id = ?")
            .bind(run_id)
            .bind(device_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
