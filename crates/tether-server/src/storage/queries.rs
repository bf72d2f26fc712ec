//! Device and device-group queries.

use sqlx::{QueryBuilder, Sqlite};
use tether_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{Device, DeviceGroup};

impl Database {
    // =========================================================================
    // Device queries
    // =========================================================================

    /// Insert or refresh a device from its hello frame and mark it online now.
    ///
    /// A missing alias keeps whatever alias was stored before.
    pub async fn upsert_device(
        &self,
        id: &str,
        organization_id: &str,
        device_name: &str,
        alias: Option<&str>,
    ) -> Result<Device, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO devices (id, organization_id, device_name, alias, last_online, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                organization_id = excluded.organization_id,
                device_name = excluded.device_name,
                alias = COALESCE(excluded.alias, devices.alias),
                last_online = excluded.last_online",
        )
        .bind(id)
        .bind(organization_id)
        .bind(device_name)
        .bind(alias)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device(id).await
    }

    pub async fn get_device(&self, id: &str) -> Result<Device, DatabaseError> {
        sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {id}")))
    }

    /// Fetch every known device among `ids`. Unknown IDs are skipped.
    pub async fn get_devices(&self, ids: &[String]) -> Result<Vec<Device>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM devices WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY id");

        Ok(query
            .build_query_as::<Device>()
            .fetch_all(self.pool())
            .await?)
    }

    pub async fn list_devices(&self, organization_id: &str) -> Result<Vec<Device>, DatabaseError> {
        Ok(sqlx::query_as::<_, Device>(
            "SELECT * FROM devices WHERE organization_id = ? ORDER BY device_name, id",
        )
        .bind(organization_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Update `last_online` to now.
    pub async fn touch_device(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE devices SET last_online = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Device group queries
    // =========================================================================

    pub async fn create_device_group(
        &self,
        id: &str,
        organization_id: &str,
        name: &str,
    ) -> Result<DeviceGroup, DatabaseError> {
        sqlx::query(
            "INSERT INTO device_groups (id, organization_id, name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(organization_id)
        .bind(name)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_device_group(id).await
    }

    pub async fn get_device_group(&self, id: &str) -> Result<DeviceGroup, DatabaseError> {
        sqlx::query_as::<_, DeviceGroup>("SELECT * FROM device_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device group {id}")))
    }

    pub async fn add_device_to_group(
        &self,
        group_id: &str,
        device_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT OR IGNORE INTO device_group_members (group_id, device_id) VALUES (?, ?)")
            .bind(group_id)
            .bind(device_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Distinct device IDs belonging to any of `group_ids`.
    pub async fn group_member_ids(
        &self,
        group_ids: &[String],
    ) -> Result<Vec<String>, DatabaseError> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query =
            QueryBuilder::<Sqlite>::new("SELECT DISTINCT device_id FROM device_group_members WHERE group_id IN (");
        let mut separated = query.separated(", ");
        for id in group_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY device_id");

        Ok(query
            .build_query_scalar::<String>()
            .fetch_all(self.pool())
            .await?)
    }
}
