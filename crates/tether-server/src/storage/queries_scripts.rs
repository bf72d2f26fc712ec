//! Saved script queries.

use tether_core::db::unix_timestamp;
use tether_core::protocol::Shell;

use super::db::{Database, DatabaseError};
use super::models::SavedScript;

/// Parameters for creating a saved script.
pub struct NewSavedScript<'a> {
    pub id: &'a str,
    pub organization_id: &'a str,
    pub name: &'a str,
    pub content: &'a str,
    pub shell: Shell,
    pub folder_path: Option<&'a str>,
    pub creator_id: &'a str,
    pub is_public: bool,
    pub is_quick_script: bool,
    pub generate_alert_on_error: bool,
    pub send_email_on_error: bool,
    pub send_error_email_to: Option<&'a str>,
}

/// Partial update of a saved script. `None` leaves a field unchanged.
///
/// Creator and organization are never touched by an update.
#[derive(Debug, Clone, Default)]
pub struct SavedScriptUpdate {
    pub name: Option<String>,
    pub content: Option<String>,
    pub shell: Option<Shell>,
    pub folder_path: Option<Option<String>>,
    pub is_public: Option<bool>,
    pub is_quick_script: Option<bool>,
    pub generate_alert_on_error: Option<bool>,
    pub send_email_on_error: Option<bool>,
    pub send_error_email_to: Option<Option<String>>,
}

impl SavedScriptUpdate {
    fn apply(self, script: &mut SavedScript) {
        if let Some(name) = self.name {
            script.name = name;
        }
        if let Some(content) = self.content {
            script.content = content;
        }
        if let Some(shell) = self.shell {
            script.shell = shell.as_str().to_string();
        }
        if let Some(folder_path) = self.folder_path {
            script.folder_path = folder_path;
        }
        if let Some(v) = self.is_public {
            script.is_public = v;
        }
        if let Some(v) = self.is_quick_script {
            script.is_quick_script = v;
        }
        if let Some(v) = self.generate_alert_on_error {
            script.generate_alert_on_error = v;
        }
        if let Some(v) = self.send_email_on_error {
            script.send_email_on_error = v;
        }
        if let Some(v) = self.send_error_email_to {
            script.send_error_email_to = v;
        }
    }
}

impl Database {
    pub async fn create_saved_script(
        &self,
        params: &NewSavedScript<'_>,
    ) -> Result<SavedScript, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO saved_scripts (id, organization_id, name, content, shell, folder_path, creator_id, is_public, is_quick_script, generate_alert_on_error, send_email_on_error, send_error_email_to, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.id)
        .bind(params.organization_id)
        .bind(params.name)
        .bind(params.content)
        .bind(params.shell.as_str())
        .bind(params.folder_path)
        .bind(params.creator_id)
        .bind(params.is_public)
        .bind(params.is_quick_script)
        .bind(params.generate_alert_on_error)
        .bind(params.send_email_on_error)
        .bind(params.send_error_email_to)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_saved_script(params.id, params.organization_id).await
    }

    /// Get a saved script scoped to its organization.
    pub async fn get_saved_script(
        &self,
        id: &str,
        organization_id: &str,
    ) -> Result<SavedScript, DatabaseError> {
        sqlx::query_as::<_, SavedScript>(
            "SELECT * FROM saved_scripts WHERE id = ? AND organization_id = ?",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Saved script {id}")))
    }

    pub async fn update_saved_script(
        &self,
        id: &str,
        organization_id: &str,
        update: SavedScriptUpdate,
    ) -> Result<SavedScript, DatabaseError> {
        let mut script = self.get_saved_script(id, organization_id).await?;
        update.apply(&mut script);

        sqlx::query(
            "UPDATE saved_scripts SET name = ?, content = ?, shell = ?, folder_path = ?, is_public = ?, is_quick_script = ?, generate_alert_on_error = ?, send_email_on_error = ?, send_error_email_to = ?, updated_at = ?
             WHERE id = ? AND organization_id = ?",
        )
        .bind(&script.name)
        .bind(&script.content)
        .bind(&script.shell)
        .bind(&script.folder_path)
        .bind(script.is_public)
        .bind(script.is_quick_script)
        .bind(script.generate_alert_on_error)
        .bind(script.send_email_on_error)
        .bind(&script.send_error_email_to)
        .bind(unix_timestamp())
        .bind(id)
        .bind(organization_id)
        .execute(self.pool())
        .await?;

        self.get_saved_script(id, organization_id).await
    }

    /// Delete a saved script. Its schedules go with it; runs and results stay.
    pub async fn delete_saved_script(
        &self,
        id: &str,
        organization_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM saved_scripts WHERE id = ? AND organization_id = ?")
            .bind(id)
            .bind(organization_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Scripts visible to `user_id`: every public script plus their own private ones.
    pub async fn list_saved_scripts(
        &self,
        organization_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<SavedScript>, DatabaseError> {
        Ok(sqlx::query_as::<_, SavedScript>(
            "SELECT * FROM saved_scripts
             WHERE organization_id = ? AND (is_public = 1 OR creator_id = ?)
             ORDER BY folder_path, name",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn list_quick_scripts(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Vec<SavedScript>, DatabaseError> {
        Ok(sqlx::query_as::<_, SavedScript>(
            "SELECT * FROM saved_scripts
             WHERE organization_id = ? AND creator_id = ? AND is_quick_script = 1
             ORDER BY name",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }
}
