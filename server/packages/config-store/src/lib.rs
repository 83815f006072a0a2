//! Persistence for named MCP server configurations.
//!
//! A configuration is a named JSON blob of the shape
//! `{"mcpServers": {"<name>": {"command": "...", "args": [...]}}}`. Records
//! are stored in SQLite; the JSON column round-trips with key order
//! preserved, which the gateway's first-server policy depends on.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt configuration record {id}: {source}")]
    CorruptRecord {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
}

/// A stored configuration row.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRecord {
    pub id: i64,
    pub name: String,
    #[schema(value_type = Object)]
    pub config: Value,
    #[schema(value_type = String)]
    pub created_at: DateTime<Utc>,
}

/// One launchable server entry inside a configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Returns the first server entry of a configuration, in insertion order.
///
/// Configurations may carry several entries; only the first is launched.
pub fn first_server(config: &Value) -> Option<(String, ServerEntry)> {
    let servers = config.get("mcpServers")?.as_object()?;
    let (name, raw) = servers.iter().next()?;
    let entry = serde_json::from_value(raw.clone()).ok()?;
    Some((name.clone(), entry))
}

/// Whether a configuration value carries an `mcpServers` object at all.
pub fn has_server_spec(config: &Value) -> bool {
    config.get("mcpServers").is_some_and(Value::is_object)
}

/// SQLite-backed store for configuration records.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    pool: SqlitePool,
}

impl ConfigStore {
    /// Open (or create) the store at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Database(sqlx::Error::Io(err))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ConfigRecord>, StoreError> {
        let rows =
            sqlx::query("SELECT id, name, config, created_at FROM mcp_configs ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn get(&self, id: i64) -> Result<Option<ConfigRecord>, StoreError> {
        let row =
            sqlx::query("SELECT id, name, config, created_at FROM mcp_configs WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn create(&self, name: &str, config: &Value) -> Result<ConfigRecord, StoreError> {
        let created_at = Utc::now();
        let result =
            sqlx::query("INSERT INTO mcp_configs (name, config, created_at) VALUES (?1, ?2, ?3)")
                .bind(name)
                .bind(config.to_string())
                .bind(created_at)
                .execute(&self.pool)
                .await?;
        Ok(ConfigRecord {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            config: config.clone(),
            created_at,
        })
    }

    /// Updates a record, returning the new row or `None` if the id is unknown.
    pub async fn update(
        &self,
        id: i64,
        name: &str,
        config: &Value,
    ) -> Result<Option<ConfigRecord>, StoreError> {
        let result = sqlx::query("UPDATE mcp_configs SET name = ?1, config = ?2 WHERE id = ?3")
            .bind(name)
            .bind(config.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    /// Deletes a record, returning whether it existed.
    pub async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM mcp_configs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ConfigRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let name: String = row.try_get("name")?;
    let raw: String = row.try_get("config")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let config =
        serde_json::from_str(&raw).map_err(|source| StoreError::CorruptRecord { id, source })?;
    Ok(ConfigRecord {
        id,
        name,
        config,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cat_config() -> Value {
        json!({ "mcpServers": { "echo": { "command": "cat", "args": [] } } })
    }

    #[tokio::test]
    async fn crud_roundtrip() {
        let store = ConfigStore::in_memory().await.unwrap();

        let created = store.create("echo server", &cat_config()).await.unwrap();
        assert_eq!(created.name, "echo server");

        let fetched = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.config, cat_config());

        let updated = store
            .update(created.id, "renamed", &cat_config())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "renamed");

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);

        assert!(store.delete(created.id).await.unwrap());
        assert!(store.get(created.id).await.unwrap().is_none());
        assert!(!store.delete(created.id).await.unwrap());
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");

        let store = ConfigStore::open(&path).await.unwrap();
        let created = store.create("persistent", &cat_config()).await.unwrap();
        drop(store);

        let reopened = ConfigStore::open(&path).await.unwrap();
        let fetched = reopened.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "persistent");
        assert_eq!(
            fetched.created_at.timestamp(),
            created.created_at.timestamp()
        );
    }

    #[tokio::test]
    async fn update_unknown_id_returns_none() {
        let store = ConfigStore::in_memory().await.unwrap();
        let result = store.update(42, "ghost", &cat_config()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn config_json_preserves_server_order() {
        let store = ConfigStore::in_memory().await.unwrap();
        let config = json!({
            "mcpServers": {
                "zeta": { "command": "zeta-server" },
                "alpha": { "command": "alpha-server" }
            }
        });
        let created = store.create("ordered", &config).await.unwrap();
        let fetched = store.get(created.id).await.unwrap().unwrap();

        let (name, entry) = first_server(&fetched.config).unwrap();
        assert_eq!(name, "zeta");
        assert_eq!(entry.command, "zeta-server");
    }

    #[test]
    fn first_server_handles_missing_or_empty_spec() {
        assert!(first_server(&json!({})).is_none());
        assert!(first_server(&json!({ "mcpServers": {} })).is_none());
        assert!(first_server(&json!({ "mcpServers": { "x": { "args": [] } } })).is_none());
    }

    #[test]
    fn server_spec_presence() {
        assert!(has_server_spec(&json!({ "mcpServers": {} })));
        assert!(!has_server_spec(&json!({ "mcpServers": [] })));
        assert!(!has_server_spec(&json!({ "servers": {} })));
    }
}
