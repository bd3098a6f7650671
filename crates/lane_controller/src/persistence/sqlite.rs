// =============================================================================
// SQLite session store
// =============================================================================

use super::{SessionOutcome, SessionRecord, SessionStore};
use crate::config::PersistenceConfig;
use crate::error::PersistenceError;
use crate::registry::InstanceSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lane_protocol::{InstanceId, PlayerId};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};
use uuid::Uuid;

/// Session store backed by a pooled SQLite database.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    /// Opens (creating if needed) the database at `url` and runs migrations.
    pub async fn connect(url: &str, config: &PersistenceConfig) -> Result<Self, PersistenceError> {
        // Create the file on first use.
        let url_with_options = if url.starts_with("sqlite:") && !url.contains('?') {
            format!("{url}?mode=rwc")
        } else if url.starts_with("sqlite:") && !url.contains("mode=") {
            format!("{url}&mode=rwc")
        } else {
            url.to_string()
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&url_with_options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!(
            "🗄️ Session store ready at {} (pool size {})",
            url, config.max_connections
        );
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS completed_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                player_id TEXT NOT NULL,
                instance_id TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                outcome TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_completed_sessions_player ON completed_sessions(player_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                game_type TEXT NOT NULL,
                address TEXT NOT NULL,
                capacity INTEGER NOT NULL,
                occupancy INTEGER NOT NULL,
                lifecycle TEXT NOT NULL,
                private INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                registered_at TEXT NOT NULL,
                snapshot_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Number of rows in the instance snapshot table.
    pub async fn instance_count(&self) -> Result<i64, PersistenceError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM instances")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<SessionRecord, PersistenceError> {
    let player: String = row.try_get("player_id")?;
    let player = Uuid::parse_str(&player)
        .map(PlayerId)
        .map_err(|e| PersistenceError::Serialization(format!("player_id {player}: {e}")))?;
    let instance: Option<String> = row.try_get("instance_id")?;
    let outcome: String = row.try_get("outcome")?;
    let outcome = SessionOutcome::parse(&outcome)
        .ok_or_else(|| PersistenceError::Serialization(format!("unknown outcome {outcome}")))?;
    let started_at: DateTime<Utc> = row.try_get("started_at")?;
    let ended_at: DateTime<Utc> = row.try_get("ended_at")?;

    Ok(SessionRecord {
        player,
        instance: instance.map(InstanceId),
        started_at,
        ended_at,
        duration_ms: row.try_get("duration_ms")?,
        outcome,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn append_session(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO completed_sessions (player_id, instance_id, started_at, ended_at, duration_ms, outcome)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.player.to_string())
        .bind(record.instance.as_ref().map(|id| id.to_string()))
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.duration_ms)
        .bind(record.outcome.as_str())
        .execute(&self.pool)
        .await?;

        debug!("Recorded session of {} ({})", record.player, record.outcome.as_str());
        Ok(())
    }

    async fn replace_instances(&self, instances: &[InstanceSnapshot]) -> Result<(), PersistenceError> {
        let snapshot_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM instances").execute(&mut *tx).await?;

        for instance in instances {
            let metadata = serde_json::to_string(&instance.metadata)
                .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO instances (id, game_type, address, capacity, occupancy, lifecycle, private, metadata, registered_at, snapshot_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(instance.id.as_str())
            .bind(&instance.game_type)
            .bind(&instance.address)
            .bind(i64::from(instance.capacity))
            .bind(i64::from(instance.occupancy))
            .bind(instance.lifecycle.as_str())
            .bind(instance.private)
            .bind(metadata)
            .bind(instance.registered_at)
            .bind(snapshot_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn sessions_for_player(&self, player: PlayerId) -> Result<Vec<SessionRecord>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT player_id, instance_id, started_at, ended_at, duration_ms, outcome
            FROM completed_sessions
            WHERE player_id = ?
            ORDER BY id
            "#,
        )
        .bind(player.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InstanceRegistry, Lifecycle};
    use lane_protocol::InstanceDescriptor;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqliteSessionStore {
        let url = format!("sqlite://{}", dir.path().join("lane.db").display());
        SqliteSessionStore::connect(&url, &PersistenceConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn appended_sessions_are_read_back_in_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let player = PlayerId::new();
        let start = Utc::now();

        let first = SessionRecord::new(
            player,
            Some(InstanceId::new("arena-1")),
            start,
            start + chrono::Duration::seconds(90),
            SessionOutcome::Completed,
        );
        let second = SessionRecord::new(player, None, start, start, SessionOutcome::Unassigned);
        store.append_session(&first).await.unwrap();
        store.append_session(&second).await.unwrap();
        store
            .append_session(&SessionRecord::new(
                PlayerId::new(),
                None,
                start,
                start,
                SessionOutcome::Unassigned,
            ))
            .await
            .unwrap();

        let records = store.sessions_for_player(player).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].instance, Some(InstanceId::new("arena-1")));
        assert_eq!(records[0].duration_ms, 90_000);
        assert_eq!(records[0].outcome, SessionOutcome::Completed);
        assert_eq!(records[1].outcome, SessionOutcome::Unassigned);
        assert!(records[1].instance.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn instance_snapshot_is_replaced_wholesale() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        for id in ["a", "b"] {
            registry
                .register(InstanceDescriptor::new("arena", "10.0.0.1:1", 4).with_id(id))
                .unwrap();
        }

        let all = registry.query(&crate::registry::InstanceFilter::all());
        store.replace_instances(&all).await.unwrap();
        assert_eq!(store.instance_count().await.unwrap(), 2);

        store.replace_instances(&all[..1]).await.unwrap();
        assert_eq!(store.instance_count().await.unwrap(), 1);
        assert_eq!(all[0].lifecycle, Lifecycle::Registering);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reopening_keeps_existing_records() {
        let dir = TempDir::new().unwrap();
        let player = PlayerId::new();
        {
            let store = open_store(&dir).await;
            let now = Utc::now();
            store
                .append_session(&SessionRecord::new(player, None, now, now, SessionOutcome::Orphaned))
                .await
                .unwrap();
            store.close().await;
        }

        let store = open_store(&dir).await;
        let records = store.sessions_for_player(player).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, SessionOutcome::Orphaned);
    }
}
