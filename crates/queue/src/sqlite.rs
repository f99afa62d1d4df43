//! Durable queue on SQLite.
//!
//! The logical layout mirrors the list/hash/KV key scheme:
//! `oct:cmd:<agent_id>` (queued list), `oct:inflight:<agent_id>` (inflight
//! list), `oct:inflight_at:<agent_id>` (hash `command_id` → RFC 3339 nanos),
//! `oct:result:<agent_id>:<command_id>` (result cell, 14-day expiry). Lists
//! use a position column: the head is the smallest position, the tail the
//! largest.

use std::{sync::Arc, time::Duration};

use {
    anyhow::Result,
    async_trait::async_trait,
    chrono::{DateTime, SecondsFormat, Utc},
    tracing::{debug, warn},
};

use {
    octo_common::Clock,
    octo_protocol::{Command, CommandResult, REDELIVERY_TTL_SECS, RESULT_TTL_SECS},
};

use crate::CommandQueue;

/// Poll re-scan interval; a durable queue has no in-process wakeup to wait on.
const POLL_SCAN_INTERVAL: Duration = Duration::from_millis(100);

fn cmd_key(agent_id: &str) -> String {
    format!("oct:cmd:{agent_id}")
}

fn inflight_key(agent_id: &str) -> String {
    format!("oct:inflight:{agent_id}")
}

fn inflight_at_key(agent_id: &str) -> String {
    format!("oct:inflight_at:{agent_id}")
}

fn result_key(agent_id: &str, command_id: &str) -> String {
    format!("oct:result:{agent_id}:{command_id}")
}

fn rfc3339_nanos(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[derive(sqlx::FromRow)]
struct ListRow {
    pos: i64,
    payload: String,
}

#[derive(sqlx::FromRow)]
struct HashRow {
    field: String,
    value: String,
}

pub struct SqliteQueue {
    pool: sqlx::SqlitePool,
    clock: Arc<dyn Clock>,
    redelivery_ttl: chrono::Duration,
    result_ttl: chrono::Duration,
}

impl SqliteQueue {
    pub fn new(pool: sqlx::SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            redelivery_ttl: chrono::Duration::seconds(REDELIVERY_TTL_SECS),
            result_ttl: chrono::Duration::seconds(RESULT_TTL_SECS),
        }
    }

    #[must_use]
    pub fn with_redelivery_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.redelivery_ttl = ttl;
        self
    }

    /// Create the queue tables.
    pub async fn init(pool: &sqlx::SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS queue_list (
                key     TEXT    NOT NULL,
                pos     INTEGER NOT NULL,
                payload TEXT    NOT NULL,
                PRIMARY KEY (key, pos)
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS queue_hash (
                key   TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, field)
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS queue_kv (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// One delivery scan inside a transaction. Mirrors the in-memory
    /// semantics: stalest redelivery-eligible inflight entry first, then the
    /// queued tail.
    async fn take_next(&self, agent_id: &str) -> Result<Option<Command>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let timestamps = sqlx::query_as::<_, HashRow>(
            "SELECT field, value FROM queue_hash WHERE key = ?",
        )
        .bind(inflight_at_key(agent_id))
        .fetch_all(&mut *tx)
        .await?;

        let mut stalest: Option<(String, DateTime<Utc>)> = None;
        for row in timestamps {
            let Ok(at) = DateTime::parse_from_rfc3339(&row.value) else {
                warn!(agent_id, field = %row.field, "unparseable inflight_at value");
                continue;
            };
            let at = at.with_timezone(&Utc);
            if now - at > self.redelivery_ttl
                && stalest.as_ref().is_none_or(|(_, best)| at < *best)
            {
                stalest = Some((row.field, at));
            }
        }

        if let Some((command_id, _)) = stalest {
            let row = sqlx::query_as::<_, ListRow>(
                "SELECT pos, payload FROM queue_list
                 WHERE key = ? AND json_extract(payload, '$.command_id') = ?",
            )
            .bind(inflight_key(agent_id))
            .bind(&command_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                sqlx::query("UPDATE queue_hash SET value = ? WHERE key = ? AND field = ?")
                    .bind(rfc3339_nanos(now))
                    .bind(inflight_at_key(agent_id))
                    .bind(&command_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                let command: Command = serde_json::from_str(&row.payload)?;
                debug!(agent_id, command_id, "redelivering inflight command");
                return Ok(Some(command));
            }
            // Orphaned timestamp; clean it up and fall through.
            sqlx::query("DELETE FROM queue_hash WHERE key = ? AND field = ?")
                .bind(inflight_at_key(agent_id))
                .bind(&command_id)
                .execute(&mut *tx)
                .await?;
        }

        let tail = sqlx::query_as::<_, ListRow>(
            "SELECT pos, payload FROM queue_list WHERE key = ? ORDER BY pos DESC LIMIT 1",
        )
        .bind(cmd_key(agent_id))
        .fetch_optional(&mut *tx)
        .await?;
        let Some(tail) = tail else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("DELETE FROM queue_list WHERE key = ? AND pos = ?")
            .bind(cmd_key(agent_id))
            .bind(tail.pos)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO queue_list (key, pos, payload)
             VALUES (?, (SELECT COALESCE(MIN(pos), 0) - 1 FROM queue_list WHERE key = ?), ?)",
        )
        .bind(inflight_key(agent_id))
        .bind(inflight_key(agent_id))
        .bind(&tail.payload)
        .execute(&mut *tx)
        .await?;

        let command: Command = serde_json::from_str(&tail.payload)?;
        sqlx::query("INSERT OR REPLACE INTO queue_hash (key, field, value) VALUES (?, ?, ?)")
            .bind(inflight_at_key(agent_id))
            .bind(&command.command_id)
            .bind(rfc3339_nanos(now))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(command))
    }
}

#[async_trait]
impl CommandQueue for SqliteQueue {
    async fn enqueue(&self, agent_id: &str, command: Command) -> Result<()> {
        let payload = serde_json::to_string(&command)?;
        let mut tx = self.pool.begin().await?;

        let pending: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM queue_list
             WHERE key IN (?, ?) AND json_extract(payload, '$.command_id') = ?
             LIMIT 1",
        )
        .bind(cmd_key(agent_id))
        .bind(inflight_key(agent_id))
        .bind(&command.command_id)
        .fetch_optional(&mut *tx)
        .await?;
        if pending.is_some() {
            debug!(agent_id, command_id = %command.command_id, "enqueue: already pending, skipping");
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO queue_list (key, pos, payload)
             VALUES (?, (SELECT COALESCE(MIN(pos), 0) - 1 FROM queue_list WHERE key = ?), ?)",
        )
        .bind(cmd_key(agent_id))
        .bind(cmd_key(agent_id))
        .bind(&payload)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn poll(&self, agent_id: &str, timeout: Duration) -> Result<Option<Command>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(command) = self.take_next(agent_id).await? {
                return Ok(Some(command));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(POLL_SCAN_INTERVAL)).await;
        }
    }

    async fn store_result(&self, agent_id: &str, result: CommandResult) -> Result<()> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM queue_list
             WHERE key = ? AND json_extract(payload, '$.command_id') = ?",
        )
        .bind(inflight_key(agent_id))
        .bind(&result.command_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM queue_hash WHERE key = ? AND field = ?")
            .bind(inflight_at_key(agent_id))
            .bind(&result.command_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR REPLACE INTO queue_kv (key, value, expires_at) VALUES (?, ?, ?)")
            .bind(result_key(agent_id, &result.command_id))
            .bind(serde_json::to_string(&result)?)
            .bind(rfc3339_nanos(now + self.result_ttl))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_result(&self, agent_id: &str, command_id: &str) -> Result<Option<CommandResult>> {
        let key = result_key(agent_id, command_id);
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT value, expires_at FROM queue_kv WHERE key = ?")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;
        let Some((value, expires_at)) = row else {
            return Ok(None);
        };
        let expired = DateTime::parse_from_rfc3339(&expires_at)
            .map(|at| self.clock.now() >= at.with_timezone(&Utc))
            .unwrap_or(true);
        if expired {
            sqlx::query("DELETE FROM queue_kv WHERE key = ?")
                .bind(&key)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&value)?))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, octo_common::ManualClock, std::sync::Arc};

    async fn queue() -> (SqliteQueue, Arc<ManualClock>) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteQueue::init(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::start_now());
        (
            SqliteQueue::new(pool, Arc::clone(&clock) as Arc<dyn Clock>),
            clock,
        )
    }

    fn status_command(id: &str) -> Command {
        Command {
            command_id: id.into(),
            idempotency_key: format!("k-{id}"),
            r#type: "status".into(),
            created_at: Utc::now(),
            payload: Some(serde_json::json!({})),
        }
    }

    #[tokio::test]
    async fn fifo_and_result_roundtrip() {
        let (queue, _clock) = queue().await;
        queue
            .enqueue("agent-a", status_command("cmd-1"))
            .await
            .unwrap();
        queue
            .enqueue("agent-a", status_command("cmd-2"))
            .await
            .unwrap();

        let first = queue
            .poll("agent-a", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.command_id, "cmd-1");

        queue
            .store_result("agent-a", CommandResult::ok("cmd-1", "done"))
            .await
            .unwrap();
        let stored = queue.get_result("agent-a", "cmd-1").await.unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("done"));

        let second = queue
            .poll("agent-a", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.command_id, "cmd-2");
    }

    #[tokio::test]
    async fn redelivery_past_ttl() {
        let (queue, clock) = queue().await;
        queue
            .enqueue("agent-a", status_command("cmd-1"))
            .await
            .unwrap();
        let _ = queue.poll("agent-a", Duration::from_millis(10)).await;

        assert!(
            queue
                .poll("agent-a", Duration::from_millis(10))
                .await
                .unwrap()
                .is_none()
        );

        clock.advance(chrono::Duration::seconds(121));
        let redelivered = queue
            .poll("agent-a", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.command_id, "cmd-1");

        queue
            .store_result("agent-a", CommandResult::ok("cmd-1", "done"))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(121));
        assert!(
            queue
                .poll("agent-a", Duration::from_millis(10))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn expired_result_reads_as_absent() {
        let (queue, clock) = queue().await;
        queue
            .store_result("agent-a", CommandResult::ok("cmd-1", "done"))
            .await
            .unwrap();
        assert!(queue.get_result("agent-a", "cmd-1").await.unwrap().is_some());

        clock.advance(chrono::Duration::days(15));
        assert!(queue.get_result("agent-a", "cmd-1").await.unwrap().is_none());
    }
}
