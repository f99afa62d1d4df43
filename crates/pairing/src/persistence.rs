//! Durable storage adapter for pairing state.

use {
    anyhow::Result,
    async_trait::async_trait,
    chrono::{DateTime, SecondsFormat, Utc},
};

use crate::AgentBinding;

/// A pair code as held by the durable store.
#[derive(Debug, Clone)]
pub struct StoredCode {
    pub telegram_user_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Persistence contract for pair codes and agent bindings.
#[async_trait]
pub trait PairingPersistence: Send + Sync {
    async fn insert_code(
        &self,
        code: &str,
        telegram_user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Remove and return a code in one step; claims must consume exactly once.
    async fn remove_code(&self, code: &str) -> Result<Option<StoredCode>>;

    /// Insert or replace the binding for `binding.telegram_user_id`.
    async fn upsert_binding(&self, binding: &AgentBinding) -> Result<()>;

    async fn load_bindings(&self) -> Result<Vec<AgentBinding>>;
}

// ── SQLite implementation ───────────────────────────────────────────────────

pub struct SqlitePairingPersistence {
    pool: sqlx::SqlitePool,
}

impl SqlitePairingPersistence {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &sqlx::SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS pair_codes (
                code             TEXT PRIMARY KEY,
                telegram_user_id TEXT NOT NULL,
                expires_at       TEXT NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS agents (
                telegram_user_id TEXT PRIMARY KEY,
                agent_id         TEXT NOT NULL UNIQUE,
                agent_key        TEXT NOT NULL UNIQUE,
                updated_at       TEXT NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    telegram_user_id: String,
    agent_id: String,
    agent_key: String,
    updated_at: String,
}

impl TryFrom<AgentRow> for AgentBinding {
    type Error = anyhow::Error;

    fn try_from(row: AgentRow) -> Result<Self> {
        Ok(Self {
            telegram_user_id: row.telegram_user_id,
            agent_id: row.agent_id,
            agent_key: row.agent_key,
            updated_at: DateTime::parse_from_rfc3339(&row.updated_at)?.with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl PairingPersistence for SqlitePairingPersistence {
    async fn insert_code(
        &self,
        code: &str,
        telegram_user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO pair_codes (code, telegram_user_id, expires_at) VALUES (?, ?, ?)",
        )
        .bind(code)
        .bind(telegram_user_id)
        .bind(expires_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_code(&self, code: &str) -> Result<Option<StoredCode>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT telegram_user_id, expires_at FROM pair_codes WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((telegram_user_id, expires_at)) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        sqlx::query("DELETE FROM pair_codes WHERE code = ?")
            .bind(code)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(StoredCode {
            telegram_user_id,
            expires_at: DateTime::parse_from_rfc3339(&expires_at)?.with_timezone(&Utc),
        }))
    }

    async fn upsert_binding(&self, binding: &AgentBinding) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO agents (telegram_user_id, agent_id, agent_key, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(telegram_user_id) DO UPDATE SET
                 agent_id   = excluded.agent_id,
                 agent_key  = excluded.agent_key,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&binding.telegram_user_id)
        .bind(&binding.agent_id)
        .bind(&binding.agent_key)
        .bind(binding.updated_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_bindings(&self) -> Result<Vec<AgentBinding>> {
        let rows = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(AgentBinding::try_from).collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{PairingStore, SequentialMinter},
        octo_common::{Clock, ManualClock},
        std::sync::Arc,
    };

    async fn persistence() -> Arc<SqlitePairingPersistence> {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqlitePairingPersistence::init(&pool).await.unwrap();
        Arc::new(SqlitePairingPersistence::new(pool))
    }

    #[tokio::test]
    async fn remove_code_consumes_exactly_once() {
        let store = persistence().await;
        store.insert_code("PAIR-000001", "tg-1", Utc::now()).await.unwrap();
        let first = store.remove_code("PAIR-000001").await.unwrap();
        assert_eq!(first.unwrap().telegram_user_id, "tg-1");
        assert!(store.remove_code("PAIR-000001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_binding_for_user() {
        let store = persistence().await;
        let now = Utc::now();
        store
            .upsert_binding(&AgentBinding {
                telegram_user_id: "tg-1".into(),
                agent_id: "agent-1".into(),
                agent_key: "key-1".into(),
                updated_at: now,
            })
            .await
            .unwrap();
        store
            .upsert_binding(&AgentBinding {
                telegram_user_id: "tg-1".into(),
                agent_id: "agent-2".into(),
                agent_key: "key-2".into(),
                updated_at: now,
            })
            .await
            .unwrap();

        let bindings = store.load_bindings().await.unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].agent_id, "agent-2");
    }

    #[tokio::test]
    async fn hydrated_store_serves_persisted_lookups() {
        let persistence = persistence().await;
        let clock = Arc::new(ManualClock::start_now());
        {
            let store = PairingStore::new(Arc::clone(&clock) as Arc<dyn Clock>)
                .with_minter(Box::new(SequentialMinter::default()))
                .with_persistence(Arc::clone(&persistence) as Arc<dyn PairingPersistence>);
            store.start_pairing("tg-1").await.unwrap();
            store.claim_pairing("PAIR-000001", "d").await.unwrap();
        }

        // A fresh store over the same pool sees the binding after hydrate.
        let store = PairingStore::new(Arc::clone(&clock) as Arc<dyn Clock>)
            .with_persistence(persistence as Arc<dyn PairingPersistence>);
        store.hydrate().await;
        assert_eq!(
            store.authenticate_agent_key("key-000001").as_deref(),
            Some("agent-000001")
        );
    }
}
