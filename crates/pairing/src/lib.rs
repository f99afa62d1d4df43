//! Pairing: one-shot codes binding a Telegram identity to an agent.
//!
//! `start_pairing` issues a short-lived monotonically-unique code;
//! `claim_pairing` consumes it exactly once and mints an `(agent_id,
//! agent_key)` binding, atomically replacing any prior binding for the same
//! Telegram user. Lookups are served from the in-memory state, which mirrors
//! the optional persistence adapter.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    chrono::{DateTime, Utc},
    tracing::{info, warn},
};

use octo_common::Clock;
use octo_protocol::{PAIRING_TTL_SECS, error_codes};

mod persistence;

pub use persistence::{PairingPersistence, SqlitePairingPersistence, StoredCode};

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("pairing code not found")]
    InvalidCode,

    #[error("pairing code expired")]
    Expired,

    #[error("pairing persistence failed")]
    Persistence(#[source] anyhow::Error),
}

impl PairingError {
    /// The stable wire code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCode => error_codes::PAIRING_INVALID_CODE,
            Self::Expired => error_codes::PAIRING_EXPIRED,
            Self::Persistence(_) => error_codes::INTERNAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, PairingError>;

// ── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PairingCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AgentBinding {
    pub telegram_user_id: String,
    pub agent_id: String,
    pub agent_key: String,
    pub updated_at: DateTime<Utc>,
}

// ── Minting ─────────────────────────────────────────────────────────────────

/// Source of fresh `(agent_id, agent_key)` pairs.
pub trait Minter: Send + Sync {
    fn mint(&self) -> (String, String);
}

/// Opaque uuid-based identifiers. The production default.
#[derive(Debug, Default)]
pub struct RandomMinter;

impl Minter for RandomMinter {
    fn mint(&self) -> (String, String) {
        (
            format!("agent-{}", uuid::Uuid::new_v4().simple()),
            format!("key-{}", uuid::Uuid::new_v4().simple()),
        )
    }
}

/// Predictable `agent-000001`-style identifiers for tests.
#[derive(Debug, Default)]
pub struct SequentialMinter {
    next: AtomicU64,
}

impl Minter for SequentialMinter {
    fn mint(&self) -> (String, String) {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        (format!("agent-{n:06}"), format!("key-{n:06}"))
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PairingMaps {
    /// code → (telegram_user_id, expires_at)
    codes: HashMap<String, (String, DateTime<Utc>)>,
    by_user: HashMap<String, AgentBinding>,
    /// agent_key → agent_id
    by_key: HashMap<String, String>,
    /// agent_id → telegram_user_id
    by_agent: HashMap<String, String>,
}

pub struct PairingStore {
    maps: RwLock<PairingMaps>,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
    minter: Box<dyn Minter>,
    persistence: Option<Arc<dyn PairingPersistence>>,
    ttl: chrono::Duration,
}

impl PairingStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            maps: RwLock::new(PairingMaps::default()),
            seq: AtomicU64::new(0),
            clock,
            minter: Box::new(RandomMinter),
            persistence: None,
            ttl: chrono::Duration::seconds(PAIRING_TTL_SECS),
        }
    }

    #[must_use]
    pub fn with_minter(mut self, minter: Box<dyn Minter>) -> Self {
        self.minter = minter;
        self
    }

    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn PairingPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Load persisted bindings into the in-memory mirror. Adapter errors are
    /// logged, not fatal: lookups fall back to whatever memory holds.
    pub async fn hydrate(&self) {
        let Some(ref persistence) = self.persistence else {
            return;
        };
        match persistence.load_bindings().await {
            Ok(bindings) => {
                let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
                for binding in bindings {
                    maps.by_key
                        .insert(binding.agent_key.clone(), binding.agent_id.clone());
                    maps.by_agent
                        .insert(binding.agent_id.clone(), binding.telegram_user_id.clone());
                    maps.by_user
                        .insert(binding.telegram_user_id.clone(), binding);
                }
            },
            Err(e) => warn!(error = %e, "pairing hydrate failed; continuing with in-memory state"),
        }
    }

    /// Issue a fresh one-shot pairing code for a Telegram user.
    pub async fn start_pairing(&self, telegram_user_id: &str) -> Result<PairingCode> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let code = format!("PAIR-{n:06}");
        let expires_at = self.clock.now() + self.ttl;

        if let Some(ref persistence) = self.persistence {
            persistence
                .insert_code(&code, telegram_user_id, expires_at)
                .await
                .map_err(PairingError::Persistence)?;
        }
        {
            let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
            maps.codes
                .insert(code.clone(), (telegram_user_id.to_string(), expires_at));
        }
        info!(telegram_user_id, code, "pairing started");
        Ok(PairingCode { code, expires_at })
    }

    /// Consume a pairing code and mint a binding.
    ///
    /// The code is deleted before the expiry check, so a code is claimable at
    /// most once even when the claim fails with `pairing.expired`. A prior
    /// binding for the same user has its agent_key invalidated before the new
    /// one is published.
    pub async fn claim_pairing(&self, code: &str, device_info: &str) -> Result<AgentBinding> {
        let removed = if let Some(ref persistence) = self.persistence {
            let stored = persistence
                .remove_code(code)
                .await
                .map_err(PairingError::Persistence)?;
            {
                let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
                maps.codes.remove(code);
            }
            stored.map(|c| (c.telegram_user_id, c.expires_at))
        } else {
            let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
            maps.codes.remove(code)
        };

        let (telegram_user_id, expires_at) = removed.ok_or(PairingError::InvalidCode)?;
        if self.clock.now() > expires_at {
            return Err(PairingError::Expired);
        }

        let (agent_id, agent_key) = self.minter.mint();
        let binding = AgentBinding {
            telegram_user_id: telegram_user_id.clone(),
            agent_id,
            agent_key,
            updated_at: self.clock.now(),
        };

        // Invalidate the previous binding before the new key becomes
        // authenticable.
        {
            let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
            if let Some(prior) = maps.by_user.remove(&telegram_user_id) {
                maps.by_key.remove(&prior.agent_key);
                maps.by_agent.remove(&prior.agent_id);
                info!(
                    telegram_user_id,
                    prior_agent_id = prior.agent_id,
                    "replacing existing agent binding"
                );
            }
        }
        if let Some(ref persistence) = self.persistence {
            persistence
                .upsert_binding(&binding)
                .await
                .map_err(PairingError::Persistence)?;
        }
        {
            let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
            maps.by_key
                .insert(binding.agent_key.clone(), binding.agent_id.clone());
            maps.by_agent
                .insert(binding.agent_id.clone(), telegram_user_id.clone());
            maps.by_user.insert(telegram_user_id.clone(), binding.clone());
        }

        info!(
            telegram_user_id,
            agent_id = binding.agent_id,
            device_info,
            "pairing claimed"
        );
        Ok(binding)
    }

    pub fn authenticate_agent_key(&self, agent_key: &str) -> Option<String> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        maps.by_key.get(agent_key).cloned()
    }

    pub fn agent_id_for_user(&self, telegram_user_id: &str) -> Option<String> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        maps.by_user
            .get(telegram_user_id)
            .map(|b| b.agent_id.clone())
    }

    pub fn user_id_for_agent(&self, agent_id: &str) -> Option<String> {
        let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
        maps.by_agent.get(agent_id).cloned()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, octo_common::ManualClock};

    fn store() -> (PairingStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::start_now());
        let store = PairingStore::new(Arc::clone(&clock) as Arc<dyn Clock>)
            .with_minter(Box::new(SequentialMinter::default()));
        (store, clock)
    }

    #[tokio::test]
    async fn start_then_claim_mints_sequential_identifiers() {
        let (store, clock) = store();
        let issued = store.start_pairing("tg-1").await.unwrap();
        assert_eq!(issued.code, "PAIR-000001");
        assert_eq!(issued.expires_at - clock.now(), chrono::Duration::minutes(10));

        let binding = store.claim_pairing("PAIR-000001", "d").await.unwrap();
        assert_eq!(binding.agent_id, "agent-000001");
        assert_eq!(binding.agent_key, "key-000001");
        assert_eq!(
            store.authenticate_agent_key("key-000001").as_deref(),
            Some("agent-000001")
        );
        assert_eq!(store.agent_id_for_user("tg-1").as_deref(), Some("agent-000001"));
        assert_eq!(store.user_id_for_agent("agent-000001").as_deref(), Some("tg-1"));
    }

    #[tokio::test]
    async fn codes_are_monotonically_unique() {
        let (store, _clock) = store();
        let a = store.start_pairing("tg-1").await.unwrap();
        let b = store.start_pairing("tg-2").await.unwrap();
        assert_eq!(a.code, "PAIR-000001");
        assert_eq!(b.code, "PAIR-000002");
    }

    #[tokio::test]
    async fn expired_code_rejects_and_stays_consumed() {
        let (store, clock) = store();
        store.start_pairing("tg-1").await.unwrap();

        clock.advance(chrono::Duration::minutes(11));
        let err = store.claim_pairing("PAIR-000001", "d").await.unwrap_err();
        assert!(matches!(err, PairingError::Expired));
        assert!(store.agent_id_for_user("tg-1").is_none());

        // Consumed at the failed claim; a retry sees an unknown code.
        let err = store.claim_pairing("PAIR-000001", "d").await.unwrap_err();
        assert!(matches!(err, PairingError::InvalidCode));
    }

    #[tokio::test]
    async fn unknown_code_rejects() {
        let (store, _clock) = store();
        let err = store.claim_pairing("PAIR-999999", "d").await.unwrap_err();
        assert!(matches!(err, PairingError::InvalidCode));
    }

    #[tokio::test]
    async fn code_claimable_at_most_once() {
        let (store, _clock) = store();
        store.start_pairing("tg-1").await.unwrap();
        store.claim_pairing("PAIR-000001", "d").await.unwrap();
        let err = store.claim_pairing("PAIR-000001", "d").await.unwrap_err();
        assert!(matches!(err, PairingError::InvalidCode));
    }

    #[tokio::test]
    async fn second_claim_replaces_binding_and_invalidates_old_key() {
        let (store, _clock) = store();
        store.start_pairing("tg-1").await.unwrap();
        let first = store.claim_pairing("PAIR-000001", "laptop").await.unwrap();

        store.start_pairing("tg-1").await.unwrap();
        let second = store.claim_pairing("PAIR-000002", "desktop").await.unwrap();

        assert_ne!(first.agent_key, second.agent_key);
        assert!(store.authenticate_agent_key(&first.agent_key).is_none());
        assert_eq!(
            store.authenticate_agent_key(&second.agent_key).as_deref(),
            Some(second.agent_id.as_str())
        );
        assert_eq!(
            store.agent_id_for_user("tg-1").as_deref(),
            Some(second.agent_id.as_str())
        );
        assert!(store.user_id_for_agent(&first.agent_id).is_none());
    }

    #[tokio::test]
    async fn random_minter_produces_opaque_unique_pairs() {
        let minter = RandomMinter;
        let (id_a, key_a) = minter.mint();
        let (id_b, key_b) = minter.mint();
        assert!(id_a.starts_with("agent-"));
        assert!(key_a.starts_with("key-"));
        assert_ne!(id_a, id_b);
        assert_ne!(key_a, key_b);
    }
}
