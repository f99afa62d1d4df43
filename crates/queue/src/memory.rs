//! In-memory queue. The default when the backend runs without a database.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    anyhow::Result,
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    tokio::sync::Notify,
    tracing::debug,
};

use {
    octo_common::Clock,
    octo_protocol::{Command, CommandResult, REDELIVERY_TTL_SECS, RESULT_TTL_SECS},
};

use crate::CommandQueue;

/// How often a blocked poll re-checks for newly redelivery-eligible entries.
const POLL_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

struct StoredResult {
    result: CommandResult,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct AgentQueues {
    /// Front = head (newest), back = tail (oldest, consumed first).
    queued: VecDeque<Command>,
    /// Front = head (most recently polled), back = oldest.
    inflight: VecDeque<Command>,
    inflight_at: HashMap<String, DateTime<Utc>>,
    results: HashMap<String, StoredResult>,
}

impl AgentQueues {
    fn contains(&self, command_id: &str) -> bool {
        self.queued.iter().any(|c| c.command_id == command_id)
            || self.inflight.iter().any(|c| c.command_id == command_id)
    }
}

pub struct MemoryQueue {
    state: Mutex<HashMap<String, AgentQueues>>,
    wakeups: Mutex<HashMap<String, Arc<Notify>>>,
    clock: Arc<dyn Clock>,
    redelivery_ttl: chrono::Duration,
    result_ttl: chrono::Duration,
}

impl MemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            wakeups: Mutex::new(HashMap::new()),
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

    fn wakeup_handle(&self, agent_id: &str) -> Arc<Notify> {
        let mut wakeups = self.wakeups.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(wakeups.entry(agent_id.to_string()).or_default())
    }

    /// One non-blocking delivery attempt: stalest eligible inflight entry
    /// first, then the queued tail.
    fn take_next(&self, agent_id: &str) -> Option<Command> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let queues = state.get_mut(agent_id)?;
        let now = self.clock.now();

        let stale = queues
            .inflight_at
            .iter()
            .filter(|(_, at)| now - **at > self.redelivery_ttl)
            .min_by_key(|(_, at)| **at)
            .map(|(id, _)| id.clone());
        if let Some(command_id) = stale {
            if let Some(command) = queues
                .inflight
                .iter()
                .find(|c| c.command_id == command_id)
                .cloned()
            {
                queues.inflight_at.insert(command_id, now);
                debug!(agent_id, command_id = %command.command_id, "redelivering inflight command");
                return Some(command);
            }
            // Timestamp without a matching inflight entry: drop the orphan.
            queues.inflight_at.remove(&command_id);
        }

        let command = queues.queued.pop_back()?;
        queues.inflight.push_front(command.clone());
        queues.inflight_at.insert(command.command_id.clone(), now);
        Some(command)
    }
}

#[async_trait]
impl CommandQueue for MemoryQueue {
    async fn enqueue(&self, agent_id: &str, command: Command) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let queues = state.entry(agent_id.to_string()).or_default();
            if queues.contains(&command.command_id) {
                debug!(agent_id, command_id = %command.command_id, "enqueue: already pending, skipping");
                return Ok(());
            }
            queues.queued.push_front(command);
        }
        self.wakeup_handle(agent_id).notify_waiters();
        Ok(())
    }

    async fn poll(&self, agent_id: &str, timeout: Duration) -> Result<Option<Command>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let wakeup = self.wakeup_handle(agent_id);
        loop {
            let notified = wakeup.notified();
            if let Some(command) = self.take_next(agent_id) {
                return Ok(Some(command));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(POLL_RECHECK_INTERVAL);
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep(wait) => {},
            }
        }
    }

    async fn store_result(&self, agent_id: &str, result: CommandResult) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let queues = state.entry(agent_id.to_string()).or_default();
        queues
            .inflight
            .retain(|c| c.command_id != result.command_id);
        queues.inflight_at.remove(&result.command_id);
        let expires_at = self.clock.now() + self.result_ttl;
        queues.results.insert(
            result.command_id.clone(),
            StoredResult { result, expires_at },
        );
        Ok(())
    }

    async fn get_result(&self, agent_id: &str, command_id: &str) -> Result<Option<CommandResult>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queues) = state.get_mut(agent_id) else {
            return Ok(None);
        };
        let now = self.clock.now();
        if let Some(stored) = queues.results.get(command_id) {
            if now >= stored.expires_at {
                queues.results.remove(command_id);
                return Ok(None);
            }
            return Ok(Some(stored.result.clone()));
        }
        Ok(None)
    }
}
