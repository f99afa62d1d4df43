//! Per-agent at-least-once command queue.
//!
//! Each agent has an ordered queued list (FIFO, tail-consumed), an ordered
//! inflight list, and a side table of `inflight_at` timestamps. A polled
//! command stays inflight until a result is stored for it; past the
//! redelivery TTL it becomes eligible for re-polling, stalest first. Results
//! are kept for 14 days.

use std::time::Duration;

use {anyhow::Result, async_trait::async_trait};

use octo_protocol::{Command, CommandResult};

mod memory;
mod sqlite;

pub use {memory::MemoryQueue, sqlite::SqliteQueue};

/// Queue contract shared by the in-memory and durable implementations.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Append a command at the queued-list head. A command already queued or
    /// inflight for this agent is not enqueued twice.
    async fn enqueue(&self, agent_id: &str, command: Command) -> Result<()>;

    /// Return the next deliverable command, blocking up to `timeout`.
    ///
    /// Redelivery-eligible inflight entries (stalest first) win over fresh
    /// queued commands; a fresh command moves queued tail → inflight head.
    /// `None` on timeout.
    async fn poll(&self, agent_id: &str, timeout: Duration) -> Result<Option<Command>>;

    /// Record the result for a command and retire it from the inflight list.
    /// A result for an absent command is still stored; never an error.
    async fn store_result(&self, agent_id: &str, result: CommandResult) -> Result<()>;

    async fn get_result(&self, agent_id: &str, command_id: &str) -> Result<Option<CommandResult>>;
}
