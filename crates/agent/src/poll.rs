//! The agent poll loop: long-poll, dispatch, report, back off on errors.

use std::{sync::Arc, time::Duration};

use {
    rand::Rng,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{client::BackendClient, dispatcher::Dispatcher};

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub timeout_seconds: u64,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// `min(backoff_max, backoff_base << attempt)` plus up to a fifth of jitter.
fn backoff_delay(config: &PollConfig, attempt: u32) -> Duration {
    let base_ms = config.backoff_base.as_millis() as u64;
    let shifted = 1u64
        .checked_shl(attempt)
        .map(|factor| base_ms.saturating_mul(factor))
        .unwrap_or(u64::MAX);
    let capped = shifted.min(config.backoff_max.as_millis() as u64);
    let jitter = rand::rng().random_range(0..=capped / 5);
    Duration::from_millis(capped + jitter)
}

/// Run until cancelled. Transport errors back off exponentially and are
/// never surfaced to the user; a failed result post relies on redelivery
/// plus the idempotency cache to replay the same result later.
pub async fn run_poll_loop(
    client: Arc<BackendClient>,
    dispatcher: Arc<Dispatcher>,
    config: PollConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    info!("agent poll loop started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = client.poll(config.timeout_seconds) => polled,
        };
        match polled {
            Ok(Some(command)) => {
                attempt = 0;
                debug!(command_id = %command.command_id, r#type = %command.r#type, "command received");
                let result = dispatcher.handle_command(&command).await;
                if let Err(e) = client.post_result(&result).await {
                    warn!(command_id = %command.command_id, error = %e, "posting result failed");
                    attempt += 1;
                    sleep_backoff(&config, attempt, &cancel).await;
                }
            },
            Ok(None) => {
                attempt = 0;
            },
            Err(e) => {
                warn!(error = %e, "poll failed");
                attempt += 1;
                sleep_backoff(&config, attempt, &cancel).await;
            },
        }
    }
    info!("agent poll loop stopped");
}

async fn sleep_backoff(config: &PollConfig, attempt: u32, cancel: &CancellationToken) {
    let delay = backoff_delay(config, attempt);
    debug!(?delay, attempt, "backing off");
    tokio::select! {
        _ = cancel.cancelled() => {},
        _ = tokio::time::sleep(delay) => {},
    }
}
