use std::time::Duration;

use secrecy::Secret;

/// Configuration for the bot process.
#[derive(Clone)]
pub struct BotConfig {
    /// Bot token from @BotFather.
    pub token: Secret<String>,
    /// Base URL of the octo backend.
    pub backend_url: String,
    /// How long a result relay keeps polling before giving up.
    pub relay_window: Duration,
    /// Interval between relay polls.
    pub relay_interval: Duration,
}

impl BotConfig {
    pub fn new(token: Secret<String>, backend_url: impl Into<String>) -> Self {
        Self {
            token,
            backend_url: backend_url.into(),
            relay_window: Duration::from_secs(2),
            relay_interval: Duration::from_millis(250),
        }
    }
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("token", &"[REDACTED]")
            .field("backend_url", &self.backend_url)
            .finish_non_exhaustive()
    }
}
