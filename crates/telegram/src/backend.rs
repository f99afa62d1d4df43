//! HTTP client for the bot ↔ backend projection surface.
//!
//! Bot-originated calls authenticate with the `X-Telegram-User-ID` header;
//! the backend resolves the agent through the pairing binding.

use std::time::Duration;

use octo_protocol::{
    Command, CommandResult, ErrorEnvelope, ProjectRecord,
    api::{PairStartRequest, PairStartResponse, ProjectsResponse},
};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// No agent binding for this Telegram user.
    #[error("not paired")]
    NotPaired,

    #[error("{code}: {message}")]
    Api { code: String, message: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

pub struct BotBackend {
    base_url: String,
    http: reqwest::Client,
}

impl BotBackend {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn pair_start(
        &self,
        telegram_user_id: &str,
    ) -> Result<PairStartResponse, BackendError> {
        let response = self
            .http
            .post(format!("{}/v1/pair/start", self.base_url))
            .json(&PairStartRequest {
                telegram_user_id: telegram_user_id.to_string(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn send_command(
        &self,
        telegram_user_id: &str,
        command: &Command,
    ) -> Result<(), BackendError> {
        let response = self
            .http
            .post(format!("{}/v1/command", self.base_url))
            .header("X-Telegram-User-ID", telegram_user_id)
            .json(command)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BackendError::NotPaired);
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    /// `None` while the command has no stored result (or pairing is absent).
    pub async fn result_status(
        &self,
        telegram_user_id: &str,
        command_id: &str,
    ) -> Result<Option<CommandResult>, BackendError> {
        let response = self
            .http
            .get(format!("{}/v1/result/status", self.base_url))
            .query(&[
                ("telegram_user_id", telegram_user_id),
                ("command_id", command_id),
            ])
            .send()
            .await?;
        match response.status() {
            reqwest::StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(api_error(response).await),
        }
    }

    pub async fn projects(
        &self,
        telegram_user_id: &str,
    ) -> Result<Vec<ProjectRecord>, BackendError> {
        let response = self
            .http
            .get(format!("{}/v1/projects", self.base_url))
            .query(&[("telegram_user_id", telegram_user_id)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let body: ProjectsResponse = response.json().await?;
        Ok(body.projects)
    }
}

async fn api_error(response: reqwest::Response) -> BackendError {
    let status = response.status();
    match response.json::<ErrorEnvelope>().await {
        Ok(envelope) => BackendError::Api {
            code: envelope.error.code,
            message: envelope.error.message,
        },
        Err(_) => BackendError::Api {
            code: "internal".into(),
            message: format!("backend returned status {status}"),
        },
    }
}
