//! HTTP client for the agent ↔ backend command plane.

use std::time::Duration;

use {
    anyhow::{Context, Result, bail},
    secrecy::{ExposeSecret, Secret},
};

use octo_protocol::{
    Command, CommandResult,
    api::{PairClaimRequest, PairClaimResponse, PollResponse},
};

pub struct BackendClient {
    base_url: String,
    agent_key: Secret<String>,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, agent_key: Secret<String>) -> Result<Self> {
        // The request timeout must outlast the longest server-side poll wait.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(75))
            .build()
            .context("building http client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent_key,
            http,
        })
    }

    /// Long-poll for the next command. `None` when the wait timed out.
    pub async fn poll(&self, timeout_seconds: u64) -> Result<Option<Command>> {
        let response = self
            .http
            .get(format!("{}/v1/poll", self.base_url))
            .query(&[("timeout_seconds", timeout_seconds)])
            .bearer_auth(self.agent_key.expose_secret())
            .send()
            .await
            .context("polling backend")?;
        match response.status() {
            reqwest::StatusCode::NO_CONTENT => Ok(None),
            reqwest::StatusCode::OK => {
                let body: PollResponse = response.json().await.context("decoding poll body")?;
                Ok(Some(body.command))
            },
            status => bail!("poll failed with status {status}"),
        }
    }

    pub async fn post_result(&self, result: &CommandResult) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/v1/result", self.base_url))
            .bearer_auth(self.agent_key.expose_secret())
            .json(result)
            .send()
            .await
            .context("posting result")?;
        if !response.status().is_success() {
            bail!("result post failed with status {}", response.status());
        }
        Ok(())
    }

    /// Claim a pairing code. Unauthenticated; used once by `octo agent pair`.
    pub async fn claim_pairing(
        base_url: &str,
        pairing_code: &str,
        device_info: &str,
    ) -> Result<PairClaimResponse> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building http client")?;
        let response = http
            .post(format!(
                "{}/v1/pair/claim",
                base_url.trim_end_matches('/')
            ))
            .json(&PairClaimRequest {
                pairing_code: pairing_code.to_string(),
                device_info: device_info.to_string(),
            })
            .send()
            .await
            .context("claiming pairing code")?;
        if !response.status().is_success() {
            bail!("pairing claim failed with status {}", response.status());
        }
        response.json().await.context("decoding claim body")
    }
}
