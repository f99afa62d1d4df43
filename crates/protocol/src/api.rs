//! Request/response bodies for the backend HTTP surface.

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

use crate::{Command, ProjectRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairStartRequest {
    pub telegram_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairStartResponse {
    pub pairing_code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairClaimRequest {
    pub pairing_code: String,
    pub device_info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairClaimResponse {
    pub agent_id: String,
    pub agent_key: String,
}

/// `200` body of `/v1/poll`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub command: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectsResponse {
    pub projects: Vec<ProjectRecord>,
}

/// `{ok:true}`, the body of accepted mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn new() -> Self {
        Self { ok: true }
    }
}

impl Default for OkResponse {
    fn default() -> Self {
        Self::new()
    }
}
