//! Wire contracts shared by the backend, the agent and the bot.
//!
//! All bodies are JSON with strict decoding: unknown fields are rejected.
//! Timestamps are RFC 3339 in UTC. The command `payload` is untyped on the
//! wire and decoded strictly per `type` via [`Command::typed_payload`].

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

pub mod api;
pub mod policy;

pub use policy::{Decision, ProjectPolicy, ProjectRecord, Scope};

// ── Constants ────────────────────────────────────────────────────────────────

/// Pair codes live this long before a claim is rejected.
pub const PAIRING_TTL_SECS: i64 = 600; // 10 min
/// An inflight command older than this is eligible for redelivery.
pub const REDELIVERY_TTL_SECS: i64 = 120;
/// Stored command results expire after this.
pub const RESULT_TTL_SECS: i64 = 14 * 24 * 3600; // 14 days
pub const IDEMPOTENCY_CAPACITY: usize = 1_000;
pub const IDEMPOTENCY_TTL_SECS: i64 = 24 * 3600;
pub const PORT_RANGE_MIN: u16 = 4096;
pub const PORT_RANGE_MAX: u16 = 4196;
pub const START_TIMEOUT_SECS: u64 = 10;
pub const RUN_TASK_TIMEOUT_SECS: u64 = 600;
pub const HEALTH_PROBE_INTERVAL_MS: u64 = 200;
/// Accepted bounds for `/v1/poll?timeout_seconds`.
pub const POLL_TIMEOUT_MIN_SECS: u64 = 1;
pub const POLL_TIMEOUT_MAX_SECS: u64 = 60;

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const VALIDATION_INVALID_PAYLOAD: &str = "validation.invalid_payload";
    pub const VALIDATION_REQUIRED_FIELD: &str = "validation.required_field";
    pub const VALIDATION_INVALID_TYPE: &str = "validation.invalid_type";
    pub const AUTH_UNAUTHORIZED: &str = "auth.unauthorized";
    pub const PAIRING_EXPIRED: &str = "pairing.expired";
    pub const PAIRING_INVALID_CODE: &str = "pairing.invalid_code";
    pub const PATH_INVALID: &str = "path.invalid";
    pub const PATH_FORBIDDEN: &str = "path.forbidden";
    pub const POLICY_DENIED: &str = "policy.denied";
    pub const PORT_EXHAUSTED: &str = "port.exhausted";
    pub const START_TIMEOUT: &str = "start.timeout";
    pub const INTERNAL: &str = "internal";
}

// ── Error shape ──────────────────────────────────────────────────────────────

/// `{code, message}` as carried inside the HTTP error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// `{ok:false, error:{code,message}}`, the shape of every failed HTTP response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

/// A validation failure with a stable error code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn required(field: &str) -> Self {
        Self::new(
            error_codes::VALIDATION_REQUIRED_FIELD,
            format!("missing required field: {field}"),
        )
    }
}

// ── Command types ────────────────────────────────────────────────────────────

/// The closed set of command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    RegisterProject,
    ApplyProjectPolicy,
    StartServer,
    RunTask,
    Status,
}

impl CommandType {
    /// Parse the wire string; `None` for anything outside the closed set.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "register_project" => Some(Self::RegisterProject),
            "apply_project_policy" => Some(Self::ApplyProjectPolicy),
            "start_server" => Some(Self::StartServer),
            "run_task" => Some(Self::RunTask),
            "status" => Some(Self::Status),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegisterProject => "register_project",
            Self::ApplyProjectPolicy => "apply_project_policy",
            Self::StartServer => "start_server",
            Self::RunTask => "run_task",
            Self::Status => "status",
        }
    }

    /// Mutating commands run strictly serialized inside the dispatcher;
    /// `status` bypasses the mutex so health checks stay responsive.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Status)
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Command ──────────────────────────────────────────────────────────────────

/// A queued unit of work addressed to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Command {
    pub command_id: String,
    pub idempotency_key: String,
    pub r#type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl Command {
    /// Build a fresh command with generated ids.
    pub fn new(kind: CommandType, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            command_id: format!("cmd-{}", uuid::Uuid::new_v4().simple()),
            idempotency_key: format!("idem-{}", uuid::Uuid::new_v4().simple()),
            r#type: kind.as_str().to_string(),
            created_at: now,
            payload: Some(payload),
        }
    }

    /// Decode the payload strictly for this command's type.
    pub fn typed_payload(&self) -> Result<TypedPayload, ValidationError> {
        let kind = CommandType::parse(&self.r#type).ok_or_else(|| {
            ValidationError::new(
                error_codes::VALIDATION_INVALID_TYPE,
                format!("unknown command type: {}", self.r#type),
            )
        })?;
        let payload = match &self.payload {
            Some(v) if !v.is_null() => v.clone(),
            _ => return Err(ValidationError::required("payload")),
        };
        let invalid = |e: serde_json::Error| {
            ValidationError::new(
                error_codes::VALIDATION_INVALID_PAYLOAD,
                format!("invalid {kind} payload: {e}"),
            )
        };
        Ok(match kind {
            CommandType::RegisterProject => {
                TypedPayload::RegisterProject(serde_json::from_value(payload).map_err(invalid)?)
            },
            CommandType::ApplyProjectPolicy => {
                TypedPayload::ApplyProjectPolicy(serde_json::from_value(payload).map_err(invalid)?)
            },
            CommandType::StartServer => {
                TypedPayload::StartServer(serde_json::from_value(payload).map_err(invalid)?)
            },
            CommandType::RunTask => {
                TypedPayload::RunTask(serde_json::from_value(payload).map_err(invalid)?)
            },
            CommandType::Status => {
                TypedPayload::Status(serde_json::from_value(payload).map_err(invalid)?)
            },
        })
    }
}

/// Reject commands with empty required fields, unknown types, or a missing
/// payload. Payload *content* is checked later by [`Command::typed_payload`].
pub fn validate_command(command: &Command) -> Result<CommandType, ValidationError> {
    if command.command_id.trim().is_empty() {
        return Err(ValidationError::required("command_id"));
    }
    if command.idempotency_key.trim().is_empty() {
        return Err(ValidationError::required("idempotency_key"));
    }
    let kind = CommandType::parse(&command.r#type).ok_or_else(|| {
        ValidationError::new(
            error_codes::VALIDATION_INVALID_TYPE,
            format!("unknown command type: {}", command.r#type),
        )
    })?;
    match &command.payload {
        Some(v) if !v.is_null() => Ok(kind),
        _ => Err(ValidationError::required("payload")),
    }
}

// ── Typed payloads ───────────────────────────────────────────────────────────

/// The command payload, decoded strictly per type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedPayload {
    RegisterProject(RegisterProjectPayload),
    ApplyProjectPolicy(ApplyPolicyPayload),
    StartServer(StartServerPayload),
    RunTask(RunTaskPayload),
    Status(StatusPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterProjectPayload {
    pub project_path_raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyPolicyPayload {
    pub project_id: String,
    pub decision: Decision,
    pub scope: Vec<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartServerPayload {
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunTaskPayload {
    pub project_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusPayload {}

// ── Command result ───────────────────────────────────────────────────────────

/// Outcome of executing one command, stored per `(agent_id, command_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandResult {
    pub command_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn ok(command_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            ok: true,
            error_code: None,
            summary: Some(summary.into()),
            stdout: None,
            stderr: None,
            meta: None,
        }
    }

    pub fn err(
        command_id: impl Into<String>,
        code: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            ok: false,
            error_code: Some(code.into()),
            summary: Some(summary.into()),
            stdout: None,
            stderr: None,
            meta: None,
        }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    #[must_use]
    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self
    }
}
