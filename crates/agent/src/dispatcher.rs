//! Command dispatcher: validate → idempotency lookup → handler → cache.
//!
//! Failures cross this boundary as non-OK results with stable error codes,
//! never as errors. Mutating commands (`register_project`,
//! `apply_project_policy`, `start_server`, `run_task`) run under a
//! process-wide mutex; `status` bypasses it so health checks stay responsive.

use std::sync::Arc;

use tracing::{debug, warn};

use {
    octo_common::Clock,
    octo_protocol::{
        Command, CommandResult, ProjectPolicy, RunTaskPayload, Scope, TypedPayload, error_codes,
        validate_command,
    },
};

use crate::{
    idempotency::IdempotencyCache,
    registry::{LocalProject, ProjectRegistry},
    worker::WorkerSupervisor,
};

pub struct Dispatcher {
    agent_id: String,
    clock: Arc<dyn Clock>,
    cache: IdempotencyCache,
    mutating: tokio::sync::Mutex<()>,
    registry: Arc<ProjectRegistry>,
    workers: Arc<WorkerSupervisor>,
}

impl Dispatcher {
    pub fn new(
        agent_id: String,
        clock: Arc<dyn Clock>,
        registry: Arc<ProjectRegistry>,
        workers: Arc<WorkerSupervisor>,
    ) -> Self {
        let cache = IdempotencyCache::new(Arc::clone(&clock));
        Self {
            agent_id,
            clock,
            cache,
            mutating: tokio::sync::Mutex::new(()),
            registry,
            workers,
        }
    }

    pub async fn handle_command(&self, command: &Command) -> CommandResult {
        let kind = match validate_command(command) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(command_id = %command.command_id, code = e.code, "command failed validation");
                return CommandResult::err(&command.command_id, e.code, e.message);
            },
        };

        if let Some(cached) = self.cache.get(&command.idempotency_key) {
            debug!(
                command_id = %command.command_id,
                cached_command_id = %cached.command_id,
                "idempotency hit, replaying cached result"
            );
            return cached;
        }

        let mut result = match command.typed_payload() {
            Ok(typed) => {
                if kind.is_mutating() {
                    let _serialized = self.mutating.lock().await;
                    self.execute(typed, command).await
                } else {
                    self.execute(typed, command).await
                }
            },
            Err(e) => CommandResult::err(&command.command_id, e.code, e.message),
        };

        if result.command_id.trim().is_empty() {
            result.command_id = command.command_id.clone();
        }
        self.cache
            .put(command.idempotency_key.clone(), result.clone());
        result
    }

    async fn execute(&self, typed: TypedPayload, command: &Command) -> CommandResult {
        let command_id = command.command_id.as_str();
        match typed {
            TypedPayload::RegisterProject(payload) => {
                match self.registry.register(&self.agent_id, &payload.project_path_raw) {
                    Ok(project) => CommandResult::ok(command_id, "project registered").with_meta(
                        serde_json::json!({
                            "project_id": project.project_id,
                            "alias": project.alias,
                            "project_path": project.path.to_string_lossy(),
                        }),
                    ),
                    Err(e) => CommandResult::err(command_id, e.code(), e.to_string()),
                }
            },
            TypedPayload::ApplyProjectPolicy(payload) => {
                let policy = ProjectPolicy {
                    decision: payload.decision,
                    scope: payload.scope,
                    expires_at: payload.expires_at,
                };
                match self.registry.apply_policy(&payload.project_id, policy.clone()) {
                    Ok(()) => CommandResult::ok(command_id, "policy applied").with_meta(
                        serde_json::to_value(&policy).unwrap_or_else(|_| serde_json::json!({})),
                    ),
                    Err(e) => CommandResult::err(command_id, e.code(), e.to_string()),
                }
            },
            TypedPayload::StartServer(payload) => {
                self.start_server(&payload.project_id, command_id).await
            },
            TypedPayload::RunTask(payload) => self.run_task(&payload, command_id).await,
            TypedPayload::Status(_) => CommandResult::ok(command_id, "agent healthy").with_meta(
                serde_json::json!({"workers": self.workers.running_count().await}),
            ),
        }
    }

    /// Policy gate, then reuse-or-start. No worker is spawned on a denial.
    async fn start_server(&self, project_id: &str, command_id: &str) -> CommandResult {
        let Some(project) = self.gated_project(project_id, Scope::StartServer) else {
            return self.denied_or_unknown(project_id, command_id);
        };
        match self.workers.ensure_running(project_id, &project.path).await {
            Ok(ready) => CommandResult::ok(
                command_id,
                format!("worker ready on port {}", ready.port),
            )
            .with_meta(serde_json::json!({"port": ready.port, "reused": ready.reused})),
            Err(e) => CommandResult::err(command_id, e.code(), e.to_string()),
        }
    }

    async fn run_task(&self, payload: &RunTaskPayload, command_id: &str) -> CommandResult {
        let Some(project) = self.gated_project(&payload.project_id, Scope::RunTask) else {
            return self.denied_or_unknown(&payload.project_id, command_id);
        };
        let ready = match self
            .workers
            .ensure_running(&payload.project_id, &project.path)
            .await
        {
            Ok(ready) => ready,
            Err(e) => return CommandResult::err(command_id, e.code(), e.to_string()),
        };
        match self
            .workers
            .run_attached(ready.port, &project.path, &payload.prompt)
            .await
        {
            Ok(output) if output.exit_code == 0 => {
                CommandResult::ok(command_id, "task completed")
                    .with_output(output.stdout, output.stderr)
            },
            Ok(output) => CommandResult::err(
                command_id,
                error_codes::INTERNAL,
                format!("task exited with status {}", output.exit_code),
            )
            .with_output(output.stdout, output.stderr),
            Err(e) => CommandResult::err(command_id, e.code(), e.to_string()),
        }
    }

    /// The registered project, provided the scope is currently effective.
    fn gated_project(&self, project_id: &str, scope: Scope) -> Option<LocalProject> {
        if !self
            .registry
            .policy_allows(project_id, scope, self.clock.now())
        {
            return None;
        }
        self.registry.get(project_id)
    }

    fn denied_or_unknown(&self, project_id: &str, command_id: &str) -> CommandResult {
        if self.registry.get(project_id).is_none()
            && !self
                .registry
                .policy_allows(project_id, Scope::StartServer, self.clock.now())
            && !self
                .registry
                .policy_allows(project_id, Scope::RunTask, self.clock.now())
        {
            // Never registered and no policy either way.
            return CommandResult::err(
                command_id,
                error_codes::POLICY_DENIED,
                "no consent recorded for this project",
            );
        }
        if self.registry.get(project_id).is_none() {
            return CommandResult::err(
                command_id,
                error_codes::PATH_INVALID,
                "project is not registered on this agent",
            );
        }
        CommandResult::err(
            command_id,
            error_codes::POLICY_DENIED,
            "the requested scope is not allowed for this project",
        )
    }
}
