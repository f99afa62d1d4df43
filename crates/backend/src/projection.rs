//! Projects agent results onto the per-user project view.

use tracing::debug;

use octo_protocol::{CommandResult, CommandType, ProjectPolicy, ProjectRecord};

use crate::state::BackendState;

fn meta_str(meta: Option<&serde_json::Value>, key: &str) -> Option<String> {
    meta.and_then(|m| m.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Fold one completed command into the view. Only OK outcomes of
/// `register_project` and `apply_project_policy` change anything; the meta
/// entry is consumed either way so the table stays bounded.
pub fn apply_result_projection(state: &BackendState, agent_id: &str, result: &CommandResult) {
    let Some(meta) = state.take_meta(agent_id, &result.command_id) else {
        return;
    };
    if !result.ok {
        return;
    }

    match meta.command_type {
        CommandType::RegisterProject => {
            // Prefer the agent's canonical values from the result meta over
            // the raw facts captured at enqueue time.
            let result_meta = result.meta.as_ref();
            let Some(project_id) =
                meta_str(result_meta, "project_id").or(meta.project_id.clone())
            else {
                debug!(agent_id, command_id = %result.command_id, "register result without project_id");
                return;
            };
            let project_path = meta_str(result_meta, "project_path")
                .or(meta.project_path)
                .unwrap_or_default();
            let alias = meta_str(result_meta, "alias")
                .or(meta.alias)
                .unwrap_or_else(|| project_id.clone());
            state.upsert_project(
                &meta.telegram_user_id,
                ProjectRecord {
                    project_id,
                    alias,
                    project_path,
                    policy: ProjectPolicy::deny_all(),
                    last_updated: state.clock.now(),
                },
            );
        },
        CommandType::ApplyProjectPolicy => {
            let Some(project_id) = meta.project_id else {
                return;
            };
            let Some(policy) = result
                .meta
                .as_ref()
                .and_then(|m| serde_json::from_value::<ProjectPolicy>(m.clone()).ok())
            else {
                debug!(agent_id, command_id = %result.command_id, "policy result without decodable meta");
                return;
            };
            let now = state.clock.now();
            let updated =
                state.update_project(&meta.telegram_user_id, &project_id, |record| {
                    record.policy = policy;
                    record.last_updated = now;
                });
            if !updated {
                debug!(project_id, "policy projection for unknown project, skipping");
            }
        },
        _ => {},
    }
}
