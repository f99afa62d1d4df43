//! Chat command routing, result relaying, and the approval callback flow.

use std::{sync::Arc, time::Duration};

use {
    chrono::Utc,
    teloxide::{
        payloads::SendMessageSetters,
        prelude::*,
        types::CallbackQuery,
    },
    tracing::{debug, warn},
};

use octo_protocol::{
    ApplyPolicyPayload, Command, CommandResult, CommandType, ProjectPolicy, ProjectRecord, Scope,
    error_codes,
};

use crate::{
    approval::{approval_keyboard, decode_callback},
    backend::{BackendError, BotBackend},
    state::{self, UserStateMap},
};

const HELP_TEXT: &str = "\
octo — remote control for your local code-gen CLI

/pair — link this chat to an agent on your machine
/project add <path> — register a project directory
/projects — list projects and their approvals
/serve <alias> — start the project's worker
/run <alias> <prompt> — run a task in a project
/status — agent health check";

/// Shared context for all update handlers.
pub struct RouterContext {
    pub bot: Bot,
    pub backend: Arc<BotBackend>,
    pub users: UserStateMap,
    pub relay_window: Duration,
    pub relay_interval: Duration,
}

// ── Command parsing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChatCommand {
    Start,
    Help,
    Pair,
    Projects,
    Status,
    ProjectAdd { path: String },
    Serve { alias: String },
    Run { alias: String, prompt: String },
    Malformed(&'static str),
    Unknown(String),
}

/// `None` for non-command text. Bot-username suffixes (`/run@octobot`) are
/// stripped.
pub(crate) fn parse_chat_command(text: &str) -> Option<ChatCommand> {
    let rest = text.trim().strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let head = parts.next()?;
    let name = head.split('@').next().unwrap_or(head);
    let command = match name {
        "start" => ChatCommand::Start,
        "help" => ChatCommand::Help,
        "pair" => ChatCommand::Pair,
        "projects" => ChatCommand::Projects,
        "status" => ChatCommand::Status,
        "project" => match parts.next() {
            Some("add") => {
                let path = parts.collect::<Vec<_>>().join(" ");
                if path.is_empty() {
                    ChatCommand::Malformed("Usage: /project add <path>")
                } else {
                    ChatCommand::ProjectAdd { path }
                }
            },
            _ => ChatCommand::Malformed("Usage: /project add <path>"),
        },
        "serve" => match parts.next() {
            Some(alias) => ChatCommand::Serve {
                alias: alias.to_string(),
            },
            None => ChatCommand::Malformed("Usage: /serve <alias>"),
        },
        "run" => {
            let alias = parts.next().map(str::to_string);
            let prompt = parts.collect::<Vec<_>>().join(" ");
            match alias {
                Some(alias) if !prompt.is_empty() => ChatCommand::Run { alias, prompt },
                _ => ChatCommand::Malformed("Usage: /run <alias> <prompt>"),
            }
        },
        other => ChatCommand::Unknown(other.to_string()),
    };
    Some(command)
}

// ── Message handling ────────────────────────────────────────────────────────

pub async fn handle_message(msg: Message, ctx: Arc<RouterContext>) -> anyhow::Result<()> {
    let Some(text) = msg.text().map(str::to_string) else {
        return Ok(());
    };
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let telegram_user_id = user.id.0.to_string();
    let chat_id = msg.chat.id;

    let Some(command) = parse_chat_command(&text) else {
        send(&ctx, chat_id, "Send /help to see what I can do.").await;
        return Ok(());
    };
    debug!(telegram_user_id, ?command, "chat command");

    match command {
        ChatCommand::Start | ChatCommand::Help => send(&ctx, chat_id, HELP_TEXT).await,
        ChatCommand::Malformed(usage) => send(&ctx, chat_id, usage).await,
        ChatCommand::Unknown(name) => {
            send(&ctx, chat_id, &format!("Unknown command /{name}. {HELP_TEXT}")).await;
        },
        ChatCommand::Pair => start_pairing_flow(&ctx, chat_id, &telegram_user_id, "").await,
        ChatCommand::Projects => {
            let now = Utc::now();
            let projects = refresh_projects(&ctx, &telegram_user_id).await;
            send(&ctx, chat_id, &render_projects(&projects, now)).await;
        },
        ChatCommand::Status => {
            enqueue_and_relay(
                &ctx,
                chat_id,
                &telegram_user_id,
                CommandType::Status,
                serde_json::json!({}),
                None,
            )
            .await;
        },
        ChatCommand::ProjectAdd { path } => {
            enqueue_and_relay(
                &ctx,
                chat_id,
                &telegram_user_id,
                CommandType::RegisterProject,
                serde_json::json!({"project_path_raw": path}),
                None,
            )
            .await;
        },
        ChatCommand::Serve { alias } => {
            let Some(project) = resolve_project(&ctx, &telegram_user_id, &alias).await else {
                send(&ctx, chat_id, &format!("Unknown project alias: {alias}")).await;
                return Ok(());
            };
            if !project.policy.allows(Scope::StartServer, Utc::now()) {
                prompt_approval(&ctx, chat_id, &project.alias).await;
                return Ok(());
            }
            enqueue_and_relay(
                &ctx,
                chat_id,
                &telegram_user_id,
                CommandType::StartServer,
                serde_json::json!({"project_id": project.project_id}),
                Some(project.alias),
            )
            .await;
        },
        ChatCommand::Run { alias, prompt } => {
            let Some(project) = resolve_project(&ctx, &telegram_user_id, &alias).await else {
                send(&ctx, chat_id, &format!("Unknown project alias: {alias}")).await;
                return Ok(());
            };
            if !project.policy.allows(Scope::RunTask, Utc::now()) {
                prompt_approval(&ctx, chat_id, &project.alias).await;
                return Ok(());
            }
            enqueue_and_relay(
                &ctx,
                chat_id,
                &telegram_user_id,
                CommandType::RunTask,
                serde_json::json!({"project_id": project.project_id, "prompt": prompt}),
                Some(project.alias),
            )
            .await;
        },
    }
    Ok(())
}

// ── Callback handling ───────────────────────────────────────────────────────

/// Inline keyboard press: decode the option, resolve the alias against the
/// current project list, and submit the chosen policy.
pub async fn handle_callback_query(
    query: CallbackQuery,
    ctx: Arc<RouterContext>,
) -> anyhow::Result<()> {
    let Some(data) = query.data.clone() else {
        return Ok(());
    };
    // Answer the callback to dismiss the loading spinner.
    let _ = ctx.bot.answer_callback_query(&query.id).await;

    let Some((option, alias_prefix)) = decode_callback(&data) else {
        debug!(data, "ignoring unknown callback payload");
        return Ok(());
    };
    let telegram_user_id = query.from.id.0.to_string();
    let Some(chat_id) = query.message.as_ref().map(|m| m.chat().id) else {
        return Ok(());
    };

    let Some(project) = resolve_project(&ctx, &telegram_user_id, alias_prefix).await else {
        send(&ctx, chat_id, &format!("Unknown project alias: {alias_prefix}")).await;
        return Ok(());
    };

    let now = Utc::now();
    let (decision, scope, expires_at) = option.to_policy(now);
    let payload = ApplyPolicyPayload {
        project_id: project.project_id.clone(),
        decision,
        scope: scope.clone(),
        expires_at,
    };
    let command = Command::new(
        CommandType::ApplyProjectPolicy,
        serde_json::to_value(&payload)?,
        now,
    );

    match ctx.backend.send_command(&telegram_user_id, &command).await {
        Ok(()) => {
            state::note_command(
                &ctx.users,
                &telegram_user_id,
                &command.command_id,
                CommandType::ApplyProjectPolicy,
            );
            // Optimistic local policy view; the agent's result confirms it.
            state::with_user(&ctx.users, &telegram_user_id, |user| {
                if let Some(record) = user
                    .projects
                    .iter_mut()
                    .find(|p| p.project_id == project.project_id)
                {
                    record.policy = ProjectPolicy {
                        decision,
                        scope,
                        expires_at,
                    };
                }
            });
            send(
                &ctx,
                chat_id,
                &format!("Recorded {} for {}.", option.label(), project.alias),
            )
            .await;
            spawn_result_relay(
                Arc::clone(&ctx),
                chat_id,
                telegram_user_id,
                command.command_id,
                None,
            );
        },
        Err(BackendError::NotPaired) => {
            start_pairing_flow(&ctx, chat_id, &telegram_user_id, "").await;
        },
        Err(e) => send(&ctx, chat_id, &format!("❌ {e}")).await,
    }
    Ok(())
}

// ── Backend plumbing ────────────────────────────────────────────────────────

/// Enqueue a command and relay its outcome. A `NotPaired` rejection flips
/// into the pairing flow instead of an error message.
async fn enqueue_and_relay(
    ctx: &Arc<RouterContext>,
    chat_id: ChatId,
    telegram_user_id: &str,
    kind: CommandType,
    payload: serde_json::Value,
    alias_for_approval: Option<String>,
) {
    let command = Command::new(kind, payload, Utc::now());
    match ctx.backend.send_command(telegram_user_id, &command).await {
        Ok(()) => {
            state::with_user(&ctx.users, telegram_user_id, |user| {
                user.paired = true;
                user.pending_pair_code = None;
            });
            state::note_command(&ctx.users, telegram_user_id, &command.command_id, kind);
            spawn_result_relay(
                Arc::clone(ctx),
                chat_id,
                telegram_user_id.to_string(),
                command.command_id,
                alias_for_approval,
            );
        },
        Err(BackendError::NotPaired) => {
            state::with_user(&ctx.users, telegram_user_id, |user| user.paired = false);
            start_pairing_flow(
                ctx,
                chat_id,
                telegram_user_id,
                "No agent is linked to this chat yet.\n\n",
            )
            .await;
        },
        Err(e) => send(ctx, chat_id, &format!("❌ {e}")).await,
    }
}

async fn start_pairing_flow(
    ctx: &Arc<RouterContext>,
    chat_id: ChatId,
    telegram_user_id: &str,
    preamble: &str,
) {
    match ctx.backend.pair_start(telegram_user_id).await {
        Ok(issued) => {
            state::with_user(&ctx.users, telegram_user_id, |user| {
                user.pending_pair_code = Some(issued.pairing_code.clone());
            });
            send(
                ctx,
                chat_id,
                &format!(
                    "{preamble}Pairing code: {}\n\nOn your machine run:\n  octo agent pair \
                     --code {}\n\nThe code expires at {}. Once claimed, repeat your command.",
                    issued.pairing_code,
                    issued.pairing_code,
                    issued.expires_at.format("%H:%M UTC"),
                ),
            )
            .await;
        },
        Err(e) => send(ctx, chat_id, &format!("❌ {e}")).await,
    }
}

/// Fetch the per-user project view, falling back to the cached copy when the
/// backend is unreachable.
async fn refresh_projects(ctx: &Arc<RouterContext>, telegram_user_id: &str) -> Vec<ProjectRecord> {
    match ctx.backend.projects(telegram_user_id).await {
        Ok(projects) => {
            state::with_user(&ctx.users, telegram_user_id, |user| {
                user.projects = projects.clone();
            });
            projects
        },
        Err(e) => {
            warn!(error = %e, "project view fetch failed, using cached copy");
            state::snapshot_user(&ctx.users, telegram_user_id).projects
        },
    }
}

/// Exact alias match, else a unique prefix (callback payloads may carry a
/// truncated alias).
async fn resolve_project(
    ctx: &Arc<RouterContext>,
    telegram_user_id: &str,
    alias: &str,
) -> Option<ProjectRecord> {
    let projects = refresh_projects(ctx, telegram_user_id).await;
    if let Some(exact) = projects.iter().find(|p| p.alias == alias) {
        return Some(exact.clone());
    }
    let mut matches = projects.iter().filter(|p| p.alias.starts_with(alias));
    match (matches.next(), matches.next()) {
        (Some(only), None) => Some(only.clone()),
        _ => None,
    }
}

async fn prompt_approval(ctx: &Arc<RouterContext>, chat_id: ChatId, alias: &str) {
    let _ = ctx
        .bot
        .send_message(
            chat_id,
            format!("🔒 {alias} needs your approval before the agent may act:"),
        )
        .reply_markup(approval_keyboard(alias))
        .await;
}

/// Poll `/v1/result/status` for a bounded window, then report either the
/// outcome or a still-queued notice. Fire-and-forget.
fn spawn_result_relay(
    ctx: Arc<RouterContext>,
    chat_id: ChatId,
    telegram_user_id: String,
    command_id: String,
    alias_for_approval: Option<String>,
) {
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + ctx.relay_window;
        loop {
            match ctx.backend.result_status(&telegram_user_id, &command_id).await {
                Ok(Some(result)) => {
                    let denied =
                        result.error_code.as_deref() == Some(error_codes::POLICY_DENIED);
                    if denied && let Some(ref alias) = alias_for_approval {
                        prompt_approval(&ctx, chat_id, alias).await;
                    } else {
                        send(&ctx, chat_id, &render_result(&result)).await;
                    }
                    return;
                },
                Ok(None) => {},
                Err(e) => debug!(error = %e, "result relay poll failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                send(
                    &ctx,
                    chat_id,
                    "⏳ No result yet — the agent may be offline. The command stays queued.",
                )
                .await;
                return;
            }
            tokio::time::sleep(ctx.relay_interval).await;
        }
    });
}

async fn send(ctx: &Arc<RouterContext>, chat_id: ChatId, text: &str) {
    if let Err(e) = ctx.bot.send_message(chat_id, text).await {
        warn!(error = %e, "failed to send telegram message");
    }
}

// ── Rendering ───────────────────────────────────────────────────────────────

pub(crate) fn render_result(result: &CommandResult) -> String {
    if result.ok {
        let mut text = format!(
            "✅ {}",
            result.summary.as_deref().unwrap_or("done")
        );
        if let Some(stdout) = result.stdout.as_deref()
            && !stdout.trim().is_empty()
        {
            text.push_str("\n\n");
            text.push_str(&tail(stdout, 1500));
        }
        return text;
    }

    let code = result.error_code.as_deref().unwrap_or(error_codes::INTERNAL);
    let summary = result.summary.as_deref().unwrap_or("command failed");
    let hint = match code {
        error_codes::POLICY_DENIED => "\nApproval required — use /run or /serve to get the buttons.",
        error_codes::PATH_FORBIDDEN => "\nThat directory cannot be registered.",
        error_codes::START_TIMEOUT => "\nThe worker did not come up in time.",
        error_codes::PORT_EXHAUSTED => "\nNo free worker ports on the agent.",
        _ => "",
    };
    format!("❌ {summary} ({code}){hint}")
}

pub(crate) fn render_projects(
    projects: &[ProjectRecord],
    now: chrono::DateTime<Utc>,
) -> String {
    if projects.is_empty() {
        return "No projects yet. Use /project add <path> to register one.".into();
    }
    let mut lines = vec!["Your projects:".to_string()];
    for project in projects {
        let serve = project.policy.allows(Scope::StartServer, now);
        let run = project.policy.allows(Scope::RunTask, now);
        let badge = if serve || run { "🟢" } else { "⚫" };
        let grants = match (serve, run) {
            (true, true) => "start + run".to_string(),
            (true, false) => "start only".to_string(),
            (false, true) => "run only".to_string(),
            (false, false) => "denied".to_string(),
        };
        let expiry = match project.policy.expires_at {
            Some(at) if serve || run => format!(" until {}", at.format("%H:%M UTC")),
            _ => String::new(),
        };
        lines.push(format!(
            "{badge} {} — {}\n    {grants}{expiry}",
            project.alias, project.project_path
        ));
    }
    lines.join("\n")
}

/// Last `max_chars` of `s`, on a char boundary.
fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}
