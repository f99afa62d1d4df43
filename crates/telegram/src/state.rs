//! Per-user bot state: pairing progress, recent commands, and the cached
//! project view used for optimistic policy checks.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use octo_protocol::{CommandType, ProjectRecord};

/// Recent commands kept per user.
const RECENT_COMMANDS_CAP: usize = 20;

pub type UserStateMap = Arc<RwLock<HashMap<String, UserState>>>;

#[derive(Debug, Clone)]
pub struct RecentCommand {
    pub command_id: String,
    pub command_type: CommandType,
}

#[derive(Debug, Default, Clone)]
pub struct UserState {
    /// Whether an agent has successfully claimed a code for this user.
    pub paired: bool,
    pub pending_pair_code: Option<String>,
    pub recent_commands: Vec<RecentCommand>,
    /// Cached `/v1/projects` view, updated optimistically on approvals.
    pub projects: Vec<ProjectRecord>,
}

pub fn new_user_state_map() -> UserStateMap {
    Arc::new(RwLock::new(HashMap::new()))
}

pub fn with_user<R>(
    users: &UserStateMap,
    telegram_user_id: &str,
    update: impl FnOnce(&mut UserState) -> R,
) -> R {
    let mut map = users.write().unwrap_or_else(|e| e.into_inner());
    update(map.entry(telegram_user_id.to_string()).or_default())
}

pub fn snapshot_user(users: &UserStateMap, telegram_user_id: &str) -> UserState {
    let map = users.read().unwrap_or_else(|e| e.into_inner());
    map.get(telegram_user_id).cloned().unwrap_or_default()
}

pub fn note_command(
    users: &UserStateMap,
    telegram_user_id: &str,
    command_id: &str,
    command_type: CommandType,
) {
    with_user(users, telegram_user_id, |state| {
        state.recent_commands.push(RecentCommand {
            command_id: command_id.to_string(),
            command_type,
        });
        if state.recent_commands.len() > RECENT_COMMANDS_CAP {
            let overflow = state.recent_commands.len() - RECENT_COMMANDS_CAP;
            state.recent_commands.drain(..overflow);
        }
    });
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_commands_are_capped() {
        let users = new_user_state_map();
        for i in 0..30 {
            note_command(&users, "tg-1", &format!("cmd-{i}"), CommandType::Status);
        }
        let state = snapshot_user(&users, "tg-1");
        assert_eq!(state.recent_commands.len(), RECENT_COMMANDS_CAP);
        assert_eq!(state.recent_commands[0].command_id, "cmd-10");
        assert_eq!(state.recent_commands.last().unwrap().command_id, "cmd-29");
    }

    #[test]
    fn snapshot_of_unknown_user_is_default() {
        let users = new_user_state_map();
        let state = snapshot_user(&users, "tg-9");
        assert!(!state.paired);
        assert!(state.pending_pair_code.is_none());
    }
}
