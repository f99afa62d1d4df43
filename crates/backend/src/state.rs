use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use {octo_common::Clock, octo_pairing::PairingStore, octo_queue::CommandQueue};

use octo_protocol::{CommandType, ProjectRecord};

/// Payload facts captured at enqueue time so a later result can be projected
/// into the per-user project view.
#[derive(Debug, Clone)]
pub struct CommandMeta {
    pub telegram_user_id: String,
    pub command_type: CommandType,
    pub project_id: Option<String>,
    pub alias: Option<String>,
    pub project_path: Option<String>,
}

/// Shared backend state. Queues and bindings are owned by their stores; the
/// command-meta table and project view are in-process projections rebuilt
/// from agent results.
pub struct BackendState {
    pub pairing: Arc<PairingStore>,
    pub queue: Arc<dyn CommandQueue>,
    pub clock: Arc<dyn Clock>,
    /// `(agent_id, command_id)` → meta, consumed at projection time.
    meta: Mutex<HashMap<(String, String), CommandMeta>>,
    /// `telegram_user_id` → `project_id` → record.
    projects: Mutex<HashMap<String, BTreeMap<String, ProjectRecord>>>,
}

impl BackendState {
    pub fn new(
        pairing: Arc<PairingStore>,
        queue: Arc<dyn CommandQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pairing,
            queue,
            clock,
            meta: Mutex::new(HashMap::new()),
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_meta(&self, agent_id: &str, command_id: &str, meta: CommandMeta) {
        let mut table = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        table.insert((agent_id.to_string(), command_id.to_string()), meta);
    }

    pub fn take_meta(&self, agent_id: &str, command_id: &str) -> Option<CommandMeta> {
        let mut table = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        table.remove(&(agent_id.to_string(), command_id.to_string()))
    }

    pub fn upsert_project(&self, telegram_user_id: &str, record: ProjectRecord) {
        let mut projects = self.projects.lock().unwrap_or_else(|e| e.into_inner());
        projects
            .entry(telegram_user_id.to_string())
            .or_default()
            .insert(record.project_id.clone(), record);
    }

    pub fn update_project<F>(&self, telegram_user_id: &str, project_id: &str, update: F) -> bool
    where
        F: FnOnce(&mut ProjectRecord),
    {
        let mut projects = self.projects.lock().unwrap_or_else(|e| e.into_inner());
        match projects
            .get_mut(telegram_user_id)
            .and_then(|m| m.get_mut(project_id))
        {
            Some(record) => {
                update(record);
                true
            },
            None => false,
        }
    }

    pub fn projects_for_user(&self, telegram_user_id: &str) -> Vec<ProjectRecord> {
        let projects = self.projects.lock().unwrap_or_else(|e| e.into_inner());
        projects
            .get(telegram_user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}
