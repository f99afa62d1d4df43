//! Agent-local project registry: canonical paths, stable project ids, and
//! the per-project policy store.
//!
//! Registration admits only canonicalized paths outside the forbidden set.
//! Policies live keyed by project id and start at DENY; `apply_project_policy`
//! overwrites a policy even when no registration exists yet.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::RwLock,
};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    tracing::info,
};

use octo_protocol::{ProjectPolicy, Scope, error_codes};

/// Roots no project may live at or under.
const FORBIDDEN_ROOTS: &[&str] = &[
    "/etc", "/bin", "/usr", "/var", "/System", "/Library", "/home", "/Users",
];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("project path cannot be resolved: {0}")]
    InvalidPath(String),

    #[error("project path is forbidden: {0}")]
    ForbiddenPath(String),

    #[error("failed to persist project registry")]
    Persist(#[source] std::io::Error),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPath(_) => error_codes::PATH_INVALID,
            Self::ForbiddenPath(_) => error_codes::PATH_FORBIDDEN,
            Self::Persist(_) => error_codes::INTERNAL,
        }
    }
}

/// A registered project on this agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalProject {
    pub project_id: String,
    pub alias: String,
    pub path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    projects: Vec<LocalProject>,
    #[serde(default)]
    policies: HashMap<String, ProjectPolicy>,
}

#[derive(Default)]
struct Inner {
    projects: HashMap<String, LocalProject>,
    policies: HashMap<String, ProjectPolicy>,
}

/// TOML-file-persisted registry. `None` keeps everything in memory.
pub struct ProjectRegistry {
    file_path: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl ProjectRegistry {
    pub fn in_memory() -> Self {
        Self {
            file_path: None,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Open a registry backed by `path`, loading any existing state.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let inner = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let file: RegistryFile = toml::from_str(&data)?;
            Inner {
                projects: file
                    .projects
                    .into_iter()
                    .map(|p| (p.project_id.clone(), p))
                    .collect(),
                policies: file.policies,
            }
        } else {
            Inner::default()
        };
        Ok(Self {
            file_path: Some(path),
            inner: RwLock::new(inner),
        })
    }

    fn persist(&self, inner: &Inner) -> Result<(), RegistryError> {
        let Some(ref path) = self.file_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(RegistryError::Persist)?;
        }
        let file = RegistryFile {
            projects: inner.projects.values().cloned().collect(),
            policies: inner.policies.clone(),
        };
        let data = toml::to_string_pretty(&file)
            .map_err(|e| RegistryError::Persist(std::io::Error::other(e)))?;
        std::fs::write(path, data).map_err(RegistryError::Persist)
    }

    /// Canonicalize, admit, hash and persist a project. The policy resets to
    /// DENY; registration is the stronger consent event.
    pub fn register(&self, agent_id: &str, raw_path: &str) -> Result<LocalProject, RegistryError> {
        let canonical = std::fs::canonicalize(raw_path)
            .map_err(|_| RegistryError::InvalidPath(raw_path.to_string()))?;
        check_forbidden(&canonical)?;

        let project_id = project_id_for(agent_id, &canonical);
        let alias = canonical
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| project_id.clone());
        let project = LocalProject {
            project_id: project_id.clone(),
            alias,
            path: canonical,
        };

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.projects.insert(project_id.clone(), project.clone());
        inner.policies.insert(project_id.clone(), ProjectPolicy::deny_all());
        self.persist(&inner)?;
        info!(project_id, path = %project.path.display(), "project registered");
        Ok(project)
    }

    /// Overwrite the policy for a project id, registered or not.
    pub fn apply_policy(
        &self,
        project_id: &str,
        policy: ProjectPolicy,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.policies.insert(project_id.to_string(), policy);
        self.persist(&inner)?;
        info!(project_id, "project policy applied");
        Ok(())
    }

    pub fn policy_allows(&self, project_id: &str, scope: Scope, now: DateTime<Utc>) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .policies
            .get(project_id)
            .is_some_and(|policy| policy.allows(scope, now))
    }

    pub fn get(&self, project_id: &str) -> Option<LocalProject> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.projects.get(project_id).cloned()
    }

    pub fn list(&self) -> Vec<LocalProject> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.projects.values().cloned().collect()
    }
}

/// `hex(SHA-256(agent_id || '\n' || canonical_path))`, stable across
/// restarts for the same (agent, path).
pub fn project_id_for(agent_id: &str, canonical_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_path.to_string_lossy().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn check_forbidden(path: &Path) -> Result<(), RegistryError> {
    let display = path.display().to_string();
    if path == Path::new("/") {
        return Err(RegistryError::ForbiddenPath(display));
    }
    if let Some(home) = dirs_next::home_dir()
        && path == home
    {
        return Err(RegistryError::ForbiddenPath(display));
    }
    for root in FORBIDDEN_ROOTS {
        if path.starts_with(root) {
            return Err(RegistryError::ForbiddenPath(display));
        }
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        octo_protocol::Decision,
        std::fs,
    };

    #[test]
    fn register_accepts_fresh_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::in_memory();
        let project = registry
            .register("agent-1", &dir.path().to_string_lossy())
            .unwrap();

        let canonical = fs::canonicalize(dir.path()).unwrap();
        assert_eq!(project.path, canonical);
        assert_eq!(project.project_id, project_id_for("agent-1", &canonical));
        assert_eq!(
            project.alias,
            canonical.file_name().unwrap().to_string_lossy()
        );
    }

    #[test]
    fn project_id_is_stable_across_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::in_memory();
        let first = registry
            .register("agent-1", &dir.path().to_string_lossy())
            .unwrap();
        let second = registry
            .register("agent-1", &dir.path().to_string_lossy())
            .unwrap();
        assert_eq!(first.project_id, second.project_id);

        // A different agent hashes to a different id for the same path.
        let other = registry
            .register("agent-2", &dir.path().to_string_lossy())
            .unwrap();
        assert_ne!(first.project_id, other.project_id);
    }

    #[test]
    fn forbidden_paths_reject() {
        let registry = ProjectRegistry::in_memory();
        let home = dirs_next::home_dir().unwrap();
        for path in [
            "/".to_string(),
            "/etc".to_string(),
            home.to_string_lossy().into_owned(),
            "/usr/local".to_string(),
        ] {
            let err = registry.register("agent-1", &path).unwrap_err();
            assert!(
                matches!(err, RegistryError::ForbiddenPath(_)),
                "expected forbidden for {path}, got {err:?}"
            );
            assert_eq!(err.code(), "path.forbidden");
        }
    }

    #[test]
    fn unresolvable_path_is_invalid() {
        let registry = ProjectRegistry::in_memory();
        let err = registry
            .register("agent-1", "/definitely/not/a/real/path")
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPath(_)));
        assert_eq!(err.code(), "path.invalid");
    }

    #[test]
    fn registration_starts_at_deny() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::in_memory();
        let project = registry
            .register("agent-1", &dir.path().to_string_lossy())
            .unwrap();
        let now = Utc::now();
        assert!(!registry.policy_allows(&project.project_id, Scope::StartServer, now));
        assert!(!registry.policy_allows(&project.project_id, Scope::RunTask, now));
    }

    #[test]
    fn apply_policy_gates_by_scope_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::in_memory();
        let project = registry
            .register("agent-1", &dir.path().to_string_lossy())
            .unwrap();
        let now = Utc::now();

        registry
            .apply_policy(
                &project.project_id,
                ProjectPolicy {
                    decision: Decision::Allow,
                    scope: vec![Scope::StartServer],
                    expires_at: Some(now + chrono::Duration::minutes(30)),
                },
            )
            .unwrap();

        assert!(registry.policy_allows(&project.project_id, Scope::StartServer, now));
        assert!(!registry.policy_allows(&project.project_id, Scope::RunTask, now));
        assert!(!registry.policy_allows(
            &project.project_id,
            Scope::StartServer,
            now + chrono::Duration::minutes(31)
        ));
    }

    #[test]
    fn apply_policy_without_registration_is_accepted() {
        let registry = ProjectRegistry::in_memory();
        registry
            .apply_policy(
                "unregistered",
                ProjectPolicy {
                    decision: Decision::Allow,
                    scope: vec![Scope::RunTask],
                    expires_at: None,
                },
            )
            .unwrap();
        assert!(registry.policy_allows("unregistered", Scope::RunTask, Utc::now()));
    }

    #[test]
    fn reregistration_resets_policy_to_deny() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::in_memory();
        let project = registry
            .register("agent-1", &dir.path().to_string_lossy())
            .unwrap();
        registry
            .apply_policy(
                &project.project_id,
                ProjectPolicy {
                    decision: Decision::Allow,
                    scope: vec![Scope::StartServer, Scope::RunTask],
                    expires_at: None,
                },
            )
            .unwrap();
        registry
            .register("agent-1", &dir.path().to_string_lossy())
            .unwrap();
        assert!(!registry.policy_allows(&project.project_id, Scope::StartServer, Utc::now()));
    }

    #[test]
    fn registry_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("projects.toml");

        let project_id = {
            let registry = ProjectRegistry::open(file.clone()).unwrap();
            let project = registry
                .register("agent-1", &project_dir.path().to_string_lossy())
                .unwrap();
            registry
                .apply_policy(
                    &project.project_id,
                    ProjectPolicy {
                        decision: Decision::Allow,
                        scope: vec![Scope::RunTask],
                        expires_at: None,
                    },
                )
                .unwrap();
            project.project_id
        };

        // A fresh registry over the same file sees both project and policy.
        let registry = ProjectRegistry::open(file).unwrap();
        assert!(registry.get(&project_id).is_some());
        assert!(registry.policy_allows(&project_id, Scope::RunTask, Utc::now()));
    }
}
