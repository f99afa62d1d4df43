//! Per-project consent model: decisions, scopes and their TTL.

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// A named capability gated by policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    StartServer,
    RunTask,
}

/// Whether the scopes in a policy are granted or withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Deny,
}

/// The consent recorded for one project.
///
/// A scope is effective iff the decision is ALLOW, the policy has not
/// expired, and the scope is in the scope set. Registration starts every
/// project at DENY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectPolicy {
    pub decision: Decision,
    pub scope: Vec<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProjectPolicy {
    /// The initial policy for a freshly registered project.
    pub fn deny_all() -> Self {
        Self {
            decision: Decision::Deny,
            scope: Vec::new(),
            expires_at: None,
        }
    }

    pub fn allows(&self, scope: Scope, now: DateTime<Utc>) -> bool {
        if self.decision != Decision::Allow {
            return false;
        }
        if let Some(expires_at) = self.expires_at
            && now >= expires_at
        {
            return false;
        }
        self.scope.contains(&scope)
    }
}

/// One project as seen in the per-user backend view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project_id: String,
    pub alias: String,
    pub project_path: String,
    pub policy: ProjectPolicy,
    pub last_updated: DateTime<Utc>,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::Duration};

    fn allow(scope: Vec<Scope>, expires_at: Option<DateTime<Utc>>) -> ProjectPolicy {
        ProjectPolicy {
            decision: Decision::Allow,
            scope,
            expires_at,
        }
    }

    #[test]
    fn deny_all_blocks_everything() {
        let now = Utc::now();
        let policy = ProjectPolicy::deny_all();
        assert!(!policy.allows(Scope::StartServer, now));
        assert!(!policy.allows(Scope::RunTask, now));
    }

    #[test]
    fn allow_is_scoped() {
        let now = Utc::now();
        let policy = allow(vec![Scope::StartServer], None);
        assert!(policy.allows(Scope::StartServer, now));
        assert!(!policy.allows(Scope::RunTask, now));
    }

    #[test]
    fn grant_lapses_at_the_deadline() {
        let now = Utc::now();
        let policy = allow(vec![Scope::RunTask], Some(now + Duration::minutes(30)));
        assert!(policy.allows(Scope::RunTask, now));
        assert!(policy.allows(Scope::RunTask, now + Duration::minutes(29)));
        // At and after the deadline the grant lapses.
        assert!(!policy.allows(Scope::RunTask, now + Duration::minutes(30)));
        assert!(!policy.allows(Scope::RunTask, now + Duration::minutes(31)));
    }

    #[test]
    fn absent_expiry_never_lapses() {
        let now = Utc::now();
        let policy = allow(vec![Scope::StartServer, Scope::RunTask], None);
        assert!(policy.allows(Scope::RunTask, now + Duration::days(3650)));
    }

    #[test]
    fn wire_format() {
        let policy = allow(vec![Scope::StartServer], None);
        let raw = serde_json::to_value(&policy).unwrap();
        assert_eq!(raw["decision"], "ALLOW");
        assert_eq!(raw["scope"][0], "START_SERVER");
    }
}
