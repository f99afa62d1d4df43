//! On-disk agent credentials, written by `octo agent pair`.

use std::path::Path;

use {
    anyhow::{Context, Result},
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCredentials {
    pub agent_id: String,
    pub agent_key: String,
    pub backend_url: String,
}

impl AgentCredentials {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading credentials from {}", path.display()))?;
        toml::from_str(&data).context("parsing credentials file")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let data = toml::to_string_pretty(self).context("serializing credentials")?;
        std::fs::write(path, data)
            .with_context(|| format!("writing credentials to {}", path.display()))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("agent.toml");
        let credentials = AgentCredentials {
            agent_id: "agent-1".into(),
            agent_key: "key-1".into(),
            backend_url: "http://127.0.0.1:8787".into(),
        };
        credentials.save(&path).unwrap();

        let loaded = AgentCredentials::load(&path).unwrap();
        assert_eq!(loaded.agent_id, "agent-1");
        assert_eq!(loaded.agent_key, "key-1");
        assert_eq!(loaded.backend_url, "http://127.0.0.1:8787");
    }
}
