use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bootstrap entry {0:?} is not of the form repo_url#branch")]
    MalformedBootstrapEntry(String),
}

/// One (repository, branch) pair the controller re-discovers on startup.
/// Textual form: `repo_url#branch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapEntry {
    pub repo_url: String,
    pub branch_name: String,
}

impl FromStr for BootstrapEntry {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repo_url, branch_name) = s
            .rsplit_once('#')
            .ok_or_else(|| ConfigError::MalformedBootstrapEntry(s.to_string()))?;
        if repo_url.is_empty() || branch_name.is_empty() {
            return Err(ConfigError::MalformedBootstrapEntry(s.to_string()));
        }
        Ok(BootstrapEntry {
            repo_url: repo_url.to_string(),
            branch_name: branch_name.to_string(),
        })
    }
}

/// How a branch's worker is executed once its tree is materialized.
#[derive(Debug, Clone)]
pub struct WorkerRuntime {
    /// File the supervisor executes, relative to the working tree root.
    pub entrypoint: String,
    /// Interpreter the entrypoint is passed to.
    pub interpreter: String,
    /// Dependency manifest whose presence triggers the installer.
    pub manifest: String,
    /// Installer program and arguments.
    pub installer: Vec<String>,
}

impl Default for WorkerRuntime {
    fn default() -> Self {
        WorkerRuntime {
            entrypoint: "agent.js".to_string(),
            interpreter: "node".to_string(),
            manifest: "package.json".to_string(),
            installer: vec!["npm".to_string(), "install".to_string()],
        }
    }
}

/// Controller configuration, assembled by the CLI from flags and environment.
///
/// Chain credentials and the master key are optional on purpose: the HTTP
/// surface must come up without them, and each operation that needs a missing
/// piece fails with its own typed error instead.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub http_addr: String,
    pub http_port: u16,
    pub workspace_root: PathBuf,
    /// Advertised to workers as `BACKEND_URL` for metric ingestion.
    pub backend_url: String,
    pub rpc_url: Option<String>,
    pub registry_address: Option<String>,
    pub private_key: Option<String>,
    pub master_key: Option<String>,
    pub bootstrap: Vec<BootstrapEntry>,
    /// Keys `/api/secrets/check` reports on.
    pub required_secrets: Vec<String>,
    pub runtime: WorkerRuntime,
}

impl ControllerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.http_addr, self.http_port)
    }

    pub fn parse_bootstrap_list(raw: &str) -> Result<Vec<BootstrapEntry>, ConfigError> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(BootstrapEntry::from_str)
            .collect()
    }
}
