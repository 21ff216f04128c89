use std::path::PathBuf;

use branchforge_common::{ConfigError, ControllerConfig, WorkerRuntime};
use clap::Parser;
use tracing::Level;

pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "branchforge",
    version = VERSION_STRING,
    about = "Git-driven deployment controller anchored by an on-chain registry"
)]
pub struct Options {
    #[arg(
        long = "http.addr",
        default_value = "0.0.0.0",
        env = "BIND_ADDR",
        value_name = "ADDRESS",
        help = "Listening address for the control-plane HTTP server.",
        help_heading = "HTTP options"
    )]
    pub http_addr: String,
    #[arg(
        long = "http.port",
        default_value = "3000",
        env = "PORT",
        value_name = "PORT",
        help_heading = "HTTP options"
    )]
    pub http_port: u16,
    #[arg(
        long = "datadir",
        default_value = "branchforge.db",
        env = "DATABASE_PATH",
        value_name = "DATABASE_PATH",
        help = "Path of the sqlite database file.",
        help_heading = "Controller options"
    )]
    pub datadir: String,
    #[arg(
        long = "workspace.root",
        default_value = "workspaces",
        env = "WORKSPACE_ROOT",
        value_name = "DIRECTORY",
        help = "Directory holding one git working tree per tracked branch.",
        help_heading = "Controller options"
    )]
    pub workspace_root: PathBuf,
    #[arg(
        long = "backend.url",
        default_value = "http://localhost:3000",
        env = "BACKEND_URL",
        value_name = "URL",
        help = "URL workers post their metrics to (exported as BACKEND_URL).",
        help_heading = "Controller options"
    )]
    pub backend_url: String,
    #[arg(
        long = "bootstrap",
        env = "BOOTSTRAP_AGENTS",
        value_name = "LIST",
        help = "Comma separated repo_url#branch pairs re-discovered on startup.",
        help_heading = "Controller options"
    )]
    pub bootstrap: Option<String>,
    #[arg(
        long = "required-secrets",
        default_value = "PRIVATE_KEY,OPENAI_API_KEY",
        env = "REQUIRED_SECRETS",
        value_name = "KEYS",
        help = "Secret keys /api/secrets/check reports on.",
        help_heading = "Controller options"
    )]
    pub required_secrets: String,
    #[arg(
        long = "rpc.url",
        env = "RPC_URL",
        value_name = "URL",
        help = "Blockchain JSON-RPC endpoint.",
        help_heading = "Chain options"
    )]
    pub rpc_url: Option<String>,
    #[arg(
        long = "registry.address",
        env = "REGISTRY_ADDRESS",
        value_name = "ADDRESS",
        help = "Address of the registry factory contract.",
        help_heading = "Chain options"
    )]
    pub registry_address: Option<String>,
    #[arg(
        long = "private-key",
        env = "CONTROLLER_PRIVATE_KEY",
        hide_env_values = true,
        value_name = "HEX",
        help = "Key that signs registration transactions.",
        help_heading = "Chain options"
    )]
    pub private_key: Option<String>,
    #[arg(
        long = "master-key",
        env = "MASTER_KEY",
        hide_env_values = true,
        value_name = "HEX",
        help = "32-byte hex key sealing stored secrets.",
        help_heading = "Controller options"
    )]
    pub master_key: Option<String>,
    #[arg(
        long = "worker.entrypoint",
        default_value = "agent.js",
        env = "WORKER_ENTRYPOINT",
        value_name = "FILE",
        help_heading = "Worker options"
    )]
    pub entrypoint: String,
    #[arg(
        long = "worker.interpreter",
        default_value = "node",
        env = "WORKER_INTERPRETER",
        value_name = "PROGRAM",
        help_heading = "Worker options"
    )]
    pub interpreter: String,
    #[arg(
        long = "worker.manifest",
        default_value = "package.json",
        env = "WORKER_MANIFEST",
        value_name = "FILE",
        help = "Dependency manifest whose presence triggers the installer.",
        help_heading = "Worker options"
    )]
    pub manifest: String,
    #[arg(
        long = "worker.installer",
        default_value = "npm install",
        env = "WORKER_INSTALLER",
        value_name = "COMMAND",
        help = "Dependency install command, split on whitespace.",
        help_heading = "Worker options"
    )]
    pub installer: String,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Controller options"
    )]
    pub log_level: Level,
}

impl Options {
    pub fn into_config(self) -> Result<(ControllerConfig, String), ConfigError> {
        let bootstrap = match self.bootstrap.as_deref() {
            Some(raw) => ControllerConfig::parse_bootstrap_list(raw)?,
            None => Vec::new(),
        };
        let required_secrets = self
            .required_secrets
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect();
        let runtime = WorkerRuntime {
            entrypoint: self.entrypoint,
            interpreter: self.interpreter,
            manifest: self.manifest,
            installer: self
                .installer
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        };
        let config = ControllerConfig {
            http_addr: self.http_addr,
            http_port: self.http_port,
            workspace_root: self.workspace_root,
            backend_url: self.backend_url,
            rpc_url: self.rpc_url,
            registry_address: self.registry_address,
            private_key: self.private_key,
            master_key: self.master_key,
            bootstrap,
            required_secrets,
            runtime,
        };
        Ok((config, self.datadir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_config() {
        let opts = Options::parse_from(["branchforge"]);
        let (config, datadir) = opts.into_config().unwrap();
        assert_eq!(datadir, "branchforge.db");
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
        assert!(config.bootstrap.is_empty());
        assert_eq!(config.runtime.installer, vec!["npm", "install"]);
        assert_eq!(config.required_secrets.len(), 2);
    }

    #[test]
    fn bootstrap_flag_is_parsed() {
        let opts = Options::parse_from([
            "branchforge",
            "--bootstrap",
            "https://host/r.git#main,https://host/r.git#dev",
        ]);
        let (config, _) = opts.into_config().unwrap();
        assert_eq!(config.bootstrap.len(), 2);
        assert_eq!(config.bootstrap[1].branch_name, "dev");
    }

    #[test]
    fn malformed_bootstrap_is_rejected() {
        let opts = Options::parse_from(["branchforge", "--bootstrap", "no-branch-here"]);
        assert!(opts.into_config().is_err());
    }
}
