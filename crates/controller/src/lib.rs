//! Orchestration core: webhook ingestion, the push pipeline, startup
//! recovery, liveness reconciliation and the control-plane HTTP surface.

mod api;
mod envbuild;
mod error;
mod locks;
mod logs;
mod push;
mod reconcile;
mod recovery;
mod webhook;

use std::sync::Arc;
use std::time::Instant;

use branchforge_chain::{ChainError, RegistryClient, RegistryConfig};
use branchforge_common::{Address, ControllerConfig};
use branchforge_crypto::Cipher;
use branchforge_storage::Store;
use branchforge_supervisor::Supervisor;
use branchforge_workspace::Workspaces;
use tracing::warn;

pub use api::{router, serve};
pub use envbuild::WorkerEnv;
pub use error::ControllerError;
pub use logs::LogLine;
pub use recovery::RecoveryReport;
pub use webhook::{EVENT_HEADER, PushEvent, branch_from_ref};

use locks::BranchLocks;

pub struct Controller {
    pub config: ControllerConfig,
    pub store: Store,
    cipher: Option<Cipher>,
    registry: Option<RegistryClient>,
    pub workspaces: Workspaces,
    pub supervisor: Supervisor,
    locks: BranchLocks,
    started_at: Instant,
}

impl Controller {
    /// Wires the components up. Missing chain credentials or master key are
    /// tolerated here on purpose: the HTTP surface must boot regardless, and
    /// the operations that need the missing piece fail with their own typed
    /// error.
    pub fn new(config: ControllerConfig, store: Store) -> Result<Arc<Self>, ControllerError> {
        let cipher = match config.master_key.as_deref() {
            Some(key) => Some(Cipher::from_hex_key(key)?),
            None => {
                warn!("MASTER_KEY not set; the secrets API will be unavailable");
                None
            }
        };

        let registry = Self::build_registry(&config);
        let workspaces = Workspaces::new(config.workspace_root.clone(), config.runtime.clone());
        let supervisor = Supervisor::new(config.workspace_root.join(".supervisor"));

        Ok(Arc::new(Controller {
            config,
            store,
            cipher,
            registry,
            workspaces,
            supervisor,
            locks: BranchLocks::default(),
            started_at: Instant::now(),
        }))
    }

    fn build_registry(config: &ControllerConfig) -> Option<RegistryClient> {
        let (Some(rpc_url), Some(registry_address), Some(private_key)) = (
            config.rpc_url.as_ref(),
            config.registry_address.as_ref(),
            config.private_key.as_ref(),
        ) else {
            warn!("chain credentials incomplete; on-chain registration is unavailable");
            return None;
        };

        let address: Address = match registry_address.trim_start_matches("0x").parse() {
            Ok(address) => address,
            Err(_) => {
                warn!(registry_address, "unparseable registry address; chain disabled");
                return None;
            }
        };
        match RegistryClient::new(&RegistryConfig {
            rpc_url: rpc_url.clone(),
            registry_address: address,
            private_key: private_key.clone(),
        }) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(%err, "chain client construction failed; chain disabled");
                None
            }
        }
    }

    pub fn registry(&self) -> Result<&RegistryClient, ChainError> {
        self.registry.as_ref().ok_or(ChainError::Unavailable)
    }

    pub fn cipher(&self) -> Result<&Cipher, ControllerError> {
        self.cipher.as_ref().ok_or(ControllerError::MasterKeyMissing)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// `RPC_URL` as advertised to workers.
    pub fn worker_rpc_url(&self) -> String {
        self.config.rpc_url.clone().unwrap_or_default()
    }
}

pub(crate) fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use branchforge_common::{ControllerConfig, WorkerRuntime};
    use branchforge_storage::Store;

    use crate::Controller;

    pub fn test_config(master_key: Option<String>) -> ControllerConfig {
        let scratch = std::env::temp_dir().join(format!(
            "branchforge-ctl-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        ControllerConfig {
            http_addr: "127.0.0.1".to_string(),
            http_port: 0,
            workspace_root: scratch,
            backend_url: "http://127.0.0.1:3000".to_string(),
            rpc_url: None,
            registry_address: None,
            private_key: None,
            master_key,
            bootstrap: Vec::new(),
            required_secrets: vec!["PRIVATE_KEY".to_string(), "OPENAI_API_KEY".to_string()],
            runtime: WorkerRuntime::default(),
        }
    }

    pub async fn test_controller(master_key: Option<String>) -> Arc<Controller> {
        let store = Store::new(":memory:").await.unwrap();
        Controller::new(test_config(master_key), store).unwrap()
    }

    pub fn test_master_key() -> String {
        "22".repeat(32)
    }
}
