use std::collections::HashMap;

use branchforge_common::Agent;
use tracing::{debug, info, warn};

use crate::{Controller, ControllerError};

/// The environment a worker is spawned with. The five controller-provided
/// fields are mandatory by construction; user secrets ride in the map and
/// can never shadow them.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub agent_contract_address: String,
    pub repo_url: String,
    pub branch_name: String,
    pub backend_url: String,
    pub rpc_url: String,
    pub secrets: HashMap<String, String>,
}

impl WorkerEnv {
    /// The OS environment map, materialized only at spawn time.
    pub fn into_env_map(self) -> HashMap<String, String> {
        let mut env = self.secrets;
        env.insert(
            "AGENT_CONTRACT_ADDRESS".to_string(),
            self.agent_contract_address,
        );
        env.insert("REPO_URL".to_string(), self.repo_url);
        env.insert("BRANCH_NAME".to_string(), self.branch_name);
        env.insert("BACKEND_URL".to_string(), self.backend_url);
        env.insert("RPC_URL".to_string(), self.rpc_url);
        env
    }
}

impl Controller {
    /// Gathers and decrypts this branch's secrets, migrating any rows left
    /// under a previous agent id first, and assembles the worker
    /// environment.
    pub async fn build_worker_env(&self, agent: &Agent) -> Result<WorkerEnv, ControllerError> {
        if agent.repo_url.is_empty() || agent.branch_name.is_empty() {
            return Err(ControllerError::Validation(
                "agent row has empty repo_url or branch_name".to_string(),
            ));
        }

        let rows = self
            .store
            .list_secrets_by_branch_hash(&agent.branch_hash)
            .await?;

        // Re-home rows stored by an earlier database generation.
        let mut stale_ids: Vec<i64> = rows
            .iter()
            .map(|row| row.agent_id)
            .filter(|id| *id != agent.id)
            .collect();
        stale_ids.sort_unstable();
        stale_ids.dedup();
        for stale_id in stale_ids {
            info!(
                branch = %agent.branch_hash,
                from = stale_id,
                to = agent.id,
                "migrating secrets from prior agent id"
            );
            self.store.migrate_secrets(stale_id, agent.id).await?;
        }

        let mut secrets = HashMap::new();
        if !rows.is_empty() {
            let cipher = self.cipher()?;
            for row in &rows {
                let plaintext = cipher.decrypt(&row.ciphertext)?;
                let value = String::from_utf8(plaintext).map_err(|_| {
                    ControllerError::Validation(format!(
                        "secret {:?} does not decrypt to utf-8",
                        row.key
                    ))
                })?;
                secrets.insert(row.key.clone(), value);
            }
        }

        // Key names only; values must never reach the log stream.
        let mut present: Vec<&str> = secrets.keys().map(String::as_str).collect();
        present.sort_unstable();
        let missing: Vec<&str> = self
            .config
            .required_secrets
            .iter()
            .map(String::as_str)
            .filter(|key| !secrets.contains_key(*key))
            .collect();
        debug!(branch = %agent.branch_hash, ?present, "secrets gathered");
        if !missing.is_empty() {
            warn!(branch = %agent.branch_hash, ?missing, "expected secrets are not set");
        }

        let agent_contract_address = agent
            .contract_address
            .map(|address| format!("{address:#x}"))
            .unwrap_or_default();
        if agent_contract_address.is_empty() {
            warn!(branch = %agent.branch_hash, "building env without a contract address");
        }

        Ok(WorkerEnv {
            agent_contract_address,
            repo_url: agent.repo_url.clone(),
            branch_name: agent.branch_name.clone(),
            backend_url: self.config.backend_url.clone(),
            rpc_url: self.worker_rpc_url(),
            secrets,
        })
    }
}
