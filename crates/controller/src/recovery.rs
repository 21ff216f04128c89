use branchforge_common::{AgentStatus, BranchHash};
use branchforge_supervisor::ProcessStatus;
use serde::Serialize;
use tracing::{info, warn};

use crate::{Controller, ControllerError};

/// Outcome of one reconciliation scan, served by `check-recovery`.
#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    pub checked: usize,
    pub outcomes: Vec<String>,
    pub errors: Vec<String>,
}

impl Controller {
    /// Startup reconciliation: walk the configured bootstrap list and, for
    /// every branch the on-chain registry knows, rebuild whatever local
    /// state a restart wiped — database row, secrets ownership, working
    /// tree, worker. Idempotent: a second run finds everything in place and
    /// changes nothing.
    pub async fn run_recovery(&self) -> RecoveryReport {
        let entries = self.config.bootstrap.clone();
        let mut report = RecoveryReport {
            checked: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            match self.recover_branch(&entry.repo_url, &entry.branch_name).await {
                Ok(outcome) => {
                    info!(repo = %entry.repo_url, branch = %entry.branch_name, outcome, "recovery");
                    report.outcomes.push(outcome);
                }
                Err(err) => {
                    warn!(repo = %entry.repo_url, branch = %entry.branch_name, %err, "recovery failed");
                    report
                        .errors
                        .push(format!("{}#{}: {err}", entry.repo_url, entry.branch_name));
                }
            }
        }
        report
    }

    async fn recover_branch(
        &self,
        repo_url: &str,
        branch_name: &str,
    ) -> Result<String, ControllerError> {
        let branch_hash = BranchHash::derive(repo_url, branch_name);
        let _guard = self.locks.acquire(branch_hash).await;

        let registry = self.registry()?;
        let Some(contract_address) = registry.lookup(&branch_hash).await? else {
            return Ok(format!("{branch_hash}: not on-chain, nothing to recover"));
        };

        // Database row: create only when missing so recovery never regresses
        // a live agent's status.
        let agent = match self.store.get_agent_by_branch_hash(&branch_hash).await? {
            Some(agent) => {
                if agent.contract_address.is_none() {
                    self.store
                        .update_agent_contract(agent.id, contract_address)
                        .await?;
                }
                agent
            }
            None => {
                self.store
                    .upsert_agent(
                        &branch_hash,
                        repo_url,
                        branch_name,
                        Some(contract_address),
                        AgentStatus::Deploying,
                    )
                    .await?;
                self.store
                    .get_agent_by_branch_hash(&branch_hash)
                    .await?
                    .ok_or_else(|| {
                        ControllerError::NotFound("agent row vanished during recovery".to_string())
                    })?
            }
        };

        // Secrets stored under a prior database generation follow the row.
        let rows = self.store.list_secrets_by_branch_hash(&branch_hash).await?;
        let mut stale_ids: Vec<i64> = rows
            .iter()
            .map(|row| row.agent_id)
            .filter(|id| *id != agent.id)
            .collect();
        stale_ids.sort_unstable();
        stale_ids.dedup();
        for stale_id in stale_ids {
            self.store.migrate_secrets(stale_id, agent.id).await?;
        }

        // Working tree.
        if let Err(err) = self
            .workspaces
            .materialize(&branch_hash, &agent.repo_url, &agent.branch_name)
            .await
        {
            let _ = self
                .store
                .update_agent_status(agent.id, AgentStatus::Error, None)
                .await;
            return Err(err.into());
        }

        if !self.workspaces.has_entrypoint(&branch_hash) {
            return Ok(format!(
                "{branch_hash}: recovered without entrypoint, worker starts on next push"
            ));
        }

        // Leave a live worker alone; that keeps repeated recovery runs a
        // fixed point instead of a restart loop.
        let name = branch_hash.supervisor_name();
        let online = matches!(
            self.supervisor.describe(&name).await,
            Ok(Some(info)) if info.status == ProcessStatus::Online
        );
        if online {
            return Ok(format!("{branch_hash}: worker already online"));
        }

        let env = self.build_worker_env(&agent).await?;
        match self.start_worker(&agent, env).await {
            Ok(pid) => {
                self.store
                    .update_agent_status(agent.id, AgentStatus::Running, pid)
                    .await?;
                Ok(format!("{branch_hash}: worker started"))
            }
            Err(err) => {
                let _ = self
                    .store
                    .update_agent_status(agent.id, AgentStatus::Error, None)
                    .await;
                Err(err)
            }
        }
    }
}
