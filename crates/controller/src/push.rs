use branchforge_common::{Agent, AgentStatus};
use branchforge_supervisor::ProcessSpec;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::envbuild::WorkerEnv;
use crate::webhook::PushEvent;
use crate::{Controller, ControllerError};

impl Controller {
    /// The push state machine. Runs inside the branch's critical section;
    /// every step is idempotent, so replays and races converge on the same
    /// terminal state:
    ///
    /// 1. resolve the on-chain contract (register when absent)
    /// 2. reconcile the database row
    /// 3. materialize the working tree
    /// 4. build the worker environment
    /// 5. start or reload the supervised worker
    /// 6. commit the resulting status
    ///
    /// The webhook response has already been sent when this runs; failures
    /// signal through the agent row and logs only.
    pub async fn handle_push(&self, event: &PushEvent) -> Result<(), ControllerError> {
        let branch_hash = event.branch_hash;
        let _guard = self.locks.acquire(branch_hash).await;

        // Step 1: chain. A transient failure leaves no trace; the next
        // delivery retries. Anything fatal is recorded on the row.
        let registry = self.registry()?;
        let contract_address = match registry.lookup(&branch_hash).await {
            Ok(Some(address)) => address,
            Ok(None) => {
                info!(branch = %branch_hash, "branch not registered, sending registration");
                match registry.register(&branch_hash).await {
                    Ok(address) => address,
                    Err(err) if err.is_transient() => return Err(err.into()),
                    Err(err) => {
                        let _ = self
                            .store
                            .upsert_agent(
                                &branch_hash,
                                &event.repo_url,
                                &event.branch_name,
                                None,
                                AgentStatus::Error,
                            )
                            .await;
                        return Err(err.into());
                    }
                }
            }
            Err(err) if err.is_transient() => return Err(err.into()),
            Err(err) => return Err(err.into()),
        };

        // Step 2: database row carries the resolved address.
        let agent_id = self
            .store
            .upsert_agent(
                &branch_hash,
                &event.repo_url,
                &event.branch_name,
                Some(contract_address),
                AgentStatus::Deploying,
            )
            .await?;

        // Step 3: working tree.
        if let Err(err) = self
            .workspaces
            .materialize(&branch_hash, &event.repo_url, &event.branch_name)
            .await
        {
            error!(branch = %branch_hash, step = %err.step(), %err, "workspace materialization failed");
            let _ = self
                .store
                .update_agent_status(agent_id, AgentStatus::Error, None)
                .await;
            return Err(err.into());
        }

        let agent = self
            .store
            .get_agent_by_branch_hash(&branch_hash)
            .await?
            .ok_or_else(|| ControllerError::NotFound("agent row vanished mid-push".to_string()))?;

        if !self.workspaces.has_entrypoint(&branch_hash) {
            warn!(
                branch = %branch_hash,
                entrypoint = %self.config.runtime.entrypoint,
                "working tree has no entrypoint; leaving agent in deploying"
            );
            return Ok(());
        }

        // Steps 4-6.
        let env = match self.build_worker_env(&agent).await {
            Ok(env) => env,
            Err(err) => {
                let _ = self
                    .store
                    .update_agent_status(agent.id, AgentStatus::Error, None)
                    .await;
                return Err(err);
            }
        };
        match self.start_worker(&agent, env).await {
            Ok(pid) => {
                self.store
                    .update_agent_status(agent.id, AgentStatus::Running, pid)
                    .await?;
                info!(branch = %branch_hash, pid, "agent deployed");
                Ok(())
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

    /// Start policy: delete the existing supervised process and start fresh
    /// so the latest environment is guaranteed to apply. When the delete
    /// itself fails, fall back to a reload that explicitly replaces the
    /// environment.
    pub(crate) async fn start_worker(
        &self,
        agent: &Agent,
        env: WorkerEnv,
    ) -> Result<Option<u32>, ControllerError> {
        let name = agent.branch_hash.supervisor_name();
        let env_map = env.into_env_map();
        let spec = ProcessSpec {
            name: name.clone(),
            interpreter: self.config.runtime.interpreter.clone(),
            entrypoint: PathBuf::from(&self.config.runtime.entrypoint),
            cwd: self.workspaces.dir(&agent.branch_hash),
            env: env_map.clone(),
        };

        match self.supervisor.delete(&name).await {
            Ok(()) => {
                let info = self.supervisor.start(spec).await?;
                Ok(info.pid)
            }
            Err(delete_err) => {
                warn!(%name, %delete_err, "delete before start failed; reloading with fresh env");
                let info = self.supervisor.reload(&name, Some(env_map)).await?;
                Ok(info.pid)
            }
        }
    }

    /// Supervisor-facing restart used by the restart endpoints: clone/sync
    /// on demand, rebuild the environment, replace the process.
    pub async fn restart_agent(&self, agent: &Agent) -> Result<Option<u32>, ControllerError> {
        let _guard = self.locks.acquire(agent.branch_hash).await;

        if let Err(err) = self
            .workspaces
            .materialize(&agent.branch_hash, &agent.repo_url, &agent.branch_name)
            .await
        {
            let _ = self
                .store
                .update_agent_status(agent.id, AgentStatus::Error, None)
                .await;
            return Err(err.into());
        }
        if !self.workspaces.has_entrypoint(&agent.branch_hash) {
            return Err(ControllerError::Validation(format!(
                "working tree has no {}",
                self.config.runtime.entrypoint
            )));
        }

        let env = self.build_worker_env(agent).await?;
        match self.start_worker(agent, env).await {
            Ok(pid) => {
                self.store
                    .update_agent_status(agent.id, AgentStatus::Running, pid)
                    .await?;
                Ok(pid)
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

    /// Wrapper for fire-and-forget processing after the webhook response
    /// went out: outcomes land in logs and on the agent row, never in the
    /// HTTP exchange.
    pub async fn process_push_logged(&self, event: PushEvent) {
        match self.handle_push(&event).await {
            Ok(()) => {}
            Err(err) if err.is_transient_chain() => {
                warn!(
                    branch = %event.branch_hash,
                    %err,
                    "transient chain failure; the next push delivery will retry"
                );
            }
            Err(err) => {
                error!(branch = %event.branch_hash, %err, "push processing failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_controller;
    use branchforge_chain::ChainError;

    #[tokio::test]
    async fn push_without_chain_config_leaves_no_state() {
        let controller = test_controller(None).await;
        let event = PushEvent::new("https://host/r.git".to_string(), "main".to_string()).unwrap();

        let err = controller.handle_push(&event).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Chain(ChainError::Unavailable)
        ));
        // no agent row was created
        assert!(controller.store.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_push_logged_swallows_errors() {
        let controller = test_controller(None).await;
        let event = PushEvent::new("https://host/r.git".to_string(), "main".to_string()).unwrap();
        // must not panic or propagate
        controller.process_push_logged(event).await;
    }
}
