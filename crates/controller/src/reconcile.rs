use std::time::Duration;

use branchforge_common::{Agent, AgentStatus};
use branchforge_supervisor::ProcessStatus;
use tracing::warn;

use crate::{Controller, unix_now};

/// An agent is considered live when a metric arrived within this window.
pub const METRIC_LIVENESS_WINDOW_SECS: i64 = 5 * 60;
/// The reconciler must not hold up API responses longer than this.
pub const RECONCILE_BUDGET: Duration = Duration::from_secs(2);

/// The authoritative status table. Supervisor state alone is not trusted:
/// a worker can outlive its supervisor entry (still posting metrics) or
/// sit "online" while it boots (no metrics yet). Neither case regresses
/// the row.
pub fn decide_status(
    supervisor: ProcessStatus,
    recent_metrics: bool,
    previous: AgentStatus,
) -> AgentStatus {
    match (supervisor, recent_metrics) {
        (ProcessStatus::Online, _) => AgentStatus::Running,
        (ProcessStatus::Stopped | ProcessStatus::Errored, true) => AgentStatus::Running,
        (ProcessStatus::Stopped | ProcessStatus::Errored, false) => AgentStatus::Error,
        (ProcessStatus::Missing, true) => AgentStatus::Running,
        (ProcessStatus::Missing, false) => {
            if previous == AgentStatus::Running {
                AgentStatus::Error
            } else {
                previous
            }
        }
    }
}

impl Controller {
    /// Refreshes each agent's status from the two liveness signals. Row
    /// updates are fire-and-forget; the returned list carries the decided
    /// statuses either way.
    pub async fn reconcile_agents(&self, agents: Vec<Agent>) -> Vec<Agent> {
        let since = unix_now() - METRIC_LIVENESS_WINDOW_SECS;
        let mut reconciled = Vec::with_capacity(agents.len());

        for mut agent in agents {
            let name = agent.branch_hash.supervisor_name();
            let supervisor_status = match self.supervisor.describe(&name).await {
                Ok(Some(info)) => info.status,
                Ok(None) => ProcessStatus::Missing,
                Err(err) => {
                    warn!(%name, %err, "supervisor describe failed during reconcile");
                    ProcessStatus::Missing
                }
            };
            let recent_metrics = self
                .store
                .has_metrics_since(agent.id, since)
                .await
                .unwrap_or(false);

            let decided = decide_status(supervisor_status, recent_metrics, agent.status);
            if decided != agent.status {
                let store = self.store.clone();
                let id = agent.id;
                tokio::spawn(async move {
                    if let Err(err) = store.update_agent_status(id, decided, None).await {
                        warn!(agent = id, %err, "reconciler status write failed");
                    }
                });
                agent.status = decided;
            }
            reconciled.push(agent);
        }
        reconciled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_is_running_regardless_of_metrics() {
        assert_eq!(
            decide_status(ProcessStatus::Online, true, AgentStatus::Deploying),
            AgentStatus::Running
        );
        // still starting up: no metrics yet must not regress the agent
        assert_eq!(
            decide_status(ProcessStatus::Online, false, AgentStatus::Running),
            AgentStatus::Running
        );
    }

    #[test]
    fn dead_process_with_fresh_metrics_is_running_outside_supervision() {
        assert_eq!(
            decide_status(ProcessStatus::Stopped, true, AgentStatus::Running),
            AgentStatus::Running
        );
        assert_eq!(
            decide_status(ProcessStatus::Errored, true, AgentStatus::Error),
            AgentStatus::Running
        );
    }

    #[test]
    fn dead_process_without_metrics_is_an_error() {
        assert_eq!(
            decide_status(ProcessStatus::Stopped, false, AgentStatus::Running),
            AgentStatus::Error
        );
        assert_eq!(
            decide_status(ProcessStatus::Errored, false, AgentStatus::Deploying),
            AgentStatus::Error
        );
    }

    #[test]
    fn missing_process_with_metrics_is_running() {
        assert_eq!(
            decide_status(ProcessStatus::Missing, true, AgentStatus::Stopped),
            AgentStatus::Running
        );
    }

    #[test]
    fn missing_process_without_metrics_errors_only_previously_running_agents() {
        assert_eq!(
            decide_status(ProcessStatus::Missing, false, AgentStatus::Running),
            AgentStatus::Error
        );
        assert_eq!(
            decide_status(ProcessStatus::Missing, false, AgentStatus::Deploying),
            AgentStatus::Deploying
        );
        assert_eq!(
            decide_status(ProcessStatus::Missing, false, AgentStatus::Stopped),
            AgentStatus::Stopped
        );
        assert_eq!(
            decide_status(ProcessStatus::Missing, false, AgentStatus::Error),
            AgentStatus::Error
        );
    }
}
