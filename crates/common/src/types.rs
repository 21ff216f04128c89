use ethereum_types::Address;
use serde::{Deserialize, Serialize};

use crate::identity::BranchHash;

/// Lifecycle state of an agent, as persisted and served by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Deploying,
    Running,
    Error,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Deploying => "deploying",
            AgentStatus::Running => "running",
            AgentStatus::Error => "error",
            AgentStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploying" => Some(AgentStatus::Deploying),
            "running" => Some(AgentStatus::Running),
            "error" => Some(AgentStatus::Error),
            "stopped" => Some(AgentStatus::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked (repository, branch) pair. `id` is a local surrogate key and
/// may change when the database is recreated; `branch_hash` is the stable
/// identity.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: i64,
    pub repo_url: String,
    pub branch_name: String,
    pub branch_hash: BranchHash,
    pub contract_address: Option<Address>,
    pub status: AgentStatus,
    pub worker_pid: Option<u32>,
    pub created_at: i64,
}

impl Agent {
    pub fn supervisor_name(&self) -> String {
        self.branch_hash.supervisor_name()
    }
}

/// Per-cycle observation reported by a worker. Append-only; the authoritative
/// observable stream for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub agent_id: i64,
    pub timestamp: i64,
    pub decision: String,
    pub price: Option<f64>,
    pub trade_executed: bool,
    pub trade_tx_hash: Option<String>,
    pub trade_amount: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricStats {
    pub total_cycles: u64,
    pub trades_executed: u64,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
    pub last_decision: Option<String>,
}

/// Persisted authorization to the git hosting provider. The provisioning
/// flow itself lives outside this controller; only storage of the grant
/// (with the token encrypted at rest) is handled here.
#[derive(Debug, Clone)]
pub struct OAuthGrant {
    pub user_id: String,
    pub access_token_ciphertext: Vec<u8>,
    pub repo_url: String,
    pub webhook_configured: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_codec_round_trips() {
        for status in [
            AgentStatus::Deploying,
            AgentStatus::Running,
            AgentStatus::Error,
            AgentStatus::Stopped,
        ] {
            assert_eq!(AgentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AgentStatus::parse("booting"), None);
    }

    #[test]
    fn agent_serializes_hash_and_address_as_hex() {
        let agent = Agent {
            id: 1,
            repo_url: "https://example.com/r.git".into(),
            branch_name: "main".into(),
            branch_hash: BranchHash::derive("https://example.com/r.git", "main"),
            contract_address: Some(Address::repeat_byte(0xab)),
            status: AgentStatus::Running,
            worker_pid: Some(42),
            created_at: 1,
        };
        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["branch_hash"], agent.branch_hash.to_hex());
        assert!(
            json["contract_address"]
                .as_str()
                .unwrap()
                .starts_with("0x")
        );
    }
}
