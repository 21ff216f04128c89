mod config;
mod identity;
mod types;

pub use config::{BootstrapEntry, ConfigError, ControllerConfig, WorkerRuntime};
pub use identity::{BranchHash, IdentityError, SUPERVISOR_NAME_LEN};
pub use types::{Agent, AgentStatus, Metric, MetricStats, OAuthGrant};

pub use ethereum_types::{Address, H256, U256};
