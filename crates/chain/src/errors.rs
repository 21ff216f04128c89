use ethereum_types::H256;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The controller was started without RPC credentials; chain-dependent
    /// operations fail with this instead of preventing startup.
    #[error("chain client is not configured")]
    Unavailable,
    /// Transport-level failure (DNS, timeout, connection refused, 5xx).
    /// Retryable; callers must not treat this as an application error.
    #[error("transient rpc failure: {0}")]
    Transient(String),
    /// The contract rejected the call.
    #[error("contract reverted: {0}")]
    Revert(String),
    /// The RPC server answered with a non-revert error object.
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("malformed rpc response: {0}")]
    InvalidResponse(String),
    #[error("transaction {0:#x} failed on-chain")]
    TransactionFailed(H256),
    #[error("invalid chain configuration: {0}")]
    InvalidConfig(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }

    /// The domain signal for an idempotent registration race: some other
    /// writer won, and the caller should re-read the registry instead of
    /// failing.
    pub fn is_already_registered(&self) -> bool {
        match self {
            ChainError::Revert(msg) | ChainError::Rpc(msg) => {
                msg.to_ascii_lowercase().contains("already registered")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        ChainError::Transient(err.to_string())
    }
}
