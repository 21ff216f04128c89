use std::time::Duration;

use branchforge_common::BranchHash;
use ethereum_types::{Address, U256};
use tracing::{debug, info, warn};

use crate::{
    ChainError, LocalSigner, RpcClient,
    calldata::{decode_address_word, encode_bytes32_call},
    tx::Eip1559Transaction,
};

const LOOKUP_SIGNATURE: &str = "getAgent(bytes32)";
const REGISTER_SIGNATURE: &str = "registerAgent(bytes32)";

pub const RECEIPT_MAX_RETRIES: u64 = 30;
pub const RECEIPT_RETRY_DELAY: Duration = Duration::from_secs(2);
// Estimations run against pending state; registrations race with other
// writers, so leave room.
const GAS_LIMIT_BUMP_PERCENT: u64 = 30;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub rpc_url: String,
    pub registry_address: Address,
    pub private_key: String,
}

/// Client for the on-chain registry mapping `branch_hash → contract`.
///
/// Holds no local state: the chain is authoritative, and every mutation is
/// resolved by re-reading it.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    rpc: RpcClient,
    registry_address: Address,
    signer: LocalSigner,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self, ChainError> {
        let rpc = RpcClient::new(&config.rpc_url)?;
        let signer = LocalSigner::from_hex(&config.private_key)
            .map_err(|err| ChainError::InvalidConfig(format!("bad private key: {err}")))?;
        Ok(Self {
            rpc,
            registry_address: config.registry_address,
            signer,
        })
    }

    pub fn rpc_url(&self) -> &str {
        self.rpc.url.as_str()
    }

    /// Reads the registered contract for this branch; `None` when the
    /// registry answers the zero address.
    pub async fn lookup(&self, branch_hash: &BranchHash) -> Result<Option<Address>, ChainError> {
        let calldata = encode_bytes32_call(LOOKUP_SIGNATURE, branch_hash.to_fixed_bytes());
        let output = self.rpc.call(self.registry_address, &calldata).await?;
        decode_address_word(&output)
    }

    /// Registers the branch and returns the resulting contract address.
    ///
    /// Losing an "already registered" race is success: the registry is
    /// re-read and the winner's address returned. Any other revert is fatal
    /// for this operation.
    pub async fn register(&self, branch_hash: &BranchHash) -> Result<Address, ChainError> {
        let calldata = encode_bytes32_call(REGISTER_SIGNATURE, branch_hash.to_fixed_bytes());

        let gas_estimate = match self
            .rpc
            .estimate_gas(self.signer.address, self.registry_address, &calldata)
            .await
        {
            Ok(gas) => gas,
            Err(err) if err.is_already_registered() => {
                return self.resolve_existing(branch_hash).await;
            }
            Err(err) => return Err(err),
        };

        let max_priority_fee_per_gas = self.rpc.get_max_priority_fee().await?;
        let gas_price = self.rpc.get_gas_price().await?;
        let tx = Eip1559Transaction {
            chain_id: self.rpc.get_chain_id().await?,
            nonce: self.rpc.get_nonce(self.signer.address).await?,
            max_priority_fee_per_gas,
            max_fee_per_gas: gas_price.max(max_priority_fee_per_gas).saturating_mul(2),
            gas_limit: gas_estimate * (100 + GAS_LIMIT_BUMP_PERCENT) / 100,
            to: self.registry_address,
            value: U256::zero(),
            data: calldata,
        };

        let raw = tx.sign_and_encode(&self.signer);
        let tx_hash = match self.rpc.send_raw_transaction(&raw).await {
            Ok(hash) => hash,
            Err(err) if err.is_already_registered() => {
                return self.resolve_existing(branch_hash).await;
            }
            Err(err) => return Err(err),
        };
        info!(branch = %branch_hash, tx = %format!("{tx_hash:#x}"), "registration transaction sent");

        for attempt in 1..=RECEIPT_MAX_RETRIES {
            match self.rpc.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.succeeded() {
                        return self.resolve_registered(branch_hash).await;
                    }
                    // Reverted on-chain. The usual cause is losing the
                    // registration race, so check the registry before
                    // declaring failure.
                    warn!(branch = %branch_hash, "registration transaction reverted");
                    if let Some(address) = self.lookup(branch_hash).await? {
                        return Ok(address);
                    }
                    return Err(ChainError::TransactionFailed(tx_hash));
                }
                Ok(None) => {
                    debug!(branch = %branch_hash, attempt, "registration receipt not yet available");
                }
                Err(err) if err.is_transient() => {
                    debug!(branch = %branch_hash, attempt, %err, "receipt poll failed");
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(RECEIPT_RETRY_DELAY).await;
        }

        // Receipt never surfaced. Re-read the registry before giving up so a
        // confirmed-but-unreported registration is not retried as a
        // duplicate.
        if let Some(address) = self.lookup(branch_hash).await? {
            return Ok(address);
        }
        Err(ChainError::Transient(format!(
            "no receipt for {tx_hash:#x} after {RECEIPT_MAX_RETRIES} polls"
        )))
    }

    async fn resolve_existing(&self, branch_hash: &BranchHash) -> Result<Address, ChainError> {
        debug!(branch = %branch_hash, "already registered, resolving via lookup");
        self.resolve_registered(branch_hash).await
    }

    async fn resolve_registered(&self, branch_hash: &BranchHash) -> Result<Address, ChainError> {
        self.lookup(branch_hash).await?.ok_or_else(|| {
            ChainError::Rpc("registry reports success but holds no address".to_string())
        })
    }
}
