mod calldata;
mod errors;
mod registry;
mod rlp;
mod rpc;
mod tx;

pub use calldata::{decode_address_word, encode_bytes32_call, function_selector};
pub use errors::ChainError;
pub use registry::{RegistryClient, RegistryConfig};
pub use rpc::{RpcClient, TxReceipt};
pub use tx::{Eip1559Transaction, LocalSigner};
