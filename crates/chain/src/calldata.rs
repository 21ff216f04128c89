use ethereum_types::Address;
use keccak_hash::keccak;

use crate::ChainError;

/// First four bytes of keccak256 of the normalized signature, e.g.
/// `getAgent(bytes32)`.
pub fn function_selector(signature: &str) -> [u8; 4] {
    let hash = keccak(signature.as_bytes());
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&hash[..4]);
    selector
}

/// Calldata for a function taking a single `bytes32` argument.
pub fn encode_bytes32_call(signature: &str, word: [u8; 32]) -> Vec<u8> {
    let mut calldata = Vec::with_capacity(36);
    calldata.extend_from_slice(&function_selector(signature));
    calldata.extend_from_slice(&word);
    calldata
}

/// Decodes an `eth_call` result carrying a single ABI-encoded `address`
/// word. The zero address is reported as `None` — the registry's "not
/// registered" answer.
pub fn decode_address_word(hex_output: &str) -> Result<Option<Address>, ChainError> {
    let stripped = hex_output.strip_prefix("0x").unwrap_or(hex_output);
    let bytes = hex::decode(stripped)
        .map_err(|_| ChainError::InvalidResponse(format!("not hex: {hex_output:?}")))?;
    if bytes.len() < 32 {
        return Err(ChainError::InvalidResponse(format!(
            "address word has {} bytes",
            bytes.len()
        )));
    }
    let address = Address::from_slice(&bytes[12..32]);
    if address.is_zero() {
        Ok(None)
    } else {
        Ok(Some(address))
    }
}
