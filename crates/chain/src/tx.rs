use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use secp256k1::{Message, SECP256K1, SecretKey};

use crate::rlp;

pub const EIP1559_TX_TYPE: u8 = 0x02;

/// The one transaction shape this controller sends: an EIP-1559 call with
/// calldata and no value transfer, access list empty.
#[derive(Debug, Clone)]
pub struct Eip1559Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u64,
    pub max_fee_per_gas: u64,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

impl Eip1559Transaction {
    /// RLP payload without the signature fields, used as the signing input.
    fn encode_fields(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        rlp::encode_u64(&mut payload, self.chain_id);
        rlp::encode_u64(&mut payload, self.nonce);
        rlp::encode_u64(&mut payload, self.max_priority_fee_per_gas);
        rlp::encode_u64(&mut payload, self.max_fee_per_gas);
        rlp::encode_u64(&mut payload, self.gas_limit);
        rlp::encode_bytes(&mut payload, self.to.as_bytes());
        rlp::encode_u256(&mut payload, self.value);
        rlp::encode_bytes(&mut payload, &self.data);
        payload.extend_from_slice(&rlp::wrap_list(&[])); // access list
        payload
    }

    /// `0x02 || rlp([...fields])` — the digest preimage of EIP-2718/1559.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut encoded = rlp::wrap_list(&self.encode_fields());
        encoded.insert(0, EIP1559_TX_TYPE);
        encoded
    }

    /// Signs and produces the raw bytes for `eth_sendRawTransaction`.
    pub fn sign_and_encode(&self, signer: &LocalSigner) -> Vec<u8> {
        let (r, s, y_parity) = signer.sign_digest(keccak(self.signing_payload()));

        let mut payload = self.encode_fields();
        rlp::encode_u64(&mut payload, y_parity as u64);
        rlp::encode_u256(&mut payload, r);
        rlp::encode_u256(&mut payload, s);

        let mut raw = rlp::wrap_list(&payload);
        raw.insert(0, EIP1559_TX_TYPE);
        raw
    }
}

/// Holds the controller's private key and derives its address the usual
/// way: keccak of the uncompressed public key, low 20 bytes.
#[derive(Clone)]
pub struct LocalSigner {
    private_key: SecretKey,
    pub address: Address,
}

impl LocalSigner {
    pub fn new(private_key: SecretKey) -> Self {
        let address = Address::from(keccak(
            &private_key.public_key(SECP256K1).serialize_uncompressed()[1..],
        ));
        Self {
            private_key,
            address,
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, secp256k1::Error> {
        let stripped = hex_key.strip_prefix("0x").unwrap_or(hex_key);
        let bytes = hex::decode(stripped).map_err(|_| secp256k1::Error::InvalidSecretKey)?;
        Ok(Self::new(SecretKey::from_slice(&bytes)?))
    }

    fn sign_digest(&self, digest: H256) -> (U256, U256, bool) {
        let msg = Message::from_digest(digest.0);
        let (recovery_id, signature) = SECP256K1
            .sign_ecdsa_recoverable(&msg, &self.private_key)
            .serialize_compact();

        let r = U256::from_big_endian(&signature[..32]);
        let s = U256::from_big_endian(&signature[32..]);
        (r, s, recovery_id.to_i32() != 0)
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalSigner({:#x})", self.address)
    }
}
