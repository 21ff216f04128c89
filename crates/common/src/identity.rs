use std::fmt;
use std::str::FromStr;

use ethereum_types::H256;
use keccak_hash::keccak;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// Number of leading hex characters used as the supervised process name.
pub const SUPERVISOR_NAME_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("branch hash must be 32 bytes of hex, got {0:?}")]
    InvalidLength(String),
    #[error("branch hash is not valid hex: {0}")]
    NotHex(#[from] hex::FromHexError),
}

/// Stable cross-database identity of a tracked (repository, branch) pair:
/// `keccak256(repo_url + "/" + branch_name)`.
///
/// Database row ids are ephemeral (the database itself is ephemeral); every
/// cross-component lookup keys on this hash instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchHash(H256);

impl BranchHash {
    pub fn derive(repo_url: &str, branch_name: &str) -> Self {
        let preimage = format!("{repo_url}/{branch_name}");
        BranchHash(keccak(preimage.as_bytes()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        BranchHash(H256(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != 32 {
            return Err(IdentityError::InvalidLength(hex::encode(bytes)));
        }
        Ok(BranchHash(H256::from_slice(bytes)))
    }

    /// Parses `"0x"`-prefixed or bare 64-character hex.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        if stripped.len() != 64 {
            return Err(IdentityError::InvalidLength(stripped.to_string()));
        }
        let bytes = hex::decode(stripped)?;
        Self::from_slice(&bytes)
    }

    pub fn as_h256(&self) -> H256 {
        self.0
    }

    pub fn to_fixed_bytes(&self) -> [u8; 32] {
        self.0.to_fixed_bytes()
    }

    /// Full lowercase hex, no prefix. Also the workspace directory name.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// The name the supervisor knows this branch's worker by.
    pub fn supervisor_name(&self) -> String {
        let mut name = self.to_hex();
        name.truncate(SUPERVISOR_NAME_LEN);
        name
    }
}

impl fmt::Display for BranchHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BranchHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchHash({})", self.to_hex())
    }
}

impl FromStr for BranchHash {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for BranchHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BranchHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BranchHash::from_hex(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_a_pure_function() {
        let a = BranchHash::derive("https://github.com/acme/bot.git", "main");
        let b = BranchHash::derive("https://github.com/acme/bot.git", "main");
        assert_eq!(a, b);
        assert_ne!(a, BranchHash::derive("https://github.com/acme/bot.git", "dev"));
    }

    #[test]
    fn derive_matches_keccak_of_joined_preimage() {
        let hash = BranchHash::derive("repo", "branch");
        assert_eq!(hash.as_h256(), keccak(b"repo/branch"));
    }

    #[test]
    fn separator_is_part_of_the_preimage() {
        // "a/b" + "c" and "a" + "b/c" join to the same string, and that is
        // intentional: identity is the joined path, not the pair.
        let joined = BranchHash::derive("a/b", "c");
        let other = BranchHash::derive("a", "b/c");
        assert_eq!(joined, other);
    }

    #[test]
    fn hex_round_trip() {
        let hash = BranchHash::derive("r", "b");
        let parsed = BranchHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        let prefixed = BranchHash::from_hex(&format!("0x{hash}")).unwrap();
        assert_eq!(hash, prefixed);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(BranchHash::from_hex("abcd").is_err());
        assert!(BranchHash::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn supervisor_name_is_sixteen_chars() {
        let hash = BranchHash::derive("r", "b");
        let name = hash.supervisor_name();
        assert_eq!(name.len(), SUPERVISOR_NAME_LEN);
        assert!(hash.to_hex().starts_with(&name));
    }

    #[test]
    fn serde_as_hex_string() {
        let hash = BranchHash::derive("r", "b");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        let back: BranchHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }
}
