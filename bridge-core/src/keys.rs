//! Keys: the paired server's public key and the wallet-side signing key handed to the transport.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a 32-byte key written as hex.
pub const KEY_HEX_LEN: usize = 64;

/// Server public key (32 bytes, x-only). Serialized as lowercase hex, as relays expect in
/// `authors` filters and `p` tags.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ServerKey(#[serde(with = "hex_32")] [u8; 32]);

mod hex_32 {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        super::decode_key_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// True if `s` is exactly 64 hex characters (either case).
pub fn is_key_hex(s: &str) -> bool {
    s.len() == KEY_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn decode_key_hex(s: &str) -> Result<[u8; 32], KeyError> {
    if s.len() != KEY_HEX_LEN {
        return Err(KeyError::Length(s.len()));
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out).map_err(|_| KeyError::NotHex)?;
    Ok(out)
}

impl ServerKey {
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        decode_key_hex(s).map(ServerKey)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ServerKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short stable label for logs: first 8 bytes of SHA-256 over the key, hex.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerKey({})", self.to_hex())
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Wallet-side secret used by the transport to sign request events. Never serialized;
/// `Debug` is redacted.
#[derive(Clone)]
pub struct SigningKey([u8; 32]);

impl SigningKey {
    /// Random key for an ephemeral session identity.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        SigningKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("expected 64 hex characters, got {0}")]
    Length(usize),
    #[error("key is not valid hex")]
    NotHex,
}
