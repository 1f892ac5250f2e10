//! BalanceBridge wire protocol: event kinds, operation types and result variants.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Pairing protocol version. Only version 1 exists.
pub const PROTOCOL_VERSION: u32 = 1;

/// App id literal carried in every pairing code.
pub const APP_ID: &str = "balancebridge";

/// Event kind for wallet → server requests.
pub const REQUEST_KIND: u16 = 30078;

/// Event kind for server → wallet responses.
pub const RESPONSE_KIND: u16 = 30079;

/// Tag name carrying the correlation id, also the body field name.
pub const REQ_TAG: &str = "req";

/// Tag name addressing the server's public key.
pub const TO_TAG: &str = "p";

/// Operations the server understands. `as_str` is the `type` field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    #[serde(rename = "bitcoin_lookup")]
    BalanceLookup,
    #[serde(rename = "get_utxos")]
    GetUtxos,
    #[serde(rename = "broadcast_tx")]
    BroadcastTx,
    #[serde(rename = "get_fee_estimates")]
    GetFeeEstimates,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BalanceLookup => "bitcoin_lookup",
            Self::GetUtxos => "get_utxos",
            Self::BroadcastTx => "broadcast_tx",
            Self::GetFeeEstimates => "get_fee_estimates",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque per-request id. Ids we mint are hyphenated UUID v4; ids seen on the wire are
/// arbitrary strings and are only compared against live ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random id (122 bits of entropy).
    pub fn generate() -> Self {
        CorrelationId(uuid::Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId(s.to_owned())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        CorrelationId(s)
    }
}

impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address balance in satoshis. `unconfirmed` may be negative while spends sit in the mempool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: i64,
    pub unconfirmed: i64,
    pub total: i64,
    /// Transaction history as the server reports it; the shape is server-defined.
    pub transactions: Vec<serde_json::Value>,
}

/// One unspent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Outcome of a broadcast. `success: false` is a normal result, not a protocol failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fee rates in sat/vB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeEstimates {
    pub fast: f64,
    pub medium: f64,
    pub slow: f64,
}

/// Parsed response body, one variant per operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultVariant {
    Balance(Balance),
    UtxoSet(Vec<Utxo>),
    Broadcast(BroadcastResult),
    FeeEstimate(FeeEstimates),
}

impl ResultVariant {
    /// Operation that produces this variant.
    pub fn operation(&self) -> OperationType {
        match self {
            Self::Balance(_) => OperationType::BalanceLookup,
            Self::UtxoSet(_) => OperationType::GetUtxos,
            Self::Broadcast(_) => OperationType::BroadcastTx,
            Self::FeeEstimate(_) => OperationType::GetFeeEstimates,
        }
    }
}
