//! Pairing: parse and validate the out-of-band pairing code that names the server and its relays.

use serde_json::Value;

use crate::keys::{is_key_hex, ServerKey};
use crate::protocol::{APP_ID, PROTOCOL_VERSION};

/// Pairing descriptor as carried in the pairing code. Fields are raw until `validate` runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingDescriptor {
    pub version: u32,
    pub app_id: String,
    pub server_key: String,
    pub relays: Vec<String>,
}

impl PairingDescriptor {
    /// Check, in order: version, app id, server key, relays. First failure wins.
    pub fn validate(&self) -> Result<ServerKey, PairingError> {
        if self.version != PROTOCOL_VERSION {
            return Err(PairingError::UnsupportedVersion(self.version));
        }
        if self.app_id != APP_ID {
            return Err(PairingError::WrongApp(self.app_id.clone()));
        }
        if !is_key_hex(&self.server_key) {
            return Err(PairingError::BadServerKey);
        }
        if self.relays.is_empty() {
            return Err(PairingError::NoRelays);
        }
        if let Some(bad) = self.relays.iter().find(|r| !is_relay_uri(r)) {
            return Err(PairingError::BadRelay(bad.clone()));
        }
        ServerKey::from_hex(&self.server_key).map_err(|_| PairingError::BadServerKey)
    }
}

fn is_relay_uri(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("wss://")
        .or_else(|| lower.strip_prefix("ws://"));
    matches!(rest, Some(host) if !host.is_empty())
}

/// Parse a pairing code into a descriptor. Does not validate field values; call
/// `PairingDescriptor::validate` (the client does so before connecting).
///
/// A bare 64-hex string is the common mistake of pasting only the server key; it gets its own
/// error so the UI can say so.
pub fn parse_pairing_code(text: &str) -> Result<PairingDescriptor, PairingError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(PairingError::Empty);
    }
    if is_key_hex(text) {
        return Err(PairingError::BareServerKey);
    }
    let value: Value =
        serde_json::from_str(text).map_err(|e| PairingError::NotJson(e.to_string()))?;
    let obj = value.as_object().ok_or(PairingError::NotAnObject)?;

    let version = match obj.get("version") {
        None => return Err(PairingError::MissingField("version")),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(PairingError::WrongType {
                field: "version",
                expected: "unsigned integer",
            })?,
    };
    let app_id = string_field(obj, "app")?;
    let server_key = string_field(obj, "nodePubkey")?;
    let relays = match obj.get("relays") {
        None => return Err(PairingError::MissingField("relays")),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, r)| {
                r.as_str()
                    .map(str::to_owned)
                    .ok_or(PairingError::RelayNotString(i))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(PairingError::WrongType {
                field: "relays",
                expected: "array of strings",
            })
        }
    };

    Ok(PairingDescriptor {
        version,
        app_id,
        server_key,
        relays,
    })
}

fn string_field(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, PairingError> {
    match obj.get(field) {
        None => Err(PairingError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(PairingError::WrongType {
            field,
            expected: "string",
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("pairing code is empty")]
    Empty,
    #[error("this looks like a bare server key; scan the full pairing code instead")]
    BareServerKey,
    #[error("pairing code is not valid JSON: {0}")]
    NotJson(String),
    #[error("pairing code must be a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be a {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("relays[{0}] must be a string")]
    RelayNotString(usize),
    #[error("unsupported pairing version {0}")]
    UnsupportedVersion(u32),
    #[error("pairing code is for app `{0}`, not balancebridge")]
    WrongApp(String),
    #[error("nodePubkey must be exactly 64 hex characters")]
    BadServerKey,
    #[error("pairing code lists no relays")]
    NoRelays,
    #[error("relay `{0}` is not a ws:// or wss:// URI")]
    BadRelay(String),
}
