//! Relay event shapes exchanged with the transport.

use serde::{Deserialize, Serialize};

use crate::keys::ServerKey;

/// Event handed to the transport for signing and publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        find_tag(&self.tags, name)
    }
}

/// Signed event as delivered by a relay (NIP-01 layout). The transport has already checked
/// the signature; nothing here is trusted beyond that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub id: String,
    pub pubkey: String,
    #[serde(default)]
    pub created_at: u64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl InboundEvent {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        find_tag(&self.tags, name)
    }
}

fn find_tag<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.first().map(String::as_str) == Some(name))
        .and_then(|t| t.get(1))
        .map(String::as_str)
}

/// Coarse server-side subscription filter. Relays treat it as a hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub kinds: Vec<u16>,
    pub authors: Vec<String>,
}

impl SubscriptionFilter {
    /// Responses authored by the paired server.
    pub fn responses_from(server: &ServerKey) -> Self {
        Self {
            kinds: vec![crate::protocol::RESPONSE_KIND],
            authors: vec![server.to_hex()],
        }
    }
}
