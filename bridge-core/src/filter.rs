//! Noise filter: cheap checks on inbound events before any body parsing.
//!
//! The subscription filter is only a hint to relays; some forward broader traffic. Everything
//! here is a tag scan or a length/equality check, so unrelated or hostile events cost little.

use crate::envelope::MAX_RESPONSE_CONTENT_LEN;
use crate::event::InboundEvent;
use crate::keys::ServerKey;
use crate::protocol::{CorrelationId, REQ_TAG, RESPONSE_KIND};

/// Decision for one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// `req` tag names a live request.
    Matched(CorrelationId),
    /// No `req` tag, but the body mentions one; host must parse the body id and re-check.
    Untagged,
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    WrongKind(u16),
    ForeignAuthor,
    TooLarge(usize),
    NoCorrelationId,
    /// Id not live: unrelated traffic or a duplicate of an already-resolved response.
    UnknownId,
}

impl DropReason {
    /// True for events that could have been ours (right author and kind) but match nothing live.
    pub fn is_unmatched(self) -> bool {
        matches!(self, DropReason::UnknownId)
    }
}

/// Per-session filter bound to the paired server key.
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    server_hex: String,
}

impl NoiseFilter {
    pub fn new(server: &ServerKey) -> Self {
        Self {
            server_hex: server.to_hex(),
        }
    }

    /// Classify `event`. `is_live` answers whether a correlation id is currently pending.
    pub fn check(&self, event: &InboundEvent, is_live: impl Fn(&str) -> bool) -> Verdict {
        if event.kind != RESPONSE_KIND {
            return Verdict::Drop(DropReason::WrongKind(event.kind));
        }
        if !event.pubkey.eq_ignore_ascii_case(&self.server_hex) {
            return Verdict::Drop(DropReason::ForeignAuthor);
        }
        if event.content.len() > MAX_RESPONSE_CONTENT_LEN {
            return Verdict::Drop(DropReason::TooLarge(event.content.len()));
        }
        match event.tag_value(REQ_TAG) {
            Some(id) if is_live(id) => Verdict::Matched(CorrelationId::from(id)),
            Some(_) => Verdict::Drop(DropReason::UnknownId),
            None if event.content.contains("\"req\"") => Verdict::Untagged,
            None => Verdict::Drop(DropReason::NoCorrelationId),
        }
    }
}
