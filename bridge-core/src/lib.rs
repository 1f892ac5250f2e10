//! BalanceBridge relay RPC protocol.
//! Host-driven: no I/O; the host owns the transport, timers and waiters and passes events in.

pub mod correlation;
pub mod envelope;
pub mod event;
pub mod filter;
pub mod keys;
pub mod pairing;
pub mod protocol;

pub use correlation::{CorrelationTable, RegisterError};
pub use envelope::{body_correlation_id, decode_response, encode_request, EnvelopeError};
pub use event::{InboundEvent, SubscriptionFilter, UnsignedEvent};
pub use filter::{DropReason, NoiseFilter, Verdict};
pub use keys::{KeyError, ServerKey, SigningKey};
pub use pairing::{parse_pairing_code, PairingDescriptor, PairingError};
pub use protocol::{
    Balance, BroadcastResult, CorrelationId, FeeEstimates, OperationType, ResultVariant, Utxo,
    APP_ID, PROTOCOL_VERSION, REQUEST_KIND, RESPONSE_KIND,
};
