//! BalanceBridge wallet client.
//! Pairs with a server over relays and exposes balance, UTXO, broadcast and fee calls.
//! The relay connection itself is a `Transport` supplied by the host.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod pending;
pub mod transport;

pub use client::{
    ClientOptions, ClientState, DeliveryStats, ProtocolClient, SessionState,
    DEFAULT_MAX_ADDRESSES, DEFAULT_REQUEST_TIMEOUT,
};
pub use config::{Config, ConfigError, LogConfig, LogFormat};
pub use error::ClientError;
pub use memory::MemoryTransport;
pub use transport::{Subscription, SubscriptionId, Transport, TransportError};
