//! Relay connectivity: the connection pool, NIP-01 message framing,
//! NIP-11 capability probing, and NIP-65 discovery.

pub mod discovery;
pub mod message;
pub mod nip11;
pub mod pool;
pub mod queue;

pub use discovery::{read_relays_for, Discovery, DiscoveryOptions, IngestItem};
pub use pool::{
    PoolError, PoolOptions, PoolResult, RelayPool, RelayState, RelayStatusSnapshot, SubEvent,
    Subscription,
};
