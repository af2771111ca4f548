//! Toku messenger core.
//! The protocol engine (DHT, onion routing, encrypted transport) lives behind
//! the `Engine` trait; this crate owns addressing, save-data envelopes,
//! instance lifecycle, and event dispatch.

pub mod emoji;
pub mod engine;
pub mod events;
pub mod identity;
pub mod instance;
pub mod loopback;
pub mod savedata;

pub use engine::{Engine, EngineError, FileControl, UserStatus};
pub use events::{Event, EventKind, Invoker, Subscription};
pub use identity::{Address, AddressError, KeyPair, PublicKey, SecretKey};
pub use instance::{Instance, InstanceError, Options, ProxyConfig};
pub use loopback::{LoopbackEngine, LoopbackHandle};
pub use savedata::SaveData;
