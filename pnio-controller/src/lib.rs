//! PROFINET IO controller AR lifecycle and cyclic data exchange engine.
//!
//! This crate implements components C4-C6 of the core: the discovery
//! pipeline, the AR state machine, and the AR manager that owns the AR
//! table, the controller's identity, and the lazily-initialized RPC
//! context. It depends on `pnio-types` for the wire format and data model
//! (C1-C3, C7) and on `pnio-core` for the ambient stack (config, errors,
//! time, lock tracing).

pub mod ar;
pub mod config;
pub mod discovery;
pub mod gsdml;
pub mod manager;
pub mod retry;
pub mod state;
pub mod transport;

pub mod test_support;

pub use ar::{Ar, ArConfig, ArState};
pub use config::{ControllerBuilder, ControllerConfig};
pub use manager::{ArManager, ArSnapshot, RpcTransportFactory};
pub use retry::ExponentialBackoff;
pub use state::{StateChange, StateChangeCallback};
