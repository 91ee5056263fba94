//! PROFINET wire format and AR/IOCR data model.
//!
//! This crate has no notion of an AR's lifecycle or of threads — it is
//! the leaf layer: byte layouts, buffer sizing rules, and the connect
//! parameter value type, all of which `pnio-controller` builds on.

pub mod connect_params;
pub mod frame;
pub mod identity;
pub mod iocr;
pub mod slot;
pub mod timing;

pub use connect_params::{ArType, ConnectContext, ConnectRequestParams, Direction};
pub use iocr::{Iocr, IocrType};
pub use slot::{DiscoveredModule, ModuleIdentLookup, Semantic, SlotInfo, SlotKind};
pub use timing::TimingProfile;
