//! Ambient stack shared by the PROFINET IO controller crates: configuration
//! loading, the error taxonomy, a monotonic time source abstraction, and
//! lock-tracing helpers around the coarse manager mutex.

pub mod config;
pub mod error;
pub mod sync;
pub mod time;

#[cfg(feature = "console-logging")]
pub mod console_logging;

pub use config::{Config, ConfigError};
pub use error::PnioError;
pub use time::{Clock, SystemClock};
