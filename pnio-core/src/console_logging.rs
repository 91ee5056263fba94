//! Optional convenience for standalone binaries (demos, CLI tools) to get
//! readable console logging without each of them reimplementing an
//! `env_logger` setup.

/// Initialize `env_logger` from the `RUST_LOG` environment variable,
/// defaulting to `info` if unset. Safe to call more than once; subsequent
/// calls are no-ops.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
