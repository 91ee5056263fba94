//! Controller configuration (§4.8), built on the `Config` trait /
//! YAML-backed loading pattern from `pnio_core::config`.
//!
//! `ControllerConfig` is the one value a deployment hand-writes (or
//! generates) to describe this controller's own identity and the fixed
//! parameters of its AR table; `ControllerBuilder` validates it and wires
//! it together with the collaborator trait objects (transport, HTTP
//! client, GSDML cache, module lookup, frame transmitter, clock) into a
//! running [`crate::manager::ArManager`].

use std::net::Ipv4Addr;
use std::sync::Arc;

use pnio_core::error::PnioError;
use pnio_core::time::{Clock, SystemClock};
use pnio_core::Config;
use pnio_types::slot::ModuleIdentLookup;
use pnio_types::timing::TimingProfile;

use crate::ar::validate_station_name;
use crate::gsdml::{FileGsdmlCache, GsdmlCache};
use crate::manager::{ArManager, RpcTransportFactory};
use crate::transport::{FrameTransmitter, HttpClient};
#[cfg(feature = "http-fallback")]
use crate::transport::ReqwestHttpClient;

/// Default AR table capacity (§3 "Manager": "fixed-capacity table of
/// ARs (cap 64)").
pub const DEFAULT_AR_TABLE_CAPACITY: usize = 64;
/// Default HTTP fallback port (§6: "device, port 9081").
pub const DEFAULT_HTTP_FALLBACK_PORT: u16 = 9081;
/// Default HTTP timeout (§5: "HTTP fallback and GSDML fetch may
/// block ... for their own timeouts (e.g. 10s)").
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Everything a deployment configures about this controller process
/// (§4.8). Loads from / saves to YAML via [`pnio_core::Config`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ControllerConfig {
    /// The CM initiator station name used in every connect request (spec
    /// §4.3) — never the device's name.
    pub controller_station_name: String,
    /// OS network interface the RPC transport binds to (§4.6
    /// `init`).
    pub interface_name: String,
    pub vendor_id: u16,
    pub device_id: u16,
    /// Directory holding cached `<station_name>.xml` GSDML documents
    /// (§6 "Persisted state layout").
    pub gsdml_cache_dir: String,
    #[serde(default)]
    pub default_timing: TimingProfile,
    #[serde(default = "default_ar_table_capacity")]
    pub ar_table_capacity: usize,
    #[serde(default = "default_http_fallback_port")]
    pub http_fallback_port: u16,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub http_fallback_enabled: bool,
}

fn default_ar_table_capacity() -> usize {
    DEFAULT_AR_TABLE_CAPACITY
}
fn default_http_fallback_port() -> u16 {
    DEFAULT_HTTP_FALLBACK_PORT
}
fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}
fn default_true() -> bool {
    true
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_station_name: "controller-1".to_string(),
            interface_name: "eth0".to_string(),
            vendor_id: 0,
            device_id: 0,
            gsdml_cache_dir: "gsdml".to_string(),
            default_timing: TimingProfile::default(),
            ar_table_capacity: DEFAULT_AR_TABLE_CAPACITY,
            http_fallback_port: DEFAULT_HTTP_FALLBACK_PORT,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            http_fallback_enabled: true,
        }
    }
}

impl Config for ControllerConfig {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if let Err(e) = validate_station_name(&self.controller_station_name) {
            errors.push(e.to_string());
        }
        if self.interface_name.is_empty() {
            errors.push("interface_name must not be empty".to_string());
        }
        if self.gsdml_cache_dir.is_empty() {
            errors.push("gsdml_cache_dir must not be empty".to_string());
        }
        if self.ar_table_capacity == 0 {
            errors.push("ar_table_capacity must be at least 1".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Builds a validated [`ArManager`] from a [`ControllerConfig`] plus the
/// collaborator trait objects the core treats as external (§1, §6,
/// §9): the RPC transport factory, the raw frame transmitter, and
/// (optionally) an overridden HTTP client / GSDML cache / module lookup.
pub struct ControllerBuilder {
    config: ControllerConfig,
    controller_mac: [u8; 6],
    controller_ip: Option<Ipv4Addr>,
    rpc_factory: Option<Arc<dyn RpcTransportFactory>>,
    http: Option<Arc<dyn HttpClient>>,
    gsdml_cache: Option<Arc<dyn GsdmlCache>>,
    module_lookup: Option<Arc<dyn ModuleIdentLookup>>,
    transmitter: Option<Arc<dyn FrameTransmitter>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ControllerBuilder {
    pub fn new(config: ControllerConfig, controller_mac: [u8; 6]) -> Self {
        Self {
            config,
            controller_mac,
            controller_ip: None,
            rpc_factory: None,
            http: None,
            gsdml_cache: None,
            module_lookup: None,
            transmitter: None,
            clock: None,
        }
    }

    pub fn with_controller_ip(mut self, ip: Ipv4Addr) -> Self {
        self.controller_ip = Some(ip);
        self
    }

    pub fn with_rpc_factory(mut self, factory: Arc<dyn RpcTransportFactory>) -> Self {
        self.rpc_factory = Some(factory);
        self
    }

    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_gsdml_cache(mut self, cache: Arc<dyn GsdmlCache>) -> Self {
        self.gsdml_cache = Some(cache);
        self
    }

    pub fn with_module_lookup(mut self, lookup: Arc<dyn ModuleIdentLookup>) -> Self {
        self.module_lookup = Some(lookup);
        self
    }

    pub fn with_transmitter(mut self, transmitter: Arc<dyn FrameTransmitter>) -> Self {
        self.transmitter = Some(transmitter);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the config and assemble the [`ArManager`] (§4.8).
    /// Fails with [`PnioError::InvalidParam`] if
    /// `validate()` reports errors, or with
    /// [`PnioError::NotInitialized`] if a mandatory collaborator
    /// (`rpc_factory`, `transmitter`) was never supplied.
    pub fn build(self) -> Result<ArManager, PnioError> {
        self.config
            .validate()
            .map_err(|errs| PnioError::InvalidParam(errs.join("; ")))?;

        let rpc_factory = self
            .rpc_factory
            .ok_or_else(|| PnioError::NotInitialized("no RpcTransportFactory supplied".to_string()))?;
        let transmitter = self
            .transmitter
            .ok_or_else(|| PnioError::NotInitialized("no FrameTransmitter supplied".to_string()))?;

        let http: Arc<dyn HttpClient> = match self.http {
            Some(h) => h,
            None => default_http_client(self.config.http_timeout_ms)?,
        };
        let gsdml_cache: Arc<dyn GsdmlCache> = self
            .gsdml_cache
            .unwrap_or_else(|| Arc::new(FileGsdmlCache::new(self.config.gsdml_cache_dir.clone())));
        let module_lookup: Arc<dyn ModuleIdentLookup> = self
            .module_lookup
            .unwrap_or_else(|| Arc::new(pnio_types::slot::StaticModuleIdentLookup));
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));

        let manager = ArManager::new(
            self.controller_mac,
            self.config.controller_station_name.clone(),
            self.config.vendor_id,
            self.config.device_id,
            self.config.interface_name.clone(),
            rpc_factory,
            http,
            gsdml_cache,
            module_lookup,
            transmitter,
            clock,
        )
        .with_capacity(self.config.ar_table_capacity)
        .with_http_fallback(self.config.http_fallback_enabled, self.config.http_fallback_port);

        if let Some(ip) = self.controller_ip {
            manager.set_controller_ip(ip);
        }

        Ok(manager)
    }
}

#[cfg(feature = "http-fallback")]
fn default_http_client(timeout_ms: u64) -> Result<Arc<dyn HttpClient>, PnioError> {
    let client = ReqwestHttpClient::new(std::time::Duration::from_millis(timeout_ms))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "http-fallback"))]
fn default_http_client(_timeout_ms: u64) -> Result<Arc<dyn HttpClient>, PnioError> {
    Err(PnioError::NotInitialized(
        "no HttpClient supplied and the http-fallback feature is disabled".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingTransmitter, StubHttp, StubTransport};
    use pnio_core::time::FakeClock;

    struct FixedRpcFactory(Arc<dyn crate::transport::RpcTransport>);
    impl RpcTransportFactory for FixedRpcFactory {
        fn create(&self, _interface_name: &str, _controller_ip: Ipv4Addr) -> Result<Arc<dyn crate::transport::RpcTransport>, PnioError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn station_name_violation_is_reported() {
        let mut cfg = ControllerConfig::default();
        cfg.controller_station_name = "BAD NAME".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_fails_without_mandatory_collaborators() {
        let cfg = ControllerConfig::default();
        let result = ControllerBuilder::new(cfg, [1, 2, 3, 4, 5, 6]).build();
        assert!(matches!(result, Err(PnioError::NotInitialized(_))));
    }

    #[test]
    fn builder_assembles_a_working_manager() {
        let cfg = ControllerConfig {
            ar_table_capacity: 4,
            ..ControllerConfig::default()
        };
        let transport: Arc<dyn crate::transport::RpcTransport> =
            Arc::new(StubTransport::always_succeeds());
        let manager = ControllerBuilder::new(cfg, [1, 2, 3, 4, 5, 6])
            .with_controller_ip("10.0.0.1".parse().unwrap())
            .with_rpc_factory(Arc::new(FixedRpcFactory(transport)))
            .with_http_client(Arc::new(StubHttp::empty()))
            .with_transmitter(Arc::new(RecordingTransmitter::default()))
            .with_clock(Arc::new(FakeClock::new()))
            .build()
            .unwrap();
        assert_eq!(manager.ar_count(), 0);
    }
}
