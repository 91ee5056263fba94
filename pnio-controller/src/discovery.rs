//! Discovery pipeline (component C4, §4.4).
//!
//! Orchestrates the full "bring an AR to RUN" sequence: cache probe, a
//! DAP-only probe connect, acyclic record-read, release of the probe AR,
//! a full connect built from the discovered (or cached) inventory, and a
//! background GSDML fetch on success. None of this runs under the
//! manager lock (§5: "long-running blocking call from inside a
//! critical section must release the lock") — [`crate::manager::ArManager`]
//! extracts what it needs, drops the lock, calls [`run_discovery`], then
//! reacquires the lock to apply the result.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use pnio_core::error::PnioError;
use pnio_types::connect_params::{self, ConnectContext};
use pnio_types::iocr::{self, Iocr};
use pnio_types::slot::{ModuleIdentLookup, SlotInfo};
use pnio_types::timing::TimingProfile;
use uuid::Uuid;

use crate::gsdml::GsdmlCache;
use crate::transport::{
    HttpClient, ReadRecordParams, RpcTransport, RECORD_INDEX_REAL_IDENTIFICATION_DATA,
};
use pnio_types::slot::{DAP_SUBSLOT_IDENTITY, DiscoveredModule};

/// Empirical pause between releasing the DAP-probe AR and issuing the
/// full connect, to let the device clean up its resources before they're
/// reused (§4.4 Phase 3b, §9 open question (c)).
pub const POST_RELEASE_SLEEP: Duration = Duration::from_millis(100);

/// Everything [`run_discovery`] needs that isn't part of the outcome
/// itself: collaborators plus the identity/addressing facts the AR
/// manager already knows about this device and about itself.
pub struct DiscoveryRequest<'a> {
    pub station_name: &'a str,
    pub device_ip: Ipv4Addr,
    pub controller_station_name: &'a str,
    pub controller_mac: [u8; 6],
    pub controller_uuid: Uuid,
    pub controller_port: u16,
    pub timing: TimingProfile,
    pub input_frame_id: u16,
    pub output_frame_id: u16,
    pub session_key: u16,
    pub http_port: u16,
    pub http_enabled: bool,
}

/// Result of a completed pipeline run: the AR manager installs these
/// values onto the real (registered) `Ar` under lock.
pub struct DiscoveryOutcome {
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub device_mac: [u8; 6],
    pub slot_info: Vec<SlotInfo>,
    pub input_iocr: Iocr,
    pub output_iocr: Iocr,
    pub from_cache: bool,
}

/// A function invoked after a successful discovery, fire-and-forget, to
/// fetch and cache the device's full GSDML document (§4.4 "Phase 5+
/// ... background GSDML fetch"). Kept as a separate step the caller may
/// skip in tests, since it is explicitly non-fatal and orthogonal to the
/// pipeline's success/failure outcome.
pub fn background_gsdml_fetch(
    http: &dyn HttpClient,
    gsdml_cache: &dyn GsdmlCache,
    station_name: &str,
    device_ip: Ipv4Addr,
    http_port: u16,
) {
    let url = format!("http://{device_ip}:{http_port}/gsdml");
    match http.get_bytes(&url, 256 * 1024) {
        Ok(bytes) => {
            if let Err(e) = gsdml_cache.save_raw(station_name, &bytes) {
                log::warn!("gsdml fetch for '{station_name}' succeeded but caching failed: {e}");
            }
        }
        Err(e) => {
            log::warn!("background gsdml fetch for '{station_name}' failed (non-fatal): {e}");
        }
    }
}

/// Run the full discovery pipeline (§4.4 Phases 1-6).
pub fn run_discovery(
    req: &DiscoveryRequest<'_>,
    transport: &dyn RpcTransport,
    http: &dyn HttpClient,
    gsdml_cache: &dyn GsdmlCache,
    module_lookup: &dyn ModuleIdentLookup,
) -> Result<DiscoveryOutcome, PnioError> {
    // Phase 1: cache probe.
    if let Some(modules) = gsdml_cache.lookup_modules(req.station_name) {
        log::info!("discovery for '{}': cache hit, skipping Phases 2-3", req.station_name);
        let slots = connect_params::slots_from_discovered(&modules, module_lookup);
        return finish_with_full_connect(req, &slots, transport, module_lookup, true);
    }
    log::info!("discovery for '{}': cache miss, starting probe", req.station_name);

    // Phase 2: DAP-only connect.
    let probe_uuid = Uuid::new_v4();
    let probe_ctx = ConnectContext {
        ar_uuid: probe_uuid,
        session_key: req.session_key,
        controller_station_name: req.controller_station_name,
        controller_mac: req.controller_mac,
        controller_uuid: req.controller_uuid,
        controller_port: req.controller_port,
        timing: req.timing,
        input_frame_id: req.input_frame_id,
        output_frame_id: req.output_frame_id,
    };
    let dap_params = connect_params::build_dap_only_params(&probe_ctx);

    let dap_connect = transport.connect(req.device_ip, &dap_params);
    let dap_connect = match dap_connect {
        Ok(resp) if resp.success => resp,
        Ok(_) => {
            log::warn!(
                "discovery for '{}': DAP-only connect rejected, falling back to HTTP",
                req.station_name
            );
            return phase6_http_fallback(req, transport, http, module_lookup);
        }
        Err(e) => {
            log::warn!(
                "discovery for '{}': DAP-only connect failed ({e}), falling back to HTTP",
                req.station_name
            );
            return phase6_http_fallback(req, transport, http, module_lookup);
        }
    };

    // Phase 2b: ParameterEnd on the probe AR — required before Record
    // Read is accepted.
    if let Err(e) = transport.parameter_end(req.device_ip, probe_uuid, dap_connect.session_key) {
        log::warn!("discovery for '{}': probe ParameterEnd failed: {e}", req.station_name);
        let _ = transport.release(req.device_ip, probe_uuid, dap_connect.session_key);
        return Err(e);
    }

    // Phase 3: Record Read 0xF844 (RealIdentificationData) on slot 0 /
    // subslot 0x0001.
    let read = transport.read_record(
        req.device_ip,
        &ReadRecordParams {
            ar_uuid: probe_uuid,
            session_key: dap_connect.session_key,
            slot: 0,
            subslot: DAP_SUBSLOT_IDENTITY,
            index: RECORD_INDEX_REAL_IDENTIFICATION_DATA,
        },
    );

    // Phase 3b: release the probe AR regardless of Record Read outcome,
    // then give the device a beat to clean up.
    if let Err(e) = transport.release(req.device_ip, probe_uuid, dap_connect.session_key) {
        log::warn!("discovery for '{}': probe release failed (best effort): {e}", req.station_name);
    }
    std::thread::sleep(POST_RELEASE_SLEEP);

    let read = match read {
        Ok(r) if r.success => r,
        Ok(_) => {
            return Err(PnioError::Protocol(format!(
                "record read 0xF844 rejected by device for '{}'",
                req.station_name
            )))
        }
        Err(e) => return Err(e),
    };

    let slots = connect_params::slots_from_discovered(&read.modules, module_lookup);
    finish_with_full_connect(req, &slots, transport, module_lookup, false)
}

fn phase6_http_fallback(
    req: &DiscoveryRequest<'_>,
    transport: &dyn RpcTransport,
    http: &dyn HttpClient,
    module_lookup: &dyn ModuleIdentLookup,
) -> Result<DiscoveryOutcome, PnioError> {
    if !req.http_enabled {
        return Err(PnioError::ConnectionFailed(format!(
            "DAP-only connect to '{}' failed and HTTP fallback is disabled",
            req.station_name
        )));
    }
    let url = format!("http://{}:{}/slots", req.device_ip, req.http_port);
    let body = http.get_json(&url)?;
    let modules = parse_slots_json(&body)?;
    let slots = connect_params::slots_from_discovered(&modules, module_lookup);
    finish_with_full_connect(req, &slots, transport, module_lookup, false)
}

fn parse_slots_json(value: &serde_json::Value) -> Result<Vec<DiscoveredModule>, PnioError> {
    let arr = value
        .as_array()
        .ok_or_else(|| PnioError::Protocol("/slots response is not a JSON array".to_string()))?;
    arr.iter()
        .map(|entry| {
            let slot = entry
                .get("slot")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| PnioError::Protocol("slot entry missing 'slot'".to_string()))?;
            let subslot = entry
                .get("subslot")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| PnioError::Protocol("slot entry missing 'subslot'".to_string()))?;
            let module_ident = entry
                .get("module_ident")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| PnioError::Protocol("slot entry missing 'module_ident'".to_string()))?;
            let submodule_ident = entry
                .get("submodule_ident")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| {
                    PnioError::Protocol("slot entry missing 'submodule_ident'".to_string())
                })?;
            Ok(DiscoveredModule {
                slot: slot as u16,
                subslot: subslot as u16,
                module_ident: module_ident as u32,
                submodule_ident: submodule_ident as u32,
            })
        })
        .collect()
}

/// Phase 4 (build full params from the discovered list, recomputing IOCR
/// sizing) + Phase 5 (full connect). Shared by the cache-hit shortcut and
/// every discovery path.
fn finish_with_full_connect(
    req: &DiscoveryRequest<'_>,
    slots: &[SlotInfo],
    transport: &dyn RpcTransport,
    module_lookup: &dyn ModuleIdentLookup,
    from_cache: bool,
) -> Result<DiscoveryOutcome, PnioError> {
    let ar_uuid = Uuid::new_v4();
    let full_ctx = ConnectContext {
        ar_uuid,
        session_key: req.session_key,
        controller_station_name: req.controller_station_name,
        controller_mac: req.controller_mac,
        controller_uuid: req.controller_uuid,
        controller_port: req.controller_port,
        timing: req.timing,
        input_frame_id: req.input_frame_id,
        output_frame_id: req.output_frame_id,
    };
    let full_params = connect_params::build_full_params(&full_ctx, slots, module_lookup)
        .map_err(PnioError::Protocol)?;

    let resp = transport.connect(req.device_ip, &full_params)?;
    if !resp.success {
        return Err(PnioError::ConnectionFailed(format!(
            "full connect to '{}' rejected",
            req.station_name
        )));
    }

    let (mut input_iocr, mut output_iocr) =
        iocr::allocate(req.input_frame_id, req.output_frame_id, slots)?;
    for (io_type, frame_id) in &resp.frame_ids {
        match io_type {
            pnio_types::iocr::IocrType::Input => input_iocr.frame_id = *frame_id,
            pnio_types::iocr::IocrType::Output => output_iocr.frame_id = *frame_id,
        }
    }

    Ok(DiscoveryOutcome {
        ar_uuid,
        session_key: resp.session_key,
        device_mac: resp.device_mac,
        slot_info: slots.to_vec(),
        input_iocr,
        output_iocr,
        from_cache,
    })
}

/// Convenience wrapper bundling the three collaborator trait objects the
/// pipeline needs, so [`crate::manager::ArManager`] can pass one value
/// instead of three.
pub struct DiscoveryCollaborators {
    pub transport: Arc<dyn RpcTransport>,
    pub http: Arc<dyn HttpClient>,
    pub gsdml_cache: Arc<dyn GsdmlCache>,
    pub module_lookup: Arc<dyn ModuleIdentLookup>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubHttp, StubTransport};
    use pnio_types::slot::{Semantic, StaticModuleIdentLookup};

    fn req<'a>(station_name: &'a str) -> DiscoveryRequest<'a> {
        DiscoveryRequest {
            station_name,
            device_ip: "10.0.0.5".parse().unwrap(),
            controller_station_name: "controller-1",
            controller_mac: [1, 2, 3, 4, 5, 6],
            controller_uuid: Uuid::nil(),
            controller_port: 34964,
            timing: TimingProfile::default(),
            input_frame_id: 0x8001,
            output_frame_id: 0x8002,
            session_key: 1,
            http_port: 9081,
            http_enabled: true,
        }
    }

    #[test]
    fn cache_hit_skips_dap_and_record_read() {
        let transport = StubTransport::always_succeeds();
        let http = StubHttp::empty();
        let gsdml = crate::gsdml::StubGsdmlCache::new();
        gsdml.seed(
            "rtu-a",
            vec![DiscoveredModule {
                slot: 1,
                subslot: 1,
                module_ident: 0x0010,
                submodule_ident: 0x0010,
            }],
        );
        let lut = StaticModuleIdentLookup;

        let outcome = run_discovery(&req("rtu-a"), &transport, &http, &gsdml, &lut).unwrap();
        assert!(outcome.from_cache);
        assert_eq!(outcome.slot_info.len(), 1);
        assert_eq!(outcome.slot_info[0].semantic, Semantic::Ph);
        assert_eq!(transport.connect_calls(), 1, "only the full connect should run");
        assert_eq!(transport.read_record_calls(), 0);
    }

    #[test]
    fn cold_cache_runs_dap_probe_then_record_read_then_full_connect() {
        let transport = StubTransport::always_succeeds();
        let http = StubHttp::empty();
        let gsdml = crate::gsdml::StubGsdmlCache::new();
        let lut = StaticModuleIdentLookup;

        let outcome = run_discovery(&req("rtu-b"), &transport, &http, &gsdml, &lut).unwrap();
        assert!(!outcome.from_cache);
        assert_eq!(transport.connect_calls(), 2, "DAP-only then full connect");
        assert_eq!(transport.read_record_calls(), 1);
        assert_eq!(transport.release_calls(), 1, "probe AR must be released");
        assert_eq!(outcome.slot_info.len(), 2);
    }

    #[test]
    fn dap_connect_failure_falls_back_to_http() {
        let transport = StubTransport::dap_connect_fails_then_succeeds();
        let http = StubHttp::with_slots(vec![serde_json::json!({
            "slot": 1, "subslot": 1, "module_ident": 0x10, "submodule_ident": 0x10
        })]);
        let gsdml = crate::gsdml::StubGsdmlCache::new();
        let lut = StaticModuleIdentLookup;

        let outcome = run_discovery(&req("rtu-c"), &transport, &http, &gsdml, &lut).unwrap();
        assert!(!outcome.from_cache);
        assert_eq!(transport.read_record_calls(), 0, "HTTP fallback skips Record Read");
        assert_eq!(outcome.slot_info.len(), 1);
        assert_eq!(outcome.slot_info[0].semantic, Semantic::Ph);
    }

    #[test]
    fn full_connect_response_frame_id_reassignment_is_adopted() {
        let transport = StubTransport::reassigns_frame_ids();
        let http = StubHttp::empty();
        let gsdml = crate::gsdml::StubGsdmlCache::new();
        gsdml.seed("rtu-d", vec![]);
        let lut = StaticModuleIdentLookup;

        let outcome = run_discovery(&req("rtu-d"), &transport, &http, &gsdml, &lut).unwrap();
        assert_eq!(outcome.input_iocr.frame_id, 0x9001);
        assert_eq!(outcome.output_iocr.frame_id, 0x9002);
    }
}
