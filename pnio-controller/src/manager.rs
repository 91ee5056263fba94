//! AR Manager (component C6, §3 "Manager", §4.6).
//!
//! Owns the fixed-capacity table of ARs, the controller's own identity,
//! the lazily-initialized RPC context, and the single state-change
//! callback. A single coarse [`parking_lot::Mutex`] covers the AR table
//! and all per-AR mutable state (§5) — there is no per-AR lock.
//! Long-running blocking calls (discovery, retry Release, ParameterEnd,
//! the `ApplicationReady` response) drop the lock before calling out and
//! re-validate the AR is still present, by pointer identity, before
//! writing back (§5, §9).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use pnio_core::error::PnioError;
use pnio_core::time::Clock;
use pnio_core::trace_lock;
use pnio_types::frame::{self, InboundCyclicFrame};
use pnio_types::identity::{self, SessionKeyGenerator};
use pnio_types::slot::ModuleIdentLookup;

use crate::ar::{Ar, ArConfig, ArState};
use crate::discovery::{self, DiscoveryRequest};
use crate::gsdml::GsdmlCache;
use crate::retry::{self, ExponentialBackoff};
use crate::state::{self, StateChangeCallback};
use crate::transport::{FrameTransmitter, HttpClient, IncomingRpc, RpcTransport};

/// Hard cap on the number of ARs one manager holds (§3 "Manager").
pub const AR_TABLE_CAPACITY: usize = 64;

/// Builds an [`RpcTransport`] bound to a specific interface and
/// controller IP, invoked lazily on first use (§4.6
/// "ensure_rpc_initialized ... binding to interface_name ... and
/// controller_ip"). The core does not implement this itself — the RPC
/// transport is an external collaborator (§1) — but the manager
/// still owns *when* it gets constructed and torn down.
pub trait RpcTransportFactory: Send + Sync {
    fn create(&self, interface_name: &str, controller_ip: Ipv4Addr) -> Result<Arc<dyn RpcTransport>, PnioError>;
}

/// Fixed identity facts established at [`ArManager::new`] and held for
/// the lifetime of the process (§4.6 `init`, §4.7).
struct Identity {
    controller_mac: [u8; 6],
    controller_station_name: String,
    vendor_id: u16,
    device_id: u16,
    interface_name: String,
    controller_uuid: Uuid,
}

/// Everything the single coarse mutex protects (§5).
struct Locked {
    ars: Vec<Box<Ar>>,
    controller_ip: Option<Ipv4Addr>,
    rpc: Option<Arc<dyn RpcTransport>>,
    state_callback: Option<Arc<dyn StateChangeCallback>>,
}

/// Registry of ARs keyed by station name and frame ID; lifecycle hooks;
/// tick; shared-state discipline; RPC context lifecycle (§3, §4.6).
pub struct ArManager {
    locked: Mutex<Locked>,
    identity: Identity,
    session_keys: SessionKeyGenerator,
    frame_id_counter: AtomicU16,
    capacity: usize,
    http_fallback_port: u16,
    http_fallback_enabled: bool,
    rpc_factory: Arc<dyn RpcTransportFactory>,
    http: Arc<dyn HttpClient>,
    gsdml_cache: Arc<dyn GsdmlCache>,
    module_lookup: Arc<dyn ModuleIdentLookup>,
    transmitter: Arc<dyn FrameTransmitter>,
    clock: Arc<dyn Clock>,
    backoff: ExponentialBackoff,
}

/// A read-only snapshot of an AR's observable state, returned from
/// lookups instead of a live reference so callers never hold the
/// manager lock past a single call (§4.6 `get_ar`,
/// `get_ar_by_frame_id`).
#[derive(Debug, Clone)]
pub struct ArSnapshot {
    pub station_name: String,
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub device_mac: [u8; 6],
    pub state: ArState,
    pub retry_count: u32,
    pub missed_cycles: u32,
    pub last_error: Option<PnioError>,
}

impl From<&Ar> for ArSnapshot {
    fn from(ar: &Ar) -> Self {
        Self {
            station_name: ar.station_name.clone(),
            ar_uuid: ar.ar_uuid,
            session_key: ar.session_key,
            device_mac: ar.device_mac,
            state: ar.state,
            retry_count: ar.retry_count,
            missed_cycles: ar.missed_cycles,
            last_error: ar.last_error.clone(),
        }
    }
}

impl ArManager {
    /// Component C6 `init`: opens no sockets itself, builds
    /// `controller_uuid` from `vendor_id`/`device_id`, does not
    /// initialize the RPC context (lazy, see [`Self::ensure_rpc`]).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller_mac: [u8; 6],
        controller_station_name: String,
        vendor_id: u16,
        device_id: u16,
        interface_name: String,
        rpc_factory: Arc<dyn RpcTransportFactory>,
        http: Arc<dyn HttpClient>,
        gsdml_cache: Arc<dyn GsdmlCache>,
        module_lookup: Arc<dyn ModuleIdentLookup>,
        transmitter: Arc<dyn FrameTransmitter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            locked: Mutex::new(Locked {
                ars: Vec::new(),
                controller_ip: None,
                rpc: None,
                state_callback: None,
            }),
            identity: Identity {
                controller_mac,
                controller_station_name,
                vendor_id,
                device_id,
                interface_name,
                controller_uuid: identity::controller_uuid(vendor_id, device_id),
            },
            session_keys: SessionKeyGenerator::new(),
            frame_id_counter: AtomicU16::new(0x8001),
            capacity: AR_TABLE_CAPACITY,
            http_fallback_port: 9081,
            http_fallback_enabled: true,
            rpc_factory,
            http,
            gsdml_cache,
            module_lookup,
            transmitter,
            clock,
            backoff: ExponentialBackoff::profinet_default(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_http_fallback(mut self, enabled: bool, port: u16) -> Self {
        self.http_fallback_enabled = enabled;
        self.http_fallback_port = port;
        self
    }

    pub fn controller_uuid(&self) -> Uuid {
        self.identity.controller_uuid
    }

    /// §4.6 `set_controller_ip`: if the RPC context was previously
    /// initialized with a different IP, tear it down so it is
    /// re-initialized lazily with the new IP.
    pub fn set_controller_ip(&self, ip: Ipv4Addr) {
        let mut locked = trace_lock!(self.locked);
        if locked.controller_ip != Some(ip) && locked.rpc.is_some() {
            log::info!("controller IP changed to {ip}, tearing down RPC context");
            locked.rpc = None;
        }
        locked.controller_ip = Some(ip);
    }

    pub fn set_state_callback(&self, cb: Arc<dyn StateChangeCallback>) {
        trace_lock!(self.locked).state_callback = Some(cb);
    }

    fn ensure_rpc(&self, locked: &mut Locked) -> Result<Arc<dyn RpcTransport>, PnioError> {
        if let Some(rpc) = &locked.rpc {
            return Ok(rpc.clone());
        }
        let ip = locked
            .controller_ip
            .ok_or_else(|| PnioError::NotInitialized("controller IP not set".to_string()))?;
        let rpc = self.rpc_factory.create(&self.identity.interface_name, ip)?;
        locked.rpc = Some(rpc.clone());
        Ok(rpc)
    }

    fn next_frame_ids(&self) -> (u16, u16) {
        let base = self.frame_id_counter.fetch_add(2, Ordering::SeqCst);
        (base, base.wrapping_add(1))
    }

    /// §4.6 `create_ar(config)`.
    pub fn create_ar(&self, config: ArConfig) -> Result<(), PnioError> {
        let mut locked = trace_lock!(self.locked);
        if locked.ars.iter().any(|a| a.station_name == config.station_name) {
            return Err(PnioError::AlreadyExists(config.station_name));
        }
        if locked.ars.len() >= self.capacity {
            return Err(PnioError::Full);
        }
        let now_ms = self.clock.now_ms();
        let ar_uuid = identity::new_ar_uuid();
        let mut ar = Ar::new(&config, ar_uuid, now_ms)?;

        let (input_frame_id, output_frame_id) = self.next_frame_ids();
        let (input_iocr, output_iocr) =
            pnio_types::iocr::allocate(input_frame_id, output_frame_id, &ar.slot_info)?;
        ar.input_iocr = Some(input_iocr);
        ar.output_iocr = Some(output_iocr);

        locked.ars.push(Box::new(ar));
        Ok(())
    }

    /// §4.6 `delete_ar(station_name)`.
    pub fn delete_ar(&self, station_name: &str) -> Result<(), PnioError> {
        let mut locked = trace_lock!(self.locked);
        let idx = locked
            .ars
            .iter()
            .position(|a| a.station_name == station_name)
            .ok_or_else(|| PnioError::NotFound(station_name.to_string()))?;
        locked.ars.remove(idx);
        Ok(())
    }

    pub fn get_ar(&self, station_name: &str) -> Option<ArSnapshot> {
        let locked = trace_lock!(self.locked);
        locked
            .ars
            .iter()
            .find(|a| a.station_name == station_name)
            .map(|a| ArSnapshot::from(a.as_ref()))
    }

    /// §4.6 `get_ar_by_frame_id`: O(N) scan of every AR's IOCRs.
    pub fn get_ar_by_frame_id(&self, frame_id: u16) -> Option<ArSnapshot> {
        let locked = trace_lock!(self.locked);
        locked
            .ars
            .iter()
            .find(|a| {
                a.input_iocr.as_ref().map(|i| i.frame_id) == Some(frame_id)
                    || a.output_iocr.as_ref().map(|i| i.frame_id) == Some(frame_id)
            })
            .map(|a| ArSnapshot::from(a.as_ref()))
    }

    pub fn ar_count(&self) -> usize {
        trace_lock!(self.locked).ars.len()
    }

    /// Run discovery (§4.4) and, on success, drive the full
    /// CONNECT_REQ -> CONNECT_CNF transition (§4.5), all outside
    /// the manager lock. This is the "discovery pipeline" referenced
    /// throughout §4 as the thing that uses the per-AR `connecting`
    /// flag to keep the scheduler tick from re-entering this AR's state
    /// machine mid-flight.
    pub fn connect_with_discovery(&self, station_name: &str) -> Result<(), PnioError> {
        let (connecting_flag, device_ip, timing, input_frame_id, output_frame_id, ptr) = {
            let locked = trace_lock!(self.locked);
            let ar = locked
                .ars
                .iter()
                .find(|a| a.station_name == station_name)
                .ok_or_else(|| PnioError::NotFound(station_name.to_string()))?;
            let ptr: *const Ar = ar.as_ref();
            (
                ar.connecting.clone(),
                ar.device_ip,
                ar.timing,
                ar.input_iocr.as_ref().map(|i| i.frame_id).unwrap_or(0x8001),
                ar.output_iocr.as_ref().map(|i| i.frame_id).unwrap_or(0x8002),
                ptr,
            )
        };

        if !try_claim_connecting(&connecting_flag) {
            return Err(PnioError::InvalidParam(format!(
                "AR '{station_name}' is already connecting"
            )));
        }

        {
            let mut locked = trace_lock!(self.locked);
            if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
                ar.last_activity_ms = self.clock.now_ms();
                state::transition(ar, ArState::ConnectReq, locked.state_callback.as_deref());
            }
        }

        let rpc = {
            let mut locked = trace_lock!(self.locked);
            self.ensure_rpc(&mut locked)
        };
        let rpc = match rpc {
            Ok(rpc) => rpc,
            Err(e) => {
                self.apply_connect_failure(ptr, &connecting_flag, e.clone());
                return Err(e);
            }
        };

        let req = DiscoveryRequest {
            station_name,
            device_ip,
            controller_station_name: &self.identity.controller_station_name,
            controller_mac: self.identity.controller_mac,
            controller_uuid: self.identity.controller_uuid,
            controller_port: 0,
            timing,
            input_frame_id,
            output_frame_id,
            session_key: self.session_keys.next(),
            http_port: self.http_fallback_port,
            http_enabled: self.http_fallback_enabled,
        };

        let result = discovery::run_discovery(
            &req,
            rpc.as_ref(),
            self.http.as_ref(),
            self.gsdml_cache.as_ref(),
            self.module_lookup.as_ref(),
        );

        match result {
            Ok(outcome) => {
                if !outcome.from_cache {
                    discovery::background_gsdml_fetch(
                        self.http.as_ref(),
                        self.gsdml_cache.as_ref(),
                        station_name,
                        device_ip,
                        self.http_fallback_port,
                    );
                }
                let now_ms = self.clock.now_ms();
                let mut locked = trace_lock!(self.locked);
                let cb = locked.state_callback.clone();
                if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
                    ar.ar_uuid = outcome.ar_uuid;
                    ar.session_key = outcome.session_key;
                    ar.device_mac = outcome.device_mac;
                    ar.slot_info = outcome.slot_info;
                    ar.input_iocr = Some(outcome.input_iocr);
                    ar.output_iocr = Some(outcome.output_iocr);
                    ar.retry_count = 0;
                    ar.missed_cycles = 0;
                    ar.last_error = None;
                    ar.last_activity_ms = now_ms;
                    state::transition(ar, ArState::ConnectCnf, cb.as_deref());
                    ar.clear_connecting();
                }
                Ok(())
            }
            Err(e) => {
                self.apply_connect_failure(ptr, &connecting_flag, e.clone());
                Err(e)
            }
        }
    }

    fn apply_connect_failure(
        &self,
        ptr: *const Ar,
        connecting_flag: &std::sync::Arc<std::sync::atomic::AtomicBool>,
        err: PnioError,
    ) {
        let now_ms = self.clock.now_ms();
        let mut locked = trace_lock!(self.locked);
        let cb = locked.state_callback.clone();
        if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
            state::abort(ar, err, now_ms, cb.as_deref());
        }
        connecting_flag.store(false, Ordering::Release);
    }

    /// §4.6 `process()`: the single-tick advance. Polls inbound RPC
    /// for `ApplicationReady`, then advances every AR not flagged
    /// `connecting` per the timeout rules of §4.5.
    pub fn process(&self) {
        let now_ms = self.clock.now_ms();
        let incoming = {
            let mut locked = trace_lock!(self.locked);
            let rpc = locked.rpc.clone();
            drop(locked);
            rpc.and_then(|r| r.poll_incoming())
        };
        if let Some(IncomingRpc::ApplicationReady(ind)) = incoming {
            self.handle_application_ready(ind, now_ms);
        }

        let station_names: Vec<String> = {
            let locked = trace_lock!(self.locked);
            locked
                .ars
                .iter()
                .filter(|a| !a.is_connecting())
                .map(|a| a.station_name.clone())
                .collect()
        };
        for name in station_names {
            self.advance_one(&name, now_ms);
        }
    }

    fn advance_one(&self, station_name: &str, now_ms: u64) {
        let ptr = {
            let locked = trace_lock!(self.locked);
            match locked.ars.iter().find(|a| a.station_name == station_name) {
                Some(ar) if !ar.is_connecting() => ar.as_ref() as *const Ar,
                _ => return,
            }
        };

        let state_now = {
            let locked = trace_lock!(self.locked);
            match find_by_ptr_const(&locked.ars, ptr) {
                Some(ar) => ar.state,
                None => return,
            }
        };

        match state_now {
            ArState::ConnectReq => {
                let mut locked = trace_lock!(self.locked);
                let cb = locked.state_callback.clone();
                if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
                    if state::connect_timed_out(ar, now_ms) {
                        state::abort(ar, PnioError::Timeout("connect timed out".to_string()), now_ms, cb.as_deref());
                    }
                }
            }
            ArState::ConnectCnf => {
                let mut locked = trace_lock!(self.locked);
                let cb = locked.state_callback.clone();
                if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
                    ar.last_activity_ms = now_ms;
                    state::transition(ar, ArState::Prmsrv, cb.as_deref());
                }
            }
            ArState::Prmsrv => self.drive_parameter_end(ptr, now_ms),
            ArState::Ready => {
                let mut locked = trace_lock!(self.locked);
                let cb = locked.state_callback.clone();
                if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
                    if state::application_ready_timed_out(ar, now_ms) {
                        state::abort(
                            ar,
                            PnioError::Timeout("no ApplicationReady received".to_string()),
                            now_ms,
                            cb.as_deref(),
                        );
                    }
                }
            }
            ArState::Abort => self.drive_retry_or_close(ptr, now_ms),
            ArState::Init | ArState::Run | ArState::Close => {}
        }
    }

    fn drive_parameter_end(&self, ptr: *const Ar, now_ms: u64) {
        let (device_ip, ar_uuid, session_key) = {
            let locked = trace_lock!(self.locked);
            match find_by_ptr_const(&locked.ars, ptr) {
                Some(ar) => (ar.device_ip, ar.ar_uuid, ar.session_key),
                None => return,
            }
        };
        let rpc = {
            let mut locked = trace_lock!(self.locked);
            match self.ensure_rpc(&mut locked) {
                Ok(rpc) => rpc,
                Err(_) => return, // NOT_INITIALIZED: leave AR in current state (§7)
            }
        };

        // Lock-drop-and-reacquire for the blocking ParameterEnd RPC
        // (§5, §9).
        let result = rpc.parameter_end(device_ip, ar_uuid, session_key);

        let mut locked = trace_lock!(self.locked);
        let cb = locked.state_callback.clone();
        if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
            match result {
                Ok(()) => {
                    ar.last_activity_ms = now_ms;
                    state::transition(ar, ArState::Ready, cb.as_deref());
                }
                Err(e) => state::abort(ar, e, now_ms, cb.as_deref()),
            }
        }
    }

    fn handle_application_ready(&self, ind: crate::transport::ApplicationReadyIndication, now_ms: u64) {
        let ptr = {
            let locked = trace_lock!(self.locked);
            locked
                .ars
                .iter()
                .find(|a| a.ar_uuid == ind.ar_uuid && a.session_key == ind.session_key)
                .map(|a| a.as_ref() as *const Ar)
        };
        let Some(ptr) = ptr else {
            log::warn!("ApplicationReady for unknown (ar_uuid, session_key) pair, ignored");
            return;
        };
        let ready_state_ok = {
            let locked = trace_lock!(self.locked);
            find_by_ptr_const(&locked.ars, ptr).map(|a| a.state) == Some(ArState::Ready)
        };
        if !ready_state_ok {
            log::warn!("ApplicationReady received while AR is not READY, ignored");
            return;
        }

        let rpc = {
            let mut locked = trace_lock!(self.locked);
            match self.ensure_rpc(&mut locked) {
                Ok(rpc) => rpc,
                Err(_) => return,
            }
        };

        // Lock-drop-and-reacquire for the blocking response send.
        let send_result =
            rpc.send_application_ready_response(ind.source_ip, ind.source_port, ind.ar_uuid, ind.session_key);

        let mut locked = trace_lock!(self.locked);
        let cb = locked.state_callback.clone();
        if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
            match send_result {
                Ok(()) => {
                    ar.last_activity_ms = now_ms;
                    state::transition(ar, ArState::Run, cb.as_deref());
                }
                Err(e) => state::abort(ar, e, now_ms, cb.as_deref()),
            }
        }
    }

    fn drive_retry_or_close(&self, ptr: *const Ar, now_ms: u64) {
        let (connecting_flag, retry_count, last_error, last_activity_ms, device_ip, old_session_key) = {
            let locked = trace_lock!(self.locked);
            match find_by_ptr_const(&locked.ars, ptr) {
                Some(ar) => (
                    ar.connecting.clone(),
                    ar.retry_count,
                    ar.last_error.clone(),
                    ar.last_activity_ms,
                    ar.device_ip,
                    ar.session_key,
                ),
                None => return,
            }
        };

        let permanent = last_error.as_ref().map(|e| e.is_permanent()).unwrap_or(false);
        if permanent || retry_count >= retry::MAX_RETRY_ATTEMPTS {
            let mut locked = trace_lock!(self.locked);
            let cb = locked.state_callback.clone();
            if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
                state::transition(ar, ArState::Close, cb.as_deref());
            }
            return;
        }

        let delay = self.backoff.next(retry_count, now_ms);
        if now_ms.saturating_sub(last_activity_ms) < delay.as_millis() as u64 {
            return; // backoff not elapsed yet
        }

        let old_ar_uuid = {
            let locked = trace_lock!(self.locked);
            find_by_ptr_const(&locked.ars, ptr).map(|a| a.ar_uuid)
        };
        let Some(old_ar_uuid) = old_ar_uuid else { return };

        // Mutually exclusive with connect_with_discovery: the retry path
        // also makes blocking RPC calls outside the manager lock (§5, §9),
        // so it must hold the same per-AR `connecting` flag while it does.
        if !try_claim_connecting(&connecting_flag) {
            return;
        }

        let rpc = {
            let mut locked = trace_lock!(self.locked);
            match self.ensure_rpc(&mut locked) {
                Ok(rpc) => rpc,
                Err(_) => {
                    connecting_flag.store(false, Ordering::Release);
                    return;
                }
            }
        };

        // Best-effort Release to clear the stale peer AR before retrying
        // (§4.5). Dropped lock for the blocking call; re-validate
        // by pointer before touching the AR again (§5, §9).
        let _ = rpc.release(device_ip, old_ar_uuid, old_session_key);

        let new_ar_uuid = identity::new_ar_uuid();
        {
            let mut locked = trace_lock!(self.locked);
            let cb = locked.state_callback.clone();
            let Some(ar) = find_by_ptr(&mut locked.ars, ptr) else {
                connecting_flag.store(false, Ordering::Release);
                return; // AR was deleted while Release was in flight
            };
            ar.ar_uuid = new_ar_uuid;
            ar.session_key = 0;
            ar.retry_count += 1;
            ar.last_activity_ms = now_ms;
            state::transition(ar, ArState::ConnectReq, cb.as_deref());
        }

        // Re-run the full connect (not full rediscovery) against the
        // already-known slot configuration.
        let rpc = {
            let mut locked = trace_lock!(self.locked);
            self.ensure_rpc(&mut locked)
        };
        match rpc {
            Ok(rpc) => self.reconnect_known_slots(ptr, rpc, now_ms, &connecting_flag),
            Err(_) => connecting_flag.store(false, Ordering::Release),
        }
    }

    fn reconnect_known_slots(
        &self,
        ptr: *const Ar,
        rpc: Arc<dyn RpcTransport>,
        now_ms: u64,
        connecting_flag: &std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) {
        let (device_ip, slot_info, timing, ar_uuid, input_frame_id, output_frame_id) = {
            let locked = trace_lock!(self.locked);
            match find_by_ptr_const(&locked.ars, ptr) {
                Some(ar) => (
                    ar.device_ip,
                    ar.slot_info.clone(),
                    ar.timing,
                    ar.ar_uuid,
                    ar.input_iocr.as_ref().map(|i| i.frame_id).unwrap_or(0x8001),
                    ar.output_iocr.as_ref().map(|i| i.frame_id).unwrap_or(0x8002),
                ),
                None => {
                    connecting_flag.store(false, Ordering::Release);
                    return;
                }
            }
        };
        let ctx = pnio_types::connect_params::ConnectContext {
            ar_uuid,
            session_key: self.session_keys.next(),
            controller_station_name: &self.identity.controller_station_name,
            controller_mac: self.identity.controller_mac,
            controller_uuid: self.identity.controller_uuid,
            controller_port: 0,
            timing,
            input_frame_id,
            output_frame_id,
        };
        let params = match pnio_types::connect_params::build_full_params(&ctx, &slot_info, self.module_lookup.as_ref()) {
            Ok(p) => p,
            Err(e) => {
                let mut locked = trace_lock!(self.locked);
                let cb = locked.state_callback.clone();
                if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
                    state::abort(ar, PnioError::Protocol(e), now_ms, cb.as_deref());
                }
                connecting_flag.store(false, Ordering::Release);
                return;
            }
        };
        let result = rpc.connect(device_ip, &params);

        let mut locked = trace_lock!(self.locked);
        let cb = locked.state_callback.clone();
        let Some(ar) = find_by_ptr(&mut locked.ars, ptr) else {
            connecting_flag.store(false, Ordering::Release);
            return;
        };
        match result {
            Ok(resp) if resp.success => {
                ar.session_key = resp.session_key;
                ar.device_mac = resp.device_mac;
                if let Some(iocr) = ar.input_iocr.as_mut() {
                    if let Some((_, fid)) = resp
                        .frame_ids
                        .iter()
                        .find(|(t, _)| *t == pnio_types::iocr::IocrType::Input)
                    {
                        iocr.frame_id = *fid;
                    }
                }
                if let Some(iocr) = ar.output_iocr.as_mut() {
                    if let Some((_, fid)) = resp
                        .frame_ids
                        .iter()
                        .find(|(t, _)| *t == pnio_types::iocr::IocrType::Output)
                    {
                        iocr.frame_id = *fid;
                    }
                }
                ar.retry_count = 0;
                ar.missed_cycles = 0;
                ar.last_error = None;
                ar.last_activity_ms = now_ms;
                state::transition(ar, ArState::ConnectCnf, cb.as_deref());
            }
            Ok(_) => state::abort(ar, PnioError::ConnectionFailed("retry connect rejected".to_string()), now_ms, cb.as_deref()),
            Err(e) => state::abort(ar, e, now_ms, cb.as_deref()),
        }
        connecting_flag.store(false, Ordering::Release);
    }

    /// §4.6 `check_health()`: per-AR watchdog evaluation.
    pub fn check_health(&self) {
        let now_ms = self.clock.now_ms();
        let mut locked = trace_lock!(self.locked);
        let cb = locked.state_callback.clone();
        for ar in locked.ars.iter_mut() {
            if ar.is_connecting() || ar.state != ArState::Run {
                continue;
            }
            if state::watchdog_tick_is_miss(ar, now_ms) {
                ar.missed_cycles += 1;
                log::warn!(
                    "ar '{}': watchdog miss {}/{}",
                    ar.station_name,
                    ar.missed_cycles,
                    state::WATCHDOG_MISS_THRESHOLD
                );
                if ar.missed_cycles >= state::WATCHDOG_MISS_THRESHOLD {
                    state::abort(ar, PnioError::Timeout("watchdog exceeded".to_string()), now_ms, cb.as_deref());
                }
            }
        }
    }

    /// §4.6 `send_output_data(ar)`: encode and transmit the cyclic
    /// OUTPUT frame for one AR.
    pub fn send_output_data(&self, station_name: &str) -> Result<(), PnioError> {
        let mut locked = trace_lock!(self.locked);
        let ar = locked
            .ars
            .iter_mut()
            .find(|a| a.station_name == station_name)
            .ok_or_else(|| PnioError::NotFound(station_name.to_string()))?;
        let data_status = if ar.state == ArState::Run {
            frame::RUN_DATA_STATUS
        } else {
            frame::data_status::STATE
        };
        let dst_mac = ar.device_mac;
        let src_mac = self.identity.controller_mac;
        let iocr = ar
            .output_iocr
            .as_mut()
            .ok_or_else(|| PnioError::NotInitialized("AR has no OUTPUT IOCR".to_string()))?;
        let bytes = frame::encode_cyclic_frame(dst_mac, src_mac, iocr, data_status);
        self.transmitter.send_frame(dst_mac, &bytes)
    }

    /// §4.6 `handle_rt_frame(bytes)`: demultiplex an inbound RT
    /// frame by frame ID and copy it into the matching INPUT IOCR.
    pub fn handle_rt_frame(&self, bytes: &[u8]) {
        let frame = match frame::parse_cyclic_frame(bytes) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("dropping malformed RT frame: {e}");
                return;
            }
        };
        let now_us = self.clock.now_us();
        let now_ms = self.clock.now_ms();
        let mut locked = trace_lock!(self.locked);
        let Some(ar) = locked.ars.iter_mut().find(|a| {
            a.input_iocr.as_ref().map(|i| i.frame_id) == Some(frame.frame_id)
        }) else {
            return; // unknown frame_id: ignored per §4.2
        };
        if let Some(iocr) = ar.input_iocr.as_mut() {
            if apply_inbound(iocr, &frame, now_us) {
                ar.last_activity_ms = now_ms;
                ar.missed_cycles = 0;
            }
        }
    }

    /// §4.6 `release`: user-triggered RUN -> CLOSE. Attempts a
    /// best-effort Release RPC, then transitions unconditionally
    /// regardless of its outcome (§4.5).
    pub fn release(&self, station_name: &str) -> Result<(), PnioError> {
        let (ptr, device_ip, ar_uuid, session_key) = {
            let locked = trace_lock!(self.locked);
            let ar = locked
                .ars
                .iter()
                .find(|a| a.station_name == station_name)
                .ok_or_else(|| PnioError::NotFound(station_name.to_string()))?;
            (ar.as_ref() as *const Ar, ar.device_ip, ar.ar_uuid, ar.session_key)
        };

        let rpc = {
            let mut locked = trace_lock!(self.locked);
            self.ensure_rpc(&mut locked).ok()
        };
        if let Some(rpc) = rpc {
            if let Err(e) = rpc.release(device_ip, ar_uuid, session_key) {
                log::warn!("release RPC for '{station_name}' failed (best effort): {e}");
            }
        }

        let mut locked = trace_lock!(self.locked);
        let cb = locked.state_callback.clone();
        if let Some(ar) = find_by_ptr(&mut locked.ars, ptr) {
            state::transition(ar, ArState::Close, cb.as_deref());
        }
        Ok(())
    }

    /// Station names of every AR currently in the table, snapshotted
    /// under the lock. Used by [`Self::run_scheduler_thread`] to decide
    /// which ARs to push output data for without holding the lock across
    /// the send.
    pub fn station_names(&self) -> Vec<String> {
        trace_lock!(self.locked)
            .ars
            .iter()
            .map(|a| a.station_name.clone())
            .collect()
    }

    /// Convenience constructor for the scheduler thread role (§5
    /// "typical threads"): on each `tick_interval`, advances every AR's
    /// state machine (`process`), checks watchdog liveness
    /// (`check_health`), and pushes a fresh output frame
    /// (`send_output_data`) for every AR currently in the table. Runs
    /// until `self` has no other owners. A thin wrapper is all this is —
    /// callers that want a different cadence or their own loop can call
    /// `process`/`check_health`/`send_output_data` directly instead.
    pub fn run_scheduler_thread(self: &Arc<Self>, tick_interval: std::time::Duration) -> std::thread::JoinHandle<()> {
        let manager = Arc::clone(self);
        std::thread::spawn(move || loop {
            if Arc::strong_count(&manager) == 1 {
                return;
            }
            manager.process();
            manager.check_health();
            for station_name in manager.station_names() {
                if let Err(e) = manager.send_output_data(&station_name) {
                    log::warn!("send_output_data for '{station_name}' failed: {e}");
                }
            }
            std::thread::sleep(tick_interval);
        })
    }

    /// Convenience constructor for the RT frame receiver thread role
    /// (§5): repeatedly calls `recv` for the next raw inbound
    /// frame and routes it via [`Self::handle_rt_frame`]. Returns (and
    /// stops the thread) once `recv` yields `None`, matching the
    /// teacher's poll-until-`None` reader loops.
    pub fn run_rt_receiver_thread(
        self: &Arc<Self>,
        recv: impl Fn() -> Option<Vec<u8>> + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        let manager = Arc::clone(self);
        std::thread::spawn(move || {
            while let Some(bytes) = recv() {
                manager.handle_rt_frame(&bytes);
            }
        })
    }
}

fn apply_inbound(iocr: &mut pnio_types::iocr::Iocr, frame: &InboundCyclicFrame<'_>, now_us: u64) -> bool {
    frame::apply_inbound_frame(iocr, frame, now_us)
}

fn find_by_ptr(ars: &mut [Box<Ar>], ptr: *const Ar) -> Option<&mut Ar> {
    ars.iter_mut().find(|a| std::ptr::eq(a.as_ref() as *const Ar, ptr)).map(|b| b.as_mut())
}

fn find_by_ptr_const(ars: &[Box<Ar>], ptr: *const Ar) -> Option<&Ar> {
    ars.iter().find(|a| std::ptr::eq(a.as_ref() as *const Ar, ptr)).map(|b| b.as_ref())
}

/// Test-and-set the per-AR `connecting` flag from outside the manager
/// lock, once the caller already holds a clone of it (§5).
fn try_claim_connecting(flag: &std::sync::atomic::AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
        .is_ok()
}
