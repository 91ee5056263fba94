//! Stub collaborator implementations shared by this crate's unit tests
//! and by the integration tests under `tests/` (§8 seed scenarios). Kept
//! as a plain public module rather than behind `#[cfg(test)]`, since
//! integration test binaries compile against the published crate API and
//! cannot see `cfg(test)`-gated items in the library they link.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use pnio_core::error::PnioError;
use pnio_types::connect_params::ConnectRequestParams;
use pnio_types::iocr::IocrType;
use pnio_types::slot::DiscoveredModule;
use uuid::Uuid;

use crate::transport::{
    ApplicationReadyIndication, ConnectResponse, HttpClient, IncomingRpc, ReadRecordParams,
    ReadRecordResponse, RpcTransport,
};

/// Scripted behavior for [`StubTransport::connect`] calls, consumed in
/// order; the last entry repeats once exhausted.
#[derive(Clone)]
pub enum ConnectScript {
    Succeed,
    RejectOnce,
    Fail(String),
}

/// A fully in-memory [`RpcTransport`] whose behavior is scripted up
/// front, with call counters for asserting exactly which RPCs a pipeline
/// run issued (§8 seed scenarios 1-3, 6).
pub struct StubTransport {
    connect_script: Mutex<Vec<ConnectScript>>,
    reassign_frame_ids: bool,
    discovered_modules: Vec<DiscoveredModule>,
    connect_calls: AtomicUsize,
    parameter_end_calls: AtomicUsize,
    read_record_calls: AtomicUsize,
    release_calls: AtomicUsize,
    incoming: Mutex<Vec<IncomingRpc>>,
    sent_responses: Mutex<Vec<(Uuid, u16)>>,
}

impl StubTransport {
    pub fn always_succeeds() -> Self {
        Self {
            connect_script: Mutex::new(vec![ConnectScript::Succeed]),
            reassign_frame_ids: false,
            discovered_modules: vec![
                DiscoveredModule {
                    slot: 1,
                    subslot: 1,
                    module_ident: 0x0010,
                    submodule_ident: 0x0010,
                },
                DiscoveredModule {
                    slot: 2,
                    subslot: 1,
                    module_ident: 0x0021,
                    submodule_ident: 0x0021,
                },
            ],
            connect_calls: AtomicUsize::new(0),
            parameter_end_calls: AtomicUsize::new(0),
            read_record_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            incoming: Mutex::new(Vec::new()),
            sent_responses: Mutex::new(Vec::new()),
        }
    }

    pub fn dap_connect_fails_then_succeeds() -> Self {
        Self {
            connect_script: Mutex::new(vec![
                ConnectScript::Fail("simulated DAP connect failure".to_string()),
                ConnectScript::Succeed,
            ]),
            ..Self::always_succeeds()
        }
    }

    pub fn reassigns_frame_ids() -> Self {
        Self {
            reassign_frame_ids: true,
            ..Self::always_succeeds()
        }
    }

    pub fn permanent_protocol_error() -> Self {
        Self {
            connect_script: Mutex::new(vec![ConnectScript::Fail("__protocol__".to_string())]),
            ..Self::always_succeeds()
        }
    }

    /// DAP-only probe succeeds (so discovery reaches Phase 5 rather than
    /// diverting to HTTP fallback), then the full connect fails with a
    /// permanent `PROTOCOL` error — the only way a rejected connect's
    /// classification survives to the caller, since Phase 2 failures are
    /// unconditionally retried via HTTP fallback (spec discovery Phase 2).
    pub fn full_connect_permanent_error() -> Self {
        Self {
            connect_script: Mutex::new(vec![
                ConnectScript::Succeed,
                ConnectScript::Fail("__protocol__".to_string()),
            ]),
            ..Self::always_succeeds()
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
    pub fn parameter_end_calls(&self) -> usize {
        self.parameter_end_calls.load(Ordering::SeqCst)
    }
    pub fn read_record_calls(&self) -> usize {
        self.read_record_calls.load(Ordering::SeqCst)
    }
    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn push_incoming(&self, rpc: IncomingRpc) {
        self.incoming.lock().unwrap().push(rpc);
    }

    pub fn sent_application_ready_responses(&self) -> Vec<(Uuid, u16)> {
        self.sent_responses.lock().unwrap().clone()
    }
}

impl RpcTransport for StubTransport {
    fn connect(
        &self,
        _device_ip: Ipv4Addr,
        params: &ConnectRequestParams,
    ) -> Result<ConnectResponse, PnioError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.connect_script.lock().unwrap();
        let step = if script.len() > 1 {
            script.remove(0)
        } else {
            script[0].clone()
        };
        match step {
            ConnectScript::Succeed => {
                let frame_ids = if self.reassign_frame_ids {
                    vec![(IocrType::Input, 0x9001), (IocrType::Output, 0x9002)]
                } else {
                    params.iocrs.iter().map(|i| (i.io_type, i.frame_id)).collect()
                };
                Ok(ConnectResponse {
                    success: true,
                    device_mac: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
                    session_key: 42,
                    frame_ids,
                    has_diff: false,
                })
            }
            ConnectScript::RejectOnce => Ok(ConnectResponse {
                success: false,
                device_mac: [0; 6],
                session_key: 0,
                frame_ids: vec![],
                has_diff: false,
            }),
            ConnectScript::Fail(msg) => {
                if msg == "__protocol__" {
                    Err(PnioError::Protocol(msg))
                } else {
                    Err(PnioError::ConnectionFailed(msg))
                }
            }
        }
    }

    fn parameter_end(&self, _device_ip: Ipv4Addr, _ar_uuid: Uuid, _session_key: u16) -> Result<(), PnioError> {
        self.parameter_end_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, _device_ip: Ipv4Addr, _ar_uuid: Uuid, _session_key: u16) -> Result<(), PnioError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_record(
        &self,
        _device_ip: Ipv4Addr,
        _params: &ReadRecordParams,
    ) -> Result<ReadRecordResponse, PnioError> {
        self.read_record_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ReadRecordResponse {
            success: true,
            modules: self.discovered_modules.clone(),
        })
    }

    fn poll_incoming(&self) -> Option<IncomingRpc> {
        self.incoming.lock().unwrap().pop()
    }

    fn send_application_ready_response(
        &self,
        _dest_ip: Ipv4Addr,
        _dest_port: u16,
        ar_uuid: Uuid,
        session_key: u16,
    ) -> Result<(), PnioError> {
        self.sent_responses.lock().unwrap().push((ar_uuid, session_key));
        Ok(())
    }
}

/// Unconditionally returns [`PnioError::ConnectionFailed`] for `connect`.
/// Used to drive the retry/backoff scenarios (§8 scenario 5).
pub struct AlwaysFailsTransport {
    pub permanent: bool,
    pub connect_calls: AtomicUsize,
    pub release_calls: AtomicUsize,
}

impl AlwaysFailsTransport {
    pub fn transient() -> Self {
        Self {
            permanent: false,
            connect_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        }
    }

    pub fn permanent() -> Self {
        Self {
            permanent: true,
            connect_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        }
    }
}

impl RpcTransport for AlwaysFailsTransport {
    fn connect(&self, _device_ip: Ipv4Addr, _params: &ConnectRequestParams) -> Result<ConnectResponse, PnioError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent {
            Err(PnioError::Protocol("simulated permanent rejection".to_string()))
        } else {
            Err(PnioError::ConnectionFailed("simulated transient failure".to_string()))
        }
    }

    fn parameter_end(&self, _device_ip: Ipv4Addr, _ar_uuid: Uuid, _session_key: u16) -> Result<(), PnioError> {
        Ok(())
    }

    fn release(&self, _device_ip: Ipv4Addr, _ar_uuid: Uuid, _session_key: u16) -> Result<(), PnioError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_record(&self, _device_ip: Ipv4Addr, _params: &ReadRecordParams) -> Result<ReadRecordResponse, PnioError> {
        Ok(ReadRecordResponse {
            success: false,
            modules: vec![],
        })
    }

    fn poll_incoming(&self) -> Option<IncomingRpc> {
        None
    }

    fn send_application_ready_response(
        &self,
        _dest_ip: Ipv4Addr,
        _dest_port: u16,
        _ar_uuid: Uuid,
        _session_key: u16,
    ) -> Result<(), PnioError> {
        Ok(())
    }
}

/// In-memory [`HttpClient`] stub: `/slots` returns a scripted JSON body,
/// `/gsdml` returns scripted bytes (§8 scenario 3).
#[derive(Default)]
pub struct StubHttp {
    slots_body: RwLock<Option<Vec<serde_json::Value>>>,
    gsdml_bytes: RwLock<Option<Vec<u8>>>,
}

impl StubHttp {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_slots(entries: Vec<serde_json::Value>) -> Self {
        Self {
            slots_body: RwLock::new(Some(entries)),
            gsdml_bytes: RwLock::new(None),
        }
    }
}

impl HttpClient for StubHttp {
    fn get_json(&self, url: &str) -> Result<serde_json::Value, PnioError> {
        if url.ends_with("/slots") {
            match &*self.slots_body.read().unwrap() {
                Some(entries) => Ok(serde_json::Value::Array(entries.clone())),
                None => Err(PnioError::ConnectionFailed(format!("no stub body for {url}"))),
            }
        } else {
            Err(PnioError::NotFound(url.to_string()))
        }
    }

    fn get_bytes(&self, url: &str, _max_len: usize) -> Result<Vec<u8>, PnioError> {
        if url.ends_with("/gsdml") {
            match &*self.gsdml_bytes.read().unwrap() {
                Some(bytes) => Ok(bytes.clone()),
                None => Ok(b"<Modules></Modules>".to_vec()),
            }
        } else {
            Err(PnioError::NotFound(url.to_string()))
        }
    }
}

/// No-op [`crate::transport::FrameTransmitter`] that just counts sends.
#[derive(Default)]
pub struct RecordingTransmitter {
    pub sent: Mutex<Vec<(Vec<u8>, [u8; 6])>>,
}

impl crate::transport::FrameTransmitter for RecordingTransmitter {
    fn send_frame(&self, dst_mac: [u8; 6], frame: &[u8]) -> Result<(), PnioError> {
        self.sent.lock().unwrap().push((frame.to_vec(), dst_mac));
        Ok(())
    }
}

/// Records every state-change notification delivered by the manager
/// (§4.5 "State-change notifications").
#[derive(Default)]
pub struct RecordingStateCallback {
    pub changes: Mutex<Vec<(String, crate::ar::ArState, crate::ar::ArState)>>,
}

impl crate::state::StateChangeCallback for RecordingStateCallback {
    fn on_state_change(&self, station_name: &str, change: crate::state::StateChange) {
        self.changes
            .lock()
            .unwrap()
            .push((station_name.to_string(), change.old, change.new));
    }
}

/// Helper matching [`ApplicationReadyIndication`]'s shape for tests that
/// need to hand the manager an inbound `ApplicationReady`.
pub fn application_ready(ar_uuid: Uuid, session_key: u16) -> IncomingRpc {
    IncomingRpc::ApplicationReady(ApplicationReadyIndication {
        ar_uuid,
        session_key,
        control_command: 1,
        source_ip: "10.0.0.5".parse().unwrap(),
        source_port: 34964,
    })
}
