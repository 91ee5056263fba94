//! Collaborator interfaces consumed by the core (§6, §9): the
//! acyclic RPC transport, the HTTP fallback client, and the raw L2 frame
//! transmitter. None of these are implemented here beyond a production
//! adapter for the HTTP client and test stubs — the core only depends on
//! the trait shape, per §1's "deliberately out of scope" list.

use std::net::Ipv4Addr;

use pnio_core::error::PnioError;
use pnio_types::connect_params::ConnectRequestParams;
use pnio_types::iocr::IocrType;
use pnio_types::slot::DiscoveredModule;
use uuid::Uuid;

/// Record-read index for RealIdentificationData (§4.4 Phase 3).
pub const RECORD_INDEX_REAL_IDENTIFICATION_DATA: u16 = 0xF844;

/// Result of an RPC `connect` call (§6).
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub success: bool,
    pub device_mac: [u8; 6],
    /// The device's authoritative session key; always adopted over the
    /// proposed value (§3, §4.7).
    pub session_key: u16,
    /// Frame IDs the device assigned, possibly different from the ones
    /// proposed in the request (§4.6).
    pub frame_ids: Vec<(IocrType, u16)>,
    pub has_diff: bool,
}

/// Parameters for an acyclic record-read (§4.4 Phase 3).
#[derive(Debug, Clone)]
pub struct ReadRecordParams {
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub slot: u16,
    pub subslot: u16,
    pub index: u16,
}

/// Result of an acyclic record-read (§6).
#[derive(Debug, Clone)]
pub struct ReadRecordResponse {
    pub success: bool,
    pub modules: Vec<DiscoveredModule>,
}

/// An inbound `ApplicationReady` indication (§6).
#[derive(Debug, Clone)]
pub struct ApplicationReadyIndication {
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub control_command: u16,
    pub source_ip: Ipv4Addr,
    pub source_port: u16,
}

/// Inbound acyclic RPC events the transport may deliver (§6: only
/// `ApplicationReady` is modeled here, as that's the only inbound RPC the
/// core's state machine reacts to).
#[derive(Debug, Clone)]
pub enum IncomingRpc {
    ApplicationReady(ApplicationReadyIndication),
}

/// The acyclic DCE/RPC-over-UDP transport, consumed as an opaque
/// collaborator (§1, §6). All operations are synchronous and may
/// block up to their configured timeout (§5).
pub trait RpcTransport: Send + Sync {
    fn connect(
        &self,
        device_ip: Ipv4Addr,
        params: &ConnectRequestParams,
    ) -> Result<ConnectResponse, PnioError>;

    fn parameter_end(
        &self,
        device_ip: Ipv4Addr,
        ar_uuid: Uuid,
        session_key: u16,
    ) -> Result<(), PnioError>;

    /// Best-effort release; failures are logged, never propagated as a
    /// reason to abort teardown (§4.5, §7).
    fn release(&self, device_ip: Ipv4Addr, ar_uuid: Uuid, session_key: u16) -> Result<(), PnioError>;

    fn read_record(
        &self,
        device_ip: Ipv4Addr,
        params: &ReadRecordParams,
    ) -> Result<ReadRecordResponse, PnioError>;

    /// Non-blocking poll for an inbound acyclic RPC, or `None` if nothing
    /// is pending.
    fn poll_incoming(&self) -> Option<IncomingRpc>;

    /// Send the controller's response to an `ApplicationReady` request
    /// (§6).
    fn send_application_ready_response(
        &self,
        dest_ip: Ipv4Addr,
        dest_port: u16,
        ar_uuid: Uuid,
        session_key: u16,
    ) -> Result<(), PnioError>;
}

/// The raw L2 transmit primitive: a byte buffer and a destination MAC
/// (§1, §5).
pub trait FrameTransmitter: Send + Sync {
    fn send_frame(&self, dst_mac: [u8; 6], frame: &[u8]) -> Result<(), PnioError>;
}

/// The HTTP fallback client consumed by the discovery pipeline (§4.4
/// Phase 6, §6, §SPEC_FULL 4.13).
pub trait HttpClient: Send + Sync {
    fn get_json(&self, url: &str) -> Result<serde_json::Value, PnioError>;
    fn get_bytes(&self, url: &str, max_len: usize) -> Result<Vec<u8>, PnioError>;
}

/// Production [`HttpClient`] backed by `reqwest`'s blocking client,
/// matching the synchronous concurrency model of §5.
#[cfg(feature = "http-fallback")]
pub struct ReqwestHttpClient {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http-fallback")]
impl ReqwestHttpClient {
    pub fn new(timeout: std::time::Duration) -> Result<Self, PnioError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PnioError::Io(e.to_string()))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http-fallback")]
impl HttpClient for ReqwestHttpClient {
    fn get_json(&self, url: &str) -> Result<serde_json::Value, PnioError> {
        self.client
            .get(url)
            .send()
            .map_err(|e| PnioError::ConnectionFailed(e.to_string()))?
            .json()
            .map_err(|e| PnioError::Protocol(format!("invalid JSON from {url}: {e}")))
    }

    fn get_bytes(&self, url: &str, max_len: usize) -> Result<Vec<u8>, PnioError> {
        use std::io::Read as _;

        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| PnioError::ConnectionFailed(e.to_string()))?;
        let mut buf = Vec::new();
        resp.take(max_len as u64 + 1)
            .read_to_end(&mut buf)
            .map_err(|e| PnioError::Io(e.to_string()))?;
        if buf.len() > max_len {
            return Err(PnioError::Protocol(format!(
                "response from {url} exceeds {max_len} bytes"
            )));
        }
        Ok(buf)
    }
}
