//! The Application Relationship itself (§3 "AR"), plus the state
//! machine enum it carries. `Ar` is the unit the manager owns and
//! destroys; it never outlives its slot in the manager's table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pnio_core::error::PnioError;
use pnio_types::connect_params::ArType;
use pnio_types::iocr::Iocr;
use pnio_types::slot::SlotInfo;
use pnio_types::timing::TimingProfile;
use uuid::Uuid;

/// Default watchdog period used when a caller doesn't specify one (spec
/// §3).
pub const DEFAULT_WATCHDOG_MS: u32 = 3000;
/// Minimum allowed watchdog period (§3).
pub const MIN_WATCHDOG_MS: u32 = 1000;

/// AR lifecycle states (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArState {
    Init,
    ConnectReq,
    ConnectCnf,
    Prmsrv,
    Ready,
    Run,
    Abort,
    Close,
}

impl ArState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArState::Init => "INIT",
            ArState::ConnectReq => "CONNECT_REQ",
            ArState::ConnectCnf => "CONNECT_CNF",
            ArState::Prmsrv => "PRMSRV",
            ArState::Ready => "READY",
            ArState::Run => "RUN",
            ArState::Abort => "ABORT",
            ArState::Close => "CLOSE",
        }
    }
}

/// User-supplied configuration for a new AR (§3, §4.6
/// `create_ar(config)`).
#[derive(Debug, Clone)]
pub struct ArConfig {
    /// DNS-compatible station name: max 63 bytes, lowercase `a-z0-9-`,
    /// first char not `-` (§3).
    pub station_name: String,
    pub device_ip: std::net::Ipv4Addr,
    /// MAC as produced by the DCP discovery collaborator. May be
    /// `[0;6]` if not yet known; the AR invariant only requires it be
    /// nonzero once the AR reaches `CONNECT_CNF` or later.
    pub device_mac: [u8; 6],
    /// `0` selects [`DEFAULT_WATCHDOG_MS`].
    pub watchdog_ms: u32,
    pub slot_info: Vec<SlotInfo>,
    pub timing: TimingProfile,
}

impl ArConfig {
    pub(crate) fn resolved_watchdog_ms(&self) -> Result<u32, PnioError> {
        if self.watchdog_ms == 0 {
            Ok(DEFAULT_WATCHDOG_MS)
        } else if self.watchdog_ms < MIN_WATCHDOG_MS {
            Err(PnioError::InvalidParam(format!(
                "watchdog_ms {} below minimum {}",
                self.watchdog_ms, MIN_WATCHDOG_MS
            )))
        } else {
            Ok(self.watchdog_ms)
        }
    }
}

/// Validate a station name against §3: DNS-compatible, max 63 bytes,
/// lowercase `a-z0-9-`, first char not `-`.
pub fn validate_station_name(name: &str) -> Result<(), PnioError> {
    if name.is_empty() || name.len() > 63 {
        return Err(PnioError::InvalidParam(format!(
            "station name '{name}' must be 1-63 bytes"
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if first == '-' {
        return Err(PnioError::InvalidParam(
            "station name must not start with '-'".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(PnioError::InvalidParam(format!(
            "station name '{name}' must be lowercase a-z0-9-"
        )));
    }
    Ok(())
}

/// An Application Relationship: the binding between this controller and
/// one field device (§3).
pub struct Ar {
    pub station_name: String,
    pub ar_uuid: Uuid,
    /// `0` until the device assigns a real value on connect (§3
    /// invariant: nonzero once connected).
    pub session_key: u16,
    pub device_mac: [u8; 6],
    pub device_ip: std::net::Ipv4Addr,
    pub ar_type: ArType,
    pub watchdog_ms: u32,
    pub slot_info: Vec<SlotInfo>,

    pub state: ArState,
    pub last_activity_ms: u64,
    pub last_error: Option<PnioError>,
    pub retry_count: u32,
    pub missed_cycles: u32,
    /// Mutual exclusion for a long-running connect attempt (§5):
    /// `true` while the discovery pipeline owns this AR, which tells the
    /// scheduler tick not to re-enter the state machine for it.
    pub connecting: Arc<AtomicBool>,

    pub input_iocr: Option<Iocr>,
    pub output_iocr: Option<Iocr>,

    pub timing: TimingProfile,
}

impl Ar {
    pub(crate) fn new(config: &ArConfig, ar_uuid: Uuid, now_ms: u64) -> Result<Self, PnioError> {
        validate_station_name(&config.station_name)?;
        let watchdog_ms = config.resolved_watchdog_ms()?;
        Ok(Self {
            station_name: config.station_name.clone(),
            ar_uuid,
            session_key: 0,
            device_mac: [0; 6],
            device_ip: config.device_ip,
            ar_type: ArType::Iocar,
            watchdog_ms,
            slot_info: config.slot_info.clone(),
            state: ArState::Init,
            last_activity_ms: now_ms,
            last_error: None,
            retry_count: 0,
            missed_cycles: 0,
            connecting: Arc::new(AtomicBool::new(false)),
            input_iocr: None,
            output_iocr: None,
            timing: config.timing,
        })
    }

    /// `true` once the AR has reached `CONNECT_CNF` or later at least
    /// once in its current connect attempt (§8 invariant 1).
    pub fn is_connected_or_beyond(&self) -> bool {
        matches!(
            self.state,
            ArState::ConnectCnf | ArState::Prmsrv | ArState::Ready | ArState::Run
        )
    }

    /// Spec §8 invariant 1: for every AR in state >= CONNECT_CNF,
    /// `session_key != 0` and `device_mac` is nonzero.
    pub fn check_connected_invariant(&self) -> bool {
        if !self.is_connected_or_beyond() {
            return true;
        }
        self.session_key != 0 && self.device_mac != [0; 6]
    }

    pub fn try_set_connecting(&self) -> bool {
        self.connecting
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear_connecting(&self) {
        self.connecting.store(false, Ordering::Release);
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ArConfig {
        ArConfig {
            station_name: "rtu-a".to_string(),
            device_ip: "10.0.0.5".parse().unwrap(),
            device_mac: [0; 6],
            watchdog_ms: 0,
            slot_info: vec![],
            timing: TimingProfile::default(),
        }
    }

    #[test]
    fn new_ar_uses_default_watchdog_when_unset() {
        let ar = Ar::new(&cfg(), Uuid::new_v4(), 0).unwrap();
        assert_eq!(ar.watchdog_ms, DEFAULT_WATCHDOG_MS);
    }

    #[test]
    fn new_ar_rejects_watchdog_below_minimum() {
        let mut c = cfg();
        c.watchdog_ms = 500;
        assert!(Ar::new(&c, Uuid::new_v4(), 0).is_err());
    }

    #[test]
    fn connected_invariant_holds_trivially_before_connect_cnf() {
        let ar = Ar::new(&cfg(), Uuid::new_v4(), 0).unwrap();
        assert!(ar.check_connected_invariant());
    }

    #[test]
    fn connected_invariant_fails_with_zero_session_key_past_connect_cnf() {
        let mut ar = Ar::new(&cfg(), Uuid::new_v4(), 0).unwrap();
        ar.state = ArState::Run;
        assert!(!ar.check_connected_invariant());
        ar.session_key = 7;
        ar.device_mac = [1, 2, 3, 4, 5, 6];
        assert!(ar.check_connected_invariant());
    }

    #[test]
    fn connecting_flag_is_mutually_exclusive() {
        let ar = Ar::new(&cfg(), Uuid::new_v4(), 0).unwrap();
        assert!(ar.try_set_connecting());
        assert!(!ar.try_set_connecting());
        ar.clear_connecting();
        assert!(ar.try_set_connecting());
    }

    #[test]
    fn station_name_validation() {
        assert!(validate_station_name("rtu-a1").is_ok());
        assert!(validate_station_name("-rtu").is_err());
        assert!(validate_station_name("RTU-A").is_err());
        assert!(validate_station_name("").is_err());
        assert!(validate_station_name(&"a".repeat(64)).is_err());
    }
}
