//! Cyclic timing profile (§3 "Timing profile").

/// Send-clock / reduction-ratio / watchdog-factor bundle that derives a
/// device's cycle time, watchdog period, and RTA retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimingProfile {
    pub send_clock_factor: u16,
    pub reduction_ratio: u16,
    pub watchdog_factor: u16,
    pub data_hold_factor: u16,
    pub rta_timeout_factor: u16,
    pub rta_retries: u8,
}

impl TimingProfile {
    /// Conservative default: SCF=64, RR=128, WDF=10 -> ~2ms cycle x 128 =
    /// 256ms update, 2.56s watchdog, 5 RTA retries (§3).
    pub fn conservative_default() -> Self {
        Self {
            send_clock_factor: 64,
            reduction_ratio: 128,
            watchdog_factor: 10,
            data_hold_factor: 3,
            rta_timeout_factor: 10,
            rta_retries: 5,
        }
    }

    /// The base cycle time in microseconds: `send_clock_factor * 31.25us`,
    /// the IEC 61158-6 base clock tick.
    pub fn cycle_time_us(&self) -> u32 {
        (self.send_clock_factor as u32 * 3125) / 100
    }

    /// The update time in microseconds: cycle time times reduction ratio.
    pub fn update_time_us(&self) -> u32 {
        self.cycle_time_us() * self.reduction_ratio as u32
    }

    /// Derived watchdog period in milliseconds: update time times watchdog
    /// factor.
    pub fn watchdog_ms(&self) -> u32 {
        (self.update_time_us() / 1000) * self.watchdog_factor as u32
    }
}

impl Default for TimingProfile {
    fn default() -> Self {
        Self::conservative_default()
    }
}
