//! IOCR buffer model (component C1, §4.1).
//!
//! An IOCR owns a single byte buffer laid out as
//! `[user data][IOPS bytes][IOCS bytes]`, sized from the AR's slot list.
//! Allocation is all-or-nothing: if either direction fails to allocate,
//! any already-allocated buffer is dropped (Rust's ownership makes the
//! "rollback partials" requirement from §4.1 automatic — there is no
//! manual free to forget).

use pnio_core::error::PnioError;

use crate::slot::{SlotInfo, SlotKind};

/// Floor on C-SDU length mandated by IEC 61158-6 for RT_CLASS_1 (§3).
pub const MIN_DATA_LENGTH: usize = 40;

/// Per-sensor payload size: 4-byte big-endian `f32` + 1-byte quality.
pub const SENSOR_IO_SIZE: usize = 5;
/// Per-actuator payload size: 1-byte command + 1-byte duty + 2-byte
/// reserved.
pub const ACTUATOR_IO_SIZE: usize = 4;

/// Directional cyclic-frame channel bound to an AR (§3 "IOCR").
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum IocrType {
    Input,
    Output,
}

/// One directional cyclic-frame channel. `data_buffer` is exclusively
/// owned by the IOCR (§3 invariant).
#[derive(Debug, Clone)]
pub struct Iocr {
    pub io_type: IocrType,
    /// Controller-proposed frame id; the device may reassign it in the
    /// connect response, at which point the AR adopts the new value
    /// in-place (§4.6).
    pub frame_id: u16,
    pub data_length: usize,
    pub user_data_length: usize,
    /// Number of IOPS bytes (one per provider submodule on this IOCR).
    pub iodata_count: usize,
    /// Number of IOCS bytes (one per consumer submodule on this IOCR).
    pub iocs_count: usize,
    pub data_buffer: Vec<u8>,
    /// Per-IOCR cycle counter, monotonically increasing mod 2^16 on every
    /// outbound frame (§3, §5).
    pub cycle_counter: u16,
    pub last_frame_time_us: u64,
}

impl Iocr {
    fn new(io_type: IocrType, frame_id: u16, user_data_length: usize, iodata_count: usize, iocs_count: usize) -> Result<Self, PnioError> {
        let data_length = std::cmp::max(
            MIN_DATA_LENGTH,
            user_data_length + iodata_count + iocs_count,
        );
        let data_buffer = vec![0u8; data_length];
        Ok(Self {
            io_type,
            frame_id,
            data_length,
            user_data_length,
            iodata_count,
            iocs_count,
            data_buffer,
            cycle_counter: 0,
            last_frame_time_us: 0,
        })
    }

    /// Offset of the first IOPS byte within `data_buffer`.
    pub fn iops_offset(&self) -> usize {
        self.user_data_length
    }

    /// Offset of the first IOCS byte within `data_buffer`.
    pub fn iocs_offset(&self) -> usize {
        self.user_data_length + self.iodata_count
    }
}

fn count_by_kind(slots: &[SlotInfo], kind: SlotKind) -> usize {
    slots.iter().filter(|s| s.kind() == kind).count()
}

/// Allocate the INPUT and OUTPUT IOCRs for an AR from its configured slot
/// list (§4.1). Note the apparent asymmetry: each IOCR's IOCS count
/// mirrors the *other* direction's provider count, since the controller
/// transmits consumer status for submodules it consumes on the peer's
/// IOCR.
pub fn allocate(
    input_frame_id: u16,
    output_frame_id: u16,
    slots: &[SlotInfo],
) -> Result<(Iocr, Iocr), PnioError> {
    let num_sensors = count_by_kind(slots, SlotKind::Sensor);
    let num_actuators = count_by_kind(slots, SlotKind::Actuator);

    let input = Iocr::new(
        IocrType::Input,
        input_frame_id,
        num_sensors * SENSOR_IO_SIZE,
        num_sensors,
        num_actuators,
    )?;
    let output = Iocr::new(
        IocrType::Output,
        output_frame_id,
        num_actuators * ACTUATOR_IO_SIZE,
        num_actuators,
        num_sensors,
    )?;

    Ok((input, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Semantic;

    fn slots() -> Vec<SlotInfo> {
        vec![
            SlotInfo {
                slot: 1,
                subslot: 1,
                semantic: Semantic::Ph,
            },
            SlotInfo {
                slot: 2,
                subslot: 1,
                semantic: Semantic::Pump,
            },
        ]
    }

    #[test]
    fn allocate_sizes_match_slot_counts() {
        let (input, output) = allocate(0x8001, 0x8002, &slots()).unwrap();
        assert_eq!(input.user_data_length, SENSOR_IO_SIZE);
        assert_eq!(input.iodata_count, 1);
        assert_eq!(input.iocs_count, 1);
        assert_eq!(input.data_length, std::cmp::max(MIN_DATA_LENGTH, 5 + 1 + 1));

        assert_eq!(output.user_data_length, ACTUATOR_IO_SIZE);
        assert_eq!(output.iodata_count, 1);
        assert_eq!(output.iocs_count, 1);
    }

    #[test]
    fn allocate_floors_data_length_at_40_even_with_no_submodules() {
        let (input, output) = allocate(1, 2, &[]).unwrap();
        assert_eq!(input.data_length, MIN_DATA_LENGTH);
        assert_eq!(output.data_length, MIN_DATA_LENGTH);
        assert_eq!(input.data_buffer.len(), MIN_DATA_LENGTH);
    }

    #[test]
    fn iops_and_iocs_offsets_are_contiguous_after_user_data() {
        let (input, _) = allocate(1, 2, &slots()).unwrap();
        assert_eq!(input.iops_offset(), input.user_data_length);
        assert_eq!(input.iocs_offset(), input.user_data_length + input.iodata_count);
    }
}
