//! Cyclic frame codec (component C2, §4.2, §6).
//!
//! Layout (all multi-byte integers network byte order):
//!
//! ```text
//! [ 0.. 5] dst MAC
//! [ 6..11] src MAC
//! [12..13] ethertype 0x8892
//! [14..15] frame_id
//! [16..16+L-1] C-SDU, L = iocr.data_length
//! [L+16..L+17] cycle_counter (post-increment on encode)
//! [L+18] data_status
//! [L+19] transfer_status
//! [... zero pad to >= 60 bytes]
//! ```

use byteorder::{BigEndian, ByteOrder};
use pnio_core::error::PnioError;

use crate::iocr::{Iocr, IocrType};

/// PROFINET ethertype, used for both cyclic and alarm frames.
pub const ETHERTYPE: u16 = 0x8892;
/// Minimum total Ethernet frame length (without FCS).
pub const MIN_FRAME_LEN: usize = 60;
/// Bytes from the start of the frame up to and including `frame_id`.
const HEADER_LEN: usize = 16;
/// Trailer bytes following the C-SDU: cycle_counter(2) + data_status(1) +
/// transfer_status(1).
const TRAILER_LEN: usize = 4;

/// Bit masks for the data-status byte (§6).
pub mod data_status {
    pub const STATE: u8 = 0x01;
    pub const REDUNDANCY: u8 = 0x02;
    pub const VALID: u8 = 0x04;
    pub const PRIMARY: u8 = 0x08;
    pub const STATIONPROBLEM: u8 = 0x10;
    pub const RUN: u8 = 0x20;
}

/// Value an IOPS or IOCS byte takes when the submodule is good.
pub const GOOD: u8 = 0x80;

/// Data status a frame carries while its AR is in the RUN state (§8
/// invariant 5: `RUN` and `VALID` must be set).
pub const RUN_DATA_STATUS: u8 = data_status::STATE | data_status::VALID | data_status::RUN;

/// Encode the outbound cyclic frame for `iocr` (normally the AR's OUTPUT
/// IOCR). Fills IOPS bytes (one `GOOD` per provider submodule) and IOCS
/// bytes (one `GOOD` per consumer submodule) into the IOCR buffer before
/// copying it into the frame, reads the current cycle counter into the
/// frame, then post-increments it (wrapping mod 2^16).
pub fn encode_cyclic_frame(
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    iocr: &mut Iocr,
    data_status: u8,
) -> Vec<u8> {
    let iops_off = iocr.iops_offset();
    for i in 0..iocr.iodata_count {
        iocr.data_buffer[iops_off + i] = GOOD;
    }
    let iocs_off = iocr.iocs_offset();
    for i in 0..iocr.iocs_count {
        iocr.data_buffer[iocs_off + i] = GOOD;
    }

    let l = iocr.data_length;
    let total_len = std::cmp::max(MIN_FRAME_LEN, HEADER_LEN + l + TRAILER_LEN);
    let mut buf = vec![0u8; total_len];

    buf[0..6].copy_from_slice(&dst_mac);
    buf[6..12].copy_from_slice(&src_mac);
    BigEndian::write_u16(&mut buf[12..14], ETHERTYPE);
    BigEndian::write_u16(&mut buf[14..16], iocr.frame_id);
    buf[HEADER_LEN..HEADER_LEN + l].copy_from_slice(&iocr.data_buffer);

    let cycle = iocr.cycle_counter;
    BigEndian::write_u16(&mut buf[HEADER_LEN + l..HEADER_LEN + l + 2], cycle);
    buf[HEADER_LEN + l + 2] = data_status;
    buf[HEADER_LEN + l + 3] = 0; // transfer_status

    iocr.cycle_counter = iocr.cycle_counter.wrapping_add(1);
    buf
}

/// A parsed inbound cyclic frame. `csdu` borrows from the original byte
/// slice and may be longer than any particular IOCR's `data_length` —
/// matching against an IOCR is the caller's job (§4.6 routes by
/// `frame_id` first).
pub struct InboundCyclicFrame<'a> {
    pub frame_id: u16,
    pub cycle_counter: u16,
    pub data_status: u8,
    pub transfer_status: u8,
    pub csdu: &'a [u8],
}

/// Parse the fixed header and trailer of an inbound cyclic frame.
///
/// Rejects frames shorter than `header + 4` bytes (§4.2 failure
/// modes). Does not validate `ethertype`; the raw-socket collaborator is
/// assumed to have already filtered to PROFINET frames.
pub fn parse_cyclic_frame(bytes: &[u8]) -> Result<InboundCyclicFrame<'_>, PnioError> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(PnioError::Protocol(format!(
            "cyclic frame too short: {} bytes, need at least {}",
            bytes.len(),
            HEADER_LEN + TRAILER_LEN
        )));
    }
    let frame_id = BigEndian::read_u16(&bytes[14..16]);
    let rest = &bytes[HEADER_LEN..];
    let csdu_len = rest.len() - TRAILER_LEN;
    let csdu = &rest[..csdu_len];
    let cycle_counter = BigEndian::read_u16(&rest[csdu_len..csdu_len + 2]);
    let data_status = rest[csdu_len + 2];
    let transfer_status = rest[csdu_len + 3];
    Ok(InboundCyclicFrame {
        frame_id,
        cycle_counter,
        data_status,
        transfer_status,
        csdu,
    })
}

/// Copy a parsed inbound frame's C-SDU into `iocr`'s buffer, if `iocr` is
/// an INPUT IOCR and the frame's C-SDU is large enough to accommodate
/// `iocr.data_length` (§4.2: "if the frame length accommodates
/// `data_length`, copies `data_length` bytes"; frames that don't
/// accommodate it are discarded, not treated as hard errors). Cycle
/// counter and data-status are read but never gate the copy — validation
/// here is advisory, per spec.
pub fn apply_inbound_frame(
    iocr: &mut Iocr,
    frame: &InboundCyclicFrame<'_>,
    now_us: u64,
) -> bool {
    if iocr.io_type != IocrType::Input {
        return false;
    }
    if frame.csdu.len() < iocr.data_length {
        return false;
    }
    iocr.data_buffer
        .copy_from_slice(&frame.csdu[..iocr.data_length]);
    iocr.last_frame_time_us = now_us;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iocr::allocate;
    use crate::slot::{Semantic, SlotInfo};

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
    fn encode_pads_to_minimum_60_bytes() {
        let (_, mut output) = allocate(1, 2, &slots()).unwrap();
        let buf = encode_cyclic_frame([1; 6], [2; 6], &mut output, RUN_DATA_STATUS);
        assert!(buf.len() >= MIN_FRAME_LEN);
    }

    #[test]
    fn encode_sets_iops_iocs_good_and_post_increments_cycle_counter() {
        let (_, mut output) = allocate(1, 2, &slots()).unwrap();
        assert_eq!(output.cycle_counter, 0);
        let buf = encode_cyclic_frame([1; 6], [2; 6], &mut output, RUN_DATA_STATUS);
        let frame = parse_cyclic_frame(&buf).unwrap();
        assert_eq!(frame.cycle_counter, 0);
        assert_eq!(output.cycle_counter, 1);
        let iops = frame.csdu[output.iops_offset()];
        let iocs = frame.csdu[output.iocs_offset()];
        assert_eq!(iops, GOOD);
        assert_eq!(iocs, GOOD);
    }

    #[test]
    fn consecutive_encodes_have_strictly_increasing_cycle_counters() {
        let (_, mut output) = allocate(1, 2, &slots()).unwrap();
        let b1 = encode_cyclic_frame([1; 6], [2; 6], &mut output, RUN_DATA_STATUS);
        let b2 = encode_cyclic_frame([1; 6], [2; 6], &mut output, RUN_DATA_STATUS);
        let f1 = parse_cyclic_frame(&b1).unwrap();
        let f2 = parse_cyclic_frame(&b2).unwrap();
        assert_eq!(f2.cycle_counter, f1.cycle_counter.wrapping_add(1));
    }

    #[test]
    fn cycle_counter_wraps_at_u16_max() {
        let (_, mut output) = allocate(1, 2, &[]).unwrap();
        output.cycle_counter = u16::MAX;
        let buf = encode_cyclic_frame([1; 6], [2; 6], &mut output, RUN_DATA_STATUS);
        let frame = parse_cyclic_frame(&buf).unwrap();
        assert_eq!(frame.cycle_counter, u16::MAX);
        assert_eq!(output.cycle_counter, 0);
    }

    #[test]
    fn round_trip_preserves_application_payload_bytes() {
        let (mut input, mut output) = allocate(1, 2, &slots()).unwrap();
        output.data_buffer[0..5].copy_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x80]);
        let buf = encode_cyclic_frame([1; 6], [2; 6], &mut output, RUN_DATA_STATUS);
        let frame = parse_cyclic_frame(&buf).unwrap();
        let applied = apply_inbound_frame(&mut input, &frame, 123);
        assert!(applied);
        assert_eq!(&input.data_buffer[0..5], &[0x01, 0x02, 0x03, 0x04, 0x80]);
        assert_eq!(input.last_frame_time_us, 123);
    }

    #[test]
    fn short_frames_are_rejected() {
        let bytes = vec![0u8; 10];
        assert!(parse_cyclic_frame(&bytes).is_err());
    }

    #[test]
    fn frames_too_short_to_fill_iocr_are_discarded_not_applied() {
        let (mut input, _) = allocate(1, 2, &slots()).unwrap();
        // A well-formed but minimal frame for an IOCR with no I/O at all.
        let (_, mut tiny_output) = allocate(1, 2, &[]).unwrap();
        let buf = encode_cyclic_frame([1; 6], [2; 6], &mut tiny_output, RUN_DATA_STATUS);
        let frame = parse_cyclic_frame(&buf).unwrap();
        let applied = apply_inbound_frame(&mut input, &frame, 1);
        assert!(!applied);
    }

    #[test]
    fn output_iocrs_never_accept_inbound_copies() {
        let (_, mut output) = allocate(1, 2, &slots()).unwrap();
        let buf = encode_cyclic_frame([1; 6], [2; 6], &mut output.clone(), RUN_DATA_STATUS);
        let frame = parse_cyclic_frame(&buf).unwrap();
        assert!(!apply_inbound_frame(&mut output, &frame, 1));
    }
}
