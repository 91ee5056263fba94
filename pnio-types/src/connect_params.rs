//! Connect parameter builder (component C3, §4.3).
//!
//! Builds the `ConnectRequestParams` value consumed by the acyclic RPC
//! `connect` primitive, in two variants: DAP-only (the discovery probe)
//! and full (production, with the complete expected submodule
//! configuration).

use uuid::Uuid;

use crate::iocr::{self, IocrType, MIN_DATA_LENGTH};
use crate::slot::{
    DiscoveredModule, ModuleIdentLookup, Semantic, SlotInfo, SlotKind, DAP_SUBSLOT_IDENTITY,
    DAP_SUBSLOT_INTERFACE, DAP_SUBSLOT_PORT,
};
use crate::timing::TimingProfile;

/// Application Relationship type. The core only ever builds IOCAR
/// (I/O Controller AR); other AR types exist in the standard but are out
/// of scope (§1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArType {
    Iocar,
}

/// `ar_properties` bit values combined in every connect request (spec
/// §4.3).
pub mod ar_properties {
    pub const STATE_ACTIVE: u32 = 0x0000_0001;
    pub const PARAMETERIZATION_TYPE: u32 = 0x0000_0020;
    pub const STARTUP_MODE_LEGACY: u32 = 0x0000_0000;
}

/// Placeholder DAP identifiers. Real identifiers come from the device's
/// GSDML; these are internally-consistent stand-ins used for the three
/// mandatory DAP submodules common to every device (§3, §4.3).
pub const DAP_MODULE_IDENT: u32 = 0x0000_0001;
pub const DAP_SUBMODULE_IDENT_IDENTITY: u32 = 0x0000_0001;
pub const DAP_SUBMODULE_IDENT_INTERFACE: u32 = 0x0000_8000;
pub const DAP_SUBMODULE_IDENT_PORT: u32 = 0x0000_8001;

/// Direction of an application submodule relative to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// One entry in the expected submodule configuration list (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleParams {
    pub slot: u16,
    pub subslot: u16,
    pub module_ident: u32,
    pub submodule_ident: u32,
    pub data_length: usize,
    pub direction: Direction,
}

/// One of the two IOCRs carried in a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IocrParams {
    pub io_type: IocrType,
    /// 1 for INPUT, 2 for OUTPUT (§4.3).
    pub reference: u16,
    pub frame_id: u16,
    pub data_length: usize,
    pub timing: TimingProfile,
}

/// Full set of parameters handed to the RPC `connect` primitive (spec
/// §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequestParams {
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub ar_type: ArType,
    pub ar_properties: u32,
    /// CM initiator station name: the *controller's* name, never the
    /// device's — using the device name here is a protocol-level error
    /// that causes silent drops (§4.3).
    pub station_name: String,
    pub controller_mac: [u8; 6],
    pub controller_uuid: Uuid,
    pub controller_port: u16,
    /// Units of 100ms; fixed at 100 (= 10s) (§4.3).
    pub activity_timeout: u16,
    pub iocrs: Vec<IocrParams>,
    pub submodules: Vec<SubmoduleParams>,
    pub max_alarm_data_length: u16,
}

/// Everything the builder needs that is independent of whether the probe
/// is DAP-only or full.
pub struct ConnectContext<'a> {
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub controller_station_name: &'a str,
    pub controller_mac: [u8; 6],
    pub controller_uuid: Uuid,
    pub controller_port: u16,
    pub timing: TimingProfile,
    pub input_frame_id: u16,
    pub output_frame_id: u16,
}

const ACTIVITY_TIMEOUT: u16 = 100;
const MAX_ALARM_DATA_LENGTH: u16 = 200;

fn dap_submodules() -> Vec<SubmoduleParams> {
    vec![
        SubmoduleParams {
            slot: 0,
            subslot: DAP_SUBSLOT_IDENTITY,
            module_ident: DAP_MODULE_IDENT,
            submodule_ident: DAP_SUBMODULE_IDENT_IDENTITY,
            data_length: 0,
            direction: Direction::Input,
        },
        SubmoduleParams {
            slot: 0,
            subslot: DAP_SUBSLOT_INTERFACE,
            module_ident: DAP_MODULE_IDENT,
            submodule_ident: DAP_SUBMODULE_IDENT_INTERFACE,
            data_length: 0,
            direction: Direction::Input,
        },
        SubmoduleParams {
            slot: 0,
            subslot: DAP_SUBSLOT_PORT,
            module_ident: DAP_MODULE_IDENT,
            submodule_ident: DAP_SUBMODULE_IDENT_PORT,
            data_length: 0,
            direction: Direction::Input,
        },
    ]
}

fn common(ctx: &ConnectContext<'_>) -> ConnectRequestParams {
    ConnectRequestParams {
        ar_uuid: ctx.ar_uuid,
        session_key: ctx.session_key,
        ar_type: ArType::Iocar,
        ar_properties: ar_properties::STATE_ACTIVE
            | ar_properties::PARAMETERIZATION_TYPE
            | ar_properties::STARTUP_MODE_LEGACY,
        station_name: ctx.controller_station_name.to_string(),
        controller_mac: ctx.controller_mac,
        controller_uuid: ctx.controller_uuid,
        controller_port: ctx.controller_port,
        activity_timeout: ACTIVITY_TIMEOUT,
        iocrs: Vec::new(),
        submodules: dap_submodules(),
        max_alarm_data_length: MAX_ALARM_DATA_LENGTH,
    }
}

/// Build the DAP-only probe variant (§4.3, §4.4 Phase 2): both IOCRs
/// floored at 40 bytes, exactly the three mandatory DAP entries, no
/// application submodules.
pub fn build_dap_only_params(ctx: &ConnectContext<'_>) -> ConnectRequestParams {
    let mut params = common(ctx);
    params.iocrs = vec![
        IocrParams {
            io_type: IocrType::Input,
            reference: 1,
            frame_id: ctx.input_frame_id,
            data_length: MIN_DATA_LENGTH,
            timing: ctx.timing,
        },
        IocrParams {
            io_type: IocrType::Output,
            reference: 2,
            frame_id: ctx.output_frame_id,
            data_length: MIN_DATA_LENGTH,
            timing: ctx.timing,
        },
    ];
    params
}

/// Build the full, production connect variant from a logical slot list
/// (§4.3, §4.4 Phase 4/5): recomputes IOCR `data_length` from the
/// actual I/O totals (still floored at 40) and appends one submodule
/// entry per application slot.
pub fn build_full_params(
    ctx: &ConnectContext<'_>,
    slots: &[SlotInfo],
    lookup: &dyn ModuleIdentLookup,
) -> Result<ConnectRequestParams, String> {
    let mut params = common(ctx);

    let (input_iocr, output_iocr) = iocr::allocate(ctx.input_frame_id, ctx.output_frame_id, slots)
        .map_err(|e| e.to_string())?;

    params.iocrs = vec![
        IocrParams {
            io_type: IocrType::Input,
            reference: 1,
            frame_id: input_iocr.frame_id,
            data_length: input_iocr.data_length,
            timing: ctx.timing,
        },
        IocrParams {
            io_type: IocrType::Output,
            reference: 2,
            frame_id: output_iocr.frame_id,
            data_length: output_iocr.data_length,
            timing: ctx.timing,
        },
    ];

    for slot in slots {
        let (module_ident, submodule_ident, data_length) = lookup
            .lookup(slot.semantic)
            .ok_or_else(|| format!("no GSDML mapping for semantic {:?}", slot.semantic))?;
        let direction = match slot.kind() {
            SlotKind::Sensor => Direction::Input,
            SlotKind::Actuator => Direction::Output,
        };
        params.submodules.push(SubmoduleParams {
            slot: slot.slot,
            subslot: if slot.subslot == 0 { 1 } else { slot.subslot },
            module_ident,
            submodule_ident,
            data_length: data_length as usize,
            direction,
        });
    }

    Ok(params)
}

/// Build a logical slot list from a device's discovered module inventory
/// (§4.4 Phase 4: "Build full params from the discovered list"),
/// skipping the three mandatory DAP entries that carry no application
/// payload.
pub fn slots_from_discovered(
    modules: &[DiscoveredModule],
    lookup: &dyn ModuleIdentLookup,
) -> Vec<SlotInfo> {
    modules
        .iter()
        .filter(|m| m.slot != 0)
        .filter_map(|m| {
            lookup
                .reverse_lookup(m.module_ident, m.submodule_ident)
                .map(|(semantic, _size)| SlotInfo {
                    slot: m.slot,
                    subslot: m.subslot,
                    semantic,
                })
        })
        .collect()
}
