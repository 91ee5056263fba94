//! Slot info, discovered modules, and the GSDML module-identifier lookup
//! (§3 "Slot info" / "Discovered module", §SPEC_FULL 3 "Semantic
//! enumeration").

/// Kind of application submodule occupying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Sensor,
    Actuator,
}

/// Closed enumeration of semantic types a slot can carry (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Semantic {
    // Sensors
    Ph,
    Tds,
    Turbidity,
    Temperature,
    Flow,
    Level,
    Custom(u16),
    // Actuators
    Pump,
    Valve,
    Relay,
}

impl Semantic {
    pub fn kind(&self) -> SlotKind {
        match self {
            Semantic::Ph
            | Semantic::Tds
            | Semantic::Turbidity
            | Semantic::Temperature
            | Semantic::Flow
            | Semantic::Level
            | Semantic::Custom(_) => SlotKind::Sensor,
            Semantic::Pump | Semantic::Valve | Semantic::Relay => SlotKind::Actuator,
        }
    }
}

/// Logical slot configuration as supplied by the user when creating an AR
/// (§3 "Slot info").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotInfo {
    pub slot: u16,
    pub subslot: u16,
    pub semantic: Semantic,
}

impl SlotInfo {
    pub fn kind(&self) -> SlotKind {
        self.semantic.kind()
    }
}

/// One module discovered on the device, by slot/subslot (§3
/// "Discovered module").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredModule {
    pub slot: u16,
    pub subslot: u16,
    pub module_ident: u32,
    pub submodule_ident: u32,
}

/// Subslot reserved for the Device Access Point's identity submodule.
pub const DAP_SUBSLOT_IDENTITY: u16 = 0x0001;
/// Subslot reserved for the DAP's interface submodule.
pub const DAP_SUBSLOT_INTERFACE: u16 = 0x8000;
/// Subslot reserved for the DAP's port submodule.
pub const DAP_SUBSLOT_PORT: u16 = 0x8001;

/// Resolves a [`Semantic`] to the `module_ident` / `submodule_ident` /
/// I/O size a GSDML description declares for it (§3, §6: "GSDML
/// module identifier lookup by semantic type").
pub trait ModuleIdentLookup: Send + Sync {
    /// Returns `(module_ident, submodule_ident, io_size)` for `semantic`,
    /// or `None` if this lookup has no mapping for it.
    fn lookup(&self, semantic: Semantic) -> Option<(u32, u32, u8)>;

    /// Reverse direction: given a discovered `(module_ident,
    /// submodule_ident)` pair, recover the `Semantic` and I/O size the
    /// full-connect Phase 4 needs to recompute IOCR sizing (§4.4).
    /// Discovery only yields raw identifiers (§3 "Discovered
    /// module"); this is the GSDML-backed inverse of [`Self::lookup`].
    fn reverse_lookup(&self, module_ident: u32, submodule_ident: u32) -> Option<(Semantic, u8)>;
}

/// Built-in table covering the closed `Semantic` enumeration with
/// placeholder but internally-consistent identifiers. Real deployments
/// supply their own [`ModuleIdentLookup`] backed by parsed GSDML.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticModuleIdentLookup;

impl ModuleIdentLookup for StaticModuleIdentLookup {
    fn lookup(&self, semantic: Semantic) -> Option<(u32, u32, u8)> {
        Some(match semantic {
            Semantic::Ph => (0x0010, 0x0010, 5),
            Semantic::Tds => (0x0011, 0x0011, 5),
            Semantic::Turbidity => (0x0012, 0x0012, 5),
            Semantic::Temperature => (0x0013, 0x0013, 5),
            Semantic::Flow => (0x0014, 0x0014, 5),
            Semantic::Level => (0x0015, 0x0015, 5),
            Semantic::Custom(id) => (0x0100 + id as u32, 0x0100 + id as u32, 5),
            Semantic::Pump => (0x0020, 0x0020, 4),
            Semantic::Valve => (0x0021, 0x0021, 4),
            Semantic::Relay => (0x0022, 0x0022, 4),
        })
    }

    fn reverse_lookup(&self, module_ident: u32, submodule_ident: u32) -> Option<(Semantic, u8)> {
        if module_ident != submodule_ident {
            return None;
        }
        Some(match module_ident {
            0x0010 => (Semantic::Ph, 5),
            0x0011 => (Semantic::Tds, 5),
            0x0012 => (Semantic::Turbidity, 5),
            0x0013 => (Semantic::Temperature, 5),
            0x0014 => (Semantic::Flow, 5),
            0x0015 => (Semantic::Level, 5),
            0x0020 => (Semantic::Pump, 4),
            0x0021 => (Semantic::Valve, 4),
            0x0022 => (Semantic::Relay, 4),
            id if (0x0100..0x0100 + 0x1_0000).contains(&id) => {
                (Semantic::Custom((id - 0x0100) as u16), 5)
            }
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_semantics_report_sensor_kind() {
        assert_eq!(Semantic::Ph.kind(), SlotKind::Sensor);
        assert_eq!(Semantic::Custom(7).kind(), SlotKind::Sensor);
    }

    #[test]
    fn actuator_semantics_report_actuator_kind() {
        assert_eq!(Semantic::Pump.kind(), SlotKind::Actuator);
    }

    #[test]
    fn static_lookup_covers_every_semantic_with_correct_io_size() {
        let lut = StaticModuleIdentLookup;
        for s in [
            Semantic::Ph,
            Semantic::Tds,
            Semantic::Turbidity,
            Semantic::Temperature,
            Semantic::Flow,
            Semantic::Level,
        ] {
            let (_, _, size) = lut.lookup(s).unwrap();
            assert_eq!(size, 5);
        }
        for s in [Semantic::Pump, Semantic::Valve, Semantic::Relay] {
            let (_, _, size) = lut.lookup(s).unwrap();
            assert_eq!(size, 4);
        }
    }

    #[test]
    fn reverse_lookup_round_trips_with_lookup() {
        let lut = StaticModuleIdentLookup;
        for s in [Semantic::Ph, Semantic::Pump, Semantic::Custom(3)] {
            let (module_ident, submodule_ident, size) = lut.lookup(s).unwrap();
            let (back, back_size) = lut.reverse_lookup(module_ident, submodule_ident).unwrap();
            assert_eq!(back, s);
            assert_eq!(back_size, size);
        }
    }

    #[test]
    fn reverse_lookup_rejects_unknown_idents() {
        let lut = StaticModuleIdentLookup;
        assert!(lut.reverse_lookup(0xFFFF, 0xFFFF).is_none());
    }
}
