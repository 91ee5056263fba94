//! GSDML cache collaborator (§1 "deliberately out of scope: The
//! GSDML cache and HTTP fallback — opaque functions returning a
//! module-discovery structure"; §6 "Persisted state layout").
//!
//! The core only depends on the `GsdmlCache` trait shape; parsing a real
//! vendor GSDML document is explicitly not this crate's job. The file
//! cache below understands a minimal internal `<Modules>` document, which
//! is all the discovery pipeline (§4.4 Phase 1, Phase 5+) needs: a
//! station-keyed module inventory it can round-trip. A real deployment's
//! `GsdmlCache` would parse whatever the device's `/gsdml` endpoint
//! actually returns into the same `DiscoveredModule` list.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use pnio_core::error::PnioError;
use pnio_types::slot::DiscoveredModule;

/// Looks up and stores a device's module inventory, keyed by station
/// name (§4.4 Phase 1, §6).
pub trait GsdmlCache: Send + Sync {
    /// Returns the cached module list for `station_name`, or `None` on a
    /// cache miss *or* a parse failure — both are treated identically by
    /// Phase 1 ("On cache miss or parse failure, proceed").
    fn lookup_modules(&self, station_name: &str) -> Option<Vec<DiscoveredModule>>;

    /// Persist the raw bytes fetched from the device's `/gsdml` endpoint
    /// (§4.4 "Phase 5+ ... background GSDML fetch"). Failure is
    /// non-fatal to the caller, per spec.
    fn save_raw(&self, station_name: &str, xml_bytes: &[u8]) -> Result<(), PnioError>;
}

/// Production cache: one XML file per device under
/// `<dir>/<station_name>.xml` (§6 "Persisted state layout").
pub struct FileGsdmlCache {
    dir: PathBuf,
}

impl FileGsdmlCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, station_name: &str) -> PathBuf {
        self.dir.join(format!("{station_name}.xml"))
    }

    fn parse(xml: &str) -> Option<Vec<DiscoveredModule>> {
        let doc = roxmltree::Document::parse(xml).ok()?;
        let root = doc.root_element();
        let mut modules = Vec::new();
        for node in root.children().filter(|n| n.is_element() && n.tag_name().name() == "Module") {
            let slot = node.attribute("slot")?.parse().ok()?;
            let subslot = node.attribute("subslot")?.parse().ok()?;
            let module_ident = parse_hex_or_dec(node.attribute("moduleIdent")?)?;
            let submodule_ident = parse_hex_or_dec(node.attribute("submoduleIdent")?)?;
            modules.push(DiscoveredModule {
                slot,
                subslot,
                module_ident,
                submodule_ident,
            });
        }
        Some(modules)
    }
}

fn parse_hex_or_dec(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

impl GsdmlCache for FileGsdmlCache {
    fn lookup_modules(&self, station_name: &str) -> Option<Vec<DiscoveredModule>> {
        let path = self.path_for(station_name);
        let xml = fs::read_to_string(path).ok()?;
        Self::parse(&xml)
    }

    fn save_raw(&self, station_name: &str, xml_bytes: &[u8]) -> Result<(), PnioError> {
        fs::create_dir_all(&self.dir).map_err(PnioError::from)?;
        fs::write(self.path_for(station_name), xml_bytes).map_err(PnioError::from)
    }
}

/// Serialize a module list to the same minimal `<Modules>` document
/// [`FileGsdmlCache::parse`] reads back, for tests and for seeding a cache
/// from an already-discovered inventory.
pub fn render_modules_xml(modules: &[DiscoveredModule]) -> String {
    let mut out = String::from("<Modules>\n");
    for m in modules {
        out.push_str(&format!(
            "  <Module slot=\"{}\" subslot=\"{}\" moduleIdent=\"0x{:04X}\" submoduleIdent=\"0x{:04X}\"/>\n",
            m.slot, m.subslot, m.module_ident, m.submodule_ident
        ));
    }
    out.push_str("</Modules>\n");
    out
}

/// In-memory cache for tests: avoids touching the filesystem while still
/// exercising the same cache-hit / cache-miss branching in the discovery
/// pipeline.
#[derive(Default)]
pub struct StubGsdmlCache {
    entries: RwLock<HashMap<String, Vec<DiscoveredModule>>>,
}

impl StubGsdmlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, station_name: &str, modules: Vec<DiscoveredModule>) {
        self.entries
            .write()
            .unwrap()
            .insert(station_name.to_string(), modules);
    }
}

impl GsdmlCache for StubGsdmlCache {
    fn lookup_modules(&self, station_name: &str) -> Option<Vec<DiscoveredModule>> {
        self.entries.read().unwrap().get(station_name).cloned()
    }

    fn save_raw(&self, _station_name: &str, _xml_bytes: &[u8]) -> Result<(), PnioError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules() -> Vec<DiscoveredModule> {
        vec![
            DiscoveredModule {
                slot: 0,
                subslot: 1,
                module_ident: 1,
                submodule_ident: 1,
            },
            DiscoveredModule {
                slot: 1,
                subslot: 1,
                module_ident: 0x10,
                submodule_ident: 0x10,
            },
        ]
    }

    #[test]
    fn file_cache_round_trips_through_rendered_xml() {
        let tmp = tempdir();
        let cache = FileGsdmlCache::new(&tmp);
        cache.save_raw("rtu-a", render_modules_xml(&modules()).as_bytes()).unwrap();
        let loaded = cache.lookup_modules("rtu-a").unwrap();
        assert_eq!(loaded, modules());
        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn file_cache_miss_returns_none_without_erroring() {
        let tmp = tempdir();
        let cache = FileGsdmlCache::new(&tmp);
        assert!(cache.lookup_modules("no-such-device").is_none());
        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn file_cache_parse_failure_is_treated_as_a_miss() {
        let tmp = tempdir();
        let cache = FileGsdmlCache::new(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("garbled.xml"), b"not xml at all <<<").unwrap();
        assert!(cache.lookup_modules("garbled").is_none());
        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn stub_cache_hit_and_miss() {
        let cache = StubGsdmlCache::new();
        assert!(cache.lookup_modules("rtu-a").is_none());
        cache.seed("rtu-a", modules());
        assert_eq!(cache.lookup_modules("rtu-a").unwrap(), modules());
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("pnio-gsdml-test-{}", uuid::Uuid::new_v4()));
        p
    }
}
