//! Hardware families.
//!
//! Each supported panel family is a type implementing [`PanelFamily`]. The
//! registry is built once at startup and looked up by the configured name.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{LinkConfig, LinkKind};
use crate::link::{SerialTransport, Transport};
use crate::unit::{Geometry, Unit};
use crate::{Error, Result};

/// GATT characteristic iPixel panels accept writes on.
pub const IPIXEL_WRITE_UUID: &str = "0000fa02-0000-1000-8000-00805f9b34fb";

/// GATT characteristic iPixel panels notify acks on.
pub const IPIXEL_NOTIFY_UUID: &str = "0000fa03-0000-1000-8000-00805f9b34fb";

/// Capabilities of one hardware family.
pub trait PanelFamily: Send + Sync {
    /// Registry key.
    fn name(&self) -> &'static str;

    /// Geometry used when a unit does not configure one.
    fn default_geometry(&self) -> Geometry;

    /// Whether units must use exactly the default geometry.
    fn fixed_geometry(&self) -> bool {
        false
    }

    /// Whether the firmware implements windowed animation uploads.
    fn supports_animation(&self) -> bool;

    fn default_write_channel(&self) -> &'static str {
        IPIXEL_WRITE_UUID
    }

    fn default_notify_channel(&self) -> Option<&'static str> {
        Some(IPIXEL_NOTIFY_UUID)
    }

    /// Builds the transport for one unit of this family.
    fn open_transport(&self, unit: &Unit, link: &LinkConfig) -> Result<Box<dyn Transport>> {
        match link.kind {
            LinkKind::Serial => Ok(Box::new(SerialTransport::new(
                &unit.address,
                link.baud_rate,
                link.max_write_len,
            ))),
            #[cfg(feature = "ble")]
            LinkKind::Ble => Ok(Box::new(crate::link::BleTransport::new(
                &unit.address,
                &unit.write_channel,
                unit.notify_channel.as_deref(),
                link.max_write_len,
            ))),
            #[cfg(not(feature = "ble"))]
            LinkKind::Ble => Err(Error::Config(format!(
                "unit {} uses BLE but this build lacks the `ble` feature",
                unit.address
            ))),
        }
    }
}

/// iPixel panels with configurable size and animation support.
pub struct IPixel;

impl PanelFamily for IPixel {
    fn name(&self) -> &'static str {
        "ipixel"
    }

    fn default_geometry(&self) -> Geometry {
        Geometry::new(64, 20)
    }

    fn supports_animation(&self) -> bool {
        true
    }
}

/// Early 64x20 iPixel boards: fixed size, still-image uploads only.
pub struct IPixel20x64;

impl PanelFamily for IPixel20x64 {
    fn name(&self) -> &'static str {
        "ipixel-20x64"
    }

    fn default_geometry(&self) -> Geometry {
        Geometry::new(64, 20)
    }

    fn fixed_geometry(&self) -> bool {
        true
    }

    fn supports_animation(&self) -> bool {
        false
    }

    fn default_notify_channel(&self) -> Option<&'static str> {
        None
    }
}

/// Name-keyed set of known families.
pub struct FamilyRegistry {
    families: BTreeMap<&'static str, Arc<dyn PanelFamily>>,
}

impl FamilyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            families: BTreeMap::new(),
        }
    }

    /// Registry with every family this crate ships.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IPixel));
        registry.register(Arc::new(IPixel20x64));
        registry
    }

    /// Adds a family, replacing any with the same name.
    pub fn register(&mut self, family: Arc<dyn PanelFamily>) {
        self.families.insert(family.name(), family);
    }

    /// Looks up a family by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn PanelFamily>> {
        self.families.get(name).cloned().ok_or_else(|| {
            Error::Config(format!(
                "unknown panel family '{}', available: {}",
                name,
                self.names().join(", ")
            ))
        })
    }

    /// Registered family names.
    pub fn names(&self) -> Vec<&'static str> {
        self.families.keys().copied().collect()
    }
}

impl Default for FamilyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::tests::unit;

    #[test]
    fn test_builtin_families() {
        let registry = FamilyRegistry::builtin();
        assert_eq!(registry.names(), vec!["ipixel", "ipixel-20x64"]);

        let ipixel = registry.get("ipixel").unwrap();
        assert!(ipixel.supports_animation());
        assert!(!ipixel.fixed_geometry());

        let legacy = registry.get("ipixel-20x64").unwrap();
        assert!(!legacy.supports_animation());
        assert_eq!(legacy.default_geometry(), Geometry::new(64, 20));
    }

    #[test]
    fn test_unknown_family_lists_available() {
        let err = FamilyRegistry::builtin().get("idotmatrix").err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("idotmatrix"));
        assert!(msg.contains("ipixel-20x64"));
    }

    #[test]
    fn test_serial_transport_construction() {
        let link = LinkConfig {
            kind: LinkKind::Serial,
            ..LinkConfig::default()
        };
        let transport = IPixel.open_transport(&unit(0, 64, 20), &link).unwrap();
        assert_eq!(transport.max_write_len(), 244);
    }

    #[cfg(not(feature = "ble"))]
    #[test]
    fn test_ble_requires_feature() {
        let link = LinkConfig::default();
        assert!(IPixel.open_transport(&unit(0, 64, 20), &link).is_err());
    }
}
