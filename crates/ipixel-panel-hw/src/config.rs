//! Panel configuration.
//!
//! ```toml
//! family = "ipixel"
//!
//! [link]
//! kind = "ble"
//!
//! [timing]
//! ack_timeout_ms = 2000
//!
//! [[units]]
//! address = "AA:BB:CC:DD:EE:01"
//! height = 20
//!
//! [[units]]
//! address = "AA:BB:CC:DD:EE:02"
//! height = 20
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::canvas::BYTES_PER_PIXEL;
use crate::family::FamilyRegistry;
use crate::protocol::MAX_IMAGE_PAYLOAD;
use crate::unit::{Geometry, Unit, UnitId};
use crate::{Error, Result};

/// Largest number of units a one-byte unit id can address.
pub const MAX_UNITS: usize = 256;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Hardware family name (see `FamilyRegistry`)
    #[serde(default = "default_family")]
    pub family: String,

    /// Transport settings
    #[serde(default)]
    pub link: LinkConfig,

    /// Timeouts and retry budgets
    #[serde(default)]
    pub timing: Timing,

    /// Units in stacking order unless `position` says otherwise
    #[serde(default)]
    pub units: Vec<UnitConfig>,
}

/// How units are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Native BLE (requires the `ble` feature).
    #[default]
    Ble,
    /// BLE-UART bridge on a serial port.
    Serial,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub kind: LinkKind,

    /// Serial bridge baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Largest single transport write; frames are fragmented to this size
    #[serde(default = "default_max_write_len")]
    pub max_write_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            kind: LinkKind::default(),
            baud_rate: default_baud_rate(),
            max_write_len: default_max_write_len(),
        }
    }
}

/// Timeouts and retry budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Reconnect attempts after link loss before giving up on a write
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Initial reconnect backoff in milliseconds (doubles per attempt)
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Wait for each animation ack, in milliseconds
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Failed attempts allowed per animation window
    #[serde(default = "default_max_window_retries")]
    pub max_window_retries: u32,
}

impl Timing {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            ack_timeout_ms: default_ack_timeout(),
            max_window_retries: default_max_window_retries(),
        }
    }
}

/// One physical unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    /// BLE MAC address or serial port path
    pub address: String,

    /// Width in pixels (family default if omitted)
    #[serde(default)]
    pub width: Option<u32>,

    /// Height in pixels (family default if omitted)
    #[serde(default)]
    pub height: Option<u32>,

    /// Stacking position, 0 = top (list index if omitted)
    #[serde(default)]
    pub position: Option<u8>,

    /// Write characteristic UUID (family default if omitted)
    #[serde(default)]
    pub write_channel: Option<String>,

    /// Notify characteristic UUID (family default if omitted)
    #[serde(default)]
    pub notify_channel: Option<String>,

    /// Accepts animation uploads (family default if omitted)
    #[serde(default)]
    pub animation: Option<bool>,
}

// Default value functions
fn default_family() -> String {
    "ipixel".to_string()
}

fn default_baud_rate() -> u32 {
    crate::link::DEFAULT_BAUD_RATE
}

fn default_max_write_len() -> usize {
    244
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    500
}

fn default_ack_timeout() -> u64 {
    2_000
}

fn default_max_window_retries() -> u32 {
    3
}

impl PanelConfig {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolves the unit list against the family defaults and validates it.
    pub fn resolve_units(&self, registry: &FamilyRegistry) -> Result<Vec<Unit>> {
        let family = registry.get(&self.family)?;

        if self.units.is_empty() {
            return Err(Error::Config("no units configured".to_string()));
        }
        if self.units.len() > MAX_UNITS {
            return Err(Error::Config(format!(
                "{} units configured, at most {} are addressable",
                self.units.len(),
                MAX_UNITS
            )));
        }

        let default_geometry = family.default_geometry();
        let mut addresses = HashSet::new();
        let mut positions = HashSet::new();
        let mut units = Vec::with_capacity(self.units.len());

        for (index, cfg) in self.units.iter().enumerate() {
            let address = cfg.address.trim();
            if address.is_empty() {
                return Err(Error::Config(format!("unit {} has an empty address", index)));
            }
            if !addresses.insert(address.to_ascii_uppercase()) {
                return Err(Error::Config(format!("duplicate unit address {}", address)));
            }

            let position = cfg.position.unwrap_or(index as u8);
            if !positions.insert(position) {
                return Err(Error::Config(format!("duplicate stacking position {}", position)));
            }

            let geometry = Geometry::new(
                cfg.width.unwrap_or(default_geometry.width),
                cfg.height.unwrap_or(default_geometry.height),
            );
            if geometry.width == 0 || geometry.height == 0 {
                return Err(Error::Config(format!(
                    "unit {} has empty geometry {}",
                    address, geometry
                )));
            }
            let frame_len = geometry.width as usize * geometry.height as usize * BYTES_PER_PIXEL;
            if frame_len > MAX_IMAGE_PAYLOAD {
                return Err(Error::Config(format!(
                    "unit {} is {}: {} bytes per image exceeds the {} byte frame limit",
                    address, geometry, frame_len, MAX_IMAGE_PAYLOAD
                )));
            }
            if family.fixed_geometry() && geometry != default_geometry {
                return Err(Error::Config(format!(
                    "family {} only supports {} units, {} is configured as {}",
                    family.name(),
                    default_geometry,
                    address,
                    geometry
                )));
            }

            let animation = cfg.animation.unwrap_or(family.supports_animation());
            if animation && !family.supports_animation() {
                return Err(Error::Config(format!(
                    "family {} does not support animation uploads",
                    family.name()
                )));
            }

            units.push(Unit {
                id: UnitId(position),
                address: address.to_string(),
                geometry,
                position,
                family: family.name().to_string(),
                write_channel: cfg
                    .write_channel
                    .clone()
                    .unwrap_or_else(|| family.default_write_channel().to_string()),
                notify_channel: cfg
                    .notify_channel
                    .clone()
                    .or_else(|| family.default_notify_channel().map(str::to_string)),
                animation,
            });
        }

        let width = units[0].width();
        if let Some(odd) = units.iter().find(|u| u.width() != width) {
            return Err(Error::Config(format!(
                "stacked units must share a width: {} is {} px, {} is {} px",
                units[0].address,
                width,
                odd.address,
                odd.width()
            )));
        }

        units.sort_by_key(|u| u.position);
        Ok(units)
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            family: default_family(),
            link: LinkConfig::default(),
            timing: Timing::default(),
            units: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_UNITS: &str = r#"
        family = "ipixel"

        [link]
        kind = "serial"

        [timing]
        ack_timeout_ms = 750
        max_window_retries = 5

        [[units]]
        address = "/dev/ttyUSB0"
        height = 20

        [[units]]
        address = "/dev/ttyUSB1"
        height = 20
    "#;

    #[test]
    fn test_parse_and_resolve() {
        let config = PanelConfig::from_toml_str(TWO_UNITS).unwrap();
        assert_eq!(config.link.kind, LinkKind::Serial);
        assert_eq!(config.link.max_write_len, 244);
        assert_eq!(config.timing.ack_timeout(), Duration::from_millis(750));
        assert_eq!(config.timing.max_window_retries, 5);
        assert_eq!(config.timing.reconnect_attempts, 3);

        let units = config.resolve_units(&FamilyRegistry::builtin()).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, UnitId(0));
        assert_eq!(units[1].id, UnitId(1));
        assert_eq!(units[0].geometry, Geometry::new(64, 20));
        assert!(units[0].animation);
        assert_eq!(units[0].write_channel, "0000fa02-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_duplicate_address() {
        let mut config = PanelConfig::from_toml_str(TWO_UNITS).unwrap();
        config.units[1].address = "/dev/ttyUSB0".to_string();
        let err = config.resolve_units(&FamilyRegistry::builtin()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_duplicate_position() {
        let mut config = PanelConfig::from_toml_str(TWO_UNITS).unwrap();
        config.units[0].position = Some(1);
        assert!(config.resolve_units(&FamilyRegistry::builtin()).is_err());
    }

    #[test]
    fn test_explicit_positions_reorder() {
        let mut config = PanelConfig::from_toml_str(TWO_UNITS).unwrap();
        config.units[0].position = Some(1);
        config.units[1].position = Some(0);
        let units = config.resolve_units(&FamilyRegistry::builtin()).unwrap();
        assert_eq!(units[0].address, "/dev/ttyUSB1");
        assert_eq!(units[1].id, UnitId(1));
    }

    #[test]
    fn test_width_mismatch() {
        let mut config = PanelConfig::from_toml_str(TWO_UNITS).unwrap();
        config.units[1].width = Some(32);
        assert!(config.resolve_units(&FamilyRegistry::builtin()).is_err());
    }

    #[test]
    fn test_fixed_geometry_family() {
        let mut config = PanelConfig::from_toml_str(TWO_UNITS).unwrap();
        config.family = "ipixel-20x64".to_string();
        let units = config.resolve_units(&FamilyRegistry::builtin()).unwrap();
        assert!(!units[0].animation);

        config.units[0].height = Some(16);
        assert!(config.resolve_units(&FamilyRegistry::builtin()).is_err());

        config.units[0].height = None;
        config.units[0].animation = Some(true);
        assert!(config.resolve_units(&FamilyRegistry::builtin()).is_err());
    }

    #[test]
    fn test_unit_too_large_for_one_frame() {
        let mut config = PanelConfig::from_toml_str(TWO_UNITS).unwrap();
        for unit in &mut config.units {
            unit.width = Some(160);
            unit.height = Some(160);
        }
        let err = config.resolve_units(&FamilyRegistry::builtin()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // 128 * 170 * 3 = 65,280 still fits.
        for unit in &mut config.units {
            unit.width = Some(128);
            unit.height = Some(170);
        }
        assert!(config.resolve_units(&FamilyRegistry::builtin()).is_ok());
    }

    #[test]
    fn test_no_units() {
        let config = PanelConfig::default();
        assert!(config.resolve_units(&FamilyRegistry::builtin()).is_err());
    }

    #[test]
    fn test_shipped_default_config() {
        let config = PanelConfig::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        let units = config.resolve_units(&FamilyRegistry::builtin()).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(config.link.kind, LinkKind::Serial);
    }

    #[test]
    fn test_unknown_family() {
        let mut config = PanelConfig::from_toml_str(TWO_UNITS).unwrap();
        config.family = "nope".to_string();
        assert!(config.resolve_units(&FamilyRegistry::builtin()).is_err());
    }
}
