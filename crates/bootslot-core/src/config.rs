//! Device profiles
//!
//! A profile tells the host which USB ids to look for, how the boot flash is
//! laid out and how patient to be with the device:
//!
//! ```toml
//! [device]
//! vendor_id = 0x1209
//! app_product_id = 0x5BF0
//! dfu_product_id = 0x5BF1
//!
//! [flash]
//! size = "16 MiB"
//! page_size = 256
//! erase_block = "64 KiB"
//! address_width = 3
//! slots = 4
//!
//! [timing]
//! detach_timeout_ms = 5000
//! poll_retries = 2000
//! ```
//!
//! Every `[timing]` key is optional.

use std::fmt;
use std::format;
use std::fs;
use std::path::Path;
use std::string::{String, ToString};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::geometry::FlashGeometry;
use crate::spi::AddressWidth;

/// Errors from loading a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The file could not be read
    Io(String),
    /// The TOML is malformed or has a bad value
    Parse(String),
    /// The values parse but describe an impossible flash
    Invalid(Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read profile: {}", e),
            Self::Parse(e) => write!(f, "failed to parse profile: {}", e),
            Self::Invalid(e) => write!(f, "invalid profile: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// USB ids of the device in both modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UsbIds {
    /// Vendor id (shared by both modes)
    #[serde(deserialize_with = "deserialize_hex_u16")]
    pub vendor_id: u16,
    /// Product id while the application runs
    #[serde(deserialize_with = "deserialize_hex_u16")]
    pub app_product_id: u16,
    /// Product id in DFU mode
    #[serde(deserialize_with = "deserialize_hex_u16")]
    pub dfu_product_id: u16,
}

impl Default for UsbIds {
    fn default() -> Self {
        Self {
            vendor_id: 0x1209,
            app_product_id: 0x5BF0,
            dfu_product_id: 0x5BF1,
        }
    }
}

/// Boot flash layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FlashSection {
    /// Total size
    #[serde(deserialize_with = "deserialize_size")]
    pub size: u32,
    /// Program page size
    #[serde(deserialize_with = "deserialize_size")]
    pub page_size: u32,
    /// Erase block size
    #[serde(deserialize_with = "deserialize_size")]
    pub erase_block: u32,
    /// Address bytes on the wire (3 or 4)
    #[serde(default = "default_address_width")]
    pub address_width: u8,
    /// Number of slots
    pub slots: usize,
}

fn default_address_width() -> u8 {
    3
}

impl Default for FlashSection {
    fn default() -> Self {
        let g = FlashGeometry::default();
        Self {
            size: g.total_size,
            page_size: g.page_size,
            erase_block: g.erase_block_size,
            address_width: g.address_width.bytes(),
            slots: 4,
        }
    }
}

/// Host-side timeouts and retry bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// How long to wait for the device to come back after DETACH
    pub detach_timeout_ms: u64,
    /// Shortest pause between GET_STATUS polls while the device is busy
    pub poll_interval_ms: u64,
    /// Longest pause honoured when the device asks for more (`bwPollTimeout`)
    pub max_poll_wait_ms: u64,
    /// GET_STATUS polls allowed per chunk
    pub poll_retries: u32,
    /// Timeout of a single control transfer
    pub control_timeout_ms: u64,
    /// Pause between bus scans while waiting for a device
    pub enumerate_interval_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            detach_timeout_ms: 5000,
            poll_interval_ms: 2,
            max_poll_wait_ms: 1000,
            poll_retries: 5000,
            control_timeout_ms: 1000,
            enumerate_interval_ms: 100,
        }
    }
}

impl Timing {
    /// Detach timeout as a duration
    pub fn detach_timeout(&self) -> Duration {
        Duration::from_millis(self.detach_timeout_ms)
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Poll wait cap as a duration
    pub fn max_poll_wait(&self) -> Duration {
        Duration::from_millis(self.max_poll_wait_ms)
    }

    /// Control transfer timeout as a duration
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    /// Enumeration interval as a duration
    pub fn enumerate_interval(&self) -> Duration {
        Duration::from_millis(self.enumerate_interval_ms)
    }
}

/// A complete device profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeviceProfile {
    /// USB ids
    #[serde(default)]
    pub device: UsbIds,
    /// Flash layout
    #[serde(default)]
    pub flash: FlashSection,
    /// Timeouts
    #[serde(default)]
    pub timing: Timing,
}

impl DeviceProfile {
    /// Load a profile from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse a profile from a TOML string and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let profile: DeviceProfile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        profile.geometry()?;
        if profile.flash.slots == 0 {
            return Err(ConfigError::Invalid(Error::InvalidSlotCount));
        }
        Ok(profile)
    }

    /// Flash geometry described by the `[flash]` section
    pub fn geometry(&self) -> Result<FlashGeometry, ConfigError> {
        let width = match AddressWidth::from_bytes(self.flash.address_width) {
            Some(w @ (AddressWidth::ThreeByte | AddressWidth::FourByte)) => w,
            _ => {
                return Err(ConfigError::Parse(format!(
                    "address_width must be 3 or 4, got {}",
                    self.flash.address_width
                )))
            }
        };
        FlashGeometry::new(
            self.flash.size,
            self.flash.page_size,
            self.flash.erase_block,
            width,
        )
        .map_err(ConfigError::Invalid)
    }
}

/// Deserialize a u16 that can be hex (0x...) or decimal
fn deserialize_hex_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let n = deserialize_with(deserializer, parse_number)?;
    u16::try_from(n).map_err(|_| serde::de::Error::custom(format!("0x{:X} does not fit 16 bits", n)))
}

/// Deserialize a size that can be a number or a string like "64 KiB"
fn deserialize_size<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_with(deserializer, parse_size)
}

fn deserialize_with<'de, D>(deserializer: D, parse: fn(&str) -> Result<u32, String>) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    // Try to deserialize as a number first, then as a string
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Int(u32),
        Str(String),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Str(s) => parse(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a number that can be hex (0x...) or decimal
fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex: {}", e))
    } else {
        s.parse().map_err(|e| format!("invalid number: {}", e))
    }
}

/// Parse a size string like "16 MiB", "4KiB" or "0x1000"
pub fn parse_size(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if let Ok(n) = parse_number(s) {
        return Ok(n);
    }

    let lower = s.to_lowercase();
    let (num_str, multiplier) = if let Some(n) = lower.strip_suffix("mib") {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("kib") {
        (n.trim(), 1024)
    } else if let Some(n) = lower.strip_suffix('b') {
        (n.trim(), 1)
    } else {
        return Err(format!("invalid size: {}", s));
    };

    let num: u32 = num_str.parse().map_err(|_| format!("invalid size: {}", s))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("16 MiB"), Ok(16 * 1024 * 1024));
        assert_eq!(parse_size("4KiB"), Ok(4096));
        assert_eq!(parse_size("0x1000"), Ok(4096));
        assert_eq!(parse_size("256"), Ok(256));
        assert!(parse_size("lots").is_err());
        assert!(parse_size("8192 MiB").is_err());
    }

    #[test]
    fn test_full_profile() {
        let profile = DeviceProfile::from_toml_str(
            r#"
            [device]
            vendor_id = 0x1d50
            app_product_id = "0x6130"
            dfu_product_id = 24881

            [flash]
            size = "32 MiB"
            page_size = 256
            erase_block = "4 KiB"
            address_width = 4
            slots = 8

            [timing]
            detach_timeout_ms = 250
            max_poll_wait_ms = 50
            poll_retries = 10
            "#,
        )
        .unwrap();

        assert_eq!(profile.device.vendor_id, 0x1d50);
        assert_eq!(profile.device.app_product_id, 0x6130);
        assert_eq!(profile.device.dfu_product_id, 0x6131);
        assert_eq!(profile.flash.slots, 8);
        assert_eq!(profile.timing.detach_timeout(), Duration::from_millis(250));
        assert_eq!(profile.timing.poll_retries, 10);
        assert_eq!(profile.timing.max_poll_wait(), Duration::from_millis(50));
        // untouched keys keep their defaults
        assert_eq!(profile.timing.control_timeout_ms, Timing::default().control_timeout_ms);

        let g = profile.geometry().unwrap();
        assert_eq!(g.total_size, 32 * 1024 * 1024);
        assert_eq!(g.erase_block_size, 4096);
        assert_eq!(g.address_width, AddressWidth::FourByte);
    }

    #[test]
    fn test_example_profile() {
        let profile = DeviceProfile::from_toml_str(include_str!("../../../profiles/example.toml")).unwrap();
        assert_eq!(profile, DeviceProfile::default());
    }

    #[test]
    fn test_empty_profile_uses_defaults() {
        let profile = DeviceProfile::from_toml_str("").unwrap();
        assert_eq!(profile, DeviceProfile::default());
        assert_eq!(profile.geometry().unwrap(), FlashGeometry::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_width = "[flash]\nsize = \"1 MiB\"\npage_size = 256\nerase_block = 4096\naddress_width = 2\nslots = 2\n";
        assert!(matches!(DeviceProfile::from_toml_str(bad_width), Err(ConfigError::Parse(_))));

        let bad_geometry = "[flash]\nsize = \"1 MiB\"\npage_size = 300\nerase_block = 4096\nslots = 2\n";
        assert_eq!(
            DeviceProfile::from_toml_str(bad_geometry),
            Err(ConfigError::Invalid(Error::InvalidGeometry))
        );

        let big_pid = "[device]\nvendor_id = 1\napp_product_id = 0x10000\ndfu_product_id = 2\n";
        assert!(matches!(DeviceProfile::from_toml_str(big_pid), Err(ConfigError::Parse(_))));
    }
}
