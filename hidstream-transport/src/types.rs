//! Common types for the transport layer

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A raw HID report: input, output or feature.
///
/// Framing (report ID prefixing) belongs to the transport; everything above
/// treats the bytes as opaque.
pub type Report = Vec<u8>;

/// Static identifying metadata for a HID device
///
/// Returned by enumeration and by `DeviceHandle::device_info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Transport-assigned unique path (opaque, platform-specific)
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    /// Device release number in BCD
    pub release: u16,
    /// Interface number, `-1` when the platform does not report one
    pub interface: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_page: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<u16>,
}

impl DeviceDescriptor {
    /// Check whether this descriptor passes an optional VID/PID filter
    pub fn matches(&self, vendor_id: Option<u16>, product_id: Option<u16>) -> bool {
        vendor_id.map_or(true, |vid| vid == self.vendor_id)
            && product_id.map_or(true, |pid| pid == self.product_id)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(product) = &self.product {
            write!(f, " {product}")?;
        }
        write!(f, " ({})", self.path)
    }
}

/// Which device to open
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceSelector {
    /// Transport path as returned by enumeration
    Path(String),
    /// First device matching the vendor/product pair (and serial, if given)
    Ids {
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
    },
}

impl DeviceSelector {
    pub fn path(path: impl Into<String>) -> Self {
        Self::Path(path.into())
    }

    pub fn ids(vendor_id: u16, product_id: u16) -> Self {
        Self::Ids {
            vendor_id,
            product_id,
            serial_number: None,
        }
    }

    pub fn with_serial(vendor_id: u16, product_id: u16, serial: impl Into<String>) -> Self {
        Self::Ids {
            vendor_id,
            product_id,
            serial_number: Some(serial.into()),
        }
    }

    /// Whether a descriptor is the device this selector names
    pub fn matches(&self, desc: &DeviceDescriptor) -> bool {
        match self {
            Self::Path(path) => desc.path == *path,
            Self::Ids {
                vendor_id,
                product_id,
                serial_number,
            } => {
                desc.vendor_id == *vendor_id
                    && desc.product_id == *product_id
                    && serial_number
                        .as_ref()
                        .map_or(true, |s| desc.serial_number.as_deref() == Some(s.as_str()))
            }
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{path}"),
            Self::Ids {
                vendor_id,
                product_id,
                serial_number: None,
            } => write!(f, "{vendor_id:04x}:{product_id:04x}"),
            Self::Ids {
                vendor_id,
                product_id,
                serial_number: Some(serial),
            } => write!(f, "{vendor_id:04x}:{product_id:04x}:{serial}"),
        }
    }
}

fn parse_hex_id(s: &str) -> Option<u16> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() || digits.len() > 4 {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

/// Parses `VID:PID`, `VID:PID:SERIAL` (hex ids) or a path.
///
/// A `path:` prefix forces the remainder to be taken as a path, for paths
/// that would otherwise look like an id pair.
impl FromStr for DeviceSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("path:") {
            return Ok(Self::Path(path.to_string()));
        }

        let mut parts = s.splitn(3, ':');
        let vid = parts.next().and_then(parse_hex_id);
        let pid = parts.next().and_then(parse_hex_id);
        match (vid, pid) {
            (Some(vendor_id), Some(product_id)) => Ok(Self::Ids {
                vendor_id,
                product_id,
                serial_number: parts.next().filter(|s| !s.is_empty()).map(str::to_string),
            }),
            _ => Ok(Self::Path(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(vid: u16, pid: u16, serial: Option<&str>) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: vid,
            product_id: pid,
            path: "mock0".into(),
            serial_number: serial.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_selector() {
        assert_eq!(
            "046d:c52b".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::ids(0x046d, 0xc52b)
        );
        assert_eq!(
            "0x16c0:0x0486:ABC123".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::with_serial(0x16c0, 0x0486, "ABC123")
        );
        assert_eq!(
            "/dev/hidraw3".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::path("/dev/hidraw3")
        );
        // macOS style path with a colon
        assert_eq!(
            "IOService:/AppleACPIPlatformExpert/XHC1"
                .parse::<DeviceSelector>()
                .unwrap(),
            DeviceSelector::path("IOService:/AppleACPIPlatformExpert/XHC1")
        );
        assert_eq!(
            "path:0001:0004:00".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::path("0001:0004:00")
        );
    }

    #[test]
    fn test_selector_matches() {
        let d = desc(0x1234, 0x5678, Some("SN1"));
        assert!(DeviceSelector::path("mock0").matches(&d));
        assert!(!DeviceSelector::path("mock1").matches(&d));
        assert!(DeviceSelector::ids(0x1234, 0x5678).matches(&d));
        assert!(DeviceSelector::with_serial(0x1234, 0x5678, "SN1").matches(&d));
        assert!(!DeviceSelector::with_serial(0x1234, 0x5678, "SN2").matches(&d));
        let unnamed = desc(0x1234, 0x5678, None);
        assert!(!DeviceSelector::with_serial(0x1234, 0x5678, "SN1").matches(&unnamed));
    }

    #[test]
    fn test_descriptor_filter() {
        let d = desc(0x1234, 0x5678, None);
        assert!(d.matches(None, None));
        assert!(d.matches(Some(0x1234), None));
        assert!(d.matches(Some(0x1234), Some(0x5678)));
        assert!(!d.matches(Some(0x1234), Some(0x0001)));
        assert!(!d.matches(Some(0x4321), None));
    }

    #[test]
    fn test_descriptor_json_omits_missing_fields() {
        let d = DeviceDescriptor {
            vendor_id: 1,
            product_id: 2,
            path: "p".into(),
            product: Some("Pad".into()),
            release: 0x0100,
            interface: 0,
            usage_page: Some(1),
            ..Default::default()
        };
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["vendorId"], 1);
        assert_eq!(json["usagePage"], 1);
        assert_eq!(json["product"], "Pad");
        assert!(json.get("serialNumber").is_none());
        assert!(json.get("usage").is_none());
    }
}
