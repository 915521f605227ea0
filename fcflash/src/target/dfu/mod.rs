//! DfuSe bootloader over USB.

mod flasher;
mod transport;
#[cfg(feature = "usb")]
mod usb;

use std::fmt;
use std::str::FromStr;

pub use flasher::DfuFlasher;
pub use transport::DfuTransport;
#[cfg(feature = "usb")]
pub use usb::UsbTransport;

/// USB vendor ID of the STM32 ROM bootloader.
pub const STM32_DFU_VID: u16 = 0x0483;

/// USB product ID of the STM32 ROM bootloader.
pub const STM32_DFU_PID: u16 = 0xDF11;

/// Picks one USB device: `VID:PID`, optionally `VID:PID@serial`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbSelector {
    /// Vendor ID.
    pub vendor_id: u16,
    /// Product ID.
    pub product_id: u16,
    /// Serial number string, when several devices share the IDs.
    pub serial: Option<String>,
}

impl UsbSelector {
    /// Whether a device with these properties is selected.
    pub fn matches(&self, vendor_id: u16, product_id: u16, serial: Option<&str>) -> bool {
        self.vendor_id == vendor_id
            && self.product_id == product_id
            && self
                .serial
                .as_deref()
                .is_none_or(|wanted| serial == Some(wanted))
    }
}

impl Default for UsbSelector {
    fn default() -> Self {
        Self {
            vendor_id: STM32_DFU_VID,
            product_id: STM32_DFU_PID,
            serial: None,
        }
    }
}

impl fmt::Display for UsbSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(serial) = &self.serial {
            write!(f, "@{serial}")?;
        }
        Ok(())
    }
}

impl FromStr for UsbSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ids, serial) = match s.split_once('@') {
            Some((ids, serial)) if !serial.is_empty() => (ids, Some(serial.to_string())),
            Some(_) => return Err(format!("empty serial number in \"{s}\"")),
            None => (s, None),
        };

        let (vid, pid) = ids
            .split_once(':')
            .ok_or_else(|| format!("expected VID:PID, got \"{s}\""))?;
        let parse = |text: &str| {
            let text = text.trim_start_matches("0x");
            u16::from_str_radix(text, 16).map_err(|e| format!("bad USB ID \"{text}\": {e}"))
        };

        Ok(Self {
            vendor_id: parse(vid)?,
            product_id: parse(pid)?,
            serial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        let selector: UsbSelector = "0483:df11".parse().unwrap();
        assert_eq!(selector, UsbSelector::default());

        let selector: UsbSelector = "2e3c:DF11@3276385A3436".parse().unwrap();
        assert_eq!(selector.vendor_id, 0x2E3C);
        assert_eq!(selector.serial.as_deref(), Some("3276385A3436"));
        assert_eq!(selector.to_string(), "2e3c:df11@3276385A3436");
    }

    #[test]
    fn test_parse_selector_rejects_garbage() {
        assert!("0483".parse::<UsbSelector>().is_err());
        assert!("0483:zz11".parse::<UsbSelector>().is_err());
        assert!("0483:df11@".parse::<UsbSelector>().is_err());
    }

    #[test]
    fn test_selector_matches_serial() {
        let any: UsbSelector = "0483:df11".parse().unwrap();
        assert!(any.matches(0x0483, 0xDF11, None));
        assert!(any.matches(0x0483, 0xDF11, Some("ABC")));

        let one: UsbSelector = "0483:df11@ABC".parse().unwrap();
        assert!(one.matches(0x0483, 0xDF11, Some("ABC")));
        assert!(!one.matches(0x0483, 0xDF11, Some("XYZ")));
        assert!(!one.matches(0x0483, 0xDF11, None));
    }
}
