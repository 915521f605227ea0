//! [`DfuTransport`] over `nusb`.

use super::{DfuTransport, UsbSelector};
use crate::error::{Error, Result};
use crate::protocol::dfu::Request;
use log::{debug, trace, warn};
use nusb::transfer::{Control, ControlType, Recipient};
use std::time::Duration;

/// Timeout of a single control transfer.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Timeout of descriptor reads.
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(2);

/// DfuSe bootloaders expose their memories on interface 0.
const DFU_INTERFACE: u8 = 0;

/// `bDescriptorType` of the DFU functional descriptor.
const DFU_FUNCTIONAL_DESCRIPTOR: u8 = 0x21;

/// US English, used when the device lists no languages.
const DEFAULT_LANGUAGE: u16 = 0x0409;

/// USB DFU device opened through `nusb`.
pub struct UsbTransport {
    device: nusb::Device,
    interface: Option<nusb::Interface>,
    name: String,
}

impl UsbTransport {
    /// Find the first device matching `selector` and claim its DFU interface.
    pub fn open(selector: &UsbSelector) -> Result<Self> {
        let info = nusb::list_devices()?
            .find(|d| selector.matches(d.vendor_id(), d.product_id(), d.serial_number()))
            .ok_or_else(|| Error::DeviceNotFound(format!("no USB device matches {selector}")))?;

        debug!(
            "Opening USB device {:04x}:{:04x} (serial {})",
            info.vendor_id(),
            info.product_id(),
            info.serial_number().unwrap_or("-")
        );

        let device = info.open()?;
        let interface = device.claim_interface(DFU_INTERFACE)?;

        Ok(Self {
            device,
            interface: Some(interface),
            name: selector.to_string(),
        })
    }

    fn interface(&self) -> Result<&nusb::Interface> {
        self.interface
            .as_ref()
            .ok_or_else(|| Error::DeviceNotFound(format!("{} is closed", self.name)))
    }

    fn control(request: Request, value: u16) -> Control {
        Control {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: request as u8,
            value,
            index: u16::from(DFU_INTERFACE),
        }
    }

    fn language(&self) -> u16 {
        match self
            .device
            .get_string_descriptor_supported_languages(DESCRIPTOR_TIMEOUT)
        {
            Ok(mut languages) => languages.next().unwrap_or(DEFAULT_LANGUAGE),
            Err(e) => {
                debug!("Language list unavailable ({e}), using {DEFAULT_LANGUAGE:#06x}");
                DEFAULT_LANGUAGE
            },
        }
    }

    /// Walk the class-specific descriptors following the DFU interface
    /// descriptor and pull `wTransferSize` out of the functional descriptor.
    fn functional_transfer_size(&self) -> Option<usize> {
        let configuration = self.device.active_configuration().ok()?;
        let interface = configuration
            .interfaces()
            .find(|i| i.interface_number() == DFU_INTERFACE)?;
        let alt = interface.alt_settings().next()?;

        let mut bytes = alt.descriptors().as_bytes();
        while let [len, kind, ..] = *bytes {
            let len = usize::from(len);
            if len < 2 || len > bytes.len() {
                break;
            }
            if kind == DFU_FUNCTIONAL_DESCRIPTOR && len >= 7 {
                return Some(usize::from(u16::from_le_bytes([bytes[5], bytes[6]])));
            }
            bytes = &bytes[len..];
        }
        None
    }
}

impl DfuTransport for UsbTransport {
    fn control_in(&mut self, request: Request, value: u16, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let n = self
            .interface()?
            .control_in_blocking(Self::control(request, value), &mut buf, DEFAULT_TIMEOUT)?;
        buf.truncate(n);
        trace!("{request:?}({value}) <- {n} bytes");
        Ok(buf)
    }

    fn control_out(&mut self, request: Request, value: u16, data: &[u8]) -> Result<()> {
        trace!("{request:?}({value}) -> {} bytes", data.len());
        self.interface()?
            .control_out_blocking(Self::control(request, value), data, DEFAULT_TIMEOUT)?;
        Ok(())
    }

    fn memory_descriptors(&mut self) -> Result<Vec<String>> {
        let language = self.language();
        let configuration = self
            .device
            .active_configuration()
            .map_err(|e| Error::Protocol(format!("no active configuration: {e}")))?;
        let interface = configuration
            .interfaces()
            .find(|i| i.interface_number() == DFU_INTERFACE)
            .ok_or_else(|| Error::UnsupportedChip("device has no DFU interface".into()))?;

        let mut descriptors = Vec::new();
        for alt in interface.alt_settings() {
            let Some(index) = alt.string_index() else {
                warn!("Alternate setting {} has no name", alt.alternate_setting());
                continue;
            };
            let text = self
                .device
                .get_string_descriptor(index, language, DESCRIPTOR_TIMEOUT)
                .map_err(|e| Error::Protocol(format!("interface string {index}: {e}")))?;
            descriptors.push(text);
        }
        Ok(descriptors)
    }

    fn transfer_size(&mut self) -> Option<usize> {
        self.functional_transfer_size()
    }

    fn close(&mut self) {
        if self.interface.take().is_some() {
            debug!("Released {}", self.name);
        }
    }
}
