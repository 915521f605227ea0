use crate::error::Result;
use crate::protocol::dfu::Request;
use std::thread;
use std::time::Duration;

/// Class requests on the DFU interface, plus the descriptor queries the
/// driver needs.
///
/// Implemented by [`super::UsbTransport`] for real devices; tests drive the
/// driver through a simulated device instead.
pub trait DfuTransport {
    /// Device-to-host class request returning at most `length` bytes.
    fn control_in(&mut self, request: Request, value: u16, length: usize) -> Result<Vec<u8>>;

    /// Host-to-device class request.
    fn control_out(&mut self, request: Request, value: u16, data: &[u8]) -> Result<()>;

    /// Interface strings of every alternate setting, one memory region each.
    fn memory_descriptors(&mut self) -> Result<Vec<String>>;

    /// `wTransferSize` of the DFU functional descriptor, if readable.
    fn transfer_size(&mut self) -> Option<usize>;

    /// Block for `duration` (device poll timeouts and settle delays).
    fn wait(&mut self, duration: Duration) {
        thread::sleep(duration);
    }

    /// Release the interface. Closing twice is a no-op.
    fn close(&mut self);
}
