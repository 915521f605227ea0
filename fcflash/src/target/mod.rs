//! Flashing targets.
//!
//! Two independent drivers program a [`FirmwareImage`]:
//!
//! - [`stm32::Stm32Flasher`] talks to the STM32 ROM bootloader over a UART.
//! - [`dfu::DfuFlasher`] talks to a DfuSe bootloader over USB control
//!   transfers.
//!
//! Both implement [`Flasher`] and report through [`FlashEvent`]s. A
//! [`FlashTarget`] describes where the device is and builds the matching
//! driver; a [`FlashSession`] wraps one driver for one attempt and guarantees
//! that the completion callback runs exactly once.
//!
//! ```text
//!                 +-------------+
//!                 | FlashTarget |
//!                 +------+------+
//!                        | create_flasher()
//!           +------------+------------+
//!           v                         v
//!   Stm32Flasher<P: Port>     DfuFlasher<T: DfuTransport>
//!           |                         |
//!           +------------+------------+
//!                        v
//!                  FlashSession  --> on_done(&Result<()>)  (once)
//! ```

pub mod dfu;
pub mod stm32;

use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use log::debug;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cancellation hook polled by the drivers between steps.
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Cancellation hook backed by [`crate::is_interrupted_requested`].
pub(crate) fn global_cancel_check() -> CancelCheck {
    Arc::new(crate::is_interrupted_requested)
}

/// Serial bootloader session stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialStage {
    /// Nothing sent yet.
    Idle,
    /// Sending sync bytes.
    Handshaking,
    /// GET command.
    QueryingVersion,
    /// GET_ID command.
    QueryingChipId,
    /// Erasing flash pages.
    Erasing,
    /// Writing image blocks.
    Writing,
    /// Reading back image blocks.
    Verifying,
    /// Jumping to the application.
    Executing,
    /// Releasing the port.
    Disconnecting,
    /// Port released.
    Disconnected,
}

impl SerialStage {
    /// Short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Handshaking => "handshaking",
            Self::QueryingVersion => "querying version",
            Self::QueryingChipId => "querying chip id",
            Self::Erasing => "erasing",
            Self::Writing => "writing",
            Self::Verifying => "verifying",
            Self::Executing => "executing",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

/// USB DFU session stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuStage {
    /// Reading memory descriptors.
    ProbingChip,
    /// Checking option bytes for read protection.
    ReadingOptionBytes,
    /// Running the read-unprotect sequence.
    Unprotecting,
    /// Erasing pages.
    Erasing,
    /// Downloading image blocks.
    Writing,
    /// Uploading image blocks.
    Verifying,
    /// Leaving DFU mode.
    Leaving,
    /// Interface released.
    Idle,
}

impl DfuStage {
    /// Short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::ProbingChip => "probing chip",
            Self::ReadingOptionBytes => "reading option bytes",
            Self::Unprotecting => "unprotecting",
            Self::Erasing => "erasing",
            Self::Writing => "writing",
            Self::Verifying => "verifying",
            Self::Leaving => "leaving",
            Self::Idle => "idle",
        }
    }
}

/// Stage of either driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Serial bootloader stage.
    Serial(SerialStage),
    /// USB DFU stage.
    Dfu(DfuStage),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(stage) => f.write_str(stage.name()),
            Self::Dfu(stage) => f.write_str(stage.name()),
        }
    }
}

/// Situations worth telling the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Serial bootloader protocol version, e.g. `3.1`.
    BootloaderVersion(String),
    /// Chip family or memory region name.
    ChipDetected(String),
    /// Programmable flash size in bytes.
    FlashSize(usize),
    /// Option bytes are readable.
    NotReadProtected,
    /// Option bytes are not readable; unprotect follows.
    ReadProtected,
    /// Unprotect issued; the board needs a power cycle.
    UnprotectPowerCycle,
    /// Erase finished.
    EraseDone {
        /// Bytes covered by the erased pages.
        bytes: usize,
    },
    /// The image is larger than the internal flash region.
    ImageLargerThanFlash {
        /// Image payload size.
        image: usize,
        /// Region size.
        flash: usize,
    },
    /// Negotiated DFU transfer size.
    TransferSize(usize),
    /// Readback matched the image.
    VerifyOk,
}

/// Event emitted while a driver runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// Entered a stage.
    Stage(Stage),
    /// Progress within the current stage, `current` out of `total`.
    Progress {
        /// Units done.
        current: usize,
        /// Units overall.
        total: usize,
    },
    /// User-facing notice.
    Notice(Notice),
}

/// Common interface of both drivers.
pub trait Flasher {
    /// Program, verify and start `image`.
    ///
    /// The image is only borrowed; it is never modified during a session.
    fn flash(&mut self, image: &FirmwareImage, events: &mut dyn FnMut(FlashEvent)) -> Result<()>;

    /// Start the application without programming anything.
    fn leave(&mut self, events: &mut dyn FnMut(FlashEvent)) -> Result<()>;

    /// Release the transport. Calling it twice is a no-op.
    fn close(&mut self);
}

/// Options of the serial bootloader driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialOptions {
    /// Mass erase instead of erasing the pages the image covers.
    pub erase_chip: bool,
    /// Skip the MSP reboot request; the board is already in the bootloader.
    pub no_reboot: bool,
    /// Baud rate of the running firmware, used for the reboot request.
    pub reboot_baud: u32,
    /// Sync bytes sent before giving up on the handshake.
    pub handshake_attempts: u32,
    /// Longest stretch without traffic before the session times out.
    pub watchdog: Duration,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            erase_chip: false,
            no_reboot: false,
            reboot_baud: 115_200,
            handshake_attempts: 5,
            watchdog: Duration::from_secs(2),
        }
    }
}

/// Options of the USB DFU driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DfuOptions {
    /// Erase every page of the flash region.
    pub erase_chip: bool,
    /// Only command the device out of DFU mode.
    pub exit_dfu_only: bool,
}

/// Where the device is and how to talk to it.
#[cfg(any(feature = "native", feature = "usb"))]
#[derive(Debug, Clone)]
pub enum FlashTarget {
    /// STM32 ROM bootloader on a serial port.
    #[cfg(feature = "native")]
    Serial {
        /// Port name, e.g. `/dev/ttyACM0`.
        port: String,
        /// Bootloader baud rate.
        baud: u32,
        /// Driver options.
        options: SerialOptions,
    },
    /// DfuSe bootloader on USB.
    #[cfg(feature = "usb")]
    UsbDfu {
        /// Device selector.
        device: dfu::UsbSelector,
        /// Driver options.
        options: DfuOptions,
    },
}

#[cfg(any(feature = "native", feature = "usb"))]
impl FlashTarget {
    /// Open the transport and build the matching driver.
    pub fn create_flasher(&self) -> Result<Box<dyn Flasher>> {
        match self {
            #[cfg(feature = "native")]
            Self::Serial {
                port,
                baud,
                options,
            } => {
                let flasher = stm32::Stm32Flasher::open(port, *baud, *options)?;
                Ok(Box::new(flasher))
            },
            #[cfg(feature = "usb")]
            Self::UsbDfu { device, options } => {
                let transport = dfu::UsbTransport::open(device)?;
                Ok(Box::new(dfu::DfuFlasher::new(transport, *options)))
            },
        }
    }

    /// Flash `image`, reporting the outcome to `on_done` exactly once.
    pub fn flash<'a>(
        &self,
        image: &FirmwareImage,
        events: &mut dyn FnMut(FlashEvent),
        on_done: impl FnOnce(&Result<()>) + 'a,
    ) -> Result<()> {
        match self.create_flasher() {
            Ok(flasher) => FlashSession::new(flasher).on_done(on_done).flash(image, events),
            Err(e) => {
                let result = Err(e);
                on_done(&result);
                result
            },
        }
    }

    /// Start the application, reporting the outcome to `on_done` exactly once.
    pub fn leave<'a>(
        &self,
        events: &mut dyn FnMut(FlashEvent),
        on_done: impl FnOnce(&Result<()>) + 'a,
    ) -> Result<()> {
        match self.create_flasher() {
            Ok(flasher) => FlashSession::new(flasher).on_done(on_done).leave(events),
            Err(e) => {
                let result = Err(e);
                on_done(&result);
                result
            },
        }
    }
}

type DoneCallback<'a> = Box<dyn FnOnce(&Result<()>) + 'a>;

/// One flashing attempt over one driver.
///
/// The driver is closed and the completion callback fired from a single
/// cleanup path: after [`FlashSession::flash`] or [`FlashSession::leave`]
/// returns, or on drop with [`Error::Cancelled`] if neither ran.
pub struct FlashSession<'a> {
    flasher: Box<dyn Flasher + 'a>,
    on_done: Option<DoneCallback<'a>>,
}

impl<'a> FlashSession<'a> {
    /// Wrap a driver.
    pub fn new(flasher: Box<dyn Flasher + 'a>) -> Self {
        Self {
            flasher,
            on_done: None,
        }
    }

    /// Register the completion callback.
    #[must_use]
    pub fn on_done(mut self, callback: impl FnOnce(&Result<()>) + 'a) -> Self {
        self.on_done = Some(Box::new(callback));
        self
    }

    /// Run [`Flasher::flash`] and clean up.
    pub fn flash(mut self, image: &FirmwareImage, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        let result = self.flasher.flash(image, events);
        self.finish(&result);
        result
    }

    /// Run [`Flasher::leave`] and clean up.
    pub fn leave(mut self, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        let result = self.flasher.leave(events);
        self.finish(&result);
        result
    }

    fn finish(&mut self, result: &Result<()>) {
        self.flasher.close();
        if let Some(callback) = self.on_done.take() {
            debug!("Session finished: {}", if result.is_ok() { "ok" } else { "failed" });
            callback(result);
        }
    }
}

impl Drop for FlashSession<'_> {
    fn drop(&mut self) {
        if self.on_done.is_some() {
            self.finish(&Err(Error::Cancelled));
        } else {
            self.flasher.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct FakeFlasher {
        fail: bool,
        closes: Rc<Cell<u32>>,
    }

    impl Flasher for FakeFlasher {
        fn flash(&mut self, _image: &FirmwareImage, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
            events(FlashEvent::Stage(Stage::Serial(SerialStage::Writing)));
            if self.fail {
                Err(Error::Protocol("boom".into()))
            } else {
                Ok(())
            }
        }

        fn leave(&mut self, _events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {
            self.closes.set(self.closes.get() + 1);
        }
    }

    fn session(fail: bool, calls: &Rc<Cell<u32>>, closes: &Rc<Cell<u32>>) -> FlashSession<'static> {
        let calls = Rc::clone(calls);
        FlashSession::new(Box::new(FakeFlasher {
            fail,
            closes: Rc::clone(closes),
        }))
        .on_done(move |_| calls.set(calls.get() + 1))
    }

    #[test]
    fn test_on_done_fires_once_on_success() {
        let calls = Rc::new(Cell::new(0));
        let closes = Rc::new(Cell::new(0));

        let mut stages = Vec::new();
        let result = session(false, &calls, &closes).flash(&FirmwareImage::default(), &mut |e| stages.push(e));

        assert!(result.is_ok());
        assert_eq!(calls.get(), 1);
        assert!(closes.get() >= 1);
        assert_eq!(stages.len(), 1);
    }

    #[test]
    fn test_on_done_fires_once_on_failure() {
        let calls = Rc::new(Cell::new(0));
        let closes = Rc::new(Cell::new(0));

        let result = session(true, &calls, &closes).flash(&FirmwareImage::default(), &mut |_| {});

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_dropped_session_reports_cancelled() {
        let outcome = Rc::new(Cell::new(None));
        let closes = Rc::new(Cell::new(0));

        {
            let outcome = Rc::clone(&outcome);
            let _session = FlashSession::new(Box::new(FakeFlasher {
                fail: false,
                closes: Rc::clone(&closes),
            }))
            .on_done(move |result: &Result<()>| {
                outcome.set(Some(matches!(result, Err(Error::Cancelled))));
            });
        }

        assert_eq!(outcome.get(), Some(true));
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Serial(SerialStage::QueryingChipId).to_string(), "querying chip id");
        assert_eq!(Stage::Dfu(DfuStage::ReadingOptionBytes).to_string(), "reading option bytes");
    }

    #[test]
    fn test_serial_option_defaults() {
        let options = SerialOptions::default();
        assert_eq!(options.handshake_attempts, 5);
        assert_eq!(options.watchdog, Duration::from_secs(2));
        assert!(!options.erase_chip);
    }
}
