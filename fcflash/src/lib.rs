//! # fcflash
//!
//! A library for flashing firmware onto STM32 based flight controllers.
//!
//! This crate provides the flashing engine behind the `fcflash` CLI:
//!
//! - Intel-HEX image parsing
//! - Custom defaults (configuration text) insertion into an image
//! - STM32 USART ROM bootloader protocol (AN3155)
//! - USB DFU with the ST DfuSe extensions (AN3156)
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//! - **USB** (default): DFU control transfers via the `nusb` crate
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `usb` (default): USB DFU support
//!
//! ## Example
//!
//! ```rust,no_run
//! use fcflash::{SerialOptions, flash_via_serial, insert_config, parse_image};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let text = std::fs::read_to_string("firmware.hex")?;
//!     let mut image = parse_image(&text)?;
//!     insert_config(&mut image, "set gyro_lpf1_static_hz = 250\n")?;
//!
//!     flash_via_serial(
//!         "/dev/ttyACM0",
//!         256_000,
//!         &image,
//!         SerialOptions::default(),
//!         &mut |event| println!("{event:?}"),
//!         |result| println!("done: {}", result.is_ok()),
//!     )?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Drivers poll it
/// between protocol steps.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

/// Parse Intel-HEX text into an image.
pub fn parse_image(text: &str) -> Result<FirmwareImage> {
    image::hex::parse(text)
}

/// Splice custom defaults into `image`.
///
/// Returns `false` when the image has no custom defaults area or already
/// carries inserted defaults.
pub fn insert_config(image: &mut FirmwareImage, config: &str) -> Result<bool> {
    image::config::insert_config(image, config)
}

/// Flash `image` through the STM32 ROM bootloader on a serial port.
///
/// `on_done` runs exactly once with the outcome, including when the port
/// cannot be opened.
#[cfg(feature = "native")]
pub fn flash_via_serial<'a>(
    port: &str,
    baud: u32,
    image: &FirmwareImage,
    options: SerialOptions,
    events: &mut dyn FnMut(FlashEvent),
    on_done: impl FnOnce(&Result<()>) + 'a,
) -> Result<()> {
    FlashTarget::Serial {
        port: port.to_string(),
        baud,
        options,
    }
    .flash(image, events, on_done)
}

/// Flash `image` through a DfuSe bootloader.
#[cfg(feature = "usb")]
pub fn flash_via_usb_dfu<'a>(
    device: &UsbSelector,
    image: &FirmwareImage,
    options: DfuOptions,
    events: &mut dyn FnMut(FlashEvent),
    on_done: impl FnOnce(&Result<()>) + 'a,
) -> Result<()> {
    FlashTarget::UsbDfu {
        device: device.clone(),
        options,
    }
    .flash(image, events, on_done)
}

/// Command a DfuSe device out of DFU mode.
#[cfg(feature = "usb")]
pub fn leave_dfu<'a>(
    device: &UsbSelector,
    events: &mut dyn FnMut(FlashEvent),
    on_done: impl FnOnce(&Result<()>) + 'a,
) -> Result<()> {
    FlashTarget::UsbDfu {
        device: device.clone(),
        options: DfuOptions {
            exit_dfu_only: true,
            ..DfuOptions::default()
        },
    }
    .leave(events, on_done)
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
#[cfg(any(feature = "native", feature = "usb"))]
pub use target::FlashTarget;
#[cfg(feature = "usb")]
pub use target::dfu::UsbTransport;
pub use {
    error::{Error, Result},
    image::{DataBlock, FirmwareImage, config::DefaultsArea},
    port::{Port, SerialConfig},
    target::{
        DfuOptions, DfuStage, FlashEvent, FlashSession, Flasher, Notice, SerialOptions,
        SerialStage, Stage,
        dfu::{DfuFlasher, DfuTransport, UsbSelector},
        stm32::Stm32Flasher,
    },
};
