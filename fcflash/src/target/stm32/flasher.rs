//! STM32 ROM bootloader driver.
//!
//! ## Session
//!
//! ```text
//! handshake -> GET -> GET_ID -> erase -> write -> verify -> GO
//!   0x7F       ver     pid      0x43/   0x31     0x11     0x21
//!                               0x44
//! ```
//!
//! Every step waits for the device's reply before the next command goes out.
//! A watchdog ends the session with [`Error::Timeout`] when no byte has been
//! sent or received for [`SerialOptions::watchdog`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use fcflash::image::FirmwareImage;
//! use fcflash::target::{Flasher, SerialOptions};
//! use fcflash::target::stm32::Stm32Flasher;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("firmware.hex")?;
//!     let mut flasher = Stm32Flasher::open("/dev/ttyACM0", 256_000, SerialOptions::default())?;
//!
//!     flasher.flash(&image, &mut |event| println!("{event:?}"))?;
//!     flasher.close();
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::port::Port;
use crate::protocol::stm32::{
    self, ACK, BootloaderInfo, Command, EraseMode, FLASH_BASE, Geometry, MAX_TRANSFER, NACK, SYNC,
};
use crate::target::{
    CancelCheck, FlashEvent, Flasher, Notice, SerialOptions, SerialStage, Stage,
    global_cancel_check,
};
use log::{debug, info, trace, warn};
use std::io::{self, ErrorKind};
use std::time::{Duration, Instant};

/// Gap between sync bytes during the handshake.
const HANDSHAKE_INTERVAL: Duration = Duration::from_millis(250);

/// Read timeout of a single port read; the watchdog decides when to give up.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// How long to listen for the optional reply after GO.
const GO_REPLY_WAIT: Duration = Duration::from_millis(100);

struct Watchdog {
    interval: Duration,
    last_activity: Instant,
}

impl Watchdog {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_activity: Instant::now(),
        }
    }

    fn feed(&mut self) {
        self.last_activity = Instant::now();
    }

    fn expired(&self) -> bool {
        self.last_activity.elapsed() >= self.interval
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

/// STM32 ROM bootloader flasher.
///
/// Generic over the port type `P`, so the protocol can run against a real
/// serial port or a simulated device.
pub struct Stm32Flasher<P: Port> {
    port: P,
    options: SerialOptions,
    stage: SerialStage,
    watchdog: Watchdog,
    cancel: CancelCheck,
    erase_mode: EraseMode,
    closed: bool,
}

/// Erase payload and the number of bytes it clears.
#[allow(clippy::cast_possible_truncation)]
fn erase_frame(mode: EraseMode, pages: usize, geometry: Geometry, erase_chip: bool) -> (Vec<u8>, usize) {
    if erase_chip {
        info!("Erasing entire flash");
        (mode.mass_erase_frame(), geometry.flash_size)
    } else if pages > mode.max_pages() {
        warn!("{pages} pages exceed a single {mode:?} erase, erasing entire flash");
        (mode.mass_erase_frame(), geometry.flash_size)
    } else {
        info!("Erasing {pages} page(s) of {} bytes", geometry.page_size);
        (mode.pages_frame(pages as u16), pages * geometry.page_size)
    }
}

impl<P: Port> Stm32Flasher<P> {
    /// Create a flasher over an already configured port.
    pub fn new(port: P, options: SerialOptions) -> Self {
        Self {
            port,
            options,
            stage: SerialStage::Idle,
            watchdog: Watchdog::new(options.watchdog),
            cancel: global_cancel_check(),
            erase_mode: EraseMode::Legacy,
            closed: false,
        }
    }

    /// Replace the cancellation hook (defaults to the global interrupt checker).
    #[must_use]
    pub fn with_cancel_check(mut self, cancel: CancelCheck) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current stage.
    pub fn stage(&self) -> SerialStage {
        self.stage
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    fn set_stage(&mut self, stage: SerialStage, events: &mut dyn FnMut(FlashEvent)) {
        debug!("Stage: {} -> {}", self.stage.name(), stage.name());
        self.stage = stage;
        events(FlashEvent::Stage(Stage::Serial(stage)));
    }

    fn check_cancelled(&self) -> Result<()> {
        if (self.cancel)() {
            warn!("Cancelled during {}", self.stage.name());
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("-> {bytes:02X?}");
        self.port.write_all_bytes(bytes)?;
        self.watchdog.feed();
        Ok(())
    }

    /// Wait up to `window` for one byte, without consulting the watchdog.
    fn poll_byte(&mut self, window: Duration) -> Result<Option<u8>> {
        let deadline = Instant::now() + window;
        let mut buf = [0u8; 1];

        while Instant::now() < deadline {
            match self.port.read(&mut buf) {
                Ok(1) => {
                    self.watchdog.feed();
                    trace!("<- {:02X}", buf[0]);
                    return Ok(Some(buf[0]));
                },
                Ok(_) => {},
                Err(e) if is_timeout(&e) => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(None)
    }

    fn read_exact(&mut self, len: usize, context: &str) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            match self.port.read(&mut buf[filled..]) {
                Ok(n) if n > 0 => {
                    filled += n;
                    self.watchdog.feed();
                },
                Ok(_) => {},
                Err(e) if is_timeout(&e) => {},
                Err(e) => return Err(Error::Io(e)),
            }

            if filled < len && self.watchdog.expired() {
                return Err(Error::Timeout(format!(
                    "no reply to {context} within {} ms ({filled}/{len} bytes)",
                    self.watchdog.interval.as_millis()
                )));
            }
        }

        trace!("<- {buf:02X?}");
        Ok(buf)
    }

    fn read_byte(&mut self, context: &str) -> Result<u8> {
        Ok(self.read_exact(1, context)?[0])
    }

    fn expect_ack(&mut self, context: &'static str) -> Result<()> {
        match self.read_byte(context)? {
            ACK => Ok(()),
            NACK => {
                debug!("NACK for {context}");
                Err(Error::Nack { context })
            },
            actual => Err(Error::UnexpectedResponse {
                context,
                expected: ACK,
                actual,
            }),
        }
    }

    fn command(&mut self, command: Command) -> Result<()> {
        self.send(&command.frame())?;
        self.expect_ack(command.name())
    }

    fn handshake(&mut self, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.set_stage(SerialStage::Handshaking, events);
        self.port.clear_buffers()?;

        let attempts = self.options.handshake_attempts.max(1);
        for attempt in 1..=attempts {
            self.check_cancelled()?;
            self.send(&[SYNC])?;

            match self.poll_byte(HANDSHAKE_INTERVAL)? {
                Some(reply @ (ACK | NACK | SYNC)) => {
                    debug!("Sync reply {reply:#04x} on attempt {attempt}");
                    info!("Bootloader synchronised on {}", self.port.name());
                    return Ok(());
                },
                Some(other) => {
                    return Err(Error::HandshakeFailed(format!(
                        "unexpected reply {other:#04x} to sync byte"
                    )));
                },
                None => debug!("No reply to sync byte (attempt {attempt}/{attempts})"),
            }
        }

        Err(Error::HandshakeFailed(format!("no reply after {attempts} attempts")))
    }

    fn get(&mut self, events: &mut dyn FnMut(FlashEvent)) -> Result<BootloaderInfo> {
        self.set_stage(SerialStage::QueryingVersion, events);
        self.command(Command::Get)?;

        let count = self.read_byte("GET")?;
        let reply = self.read_exact(usize::from(count) + 1, "GET")?;
        self.expect_ack("GET reply")?;

        let info = BootloaderInfo::from_reply(&reply)
            .ok_or_else(|| Error::Protocol("empty GET reply".into()))?;

        info!(
            "Bootloader version {}, {:?} erase",
            info.version_string(),
            info.erase_mode()
        );
        debug!("Supported commands: {:02X?}", info.commands);
        events(FlashEvent::Notice(Notice::BootloaderVersion(info.version_string())));
        Ok(info)
    }

    fn get_id(
        &mut self,
        image: &FirmwareImage,
        events: &mut dyn FnMut(FlashEvent),
    ) -> Result<Geometry> {
        self.set_stage(SerialStage::QueryingChipId, events);
        self.command(Command::GetId)?;

        let count = self.read_byte("GET_ID")?;
        let reply = self.read_exact(usize::from(count) + 1, "GET_ID")?;
        self.expect_ack("GET_ID reply")?;

        let [hi, lo, ..] = *reply.as_slice() else {
            return Err(Error::Protocol(format!("GET_ID returned {} byte(s)", reply.len())));
        };
        let pid = u16::from_be_bytes([hi, lo]);

        let chip = stm32::lookup_chip(pid)
            .ok_or_else(|| Error::UnsupportedChip(format!("unknown product ID {pid:#05x}")))?;
        info!("Chip: {} ({pid:#05x})", chip.name);
        events(FlashEvent::Notice(Notice::ChipDetected(chip.name.to_string())));

        let geometry = chip.geometry.ok_or_else(|| {
            Error::UnsupportedChip(format!("no flash layout known for {} ({pid:#05x})", chip.name))
        })?;
        events(FlashEvent::Notice(Notice::FlashSize(geometry.flash_size)));

        if image.bytes_total() >= geometry.flash_size {
            return Err(Error::ImageTooLarge {
                image: image.bytes_total(),
                flash: geometry.flash_size,
            });
        }

        let flash_end = u64::from(FLASH_BASE) + geometry.flash_size as u64;
        if let Some(block) = image.blocks().iter().find(|b| {
            b.address < FLASH_BASE || u64::from(b.address) + b.len() as u64 > flash_end
        }) {
            return Err(Error::AddressOutOfRange {
                address: block.address,
                length: block.len(),
            });
        }

        Ok(geometry)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn erase(
        &mut self,
        image: &FirmwareImage,
        geometry: Geometry,
        events: &mut dyn FnMut(FlashEvent),
    ) -> Result<()> {
        self.check_cancelled()?;
        self.set_stage(SerialStage::Erasing, events);

        let mode = self.erase_mode;
        let used = image
            .end_address()
            .map_or(0, |end| end.saturating_sub(FLASH_BASE)) as usize;
        let pages = used.div_ceil(geometry.page_size);

        let (frame, erased) = erase_frame(mode, pages, geometry, self.options.erase_chip);

        self.command(mode.command())?;
        self.send(&frame)?;
        self.expect_ack("erase pages")?;

        events(FlashEvent::Notice(Notice::EraseDone { bytes: erased }));
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&mut self, image: &FirmwareImage, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.set_stage(SerialStage::Writing, events);

        let total = image.bytes_total() * 2;
        let mut written = 0;

        for block in image.blocks() {
            debug!("Writing {} bytes at {:#010x}", block.len(), block.address);

            for (index, window) in block.data.chunks(MAX_TRANSFER).enumerate() {
                self.check_cancelled()?;
                let address = block.address + (index * MAX_TRANSFER) as u32;

                self.command(Command::WriteMemory)?;
                self.send(&stm32::address_frame(address))?;
                self.expect_ack("write address")?;
                self.send(&stm32::write_payload(window))?;
                self.expect_ack("write data")?;

                written += window.len();
                events(FlashEvent::Progress {
                    current: written,
                    total,
                });
            }
        }

        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn verify(&mut self, image: &FirmwareImage, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.set_stage(SerialStage::Verifying, events);

        let total = image.bytes_total() * 2;
        let mut verified = image.bytes_total();

        for block in image.blocks() {
            for (index, window) in block.data.chunks(MAX_TRANSFER).enumerate() {
                self.check_cancelled()?;
                let address = block.address + (index * MAX_TRANSFER) as u32;

                self.command(Command::ReadMemory)?;
                self.send(&stm32::address_frame(address))?;
                self.expect_ack("read address")?;
                self.send(&stm32::read_length_frame(window.len()))?;
                self.expect_ack("read length")?;
                let readback = self.read_exact(window.len(), "read memory")?;

                if let Some(pos) = window.iter().zip(&readback).position(|(a, b)| a != b) {
                    let address = address + pos as u32;
                    warn!("Verify mismatch at {address:#010x}");
                    return Err(Error::VerifyMismatch {
                        address,
                        detail: format!("expected {:#04x}, read {:#04x}", window[pos], readback[pos]),
                    });
                }

                verified += window.len();
                events(FlashEvent::Progress {
                    current: verified,
                    total,
                });
            }
        }

        info!("Verified {} bytes", image.bytes_total());
        events(FlashEvent::Notice(Notice::VerifyOk));
        Ok(())
    }

    fn go(&mut self, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.check_cancelled()?;
        self.set_stage(SerialStage::Executing, events);
        self.send_go()
    }

    /// Jump to the application after a cancelled write, ignoring failures.
    fn go_best_effort(&mut self) {
        debug!("Starting application after cancel");
        if let Err(e) = self.send_go() {
            debug!("GO after cancel failed: {e}");
        }
    }

    fn send_go(&mut self) -> Result<()> {
        self.command(Command::Go)?;
        self.send(&stm32::address_frame(FLASH_BASE))?;

        match self.poll_byte(GO_REPLY_WAIT)? {
            Some(ACK) => debug!("GO address acknowledged"),
            Some(other) => debug!("Reply {other:#04x} after GO"),
            None => debug!("No reply after GO"),
        }

        info!("Started application at {FLASH_BASE:#010x}");
        Ok(())
    }

    fn program(&mut self, image: &FirmwareImage, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.write(image, events)?;
        self.verify(image, events)?;
        self.go(events)
    }

    fn start_session(&mut self) -> Result<()> {
        self.port.set_timeout(POLL_TIMEOUT)?;
        self.watchdog.feed();
        Ok(())
    }
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{Error, Result, SerialOptions, Stm32Flasher, debug, info, warn};
    use crate::port::{NativePort, Port, SerialConfig};
    use crate::protocol::msp::{self, RebootMode};
    use std::thread;
    use std::time::Duration;

    /// Time for the firmware to reset into the ROM bootloader.
    const REBOOT_DELAY: Duration = Duration::from_millis(1500);

    impl Stm32Flasher<NativePort> {
        /// Open `port_name` for the bootloader, first rebooting the running
        /// firmware through MSP unless [`SerialOptions::no_reboot`] is set.
        pub fn open(port_name: &str, baud: u32, options: SerialOptions) -> Result<Self> {
            if !options.no_reboot {
                Self::request_bootloader(port_name, options.reboot_baud)?;
            }
            Self::open_with_retry(port_name, baud, options)
        }

        fn request_bootloader(port_name: &str, reboot_baud: u32) -> Result<()> {
            info!("Requesting ROM bootloader on {port_name} at {reboot_baud} baud");

            let mut port = NativePort::open(&SerialConfig::new(port_name, reboot_baud))?;
            port.write_all_bytes(&msp::reboot(RebootMode::BootloaderRom))?;
            port.close()?;

            thread::sleep(REBOOT_DELAY);
            Ok(())
        }

        /// Open serial port with retry mechanism.
        fn open_with_retry(port_name: &str, baud: u32, options: SerialOptions) -> Result<Self> {
            const MAX_OPEN_PORT_ATTEMPTS: usize = 3;
            const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

            let mut last_error = None;

            for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
                let config = SerialConfig::bootloader(port_name, baud);
                match NativePort::open(&config) {
                    Ok(port) => {
                        if attempt > 1 {
                            debug!("Port opened on attempt {attempt}");
                        }
                        return Ok(Self::new(port, options));
                    },
                    Err(e) => {
                        warn!(
                            "Failed to open port {port_name} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}"
                        );
                        last_error = Some(e);

                        if attempt < MAX_OPEN_PORT_ATTEMPTS {
                            thread::sleep(OPEN_RETRY_DELAY);
                        }
                    },
                }
            }

            Err(last_error.unwrap_or_else(|| Error::DeviceNotFound(port_name.to_string())))
        }
    }
}

impl<P: Port> Flasher for Stm32Flasher<P> {
    fn flash(&mut self, image: &FirmwareImage, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        if image.is_empty() {
            return Err(Error::CorruptImage("image holds no data".into()));
        }

        self.start_session()?;
        self.handshake(events)?;

        let info = self.get(events)?;
        self.erase_mode = info.erase_mode();

        let geometry = self.get_id(image, events)?;
        self.erase(image, geometry, events)?;

        let result = self.program(image, events);
        if matches!(result, Err(Error::Cancelled)) {
            self.go_best_effort();
        }
        result?;

        info!("Flashing complete!");
        Ok(())
    }

    fn leave(&mut self, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.start_session()?;
        self.handshake(events)?;
        self.go(events)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }

        self.stage = SerialStage::Disconnecting;
        if let Err(e) = self.port.close() {
            warn!("Failed to close {}: {e}", self.port.name());
        }
        self.stage = SerialStage::Disconnected;
        self.closed = true;
        debug!("Serial session disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::DataBlock;
    use crate::image::hex::test_support::encode_blocks;
    use crate::protocol::stm32::xor_checksum;
    use crate::target::FlashSession;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const FLASH_SIZE: usize = 0x4_0000;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Command,
        Address(u8),
        ReadLength(u32),
        WriteData(u32),
        EraseArgs(u8),
    }

    /// Simulated ROM bootloader with a flash array.
    struct Device {
        flash: Vec<u8>,
        replies: VecDeque<u8>,
        pending: Vec<u8>,
        phase: Phase,
        pid: u16,
        extended: bool,
        silent: bool,
        nack: Option<u8>,
        mute_on: Option<u8>,
        muted: bool,
        corrupt_read: Option<usize>,
        reads: usize,
        erase_args: Vec<Vec<u8>>,
        go_address: Option<u32>,
        received: usize,
        closes: usize,
    }

    impl Device {
        fn new(pid: u16) -> Self {
            Self {
                flash: vec![0xFF; FLASH_SIZE],
                replies: VecDeque::new(),
                pending: Vec::new(),
                phase: Phase::Command,
                pid,
                extended: false,
                silent: false,
                nack: None,
                mute_on: None,
                muted: false,
                corrupt_read: None,
                reads: 0,
                erase_args: Vec::new(),
                go_address: None,
                received: 0,
                closes: 0,
            }
        }

        fn offset(address: u32) -> usize {
            (address - FLASH_BASE) as usize
        }

        fn feed(&mut self, byte: u8) {
            self.received += 1;
            if self.silent || self.muted {
                return;
            }
            self.pending.push(byte);

            match self.phase {
                Phase::Command => {
                    if self.pending == [SYNC] {
                        self.pending.clear();
                        self.replies.push_back(ACK);
                        return;
                    }
                    if self.pending.len() < 2 {
                        return;
                    }
                    let (op, check) = (self.pending[0], self.pending[1]);
                    self.pending.clear();
                    assert_eq!(check, !op, "bad command complement");

                    if self.mute_on == Some(op) {
                        self.muted = true;
                        return;
                    }
                    if self.nack == Some(op) {
                        self.replies.push_back(NACK);
                        return;
                    }
                    self.replies.push_back(ACK);

                    match op {
                        0x00 => {
                            let mut commands = vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31];
                            commands.push(if self.extended { 0x44 } else { 0x43 });
                            self.replies.push_back(commands.len() as u8);
                            self.replies.push_back(0x31);
                            self.replies.extend(commands);
                            self.replies.push_back(ACK);
                        },
                        0x02 => {
                            let [hi, lo] = self.pid.to_be_bytes();
                            self.replies.extend([0x01, hi, lo, ACK]);
                        },
                        0x11 | 0x21 | 0x31 => self.phase = Phase::Address(op),
                        0x43 | 0x44 => self.phase = Phase::EraseArgs(op),
                        other => panic!("unexpected opcode {other:#04x}"),
                    }
                },
                Phase::Address(op) => {
                    if self.pending.len() < 5 {
                        return;
                    }
                    assert_eq!(xor_checksum(&self.pending), 0, "bad address checksum");
                    let address = u32::from_be_bytes([
                        self.pending[0],
                        self.pending[1],
                        self.pending[2],
                        self.pending[3],
                    ]);
                    self.pending.clear();
                    self.replies.push_back(ACK);

                    self.phase = match op {
                        0x11 => Phase::ReadLength(address),
                        0x31 => Phase::WriteData(address),
                        _ => {
                            self.go_address = Some(address);
                            Phase::Command
                        },
                    };
                },
                Phase::ReadLength(address) => {
                    if self.pending.len() < 2 {
                        return;
                    }
                    assert_eq!(self.pending[1], !self.pending[0]);
                    let len = usize::from(self.pending[0]) + 1;
                    self.pending.clear();
                    self.replies.push_back(ACK);

                    let start = Self::offset(address);
                    let mut data = self.flash[start..start + len].to_vec();
                    if self.corrupt_read == Some(self.reads) {
                        data[0] ^= 0xFF;
                    }
                    self.reads += 1;
                    self.replies.extend(data);
                    self.phase = Phase::Command;
                },
                Phase::WriteData(address) => {
                    let need = usize::from(self.pending[0]) + 3;
                    if self.pending.len() < need {
                        return;
                    }
                    assert_eq!(xor_checksum(&self.pending), 0, "bad data checksum");
                    let start = Self::offset(address);
                    let data = &self.pending[1..need - 1];
                    self.flash[start..start + data.len()].copy_from_slice(data);
                    self.pending.clear();
                    self.replies.push_back(ACK);
                    self.phase = Phase::Command;
                },
                Phase::EraseArgs(op) => {
                    let need = if op == 0x43 {
                        if self.pending[0] == 0xFF {
                            2
                        } else {
                            usize::from(self.pending[0]) + 3
                        }
                    } else {
                        if self.pending.len() < 2 {
                            return;
                        }
                        let count = u16::from_be_bytes([self.pending[0], self.pending[1]]);
                        if count == 0xFFFF {
                            3
                        } else {
                            2 + 2 * (usize::from(count) + 1) + 1
                        }
                    };
                    if self.pending.len() < need {
                        return;
                    }
                    self.erase_args.push(std::mem::take(&mut self.pending));
                    self.replies.push_back(ACK);
                    self.phase = Phase::Command;
                },
            }
        }
    }

    struct MockBootloader {
        device: Arc<Mutex<Device>>,
    }

    impl io::Read for MockBootloader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut device = self.device.lock().unwrap();
            if device.replies.is_empty() {
                return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(device.replies.len());
            for b in buf.iter_mut().take(n) {
                *b = device.replies.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl io::Write for MockBootloader {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut device = self.device.lock().unwrap();
            for &byte in buf {
                device.feed(byte);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockBootloader {
        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn timeout(&self) -> Duration {
            POLL_TIMEOUT
        }

        fn baud_rate(&self) -> u32 {
            115_200
        }

        fn clear_buffers(&mut self) -> Result<()> {
            self.device.lock().unwrap().replies.clear();
            Ok(())
        }

        fn name(&self) -> &str {
            "mock"
        }

        fn close(&mut self) -> Result<()> {
            self.device.lock().unwrap().closes += 1;
            Ok(())
        }
    }

    fn test_options() -> SerialOptions {
        SerialOptions {
            no_reboot: true,
            handshake_attempts: 2,
            watchdog: Duration::from_millis(200),
            ..SerialOptions::default()
        }
    }

    fn flasher(device: &Arc<Mutex<Device>>, options: SerialOptions) -> Stm32Flasher<MockBootloader> {
        let port = MockBootloader {
            device: Arc::clone(device),
        };
        Stm32Flasher::new(port, options).with_cancel_check(Arc::new(|| false))
    }

    fn three_block_image() -> FirmwareImage {
        let blocks: Vec<DataBlock> = [0x0800_0000u32, 0x0800_0400, 0x0800_0800]
            .iter()
            .enumerate()
            .map(|(i, &address)| {
                let data = (0..256).map(|b| (b as u8).wrapping_mul(3).wrapping_add(i as u8)).collect();
                DataBlock::new(address, data)
            })
            .collect();
        FirmwareImage::from_hex(&encode_blocks(&blocks)).unwrap()
    }

    fn stages(events: &[FlashEvent]) -> Vec<SerialStage> {
        events
            .iter()
            .filter_map(|e| match e {
                FlashEvent::Stage(Stage::Serial(stage)) => Some(*stage),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_flash_end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(Mutex::new(Device::new(0x410)));
        let image = three_block_image();
        let done = Arc::new(AtomicUsize::new(0));

        let mut events = Vec::new();
        let counter = Arc::clone(&done);
        let result = FlashSession::new(Box::new(flasher(&device, test_options())))
            .on_done(move |result: &Result<()>| {
                assert!(result.is_ok());
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .flash(&image, &mut |e| events.push(e));

        assert!(result.is_ok(), "{result:?}");
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(
            stages(&events),
            vec![
                SerialStage::Handshaking,
                SerialStage::QueryingVersion,
                SerialStage::QueryingChipId,
                SerialStage::Erasing,
                SerialStage::Writing,
                SerialStage::Verifying,
                SerialStage::Executing,
            ]
        );
        assert!(events.contains(&FlashEvent::Notice(Notice::VerifyOk)));
        assert!(events.contains(&FlashEvent::Progress {
            current: 768 * 2,
            total: 768 * 2,
        }));

        let device = device.lock().unwrap();
        for block in image.blocks() {
            let start = Device::offset(block.address);
            assert_eq!(&device.flash[start..start + block.len()], block.data.as_slice());
        }
        // 0x900 bytes used, 1 KiB pages
        assert_eq!(device.erase_args, vec![EraseMode::Legacy.pages_frame(3)]);
        assert_eq!(device.go_address, Some(FLASH_BASE));
        assert_eq!(device.closes, 1);
    }

    #[test]
    fn test_verify_mismatch_fails_once() {
        let device = Arc::new(Mutex::new(Device::new(0x410)));
        device.lock().unwrap().corrupt_read = Some(1);
        let done = Arc::new(AtomicUsize::new(0));

        let mut events = Vec::new();
        let counter = Arc::clone(&done);
        let result = FlashSession::new(Box::new(flasher(&device, test_options())))
            .on_done(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .flash(&three_block_image(), &mut |e| events.push(e));

        match result {
            Err(Error::VerifyMismatch { address, .. }) => assert_eq!(address, 0x0800_0400),
            other => panic!("expected VerifyMismatch, got {other:?}"),
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!stages(&events).contains(&SerialStage::Executing));
        assert_eq!(device.lock().unwrap().go_address, None);
        assert_eq!(device.lock().unwrap().closes, 1);
    }

    #[test]
    fn test_extended_mass_erase() {
        let device = Arc::new(Mutex::new(Device::new(0x422)));
        device.lock().unwrap().extended = true;

        let options = SerialOptions {
            erase_chip: true,
            ..test_options()
        };
        let mut flasher = flasher(&device, options);
        flasher.flash(&three_block_image(), &mut |_| {}).unwrap();

        assert_eq!(device.lock().unwrap().erase_args, vec![vec![0xFF, 0xFF, 0x00]]);
        assert_eq!(flasher.stage(), SerialStage::Executing);

        flasher.close();
        assert_eq!(flasher.stage(), SerialStage::Disconnected);
    }

    #[test]
    fn test_legacy_erase_never_sends_page_list_after_global_byte() {
        let geometry = Geometry {
            flash_size: 0x10_0000,
            page_size: 1024,
        };

        let (frame, erased) = erase_frame(EraseMode::Legacy, 255, geometry, false);
        assert_eq!(frame.len(), 1 + 255 + 1);
        assert_eq!(frame[0], 0xFE);
        assert_eq!(erased, 255 * 1024);

        for pages in [256, 300] {
            let (frame, erased) = erase_frame(EraseMode::Legacy, pages, geometry, false);
            assert_eq!(frame, EraseMode::Legacy.mass_erase_frame(), "{pages} pages");
            assert_eq!(erased, geometry.flash_size);
        }
    }

    #[test]
    fn test_extended_page_erase() {
        let device = Arc::new(Mutex::new(Device::new(0x414)));
        device.lock().unwrap().extended = true;

        flasher(&device, test_options())
            .flash(&three_block_image(), &mut |_| {})
            .unwrap();

        // 0x900 bytes used, 2 KiB pages
        assert_eq!(device.lock().unwrap().erase_args, vec![EraseMode::Extended.pages_frame(2)]);
    }

    #[test]
    fn test_nack_aborts() {
        let device = Arc::new(Mutex::new(Device::new(0x410)));
        device.lock().unwrap().nack = Some(Command::WriteMemory as u8);

        let err = flasher(&device, test_options())
            .flash(&three_block_image(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Nack { context: "WRITE_MEMORY" }), "{err:?}");
    }

    #[test]
    fn test_handshake_gives_up() {
        let device = Arc::new(Mutex::new(Device::new(0x410)));
        device.lock().unwrap().silent = true;

        let err = flasher(&device, test_options())
            .flash(&three_block_image(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed(_)), "{err:?}");
        assert_eq!(device.lock().unwrap().received, 2);
    }

    #[test]
    fn test_unknown_and_unprogrammable_chips() {
        for pid in [0x999, 0x413] {
            let device = Arc::new(Mutex::new(Device::new(pid)));
            let err = flasher(&device, test_options())
                .flash(&three_block_image(), &mut |_| {})
                .unwrap_err();
            assert!(matches!(err, Error::UnsupportedChip(_)), "{pid:#x}: {err:?}");
            assert!(device.lock().unwrap().erase_args.is_empty());
        }
    }

    #[test]
    fn test_image_must_be_smaller_than_flash() {
        let device = Arc::new(Mutex::new(Device::new(0x410)));
        let image = FirmwareImage::from_blocks(vec![DataBlock::new(FLASH_BASE, vec![0; 0x2_0000])]);

        let err = flasher(&device, test_options())
            .flash(&image, &mut |_| {})
            .unwrap_err();
        assert!(
            matches!(err, Error::ImageTooLarge { image: 0x2_0000, flash: 0x2_0000 }),
            "{err:?}"
        );
        assert!(device.lock().unwrap().erase_args.is_empty());
    }

    #[test]
    fn test_watchdog_times_out_silent_device() {
        let device = Arc::new(Mutex::new(Device::new(0x410)));
        device.lock().unwrap().mute_on = Some(Command::GetId as u8);

        let options = SerialOptions {
            watchdog: Duration::from_millis(100),
            ..test_options()
        };
        let err = flasher(&device, options)
            .flash(&three_block_image(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err:?}");
    }

    #[test]
    fn test_cancel_before_handshake() {
        let device = Arc::new(Mutex::new(Device::new(0x410)));

        let err = flasher(&device, test_options())
            .with_cancel_check(Arc::new(|| true))
            .flash(&three_block_image(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(device.lock().unwrap().received, 0);
    }

    #[test]
    fn test_cancel_during_write_starts_application() {
        let device = Arc::new(Mutex::new(Device::new(0x410)));
        let cancelled = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&cancelled);
        let mut flasher =
            flasher(&device, test_options()).with_cancel_check(Arc::new(move || flag.load(Ordering::SeqCst)));

        let mut events = Vec::new();
        let err = flasher
            .flash(&three_block_image(), &mut |e| {
                if e == FlashEvent::Stage(Stage::Serial(SerialStage::Writing)) {
                    cancelled.store(true, Ordering::SeqCst);
                }
                events.push(e);
            })
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled), "{err:?}");
        assert!(!stages(&events).contains(&SerialStage::Verifying));
        let device = device.lock().unwrap();
        assert_eq!(device.erase_args.len(), 1);
        assert_eq!(device.go_address, Some(FLASH_BASE));
    }

    #[test]
    fn test_leave_sends_go() {
        let device = Arc::new(Mutex::new(Device::new(0x410)));
        flasher(&device, test_options()).leave(&mut |_| {}).unwrap();
        assert_eq!(device.lock().unwrap().go_address, Some(FLASH_BASE));
    }
}
