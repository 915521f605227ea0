//! DfuSe flashing session.
//!
//! ```text
//! probe layout --+-- internal flash --> option bytes --+--> erase --> write --> verify --> leave
//!                |                        |            |
//!                |                        +-- protected --> unprotect (power cycle)
//!                +-- external flash ---------------------^
//! ```
//!
//! Every state-changing DNLOAD is followed by GETSTATUS. The device answers
//! `dfuDNBUSY` with a poll timeout; the driver waits that long and polls
//! again before sending anything else.

use super::DfuTransport;
use crate::error::{Error, Result};
use crate::image::{DataBlock, FirmwareImage};
use crate::protocol::dfu::{
    self, ChipLayout, DEFAULT_TRANSFER_SIZE, FIRST_DATA_BLOCK, MemoryRegion, Request,
    STATUS_LENGTH, State, Status, StatusReport,
};
use crate::target::{
    CancelCheck, DfuOptions, DfuStage, FlashEvent, Flasher, Notice, Stage, global_cancel_check,
};
use log::{debug, error, info, trace, warn};
use std::time::Duration;

/// Address handed to the leave request when the image gives none.
const DEFAULT_LEAVE_ADDRESS: u32 = 0x0800_0000;

/// CLRSTATUS rounds before giving up on reaching dfuIDLE.
const MAX_CLEAR_ROUNDS: usize = 10;

/// Extra wait on top of the poll timeout while the chip mass-erases itself.
const UNPROTECT_ERASE_WAIT: Duration = Duration::from_secs(20);

/// Settle time before checking that the device dropped off.
const UNPROTECT_SETTLE_WAIT: Duration = Duration::from_secs(2);

const PROGRESS_TICK: Duration = Duration::from_secs(1);

fn unexpected(context: &'static str, expected: State, report: &StatusReport) -> Error {
    Error::UnexpectedState {
        context,
        expected: expected.name(),
        actual: report.state.name(),
        status: report.status.name(),
    }
}

/// Chunks of `block` paired with their DNLOAD/UPLOAD block numbers.
fn numbered_chunks(block: &DataBlock, transfer_size: usize) -> Result<impl Iterator<Item = (u16, &[u8])>> {
    let chunks = block.len().div_ceil(transfer_size);
    if chunks > usize::from(u16::MAX - FIRST_DATA_BLOCK) {
        return Err(Error::Protocol(format!(
            "block at {:#010x} needs {chunks} transfers",
            block.address
        )));
    }
    Ok((FIRST_DATA_BLOCK..).zip(block.data.chunks(transfer_size)))
}

fn leave_address(image: &FirmwareImage) -> u32 {
    image.lowest_address().unwrap_or(DEFAULT_LEAVE_ADDRESS)
}

/// DfuSe flasher, generic over the transport.
pub struct DfuFlasher<T: DfuTransport> {
    transport: T,
    options: DfuOptions,
    stage: DfuStage,
    cancel: CancelCheck,
    transfer_size: usize,
    closed: bool,
}

impl<T: DfuTransport> DfuFlasher<T> {
    /// Create a flasher over an opened transport.
    pub fn new(transport: T, options: DfuOptions) -> Self {
        Self {
            transport,
            options,
            stage: DfuStage::Idle,
            cancel: global_cancel_check(),
            transfer_size: DEFAULT_TRANSFER_SIZE,
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
    pub fn stage(&self) -> DfuStage {
        self.stage
    }

    fn set_stage(&mut self, stage: DfuStage, events: &mut dyn FnMut(FlashEvent)) {
        debug!("Stage: {} -> {}", self.stage.name(), stage.name());
        self.stage = stage;
        events(FlashEvent::Stage(Stage::Dfu(stage)));
    }

    fn check_cancelled(&self) -> Result<()> {
        if (self.cancel)() {
            warn!("Cancelled during {}", self.stage.name());
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn get_status(&mut self) -> Result<StatusReport> {
        let data = self
            .transport
            .control_in(Request::GetStatus, 0, STATUS_LENGTH)?;
        let report = StatusReport::parse(&data)?;
        trace!(
            "GETSTATUS {:02X?}: {} / {}, poll {} ms",
            data,
            report.state.name(),
            report.status.name(),
            report.poll_timeout.as_millis()
        );
        Ok(report)
    }

    /// Poll, clearing errors and aborted transfers, until the device is in
    /// dfuIDLE.
    fn clear_status(&mut self) -> Result<()> {
        for _ in 0..MAX_CLEAR_ROUNDS {
            let report = self.get_status()?;
            if report.state == State::DfuIdle {
                return Ok(());
            }

            debug!("Clearing status from {}", report.state.name());
            self.transport.wait(report.poll_timeout);
            self.transport.control_out(Request::ClrStatus, 0, &[])?;
        }

        Err(Error::Timeout(format!(
            "device did not return to dfuIDLE after {MAX_CLEAR_ROUNDS} CLRSTATUS rounds"
        )))
    }

    /// DNLOAD a DfuSe command and wait for the device to execute it.
    ///
    /// Returns the report that follows the busy period.
    fn execute(&mut self, context: &'static str, value: u16, data: &[u8]) -> Result<StatusReport> {
        self.transport.control_out(Request::Dnload, value, data)?;

        let report = self.get_status()?;
        if report.state != State::DnBusy {
            return Err(unexpected(context, State::DnBusy, &report));
        }

        self.transport.wait(report.poll_timeout);
        self.get_status()
    }

    /// Set the address pointer. With `abort` a device that does not return
    /// to dfuDNLOAD-IDLE fails the call; without it the report is handed
    /// back for inspection.
    fn load_address(&mut self, address: u32, abort: bool) -> Result<StatusReport> {
        debug!("Set address {address:#010x}");
        let report = self.execute("set address", 0, &dfu::set_address_command(address))?;

        if report.state != State::DnloadIdle && abort {
            return Err(unexpected("set address", State::DnloadIdle, &report));
        }
        Ok(report)
    }

    fn probe_layout(&mut self, events: &mut dyn FnMut(FlashEvent)) -> Result<ChipLayout> {
        self.set_stage(DfuStage::ProbingChip, events);

        let descriptors = self.transport.memory_descriptors()?;
        for descriptor in &descriptors {
            debug!("Memory descriptor: {descriptor}");
        }
        let layout = ChipLayout::from_descriptors(&descriptors);

        self.transfer_size = self
            .transport
            .transfer_size()
            .filter(|size| *size > 0)
            .unwrap_or_else(|| {
                warn!("Transfer size unavailable, using {DEFAULT_TRANSFER_SIZE}");
                DEFAULT_TRANSFER_SIZE
            });
        info!("Transfer size: {}", self.transfer_size);
        events(FlashEvent::Notice(Notice::TransferSize(self.transfer_size)));

        Ok(layout)
    }

    /// Returns whether the option bytes are read protected.
    fn read_protected(
        &mut self,
        option_bytes: &MemoryRegion,
        events: &mut dyn FnMut(FlashEvent),
    ) -> Result<bool> {
        self.set_stage(DfuStage::ReadingOptionBytes, events);
        self.clear_status()?;

        let report = self.load_address(option_bytes.start_address, false)?;
        match (report.state, report.status) {
            (State::Error, Status::ErrVendor) => {
                debug!("Option bytes address rejected with errVENDOR");
                Ok(true)
            },
            (State::DnloadIdle, _) => {
                self.clear_status()?;

                let length = option_bytes.total_size as usize;
                // A failed upload aborts: only errVENDOR on the address means protection.
                let data = self
                    .transport
                    .control_in(Request::Upload, FIRST_DATA_BLOCK, length)
                    .inspect_err(|e| warn!("Option bytes upload failed: {e}"))?;

                let report = self.get_status()?;
                Ok(!(report.state == State::UploadIdle && data.len() == length))
            },
            _ => Err(unexpected("option bytes address", State::DnloadIdle, &report)),
        }
    }

    /// Remove read protection. The chip mass-erases and drops off the bus,
    /// so this always ends the session with an error.
    #[allow(clippy::cast_possible_truncation)]
    fn unprotect(&mut self, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.set_stage(DfuStage::Unprotecting, events);
        self.clear_status()?;

        warn!("Removing read protection, the chip will be mass erased");
        self.transport
            .control_out(Request::Dnload, 0, &[dfu::CMD_READ_UNPROTECT])?;

        let report = self.get_status()?;
        if report.state != State::DnBusy {
            return Err(Error::UnprotectFailed(format!(
                "device reported {} ({}) after the unprotect request",
                report.state.name(),
                report.status.name()
            )));
        }

        let total = report.poll_timeout + UNPROTECT_ERASE_WAIT;
        let ticks = total.as_millis().div_ceil(PROGRESS_TICK.as_millis()) as usize;
        for tick in 1..=ticks {
            self.transport.wait(PROGRESS_TICK);
            events(FlashEvent::Progress {
                current: tick,
                total: ticks,
            });
        }
        self.transport.wait(UNPROTECT_SETTLE_WAIT);

        match self.get_status() {
            Err(e) => {
                info!("Device dropped off after unprotect ({e}), power cycle required");
                events(FlashEvent::Notice(Notice::UnprotectPowerCycle));
                Err(Error::ReadProtectionDetected)
            },
            Ok(report) => Err(Error::UnprotectFailed(format!(
                "device still responding in {}",
                report.state.name()
            ))),
        }
    }

    fn erase(
        &mut self,
        region: &MemoryRegion,
        image: &FirmwareImage,
        events: &mut dyn FnMut(FlashEvent),
    ) -> Result<()> {
        self.set_stage(DfuStage::Erasing, events);

        let pages = region.erase_pages(image.blocks(), self.options.erase_chip);
        if pages.is_empty() {
            return Err(Error::CorruptImage(format!("no image data inside {}", region.name)));
        }

        let bytes: usize = pages.iter().map(|p| p.size as usize).sum();
        info!("Erasing {} page(s), {} KiB", pages.len(), bytes / 1024);

        for (index, page) in pages.iter().enumerate() {
            self.check_cancelled()?;
            debug!(
                "Erasing sector {} page {} at {:#010x}",
                page.sector, page.page, page.address
            );

            let report = self.execute("erase page", 0, &dfu::erase_page_command(page.address))?;
            match report.state {
                State::DnloadIdle => {},
                State::DnBusy => {
                    debug!("Still busy after erase, clearing status");
                    self.clear_status()?;
                },
                _ => return Err(unexpected("erase page", State::DnloadIdle, &report)),
            }

            events(FlashEvent::Progress {
                current: index + 1,
                total: pages.len(),
            });
        }

        events(FlashEvent::Notice(Notice::EraseDone { bytes }));
        Ok(())
    }

    fn write(&mut self, image: &FirmwareImage, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.set_stage(DfuStage::Writing, events);

        let total = image.bytes_total();
        let mut written = 0;

        for block in image.blocks() {
            self.check_cancelled()?;
            debug!("Writing {} bytes at {:#010x}", block.len(), block.address);
            self.load_address(block.address, true)?;

            for (number, chunk) in numbered_chunks(block, self.transfer_size)? {
                self.check_cancelled()?;

                let report = self.execute("download", number, chunk)?;
                if report.state != State::DnloadIdle {
                    return Err(unexpected("download", State::DnloadIdle, &report));
                }

                written += chunk.len();
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
        self.set_stage(DfuStage::Verifying, events);

        let total = image.bytes_total();
        let mut verified = 0;

        for block in image.blocks() {
            self.check_cancelled()?;
            self.clear_status()?;
            self.load_address(block.address, true)?;
            self.clear_status()?;

            let mut readback = Vec::with_capacity(block.len());
            for (number, chunk) in numbered_chunks(block, self.transfer_size)? {
                let data = self
                    .transport
                    .control_in(Request::Upload, number, chunk.len())?;
                readback.extend_from_slice(&data);

                verified += chunk.len();
                events(FlashEvent::Progress {
                    current: verified,
                    total,
                });
            }

            let first_difference = block
                .data
                .iter()
                .zip(&readback)
                .position(|(a, b)| a != b)
                .or_else(|| (readback.len() != block.len()).then(|| readback.len().min(block.len())));

            if let Some(pos) = first_difference {
                let address = block.address + pos as u32;
                error!("Verify mismatch at {address:#010x}");
                let detail = match readback.get(pos) {
                    Some(read) => format!("expected {:#04x}, read {read:#04x}", block.data[pos]),
                    None => format!("read {} of {} bytes", readback.len(), block.len()),
                };
                return Err(Error::VerifyMismatch { address, detail });
            }
        }

        info!("Verified {total} bytes");
        events(FlashEvent::Notice(Notice::VerifyOk));
        Ok(())
    }

    fn leave_at(&mut self, address: u32, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.set_stage(DfuStage::Leaving, events);
        self.clear_status()?;
        self.load_address(address, false)?;

        self.transport.control_out(Request::Dnload, 0, &[])?;
        match self.get_status() {
            Ok(report) => debug!("State after leave request: {}", report.state.name()),
            Err(e) => debug!("No status after leave request ({e})"),
        }

        info!("Device left DFU mode, starting at {address:#010x}");
        Ok(())
    }

    fn leave_best_effort(&mut self, address: u32) {
        if let Err(e) = self.leave_at(address, &mut |_| {}) {
            warn!("Failed to leave DFU mode: {e}");
        }
    }

    fn run(&mut self, image: &FirmwareImage, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.check_cancelled()?;
        let layout = self.probe_layout(events)?;

        let (region, internal) = match (layout.internal_flash(), layout.external_flash()) {
            (Some(region), _) => (region.clone(), true),
            (None, Some(region)) => (region.clone(), false),
            (None, None) => {
                return Err(Error::UnsupportedChip(
                    "no internal or external flash region in memory descriptors".into(),
                ));
            },
        };

        info!(
            "Target: {} at {:#010x}, {} KiB",
            region.name,
            region.start_address,
            region.total_size / 1024
        );
        events(FlashEvent::Notice(Notice::ChipDetected(region.name.clone())));
        events(FlashEvent::Notice(Notice::FlashSize(region.total_size as usize)));

        if internal && image.bytes_total() > region.total_size as usize {
            warn!(
                "Image ({} bytes) is larger than {} ({} bytes)",
                image.bytes_total(),
                region.name,
                region.total_size
            );
            events(FlashEvent::Notice(Notice::ImageLargerThanFlash {
                image: image.bytes_total(),
                flash: region.total_size as usize,
            }));
        }

        if let Some(block) = image
            .blocks()
            .iter()
            .find(|b| !region.is_block_usable(b.address, b.len()))
        {
            error!(
                "Block of {} bytes at {:#010x} is outside {}",
                block.len(),
                block.address,
                region.name
            );
            self.leave_best_effort(leave_address(image));
            return Err(Error::AddressOutOfRange {
                address: block.address,
                length: block.len(),
            });
        }

        self.clear_status()?;

        if internal {
            let option_bytes = layout.option_bytes().cloned().ok_or_else(|| {
                Error::UnsupportedChip("internal flash without an option bytes region".into())
            })?;

            if self.read_protected(&option_bytes, events)? {
                warn!("Chip is read protected");
                events(FlashEvent::Notice(Notice::ReadProtected));
                return self.unprotect(events);
            }
            info!("Chip is not read protected");
            events(FlashEvent::Notice(Notice::NotReadProtected));
            self.clear_status()?;
        }

        self.check_cancelled()?;
        self.erase(&region, image, events)?;
        self.write(image, events)?;
        self.verify(image, events)?;

        self.check_cancelled()?;
        self.leave_at(leave_address(image), events)
    }
}

impl<T: DfuTransport> Flasher for DfuFlasher<T> {
    fn flash(&mut self, image: &FirmwareImage, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        if self.options.exit_dfu_only {
            return self.leave_at(leave_address(image), events);
        }
        if image.is_empty() {
            return Err(Error::CorruptImage("image holds no data".into()));
        }

        let result = self.run(image, events);
        if matches!(result, Err(Error::Cancelled)) {
            self.leave_best_effort(leave_address(image));
        }
        result
    }

    fn leave(&mut self, events: &mut dyn FnMut(FlashEvent)) -> Result<()> {
        self.leave_at(DEFAULT_LEAVE_ADDRESS, events)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.transport.close();
        self.stage = DfuStage::Idle;
        self.closed = true;
        debug!("DFU interface released");
    }
}
