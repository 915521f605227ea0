//! USB DFU flash and leave commands.

use anyhow::Result;
use console::style;
use fcflash::{DfuOptions, UsbSelector};
use rust_i18n::t;
use std::path::Path;

use super::{FlashReporter, custom_defaults_path, load_firmware};
use crate::config::Config;
use crate::{Cli, CliError, was_interrupted};

/// Pick the USB device: `--device`, then `[dfu] device`, then the ST bootloader IDs.
fn resolve_device(arg: Option<&UsbSelector>, config: &Config) -> Result<UsbSelector> {
    if let Some(device) = arg {
        return Ok(device.clone());
    }
    match config.dfu.device.as_deref() {
        Some(text) => text.parse().map_err(|e: String| {
            CliError::Config(t!("error.config_device", value = text, error = e).to_string()).into()
        }),
        None => Ok(UsbSelector::default()),
    }
}

/// DFU flash command implementation.
pub(crate) fn cmd_dfu(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    device: Option<&UsbSelector>,
    erase_chip: bool,
    custom_defaults: Option<&Path>,
) -> Result<()> {
    let device = resolve_device(device, config)?;
    let options = DfuOptions {
        erase_chip: erase_chip || config.flash.erase_chip,
        exit_dfu_only: false,
    };

    let image = load_firmware(
        firmware,
        custom_defaults_path(custom_defaults, config),
        cli.quiet,
    )?;
    if was_interrupted() {
        return Err(CliError::Cancelled(t!("error.interrupted").to_string()).into());
    }

    if !cli.quiet {
        eprintln!(
            "{} {}",
            style("🔌").cyan(),
            t!("dfu.using_device", device = device)
        );
    }

    let reporter = FlashReporter::new(cli);
    fcflash::flash_via_usb_dfu(
        &device,
        &image,
        options,
        &mut |event| reporter.event(event),
        |result| reporter.done(result),
    )?;

    if !cli.quiet {
        eprintln!("{} {}", style("🎉").green(), t!("dfu.completed"));
    }

    Ok(())
}

/// Leave-DFU command implementation.
pub(crate) fn cmd_leave_dfu(cli: &Cli, config: &Config, device: Option<&UsbSelector>) -> Result<()> {
    let device = resolve_device(device, config)?;

    if !cli.quiet {
        eprintln!(
            "{} {}",
            style("🔌").cyan(),
            t!("dfu.using_device", device = device)
        );
    }

    let reporter = FlashReporter::new(cli);
    fcflash::leave_dfu(
        &device,
        &mut |event| reporter.event(event),
        |result| reporter.done(result),
    )?;

    if !cli.quiet {
        eprintln!("{} {}", style("✓").green(), t!("dfu.left"));
    }

    Ok(())
}
