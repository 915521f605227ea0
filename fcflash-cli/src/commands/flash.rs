//! Serial bootloader flash command.

use anyhow::Result;
use console::style;
use fcflash::SerialOptions;
use rust_i18n::t;
use std::path::Path;

use super::{FlashReporter, custom_defaults_path, load_firmware};
use crate::config::Config;
use crate::{Cli, CliError, DEFAULT_BAUD, was_interrupted};

/// Arguments of `fcflash flash`.
pub(crate) struct SerialArgs<'a> {
    pub(crate) firmware: &'a Path,
    pub(crate) erase_chip: bool,
    pub(crate) no_reboot: bool,
    pub(crate) reboot_baud: Option<u32>,
    pub(crate) custom_defaults: Option<&'a Path>,
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled(t!("error.interrupted").to_string()).into())
    } else {
        Ok(())
    }
}

/// Resolve driver options from flags and config; flags only ever switch on.
fn serial_options(args: &SerialArgs<'_>, config: &Config) -> SerialOptions {
    let defaults = SerialOptions::default();
    SerialOptions {
        erase_chip: args.erase_chip || config.flash.erase_chip,
        no_reboot: args.no_reboot || config.flash.no_reboot,
        reboot_baud: args
            .reboot_baud
            .or(config.serial.reboot_baud)
            .unwrap_or(defaults.reboot_baud),
        ..defaults
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, args: &SerialArgs<'_>) -> Result<()> {
    let port = cli
        .port
        .clone()
        .or_else(|| config.serial.port.clone())
        .ok_or_else(|| CliError::Usage(t!("error.no_port").to_string()))?;
    let baud = cli.baud.or(config.serial.baud).unwrap_or(DEFAULT_BAUD);
    let options = serial_options(args, config);

    let image = load_firmware(
        args.firmware,
        custom_defaults_path(args.custom_defaults, config),
        cli.quiet,
    )?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!(
            "{} {}",
            style("🔌").cyan(),
            t!("common.using_port", port = port, baud = baud)
        );
        if options.no_reboot {
            eprintln!("{} {}", style("⏳").yellow(), t!("flash.expect_bootloader"));
        } else {
            eprintln!(
                "{} {}",
                style("⏳").yellow(),
                t!("flash.rebooting", baud = options.reboot_baud)
            );
        }
    }

    let reporter = FlashReporter::new(cli);
    fcflash::flash_via_serial(
        &port,
        baud,
        &image,
        options,
        &mut |event| reporter.event(event),
        |result| reporter.done(result),
    )?;

    if !cli.quiet {
        eprintln!("{} {}", style("🎉").green(), t!("flash.completed"));
    }

    Ok(())
}
