//! Command implementations.
//!
//! Each subcommand is implemented in its own module; the image loading and
//! progress reporting they share live here.

pub(crate) mod completions;
pub(crate) mod dfu;
pub(crate) mod flash;
pub(crate) mod info;

use anyhow::{Context, Result};
use console::style;
use fcflash::{FirmwareImage, FlashEvent, Notice, Stage};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rust_i18n::t;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output};

/// Custom defaults file to insert: the command line wins over the config.
pub(crate) fn custom_defaults_path<'a>(
    arg: Option<&'a Path>,
    config: &'a Config,
) -> Option<(&'a Path, bool)> {
    arg.map(|p| (p, false))
        .or_else(|| config.flash.custom_defaults.as_deref().map(|p| (p, true)))
}

/// Read and parse a firmware file, then splice in custom defaults.
///
/// `from_config` marks a defaults path that came from a config file, so a
/// missing file is reported as a configuration error.
pub(crate) fn load_firmware(
    path: &Path,
    custom_defaults: Option<(&Path, bool)>,
    quiet: bool,
) -> Result<FirmwareImage> {
    if !quiet {
        eprintln!(
            "{} {}",
            style("📦").cyan(),
            t!("firmware.loading", path = path.display())
        );
    }

    let text = fs::read_to_string(path)
        .with_context(|| t!("error.read_firmware", path = path.display()).to_string())?;
    let mut image = fcflash::parse_image(&text)
        .with_context(|| t!("error.parse_firmware", path = path.display()).to_string())?;

    if !quiet {
        eprintln!(
            "{} {}",
            style("ℹ").blue(),
            t!(
                "firmware.summary",
                blocks = image.blocks().len(),
                bytes = image.bytes_total()
            )
        );
    }

    if let Some((defaults_path, from_config)) = custom_defaults {
        let defaults = match fs::read_to_string(defaults_path) {
            Ok(text) => text,
            Err(e) if from_config => {
                return Err(CliError::Config(
                    t!(
                        "error.read_defaults_config",
                        path = defaults_path.display(),
                        error = e
                    )
                    .to_string(),
                )
                .into());
            },
            Err(e) => {
                return Err(anyhow::Error::from(e).context(
                    t!("error.read_defaults", path = defaults_path.display()).to_string(),
                ));
            },
        };

        let inserted = fcflash::insert_config(&mut image, &defaults)
            .context(t!("error.insert_defaults").to_string())?;
        if !quiet {
            if inserted {
                eprintln!("{} {}", style("✓").green(), t!("firmware.defaults_inserted"));
            } else {
                eprintln!(
                    "{} {}",
                    style("⚠").yellow(),
                    t!("firmware.defaults_skipped")
                );
            }
        }
    }

    Ok(image)
}

/// Localized text for a driver notice.
pub(crate) fn notice_text(notice: &Notice) -> String {
    match notice {
        Notice::BootloaderVersion(version) => t!("notice.bootloader_version", version = version),
        Notice::ChipDetected(name) => t!("notice.chip_detected", name = name),
        Notice::FlashSize(bytes) => t!("notice.flash_size", kib = bytes / 1024),
        Notice::NotReadProtected => t!("notice.not_read_protected"),
        Notice::ReadProtected => t!("notice.read_protected"),
        Notice::UnprotectPowerCycle => t!("notice.unprotect_power_cycle"),
        Notice::EraseDone { bytes } => t!("notice.erase_done", kib = bytes.div_ceil(1024)),
        Notice::ImageLargerThanFlash { image, flash } => {
            t!("notice.image_larger_than_flash", image = image, flash = flash)
        },
        Notice::TransferSize(size) => t!("notice.transfer_size", size = size),
        Notice::VerifyOk => t!("notice.verify_ok"),
    }
    .to_string()
}

fn is_warning(notice: &Notice) -> bool {
    matches!(
        notice,
        Notice::ReadProtected | Notice::UnprotectPowerCycle | Notice::ImageLargerThanFlash { .. }
    )
}

/// Localized name of a driver stage.
pub(crate) fn stage_text(stage: Stage) -> String {
    let key = format!("stage.{}", stage.to_string().replace(' ', "_"));
    let localized = t!(&key).to_string();
    if localized != key {
        localized
    } else {
        stage.to_string()
    }
}

/// Renders driver events as a progress bar and status lines.
pub(crate) struct FlashReporter {
    pb: ProgressBar,
    quiet: bool,
    fancy: bool,
}

impl FlashReporter {
    pub(crate) fn new(cli: &Cli) -> Self {
        let fancy = !cli.quiet && !cli.non_interactive && use_fancy_output();
        let pb = if fancy {
            let pb = ProgressBar::new(100);
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb.set_draw_target(ProgressDrawTarget::stderr());
            pb
        } else {
            ProgressBar::hidden()
        };

        Self {
            pb,
            quiet: cli.quiet,
            fancy,
        }
    }

    fn line(&self, text: &str) {
        if self.quiet {
            return;
        }
        if self.fancy {
            self.pb.println(text);
        } else {
            eprintln!("{text}");
        }
    }

    /// Handle one driver event.
    pub(crate) fn event(&self, event: FlashEvent) {
        match event {
            FlashEvent::Stage(stage) => {
                let name = stage_text(stage);
                if self.fancy {
                    self.pb.set_position(0);
                    self.pb.set_message(name);
                } else {
                    self.line(&format!("{} {name}", style("→").dim()));
                }
            },
            FlashEvent::Progress { current, total } => {
                if total > 0 {
                    self.pb.set_position((current * 100 / total) as u64);
                }
            },
            FlashEvent::Notice(notice) => {
                let text = notice_text(&notice);
                if is_warning(&notice) {
                    self.line(&format!("{} {text}", style("⚠").yellow()));
                } else {
                    self.line(&format!("{} {text}", style("ℹ").blue()));
                }
            },
        }
    }

    /// Completion callback of the session.
    pub(crate) fn done(&self, result: &fcflash::Result<()>) {
        match result {
            Ok(()) => self.pb.finish_and_clear(),
            Err(_) => self.pb.abandon(),
        }
    }
}
