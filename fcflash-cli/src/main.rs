//! fcflash CLI - Command-line tool for flashing STM32 flight controllers.
//!
//! ## Features
//!
//! - Flash Intel-HEX firmware through the STM32 UART bootloader
//! - Flash Intel-HEX firmware through USB DFU (DfuSe)
//! - Splice custom defaults into the image before flashing
//! - Inspect firmware images
//! - Shell completion generation
//! - Environment variable support
//! - Internationalization (i18n) support

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use fcflash::UsbSelector;
use log::debug;
use rust_i18n::t;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

// Initialize i18n with locale files from the locales directory
rust_i18n::i18n!("locales", fallback = "en");

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors raised by the CLI itself, as opposed to the flashing library.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Missing or contradictory arguments.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration value.
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Process exit codes.
mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const DEVICE: i32 = 4;
    pub const CANCELLED: i32 = 130;
}

/// Default bootloader baud rate.
pub(crate) const DEFAULT_BAUD: u32 = 256_000;

/// fcflash - A cross-platform tool for flashing STM32 flight controllers.
///
/// Environment variables:
///   FCFLASH_PORT              - Default serial port
///   FCFLASH_BAUD              - Bootloader baud rate (default: 256000)
///   FCFLASH_DEVICE            - USB DFU device (VID:PID[@serial])
///   FCFLASH_LANG              - Language/locale (en, zh-CN)
///   FCFLASH_NON_INTERACTIVE   - Non-interactive mode (plain output)
#[derive(Parser)]
#[command(name = "fcflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port of the flight controller.
    #[arg(short, long, global = true, env = "FCFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate for the bootloader link [default: 256000].
    #[arg(short, long, global = true, env = "FCFLASH_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Language/locale for messages (e.g., en, zh-CN).
    #[arg(long, global = true, env = "FCFLASH_LANG")]
    pub(crate) lang: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (no progress animation, plain status lines).
    #[arg(long, global = true, env = "FCFLASH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Flash an Intel-HEX image through the serial bootloader.
    Flash {
        /// Path to the Intel-HEX firmware file.
        firmware: PathBuf,

        /// Mass erase instead of erasing only the pages the image covers.
        #[arg(long)]
        erase_chip: bool,

        /// The board already sits in the bootloader; skip the reboot request.
        #[arg(long)]
        no_reboot: bool,

        /// Baud rate of the running firmware, used for the reboot request.
        #[arg(long, value_name = "BAUD")]
        reboot_baud: Option<u32>,

        /// Text file spliced into the image's custom defaults area.
        #[arg(long, value_name = "FILE")]
        custom_defaults: Option<PathBuf>,
    },

    /// Flash an Intel-HEX image through USB DFU.
    Dfu {
        /// Path to the Intel-HEX firmware file.
        firmware: PathBuf,

        /// USB device, VID:PID[@serial] (default: 0483:df11).
        #[arg(long, env = "FCFLASH_DEVICE", value_name = "VID:PID")]
        device: Option<UsbSelector>,

        /// Erase the whole flash region instead of the covered pages.
        #[arg(long)]
        erase_chip: bool,

        /// Text file spliced into the image's custom defaults area.
        #[arg(long, value_name = "FILE")]
        custom_defaults: Option<PathBuf>,
    },

    /// Command a USB DFU device to leave DFU mode and run its firmware.
    LeaveDfu {
        /// USB device, VID:PID[@serial] (default: 0483:df11).
        #[arg(long, env = "FCFLASH_DEVICE", value_name = "VID:PID")]
        device: Option<UsbSelector>,
    },

    /// Show information about a firmware file.
    Info {
        /// Path to the Intel-HEX firmware file.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Show the image after inserting this custom defaults file.
        #[arg(long, value_name = "FILE")]
        custom_defaults: Option<PathBuf>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Supported locales for i18n
const SUPPORTED_LOCALES: &[&str] = &["en", "zh-CN"];

/// Map a system locale like `zh_CN.UTF-8` onto a supported locale.
fn match_locale(system_locale: &str) -> String {
    // Remove encoding suffix (e.g., .UTF-8)
    let locale = system_locale
        .split('.')
        .next()
        .unwrap_or(system_locale);
    let locale = locale.replace('_', "-");

    if SUPPORTED_LOCALES.contains(&locale.as_str()) {
        return locale;
    }

    let lang_code = locale.split('-').next().unwrap_or(&locale);
    match lang_code.to_lowercase().as_str() {
        "zh" => "zh-CN".to_string(),
        _ => "en".to_string(),
    }
}

/// Detect the best matching locale from system settings.
fn detect_locale() -> String {
    let system_locale = sys_locale::get_locale().unwrap_or_else(|| "en".to_string());
    match_locale(&system_locale)
}

/// Extract `--lang` before clap runs so help text is localized.
fn early_lang(raw_args: &[String]) -> Option<String> {
    let mut lang = None;
    for (i, arg) in raw_args.iter().enumerate() {
        if let Some(val) = arg.strip_prefix("--lang=") {
            lang = Some(val.to_string());
        } else if arg == "--lang" {
            lang = raw_args.get(i + 1).cloned();
        }
    }
    lang.or_else(|| env::var("FCFLASH_LANG").ok())
}

fn main() {
    let raw_args: Vec<String> = env::args().collect();

    let locale = early_lang(&raw_args).map_or_else(detect_locale, |lang| match_locale(&lang));
    rust_i18n::set_locale(&locale);

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Print localized help ourselves so section headings are translated.
    let wants_help = raw_args.iter().any(|a| a == "-h" || a == "--help");
    if wants_help || raw_args.len() <= 1 {
        print_localized_help(&raw_args);
        std::process::exit(exit_code::SUCCESS);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "fcflash v{} (verbose level: {}, locale: {locale})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Ctrl-C handler not installed: {e}");
    }
    fcflash::set_interrupt_checker(was_interrupted);

    let code = match run(&cli) {
        Ok(()) => exit_code::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style(t!("common.error_prefix")).red().bold());
            exit_code_for(&err)
        },
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            firmware,
            erase_chip,
            no_reboot,
            reboot_baud,
            custom_defaults,
        } => commands::flash::cmd_flash(
            cli,
            &config,
            &commands::flash::SerialArgs {
                firmware,
                erase_chip: *erase_chip,
                no_reboot: *no_reboot,
                reboot_baud: *reboot_baud,
                custom_defaults: custom_defaults.as_deref(),
            },
        ),
        Commands::Dfu {
            firmware,
            device,
            erase_chip,
            custom_defaults,
        } => commands::dfu::cmd_dfu(
            cli,
            &config,
            firmware,
            device.as_ref(),
            *erase_chip,
            custom_defaults.as_deref(),
        ),
        Commands::LeaveDfu { device } => commands::dfu::cmd_leave_dfu(cli, &config, device.as_ref()),
        Commands::Info {
            firmware,
            json,
            custom_defaults,
        } => commands::info::cmd_info(firmware, *json, custom_defaults.as_deref()),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(t!("completions.need_shell").to_string())
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Map an error chain onto the documented exit codes.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => exit_code::USAGE,
            CliError::Config(_) => exit_code::CONFIG,
            CliError::Cancelled(_) => exit_code::CANCELLED,
        };
    }

    match err.downcast_ref::<fcflash::Error>() {
        Some(fcflash::Error::Cancelled) => exit_code::CANCELLED,
        Some(
            fcflash::Error::DeviceNotFound(_)
            | fcflash::Error::Io(_)
            | fcflash::Error::Serial(_)
            | fcflash::Error::Usb(_)
            | fcflash::Error::Timeout(_)
            | fcflash::Error::HandshakeFailed(_)
            | fcflash::Error::Nack { .. }
            | fcflash::Error::UnexpectedResponse { .. }
            | fcflash::Error::UnexpectedState { .. }
            | fcflash::Error::Protocol(_),
        ) => exit_code::DEVICE,
        _ if was_interrupted() => exit_code::CANCELLED,
        _ => exit_code::FAILURE,
    }
}

fn print_localized_help(raw_args: &[String]) {
    let app = build_localized_command();

    let subcommand = raw_args.iter().skip(1).find_map(|token| {
        app.get_subcommands()
            .find(|s| s.get_name() == token.as_str())
    });

    let _ = match subcommand {
        Some(sub) => sub.clone().print_help(),
        None => app.clone().print_help(),
    };
}

/// Build a clap `Command` with fully localized help output.
///
/// Uses clap as the single source of truth for structure (args, subcommands),
/// while replacing all user-visible text (section headings, command descriptions,
/// argument help) with translations from the locale files.
fn build_localized_command() -> clap::Command {
    let tpl = format!(
        "{{bin}} {{version}}\n\n{{about}}\n\n\
         {usage_h}:\n  {{usage}}\n\n\
         {cmds_h}:\n{{subcommands}}\n\n\
         {opts_h}:\n{{options}}\n",
        usage_h = t!("help.usage_heading"),
        cmds_h = t!("help.commands_heading"),
        opts_h = t!("help.options_heading"),
    );

    let sub_tpl = format!(
        "{{bin}} {{version}}\n\n{{about}}\n\n\
         {usage_h}:\n  {{usage}}\n\n\
         {opts_h}:\n{{options}}\n",
        usage_h = t!("help.usage_heading"),
        opts_h = t!("help.options_heading"),
    );

    Cli::command()
        .help_template(tpl)
        .about(t!("app.about").to_string())
        .mut_args(localize_arg)
        .mut_subcommands(move |sub| {
            let key = format!("cmd.{}.about", sub.get_name().replace('-', "_"));
            let localized = t!(&key).to_string();
            let sub = if localized != key {
                sub.about(localized)
            } else {
                sub
            };
            sub.help_template(sub_tpl.clone()).mut_args(localize_arg)
        })
}

/// Replace an arg's help text with its localized version if available.
fn localize_arg(arg: clap::Arg) -> clap::Arg {
    let key = format!("arg.{}.help", arg.get_id().as_str());
    let localized = t!(&key).to_string();
    if localized != key {
        arg.help(localized)
    } else {
        arg
    }
}
