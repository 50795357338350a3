//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use with the
//! [nautilus-flash] command-line application, and are likely not of much use
//! otherwise.
//!
//! Important note: The contents of this module DO NOT provide SemVer
//! guarantees, and may change at any time.
//!
//! [nautilus-flash]: https://crates.io/crates/nautilus-flash

use std::{fmt, path::PathBuf};

use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::{debug, info};
use miette::{IntoDiagnostic, Result};

pub use self::{progress::TerminalReporter, serial::SerialTransport};
use self::config::Config;
use crate::{
    catalog::{GitHubReleases, Release, ReleaseCatalog},
    error::CatalogError,
    fetch::HttpFetcher,
    manifest::{ManifestResolver, BOOTLOADER, FIRMWARE, PARTITIONS},
    relay::Relay,
    rom::RomProgrammer,
    serial::DEFAULT_BAUD,
    session::{Confirmation, SessionController, SessionState},
};

pub mod config;

mod progress;
mod serial;

/// Establish a connection with a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "NAUTILUS_PORT")]
    pub port: Option<String>,
    /// Baud rate at which to communicate with target device
    #[arg(short = 'b', long, env = "NAUTILUS_BAUD")]
    pub baud: Option<u32>,
    /// Require confirmation before connecting to a named port
    #[arg(long)]
    pub confirm_port: bool,
}

/// Where the firmware to flash comes from
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FirmwareArgs {
    /// Flash the files in the firmware directory instead of a release
    #[arg(long, conflicts_with = "release")]
    pub local: bool,
    /// Release to flash, by tag, name or row number. Defaults to the most
    /// recent one
    #[arg(short = 'r', long)]
    pub release: Option<String>,
    /// Directory holding the local firmware files
    #[arg(long, env = "NAUTILUS_FIRMWARE_DIR")]
    pub firmware_dir: Option<PathBuf>,
    /// GitHub repository publishing the releases, as `owner/repo`
    #[arg(long, env = "NAUTILUS_REPOSITORY")]
    pub repository: Option<String>,
    /// Relay release assets are downloaded through
    #[arg(long)]
    pub relay: Option<String>,
}

/// Options for erasing a device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct EraseArgs {
    /// Don't ask for confirmation before erasing
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// Build a controller for a native serial port, reporting to the terminal
pub fn session_controller(
    args: &ConnectArgs,
    firmware: &FirmwareArgs,
    config: &Config,
) -> Result<SessionController> {
    let baud = args
        .baud
        .or(config.connection.baudrate)
        .unwrap_or(DEFAULT_BAUD);
    let transport = SerialTransport::new(args.port.clone(), baud, args.confirm_port, config.clone());

    let relay = firmware
        .relay
        .as_deref()
        .unwrap_or(&config.releases.relay);
    let firmware_dir = firmware
        .firmware_dir
        .clone()
        .unwrap_or_else(|| config.firmware.directory.clone());
    let resolver = ManifestResolver::new(firmware_dir, Relay::parse(relay)?);

    Ok(SessionController::new(
        transport,
        RomProgrammer::new(config.flash.size),
        HttpFetcher::new()?,
        resolver,
        TerminalReporter::default(),
    ))
}

/// The catalog of the configured repository, or a local-only one without
pub fn release_catalog(firmware: &FirmwareArgs, config: &Config) -> Result<ReleaseCatalog> {
    let repository = firmware
        .repository
        .as_deref()
        .or(config.releases.repository.as_deref());

    match repository {
        Some(repository) => {
            let source = GitHubReleases::new(repository, &config.releases.api_url)?;
            debug!("Listing releases from {}", source.url());

            Ok(ReleaseCatalog::new(source))
        }
        None => {
            debug!("No release repository configured");
            Ok(ReleaseCatalog::local_only())
        }
    }
}

/// Pick the firmware named on the command line
async fn select_firmware(catalog: &mut ReleaseCatalog, firmware: &FirmwareArgs) -> Result<()> {
    if firmware.local {
        catalog.select(None)?;
        return Ok(());
    }

    catalog.refresh().await;
    if let Some(release) = &firmware.release {
        // A tag or name, or the 1-based row printed by `releases`
        match (catalog.select_tag(release), release.parse::<usize>()) {
            (Ok(()), _) => {}
            (Err(err @ CatalogError::Unavailable { .. }), _) => return Err(err.into()),
            (Err(_), Ok(row)) if row > 0 => catalog.select(Some(row - 1))?,
            (Err(err), _) => return Err(err.into()),
        }
    }

    Ok(())
}

/// Connect to a device, print its description and disconnect
pub async fn board_info(args: &ConnectArgs, config: &Config) -> Result<()> {
    let firmware = FirmwareArgs::local();
    let controller = session_controller(args, &firmware, config)?;

    let result = controller.connect().await;
    controller.disconnect().await;

    let status = result?;
    if let Some(device) = status.device {
        println!("Chip type:         {device}");
    }

    Ok(())
}

/// Flash the selected firmware to a device
pub async fn flash(args: &ConnectArgs, firmware: &FirmwareArgs, config: &Config) -> Result<()> {
    let mut catalog = release_catalog(firmware, config)?;
    select_firmware(&mut catalog, firmware).await?;
    println!("Firmware:          {}", Choice::from(&catalog));

    let controller = session_controller(args, firmware, config)?;

    let result = match controller.connect().await {
        Ok(_) => controller.flash(catalog.selection()).await,
        Err(err) => Err(err),
    };
    controller.disconnect().await;

    result.map_err(Into::into)
}

/// Erase the entire flash of a device
pub async fn erase(args: &ConnectArgs, erase_args: &EraseArgs, config: &Config) -> Result<()> {
    let confirmation = if erase_args.yes {
        Confirmation::Confirmed
    } else {
        confirm_erase().await?
    };
    if confirmation == Confirmation::Declined {
        println!("Erase cancelled, the flash was left untouched");
        return Ok(());
    }

    let controller = session_controller(args, &FirmwareArgs::local(), config)?;

    let result = match controller.connect().await {
        Ok(_) => controller.erase(confirmation).await,
        Err(err) => Err(err),
    };
    controller.disconnect().await;

    result.map_err(Into::into)
}

/// Print the published releases
pub async fn list_releases(firmware: &FirmwareArgs, config: &Config) -> Result<()> {
    let mut catalog = release_catalog(firmware, config)?;
    catalog.refresh().await;

    if let Some(reason) = catalog.failure() {
        println!("Releases are unavailable ({reason}), only local files can be flashed");
        return Ok(());
    }

    print_releases(catalog.releases());
    Ok(())
}

fn print_releases(releases: &[Release]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("#").add_attribute(Attribute::Bold),
            Cell::new("Release")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
            Cell::new("Tag")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
            Cell::new("Pre-release")
                .fg(Color::Yellow)
                .add_attribute(Attribute::Bold),
            Cell::new("Flashable")
                .fg(Color::Magenta)
                .add_attribute(Attribute::Bold),
        ]);

    for (index, release) in releases.iter().enumerate() {
        let flashable = [BOOTLOADER, PARTITIONS, FIRMWARE]
            .iter()
            .all(|name| release.asset(name).is_some());

        table.add_row(vec![
            Cell::new(index + 1),
            Cell::new(release.display_name()).fg(Color::Green),
            Cell::new(&release.tag).fg(Color::Cyan),
            Cell::new(if release.prerelease { "yes" } else { "" }).fg(Color::Yellow),
            Cell::new(if flashable { "yes" } else { "no" }).fg(Color::Magenta),
        ]);
    }

    println!("{table}");
}

/// An entry of the interactive menu
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum Action {
    #[strum(serialize = "Connect")]
    Connect,
    #[strum(serialize = "Flash firmware")]
    Flash,
    #[strum(serialize = "Erase flash")]
    Erase,
    #[strum(serialize = "Select firmware")]
    SelectFirmware,
    #[strum(serialize = "Refresh releases")]
    Refresh,
    #[strum(serialize = "Disconnect")]
    Disconnect,
    #[strum(serialize = "Quit")]
    Quit,
}

impl Action {
    /// Actions which make sense in `state`
    fn available(state: SessionState) -> Vec<Action> {
        match state {
            SessionState::Connected => vec![
                Action::Flash,
                Action::Erase,
                Action::SelectFirmware,
                Action::Refresh,
                Action::Disconnect,
                Action::Quit,
            ],
            _ => vec![
                Action::Connect,
                Action::SelectFirmware,
                Action::Refresh,
                Action::Quit,
            ],
        }
    }
}

/// Drive a session from a menu until the operator quits
pub async fn interactive(args: &ConnectArgs, firmware: &FirmwareArgs, config: &Config) -> Result<()> {
    let mut catalog = release_catalog(firmware, config)?;
    select_firmware(&mut catalog, firmware).await?;

    let controller = session_controller(args, firmware, config)?;

    loop {
        let status = controller.status();
        println!();
        match &status.device {
            Some(device) => println!("Device:   {device}"),
            None => println!("Device:   not connected"),
        }
        println!("Firmware: {}", Choice::from(&catalog));

        let actions = Action::available(status.state);
        let labels = actions.iter().map(ToString::to_string).collect::<Vec<_>>();
        let chosen = prompt(move || {
            Select::with_theme(&ColorfulTheme::default())
                .items(&labels)
                .default(0)
                .interact_opt()
        })
        .await?;

        let Some(action) = chosen.and_then(|index| actions.get(index).copied()) else {
            break;
        };

        // Failures have already been reported, the menu carries on
        let result = match action {
            Action::Connect => controller.connect().await.map(drop),
            Action::Flash => controller.flash(catalog.selection()).await,
            Action::Erase => controller.erase(confirm_erase().await?).await,
            Action::SelectFirmware => {
                choose_firmware(&mut catalog).await?;
                Ok(())
            }
            Action::Refresh => {
                let found = catalog.refresh().await;
                info!("{found} release(s) available");
                Ok(())
            }
            Action::Disconnect => {
                controller.disconnect().await;
                Ok(())
            }
            Action::Quit => break,
        };

        if let Err(err) = result {
            debug!("{action} failed: {err}");
        }
    }

    controller.disconnect().await;
    Ok(())
}

async fn choose_firmware(catalog: &mut ReleaseCatalog) -> Result<()> {
    let mut items = vec![String::from("Local files")];
    items.extend(catalog.releases().iter().map(|release| {
        if release.prerelease {
            format!("{} (pre-release)", release.display_name())
        } else {
            release.display_name().to_string()
        }
    }));
    let default = catalog.selected_index().map_or(0, |index| index + 1);

    let chosen = prompt(move || {
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Firmware to flash")
            .items(&items)
            .default(default)
            .interact_opt()
    })
    .await?;

    if let Some(index) = chosen {
        catalog.select(index.checked_sub(1))?;
    }

    Ok(())
}

async fn confirm_erase() -> Result<Confirmation> {
    let confirmed = prompt(|| {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Erase the entire flash? This cannot be undone")
            .default(false)
            .interact_opt()
    })
    .await?;

    Ok(Confirmation::from(confirmed.unwrap_or_default()))
}

/// Run a blocking terminal prompt off the async runtime
async fn prompt<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> dialoguer::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .into_diagnostic()?
        .into_diagnostic()
}

/// Describes the current firmware choice of a catalog
struct Choice<'a>(Option<&'a Release>);

impl<'a> From<&'a ReleaseCatalog> for Choice<'a> {
    fn from(catalog: &'a ReleaseCatalog) -> Self {
        Choice(catalog.selected())
    }
}

impl fmt::Display for Choice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(release) => write!(f, "{} ({})", release.display_name(), release.tag),
            None => f.write_str("local files"),
        }
    }
}

impl FirmwareArgs {
    /// Local files, with everything else taken from the configuration
    fn local() -> Self {
        FirmwareArgs {
            local: true,
            release: None,
            firmware_dir: None,
            repository: None,
            relay: None,
        }
    }
}
