//! A library and application for flashing Nautilus firmware to ESP32-S3
//! devices over a serial link
//!
//! The heart of the crate is the [SessionController], which owns the device
//! connection and drives the connect, flash, erase and disconnect operations.
//! Firmware comes either from local files or from a published release, listed
//! by the [ReleaseCatalog] and turned into a concrete [FirmwareManifest] by the
//! [ManifestResolver].
//!
//! The chip protocol itself sits behind the [Programmer] trait; the
//! [rom::RomProgrammer] implements it for the ESP ROM serial loader.
//!
//! ## As an application
//!
//! [nautilus-flash] can be installed using `cargo install`:
//!
//! ```bash
//! $ cargo install nautilus-flash
//! ```
//!
//! ## As a library
//!
//! [nautilus-flash] can be used as a library in other applications:
//!
//! ```toml
//! nautilus-flash = { version = "0.1", default-features = false, features = ["serialport"] }
//! ```
//!
//! We add `default-features` here to disable the `cli` feature, which is
//! enabled by default. Its important to note that the cli module does not
//! provide SemVer guarantees.
//!
//! [nautilus-flash]: https://crates.io/crates/nautilus-flash

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use self::{
    catalog::{Asset, CatalogState, Release, ReleaseCatalog, ReleaseSource},
    error::Error,
    manifest::{FirmwareManifest, FlashSegment, ManifestResolver, SegmentSource, Selection},
    programmer::{FlashImage, Programmer, WriteOptions},
    progress::{FlashProgress, ProgressCallbacks},
    relay::Relay,
    report::{Event, LogLevel, Reporter},
    session::{Confirmation, SessionController, SessionState, SessionStatus},
    transport::{ControlLine, Link, PortHandle, Transport, UsbIds},
};

pub mod catalog;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod programmer;
pub mod progress;
pub mod relay;
pub mod report;
pub mod rom;
pub mod session;
pub mod transport;

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
pub mod serial;

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;

/// Logging utilities
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging {
    use env_logger::{Builder, Env};
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
