//! Library and application errors

use std::{io, path::PathBuf};

use miette::Diagnostic;
use thiserror::Error;

use crate::{rom::command::CommandType, session::SessionState};

/// All possible errors returned by a device-programming session
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to connect to the device: {0}")]
    #[diagnostic(
        code(nautilus_flash::connect_failed),
        help("Check the USB cable and that the device is in download mode, then connect again")
    )]
    Connect(#[source] ConnectError),

    #[error("Flashing failed: {0}")]
    #[diagnostic(
        code(nautilus_flash::flash_failed),
        help("The device is still connected, the flash can be retried without reconnecting")
    )]
    Flash(#[source] FlashError),

    #[error("Erasing the flash failed: {0}")]
    #[diagnostic(
        code(nautilus_flash::erase_failed),
        help("The device is still connected, the erase can be retried without reconnecting")
    )]
    Erase(#[source] ProgrammerError),

    #[error("Another operation is in progress (device is {0})")]
    #[diagnostic(
        code(nautilus_flash::busy),
        help("Wait for the current operation to finish")
    )]
    Busy(SessionState),

    #[error("No device connected")]
    #[diagnostic(code(nautilus_flash::not_connected), help("Connect to a device first"))]
    NotConnected,

    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(nautilus_flash::cancelled))]
    Cancelled,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Catalog(#[from] CatalogError),
}

/// Errors raised while establishing a session
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error("Handshake with the device failed: {0}")]
    #[diagnostic(code(nautilus_flash::handshake))]
    Handshake(#[source] ProgrammerError),
}

/// Errors raised during a single flash attempt
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum FlashError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Failed to load {segment}: {source}")]
    #[diagnostic(code(nautilus_flash::fetch))]
    Fetch {
        segment: String,
        #[source]
        source: FetchError,
    },

    #[error("Communication error while flashing device: {0}")]
    #[diagnostic(code(nautilus_flash::write))]
    Write(#[source] ProgrammerError),
}

/// Errors raised while turning a selection into a manifest
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ManifestError {
    #[error("Release '{release}' is missing {}", .missing.join(", "))]
    #[diagnostic(
        code(nautilus_flash::manifest_incomplete),
        help("Select another release, or flash the local firmware files")
    )]
    Incomplete {
        release: String,
        missing: Vec<&'static str>,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Relay(#[from] RelayError),
}

/// Errors raised while routing an asset through the relay
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum RelayError {
    #[error("Refusing to relay '{0}', it is not a release download URL")]
    #[diagnostic(code(nautilus_flash::relay_rejected))]
    Rejected(String),

    #[error("Invalid relay endpoint: {0}")]
    #[diagnostic(
        code(nautilus_flash::relay_endpoint),
        help("Set `relay` under [releases] in the configuration file to a valid URL")
    )]
    InvalidEndpoint(#[from] url::ParseError),
}

/// Errors raised while fetching the bytes of a segment
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum FetchError {
    #[error("Failed to read {}: {source}", .path.display())]
    #[diagnostic(
        code(nautilus_flash::fetch::read),
        help("Make sure the firmware directory holds bootloader.bin, partitions.bin and firmware.bin")
    )]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("HTTP request failed: {0}")]
    #[diagnostic(code(nautilus_flash::fetch::http))]
    Http(#[from] reqwest::Error),

    #[error("HTTP error! status: {status} ({message})")]
    #[diagnostic(code(nautilus_flash::fetch::status))]
    Status { status: u16, message: String },

    #[error("Unexpected content type '{0}', expected a firmware binary")]
    #[diagnostic(code(nautilus_flash::fetch::content_type))]
    UnexpectedContentType(String),

    #[error("Truncated download, expected {expected} bytes but received {got} bytes")]
    #[diagnostic(code(nautilus_flash::fetch::truncated))]
    Truncated { expected: u64, got: usize },

    #[error("The firmware image is empty")]
    #[diagnostic(code(nautilus_flash::fetch::empty))]
    Empty,
}

/// Errors raised by the release catalog
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum CatalogError {
    #[error("No release repository has been configured")]
    #[diagnostic(
        code(nautilus_flash::catalog::not_configured),
        help("Pass `--repository owner/repo` or set `repository` under [releases]")
    )]
    NotConfigured,

    #[error("Invalid release repository '{0}'")]
    #[diagnostic(
        code(nautilus_flash::catalog::repository),
        help("The repository must be given as `owner/repo`")
    )]
    InvalidRepository(String),

    #[error("Failed to fetch the release list: {0}")]
    #[diagnostic(code(nautilus_flash::catalog::http))]
    Http(#[from] reqwest::Error),

    #[error("The release service rate limit has been exceeded")]
    #[diagnostic(
        code(nautilus_flash::catalog::rate_limited),
        help("Wait a while before refreshing, the local firmware files can still be flashed")
    )]
    RateLimited,

    #[error("The release service answered with status {0}")]
    #[diagnostic(code(nautilus_flash::catalog::status))]
    Status(u16),

    #[error("Invalid release service URL: {0}")]
    #[diagnostic(code(nautilus_flash::catalog::url))]
    InvalidUrl(#[from] url::ParseError),

    #[error("Release index {index} is out of range, {len} releases are available")]
    #[diagnostic(code(nautilus_flash::catalog::out_of_range))]
    OutOfRange { index: usize, len: usize },

    #[error("No release named '{0}' is available")]
    #[diagnostic(
        code(nautilus_flash::catalog::unknown_release),
        help("Run the `releases` subcommand to list the available releases")
    )]
    UnknownRelease(String),

    #[error("Release '{release}' cannot be selected, the release list could not be loaded: {reason}")]
    #[diagnostic(
        code(nautilus_flash::catalog::unavailable),
        help("Use `--local` to flash the local firmware files instead")
    )]
    Unavailable { release: String, reason: String },
}

/// Errors raised by the host's port capability
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Serial ports are not supported here: {0}")]
    #[diagnostic(
        code(nautilus_flash::transport::not_supported),
        help("Make sure you have connected a device to the host system")
    )]
    NotSupported(String),

    #[error("No serial port was selected")]
    #[diagnostic(code(nautilus_flash::transport::declined))]
    Declined,

    #[error("The serial port '{0}' is already in use")]
    #[diagnostic(
        code(nautilus_flash::transport::in_use),
        help("Close any serial monitor or other program using the port")
    )]
    InUse(String),

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(nautilus_flash::transport::not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    NotFound(String),

    #[error("The link does not expose control lines")]
    #[diagnostic(code(nautilus_flash::transport::control_line))]
    ControlLineUnsupported,

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(nautilus_flash::transport::io))]
    Io(#[from] io::Error),

    #[error("Serial port error: {0}")]
    #[diagnostic(code(nautilus_flash::transport::serial))]
    Serial(String),
}

/// Errors raised by a [Programmer](crate::Programmer)
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ProgrammerError {
    #[error("The programmer does not support {0}")]
    #[diagnostic(code(nautilus_flash::programmer::unsupported))]
    Unsupported(&'static str),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error while talking to the device: {0}")]
    #[diagnostic(code(nautilus_flash::programmer::io))]
    Io(#[from] io::Error),

    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(nautilus_flash::programmer::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not responding to sync")]
    #[diagnostic(
        code(nautilus_flash::programmer::no_sync_reply),
        help("Hold the BOOT button while plugging the device in to force download mode")
    )]
    NoSyncReply,

    #[error("Timeout while running {0} command")]
    #[diagnostic(code(nautilus_flash::programmer::timeout))]
    Timeout(CommandType),

    #[error("Received a malformed SLIP frame: {0}")]
    #[diagnostic(code(nautilus_flash::programmer::framing))]
    Framing(String),

    #[error("Invalid response from the ROM loader")]
    #[diagnostic(code(nautilus_flash::programmer::invalid_response))]
    InvalidResponse,

    #[error("Unrecognized magic value: {0:#x}")]
    #[diagnostic(
        code(nautilus_flash::programmer::chip_detect),
        help("Try hard-resetting the device and connect again")
    )]
    UnknownChip(u32),

    #[error("The bootloader returned an error: {0}")]
    #[diagnostic(transparent)]
    Rom(#[from] RomError),

    #[error("{0}")]
    #[diagnostic(code(nautilus_flash::programmer::other))]
    Other(String),
}

/// Errors originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, PartialEq, Eq, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(nautilus_flash::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(nautilus_flash::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(nautilus_flash::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(nautilus_flash::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(nautilus_flash::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(nautilus_flash::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(nautilus_flash::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Bad data length")]
    #[diagnostic(code(nautilus_flash::rom::data_len))]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    #[diagnostic(code(nautilus_flash::rom::data_crc))]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    #[diagnostic(code(nautilus_flash::rom::block_size))]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    #[diagnostic(code(nautilus_flash::rom::cmd))]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    #[diagnostic(code(nautilus_flash::rom::spi))]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    #[diagnostic(code(nautilus_flash::rom::spi_unlock))]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    #[diagnostic(code(nautilus_flash::rom::flash_mode))]
    NotInFlashMode = 0xc6,

    #[error("Error when uncompressing the data")]
    #[diagnostic(code(nautilus_flash::rom::inflate))]
    InflateError = 0xc7,

    #[error("Didn't receive enough data")]
    #[diagnostic(code(nautilus_flash::rom::not_enough))]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    #[diagnostic(code(nautilus_flash::rom::too_much_data))]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    #[diagnostic(code(nautilus_flash::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }

    /// The error code reported by the ROM loader
    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

pub(crate) trait ResultExt {
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, ProgrammerError> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(ProgrammerError::Io(err)) if err.kind() == io::ErrorKind::TimedOut => {
                Err(ProgrammerError::Timeout(command))
            }
            Err(ProgrammerError::Timeout(_)) => Err(ProgrammerError::Timeout(command)),
            res => res,
        }
    }
}
