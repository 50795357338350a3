//! Host capability for reaching a physical device
//!
//! A [Transport] asks the operator which port to use and opens it. The
//! resulting [Link] is an exclusively owned byte channel which the
//! [Programmer](crate::Programmer) talks through and which the session closes
//! when it ends.

use std::{
    fmt::{self, Display, Formatter},
    io::{Read, Write},
    time::Duration,
};

use async_trait::async_trait;

use crate::error::TransportError;

/// USB vendor and product identifiers of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIds {
    pub vid: u16,
    pub pid: u16,
}

/// A port the operator has authorized us to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortHandle {
    /// Name of the port, e.g. `/dev/ttyUSB0` or `COM4`
    pub name: String,
    /// USB identifiers, when the port is backed by a USB device
    pub usb: Option<UsbIds>,
    /// Human readable product description
    pub product: Option<String>,
}

impl PortHandle {
    pub fn new(name: impl Into<String>) -> Self {
        PortHandle {
            name: name.into(),
            usb: None,
            product: None,
        }
    }

    pub fn with_usb(mut self, vid: u16, pid: u16) -> Self {
        self.usb = Some(UsbIds { vid, pid });
        self
    }

    /// USB product id of the port, if known
    pub fn pid(&self) -> Option<u16> {
        self.usb.map(|ids| ids.pid)
    }
}

impl Display for PortHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.product {
            Some(product) => write!(f, "{} - {}", self.name, product),
            None => f.write_str(&self.name),
        }
    }
}

/// Modem control lines of a serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ControlLine {
    #[strum(serialize = "RTS")]
    RequestToSend,
    #[strum(serialize = "DTR")]
    DataTerminalReady,
}

/// An open connection to a device
pub trait Link: Read + Write + Send {
    /// The port this link was opened on
    fn port(&self) -> &PortHandle;

    /// Timeout applied to blocking reads
    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Discard any bytes received but not yet read
    fn clear_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Drive one of the modem control lines
    fn set_control_line(&mut self, line: ControlLine, level: bool) -> Result<(), TransportError> {
        let _ = (line, level);
        Err(TransportError::ControlLineUnsupported)
    }

    /// Release the underlying port
    fn close(self: Box<Self>) -> Result<(), TransportError>;
}

/// Host capability that authorizes and opens ports
#[async_trait]
pub trait Transport: Send {
    /// Ask the operator which port to use
    async fn request_port(&mut self) -> Result<PortHandle, TransportError>;

    /// Open a previously authorized port
    async fn open(&mut self, port: &PortHandle) -> Result<Box<dyn Link>, TransportError>;
}
