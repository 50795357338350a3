//! [Link] implementation backed by the `serialport` crate

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use log::debug;
use serialport::{ClearBuffer, SerialPort, SerialPortType};

use crate::{
    error::TransportError,
    transport::{ControlLine, Link, PortHandle},
};

/// Baud rate the ROM loader autodetects reliably
pub const DEFAULT_BAUD: u32 = 115_200;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// An open serial port
pub struct SerialLink {
    serial: Box<dyn SerialPort>,
    port: PortHandle,
}

impl SerialLink {
    pub fn open(port: &PortHandle, baud: u32) -> Result<Self, TransportError> {
        debug!("Opening {} at {baud} baud", port.name);

        let serial = serialport::new(&port.name, baud)
            .flow_control(serialport::FlowControl::None)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(|err| map_error(&port.name, err))?;

        Ok(SerialLink {
            serial,
            port: port.clone(),
        })
    }
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.serial.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.serial.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.serial.flush()
    }
}

impl Link for SerialLink {
    fn port(&self) -> &PortHandle {
        &self.port
    }

    fn timeout(&self) -> Duration {
        self.serial.timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.serial
            .set_timeout(timeout)
            .map_err(|err| map_error(&self.port.name, err))
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.serial
            .clear(ClearBuffer::Input)
            .map_err(|err| map_error(&self.port.name, err))
    }

    fn set_control_line(&mut self, line: ControlLine, level: bool) -> Result<(), TransportError> {
        let result = match line {
            ControlLine::RequestToSend => self.serial.write_request_to_send(level),
            ControlLine::DataTerminalReady => self.serial.write_data_terminal_ready(level),
        };

        result.map_err(|err| map_error(&self.port.name, err))
    }

    fn close(mut self: Box<Self>) -> Result<(), TransportError> {
        debug!("Closing {}", self.port.name);
        self.serial.flush()?;
        Ok(())
    }
}

/// Serial ports which are, or may be, USB devices
pub fn usb_ports() -> Result<Vec<PortHandle>, TransportError> {
    let ports = serialport::available_ports()
        .map_err(|err| TransportError::NotSupported(err.to_string()))?;

    Ok(ports
        .into_iter()
        .filter_map(|info| match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let mut handle = PortHandle::new(info.port_name).with_usb(usb.vid, usb.pid);
                handle.product = usb.product;
                Some(handle)
            }
            SerialPortType::Unknown => Some(PortHandle::new(info.port_name)),
            _ => None,
        })
        .collect())
}

fn map_error(port: &str, err: serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::NoDevice if err.description.contains("busy") => {
            TransportError::InUse(port.to_string())
        }
        serialport::ErrorKind::NoDevice => TransportError::NotFound(port.to_string()),
        serialport::ErrorKind::Io(kind) => TransportError::Io(io::Error::new(kind, err.description)),
        _ => TransportError::Serial(err.description),
    }
}
