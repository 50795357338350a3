use std::io;

use async_trait::async_trait;
use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::{debug, warn};

use super::config::{Config, UsbDevice};
use crate::{
    error::TransportError,
    serial::{usb_ports, SerialLink},
    transport::{Link, PortHandle, Transport, UsbIds},
};

/// USB UART adapters which are known to be on common dev boards
const KNOWN_DEVICES: &[UsbDevice] = &[
    UsbDevice {
        vid: 0x303a,
        pid: 0x1001,
    }, // Espressif USB-Serial/JTAG, built into the ESP32-S3
    UsbDevice {
        vid: 0x10c4,
        pid: 0xea60,
    }, // Silicon Labs CP210x UART Bridge
    UsbDevice {
        vid: 0x1a86,
        pid: 0x7523,
    }, // QinHeng Electronics CH340 serial converter
];

/// A [Transport] which lets the operator pick a native serial port on the
/// terminal
#[derive(Debug, Clone)]
pub struct SerialTransport {
    /// Port named on the command line
    port: Option<String>,
    baud: u32,
    /// Ask before using a port which was named rather than picked
    confirm_port: bool,
    config: Config,
}

impl SerialTransport {
    pub fn new(port: Option<String>, baud: u32, confirm_port: bool, config: Config) -> Self {
        SerialTransport {
            port,
            baud,
            confirm_port,
            config,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn request_port(&mut self) -> Result<PortHandle, TransportError> {
        let transport = self.clone();

        tokio::task::spawn_blocking(move || select_port(&transport))
            .await
            .map_err(|err| TransportError::Serial(err.to_string()))?
    }

    async fn open(&mut self, port: &PortHandle) -> Result<Box<dyn Link>, TransportError> {
        let port = port.clone();
        let baud = self.baud;

        let link = tokio::task::spawn_blocking(move || SerialLink::open(&port, baud))
            .await
            .map_err(|err| TransportError::Serial(err.to_string()))??;

        Ok(Box::new(link))
    }
}

fn select_port(transport: &SerialTransport) -> Result<PortHandle, TransportError> {
    // A port named on the command line takes precedence over the configured
    // one. Without either, the operator is prompted to pick one, unless a
    // single port matching a known device is found.
    let ports = usb_ports().unwrap_or_default();
    let config = &transport.config;

    let named = transport
        .port
        .as_deref()
        .or(config.connection.serial.as_deref());

    if let Some(name) = named {
        let port = find_port(&ports, &canonicalize(name)?)?;

        if transport.confirm_port && !confirm_port(&port)? {
            return Err(TransportError::Declined);
        }
        return Ok(port);
    }

    let (port, known) = select_detected_port(ports, config)?;

    if let Some(ids) = port.usb.filter(|_| !known) {
        let remember = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Remember this serial port for future use?")
            .interact_opt()
            .map_err(prompt_error)?
            .unwrap_or_default();

        if remember {
            // Failing to save shouldn't stop us from using the port
            if let Err(err) = config.save_with(|config| {
                config.usb_device.push(UsbDevice {
                    vid: ids.vid,
                    pid: ids.pid,
                })
            }) {
                warn!("Failed to save config: {err:#}");
            }
        }
    }

    Ok(port)
}

#[cfg(not(target_os = "windows"))]
fn canonicalize(name: &str) -> Result<String, TransportError> {
    // Symlinks such as /dev/serial/by-id/* resolve to the enumerated name
    match std::fs::canonicalize(name) {
        Ok(path) => Ok(path.to_string_lossy().to_string()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(TransportError::NotFound(name.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

// Device names like `COM4` can't be canonicalized on Windows
#[cfg(target_os = "windows")]
fn canonicalize(name: &str) -> Result<String, TransportError> {
    Ok(name.to_string())
}

/// Find the port whose name matches `name`
fn find_port(ports: &[PortHandle], name: &str) -> Result<PortHandle, TransportError> {
    ports
        .iter()
        .find(|port| port.name.eq_ignore_ascii_case(name))
        .cloned()
        .ok_or_else(|| TransportError::NotFound(name.to_string()))
}

fn is_known(config: &Config, ids: &UsbIds) -> bool {
    config
        .usb_device
        .iter()
        .chain(KNOWN_DEVICES)
        .any(|device| device.matches(ids))
}

fn select_detected_port(
    ports: Vec<PortHandle>,
    config: &Config,
) -> Result<(PortHandle, bool), TransportError> {
    let known = |port: &PortHandle| port.usb.is_some_and(|ids| is_known(config, &ids));

    match ports.as_slice() {
        [] => Err(TransportError::NotSupported(
            "no serial ports were detected".into(),
        )),
        [port] if known(port) => {
            debug!("Using the only detected port, {port}");
            Ok((port.clone(), true))
        }
        [port] => {
            if confirm_port(port)? {
                Ok((port.clone(), false))
            } else {
                Err(TransportError::Declined)
            }
        }
        _ => {
            println!(
                "Detected {} serial ports. Ports which match a known common dev board are highlighted.\n",
                ports.len()
            );

            let port_names = ports
                .iter()
                .map(|port| {
                    let name = if known(port) {
                        port.name.as_str().bold()
                    } else {
                        port.name.as_str().reset()
                    };

                    match &port.product {
                        Some(product) => format!("{name} - {product}"),
                        None => name.to_string(),
                    }
                })
                .collect::<Vec<_>>();

            let index = Select::with_theme(&ColorfulTheme::default())
                .items(&port_names)
                .default(0)
                .interact_opt()
                .map_err(prompt_error)?
                .ok_or(TransportError::Declined)?;

            let port = ports
                .get(index)
                .cloned()
                .ok_or(TransportError::Declined)?;
            let matches = known(&port);

            Ok((port, matches))
        }
    }
}

fn confirm_port(port: &PortHandle) -> Result<bool, TransportError> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use serial port '{port}'?"))
        .interact_opt()
        .map_err(prompt_error)?
        .ok_or(TransportError::Declined)
}

fn prompt_error(err: dialoguer::Error) -> TransportError {
    TransportError::Io(io::Error::other(err))
}
