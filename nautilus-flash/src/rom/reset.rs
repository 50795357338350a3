//! DTR/RTS sequences which reset the chip, into the ROM loader or out of it

use std::{thread::sleep, time::Duration};

use log::debug;

use super::USB_SERIAL_JTAG_PID;
use crate::{
    error::TransportError,
    transport::{ControlLine, Link},
};

/// Time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: Duration = Duration::from_millis(50);
/// Used when the default delay does not get the chip into download mode
const EXTRA_RESET_DELAY: Duration = Duration::from_millis(550);

/// A way of resetting a chip into download mode
pub trait ResetStrategy {
    fn reset(&self, link: &mut dyn Link) -> Result<(), TransportError>;

    fn set_dtr(&self, link: &mut dyn Link, level: bool) -> Result<(), TransportError> {
        link.set_control_line(ControlLine::DataTerminalReady, level)
    }

    fn set_rts(&self, link: &mut dyn Link, level: bool) -> Result<(), TransportError> {
        link.set_control_line(ControlLine::RequestToSend, level)
    }
}

/// Sets DTR and RTS one after the other, for USB-to-UART bridges
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: Duration,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, link: &mut dyn Link) -> Result<(), TransportError> {
        debug!("Using Classic reset strategy with delay of {:?}", self.delay);

        self.set_dtr(link, false)?; // IO0 = HIGH
        self.set_rts(link, true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        self.set_dtr(link, true)?; // IO0 = LOW
        self.set_rts(link, false)?; // EN = HIGH, chip out of reset

        sleep(self.delay);

        self.set_dtr(link, false)?; // IO0 = HIGH, done

        Ok(())
    }
}

/// Sequence for the ESP32-S3's built in USB-JTAG-Serial peripheral
#[derive(Debug, Clone, Copy)]
pub struct UsbJtagSerialReset;

impl ResetStrategy for UsbJtagSerialReset {
    fn reset(&self, link: &mut dyn Link) -> Result<(), TransportError> {
        debug!("Using UsbJtagSerial reset strategy");

        self.set_rts(link, false)?;
        self.set_dtr(link, false)?; // Idle

        sleep(Duration::from_millis(100));

        self.set_dtr(link, true)?; // Set IO0
        self.set_rts(link, false)?;

        sleep(Duration::from_millis(100));

        // Goes through (1,1) instead of (0,0)
        self.set_rts(link, true)?;
        self.set_dtr(link, false)?;
        // Windows only propagates DTR when RTS is set
        self.set_rts(link, true)?;

        sleep(Duration::from_millis(100));

        self.set_dtr(link, false)?;
        self.set_rts(link, false)?;

        Ok(())
    }
}

/// The strategies to cycle through while trying to connect
pub fn reset_sequence(pid: Option<u16>) -> Vec<Box<dyn ResetStrategy + Send>> {
    if pid == Some(USB_SERIAL_JTAG_PID) {
        return vec![Box::new(UsbJtagSerialReset)];
    }

    vec![
        Box::new(ClassicReset::new(false)),
        Box::new(ClassicReset::new(true)),
    ]
}

/// Reset the chip so it boots the application
pub fn hard_reset(link: &mut dyn Link) -> Result<(), TransportError> {
    sleep(Duration::from_millis(100));

    if link.port().pid() == Some(USB_SERIAL_JTAG_PID) {
        link.set_control_line(ControlLine::DataTerminalReady, false)?;
        sleep(Duration::from_millis(100));

        link.set_control_line(ControlLine::RequestToSend, true)?;
        link.set_control_line(ControlLine::DataTerminalReady, false)?;
        link.set_control_line(ControlLine::RequestToSend, true)?;
        sleep(Duration::from_millis(100));

        link.set_control_line(ControlLine::RequestToSend, false)
    } else {
        link.set_control_line(ControlLine::RequestToSend, true)?;
        sleep(Duration::from_millis(100));

        link.set_control_line(ControlLine::RequestToSend, false)
    }
}
