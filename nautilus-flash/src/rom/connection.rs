//! Request/response exchange with the ROM loader over a [Link]

use std::{
    io::{BufWriter, Write},
    iter::zip,
    thread::sleep,
    time::Duration,
};

use log::{debug, warn};
use slip_codec::{SlipDecoder, SlipError};

use super::{
    command::{Command, CommandType},
    encoder::SlipEncoder,
    reset::reset_sequence,
};
use crate::{
    error::{ProgrammerError, ResultExt, RomError, RomErrorKind},
    transport::Link,
};

const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 5;
/// Replies the loader sends for a single SYNC
pub(crate) const SYNC_REPLIES: usize = 8;
/// Responses read while waiting for the one matching a command
const MAX_RESPONSES: usize = 100;

/// A decoded response packet
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Response {
    pub op: u8,
    pub value: u32,
    /// The loader reported a failure
    pub failed: bool,
    pub error: u8,
}

impl Response {
    /// Parse a ROM loader response, whose status bytes trail the packet
    pub fn parse(packet: &[u8]) -> Result<Self, ProgrammerError> {
        // 10 bytes from a flasher stub, 12 from the ROM loader
        let status_len = match packet.len() {
            10 => 2,
            12 => 4,
            _ => return Err(ProgrammerError::InvalidResponse),
        };

        if packet[0] != 1 {
            return Err(ProgrammerError::InvalidResponse);
        }

        let status = packet.len() - status_len;
        let value = u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]);

        Ok(Response {
            op: packet[1],
            value,
            failed: packet[status] != 0,
            error: packet[status + 1],
        })
    }
}

/// A connection to the ROM loader, borrowing the session's link
pub struct Connection<'a> {
    link: &'a mut dyn Link,
    decoder: SlipDecoder,
}

impl<'a> Connection<'a> {
    pub fn new(link: &'a mut dyn Link) -> Self {
        Connection {
            link,
            decoder: SlipDecoder::new(),
        }
    }

    /// Reset the chip into download mode and synchronize with it
    pub fn begin(&mut self) -> Result<(), ProgrammerError> {
        let strategies = reset_sequence(self.link.port().pid());

        for (attempt, strategy) in zip(0..MAX_CONNECT_ATTEMPTS, strategies.iter().cycle()) {
            if let Err(err) = strategy.reset(&mut *self.link) {
                // Some links can't drive DTR/RTS, the chip may already be
                // waiting in download mode
                debug!("Reset attempt {attempt} failed: {err}");
            }

            for _ in 0..MAX_SYNC_ATTEMPTS {
                self.link.clear_input()?;

                match self.sync() {
                    Ok(()) => return Ok(()),
                    Err(err) => debug!("Sync failed: {err}"),
                }
            }
        }

        Err(ProgrammerError::ConnectionFailed)
    }

    /// Send a SYNC and drain the loader's repeated replies
    pub fn sync(&mut self) -> Result<(), ProgrammerError> {
        self.with_timeout(CommandType::Sync.timeout(), |connection| {
            connection.write_command(Command::Sync)?;
            sleep(Duration::from_millis(10));

            for index in 0..SYNC_REPLIES {
                let response = match connection.read_response() {
                    Ok(response) => response,
                    // Some replies may have been dropped, the first one is enough
                    Err(_) if index > 0 => break,
                    Err(ProgrammerError::Io(_)) | Err(ProgrammerError::Timeout(_)) => {
                        return Err(ProgrammerError::NoSyncReply)
                    }
                    Err(err) => return Err(err),
                };

                if response.op != CommandType::Sync as u8 {
                    return Err(RomError::new(CommandType::Sync, RomErrorKind::InvalidMessage).into());
                }
                if response.failed {
                    return Err(
                        RomError::new(CommandType::Sync, RomErrorKind::from(response.error)).into(),
                    );
                }
            }

            Ok(())
        })
    }

    /// Run `f` with the link's read timeout temporarily set to `timeout`
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, f: F) -> Result<T, ProgrammerError>
    where
        F: FnOnce(&mut Self) -> Result<T, ProgrammerError>,
    {
        let previous = self.link.timeout();
        self.link.set_timeout(timeout)?;

        let result = f(self);

        if let Err(err) = self.link.set_timeout(previous) {
            warn!("Failed to restore the read timeout: {err}");
        }
        result
    }

    /// Write a command, and wait for the matching response
    pub fn command(&mut self, command: Command<'_>) -> Result<u32, ProgrammerError> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;

        for _ in 0..MAX_RESPONSES {
            let response = self.read_response().for_command(ty)?;
            if response.op != ty as u8 {
                continue;
            }

            return if response.failed {
                Err(RomError::new(ty, RomErrorKind::from(response.error)).into())
            } else {
                Ok(response.value)
            };
        }

        Err(ProgrammerError::ConnectionFailed)
    }

    /// Write a command without waiting for a response
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), ProgrammerError> {
        debug!("Writing command: {:?}", command.command_type());
        self.link.clear_input()?;

        let mut writer = BufWriter::new(&mut *self.link);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;

        Ok(())
    }

    pub fn read_reg(&mut self, address: u32) -> Result<u32, ProgrammerError> {
        self.with_timeout(CommandType::ReadReg.timeout(), |connection| {
            connection.command(Command::ReadReg { address })
        })
    }

    fn read_response(&mut self) -> Result<Response, ProgrammerError> {
        let packet = self.read_packet()?;
        Response::parse(&packet)
    }

    fn read_packet(&mut self) -> Result<Vec<u8>, ProgrammerError> {
        let mut packet = Vec::with_capacity(64);

        self.decoder
            .decode(&mut self.link, &mut packet)
            .map_err(|err| match err {
                SlipError::ReadError(io) => ProgrammerError::Io(io),
                other => ProgrammerError::Framing(format!("{other:?}")),
            })?;

        Ok(packet)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        io::{self, Read},
        sync::{Arc, Mutex},
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{error::TransportError, transport::PortHandle};

    /// A link which plays back canned loader responses
    pub(crate) struct ScriptedLink {
        port: PortHandle,
        timeout: Duration,
        rx: VecDeque<u8>,
        pub(crate) tx: Arc<Mutex<Vec<u8>>>,
        /// Successful timeout changes left before the port stops accepting them
        pub(crate) timeout_changes: Option<usize>,
    }

    impl ScriptedLink {
        pub(crate) fn new() -> Self {
            ScriptedLink {
                port: PortHandle::new("/dev/ttyTEST0"),
                timeout: Duration::from_secs(1),
                rx: VecDeque::new(),
                tx: Arc::default(),
                timeout_changes: None,
            }
        }

        /// Queue a ROM loader response for `op`
        pub(crate) fn respond(&mut self, op: CommandType, value: u32, error: Option<u8>) {
            let mut packet = vec![1, op as u8, 4, 0];
            packet.extend_from_slice(&value.to_le_bytes());
            packet.extend_from_slice(&[u8::from(error.is_some()), error.unwrap_or(0), 0, 0]);

            let mut framed = Vec::new();
            let mut encoder = SlipEncoder::new(&mut framed).unwrap();
            encoder.write_all(&packet).unwrap();
            encoder.finish().unwrap();

            self.rx.extend(framed);
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no more responses"));
            }

            let len = buf.len().min(self.rx.len());
            for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..len)) {
                *slot = byte;
            }
            Ok(len)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Link for ScriptedLink {
        fn port(&self) -> &PortHandle {
            &self.port
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
            match self.timeout_changes.as_mut() {
                Some(0) => return Err(TransportError::Serial("port went away".into())),
                Some(left) => *left -= 1,
                None => {}
            }
            self.timeout = timeout;
            Ok(())
        }

        fn close(self: Box<Self>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn parses_rom_responses() {
        let response = Response::parse(&[1, 0x0a, 4, 0, 0x09, 0, 0, 0, 0, 0, 0, 0]).unwrap();

        assert_eq!(
            response,
            Response {
                op: 0x0a,
                value: 9,
                failed: false,
                error: 0,
            }
        );

        let response = Response::parse(&[1, 0x03, 4, 0, 0, 0, 0, 0, 1, 0xc1, 0, 0]).unwrap();
        assert!(response.failed);
        assert_eq!(RomErrorKind::from(response.error), RomErrorKind::BadDataChecksum);

        assert!(Response::parse(&[1, 2, 3]).is_err());
        assert!(Response::parse(&[0, 0x0a, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn syncs_and_reads_registers() {
        let mut link = ScriptedLink::new();
        for _ in 0..SYNC_REPLIES {
            link.respond(CommandType::Sync, 0, None);
        }
        link.respond(CommandType::ReadReg, 0x9, None);

        let mut connection = Connection::new(&mut link);
        connection.begin().unwrap();
        assert_eq!(connection.read_reg(0x4000_1000).unwrap(), 0x9);

        // The timeout is restored after each command
        assert_eq!(link.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn sync_tolerates_dropped_replies() {
        let mut link = ScriptedLink::new();
        for _ in 0..3 {
            link.respond(CommandType::Sync, 0, None);
        }

        let mut connection = Connection::new(&mut link);
        connection.sync().unwrap();
    }

    #[test]
    fn failing_to_restore_the_timeout_keeps_the_result() {
        let mut link = ScriptedLink::new();
        link.respond(CommandType::ReadReg, 0x9, None);
        link.timeout_changes = Some(1);

        let mut connection = Connection::new(&mut link);
        assert_eq!(connection.read_reg(0x4000_1000).unwrap(), 0x9);

        // Errors from the command itself still come through
        let mut link = ScriptedLink::new();
        link.timeout_changes = Some(1);

        let mut connection = Connection::new(&mut link);
        assert!(matches!(
            connection.read_reg(0x4000_1000),
            Err(ProgrammerError::Timeout(CommandType::ReadReg))
        ));
    }

    #[test]
    fn rom_errors_are_attributed_to_the_command() {
        let mut link = ScriptedLink::new();
        link.respond(CommandType::ReadReg, 0, Some(0x05));

        let mut connection = Connection::new(&mut link);
        let err = connection.read_reg(0x4000_1000).unwrap_err();

        match err {
            ProgrammerError::Rom(rom) => assert_eq!(rom.kind(), RomErrorKind::InvalidMessage),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn silence_is_a_timeout() {
        let mut link = ScriptedLink::new();

        let mut connection = Connection::new(&mut link);
        assert!(matches!(
            connection.read_reg(0x4000_1000),
            Err(ProgrammerError::Timeout(CommandType::ReadReg))
        ));
    }

    #[test]
    fn unresponsive_device_fails_to_connect() {
        let mut link = ScriptedLink::new();

        let mut connection = Connection::new(&mut link);
        assert!(matches!(
            connection.begin(),
            Err(ProgrammerError::ConnectionFailed)
        ));
    }
}
