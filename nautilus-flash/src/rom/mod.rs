//! A [Programmer] for the ESP ROM serial loader
//!
//! Every Espressif chip ships with a serial bootloader in mask ROM. The
//! [RomProgrammer] resets the chip into it using the DTR/RTS lines of the link,
//! identifies the chip and writes images with the loader's FLASH_* or
//! FLASH_DEFL_* commands. No flasher stub is uploaded.
//!
//! All serial I/O is blocking and runs inside
//! [tokio::task::block_in_place], which requires a multi-threaded runtime.

use std::io::Write;

use async_trait::async_trait;
use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use log::debug;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::task::block_in_place;

use self::{
    command::{Begin, Block, Command, CommandType},
    connection::Connection,
};
use crate::{
    error::ProgrammerError,
    programmer::{FlashImage, Programmer, WriteOptions},
    progress::ProgressCallbacks,
    transport::Link,
};

pub mod command;
pub mod connection;
pub mod encoder;
pub mod reset;

/// Register holding a chip specific magic value
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;
/// USB product id of the built in USB-JTAG-Serial peripheral
pub const USB_SERIAL_JTAG_PID: u16 = 0x1001;

const FLASH_SECTOR_SIZE: usize = 0x1000;
const FLASH_WRITE_SIZE: usize = 0x400;

/// Chips the ROM loader can identify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum Chip {
    #[strum(serialize = "ESP8266")]
    Esp8266,
    #[strum(serialize = "ESP32")]
    Esp32,
    #[strum(serialize = "ESP32-C2")]
    Esp32c2,
    #[strum(serialize = "ESP32-C3")]
    Esp32c3,
    #[strum(serialize = "ESP32-C6")]
    Esp32c6,
    #[strum(serialize = "ESP32-H2")]
    Esp32h2,
    #[strum(serialize = "ESP32-S2")]
    Esp32s2,
    #[strum(serialize = "ESP32-S3")]
    Esp32s3,
}

impl Chip {
    pub fn from_magic(magic: u32) -> Result<Self, ProgrammerError> {
        let chip = match magic {
            0xfff0_c101 => Chip::Esp8266,
            0x00f0_1d83 => Chip::Esp32,
            0x6f51_306f | 0x7c41_a06f => Chip::Esp32c2,
            0x6921_506f | 0x1b31_506f | 0x4881_606f | 0x4361_606f => Chip::Esp32c3,
            0x2ce0_806f => Chip::Esp32c6,
            0xd7b7_3e80 => Chip::Esp32h2,
            0x0000_07c6 => Chip::Esp32s2,
            0x0000_0009 => Chip::Esp32s3,
            _ => return Err(ProgrammerError::UnknownChip(magic)),
        };

        Ok(chip)
    }

    /// Whether the loader's begin commands take the `encrypted` word
    fn supports_encryption(&self) -> bool {
        !matches!(self, Chip::Esp8266 | Chip::Esp32)
    }
}

/// Size of the attached SPI flash
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FlashSize {
    #[serde(rename = "1MB")]
    #[strum(serialize = "1MB")]
    _1Mb,
    #[serde(rename = "2MB")]
    #[strum(serialize = "2MB")]
    _2Mb,
    #[serde(rename = "4MB")]
    #[strum(serialize = "4MB")]
    _4Mb,
    #[serde(rename = "8MB")]
    #[strum(serialize = "8MB")]
    _8Mb,
    #[default]
    #[serde(rename = "16MB")]
    #[strum(serialize = "16MB")]
    _16Mb,
    #[serde(rename = "32MB")]
    #[strum(serialize = "32MB")]
    _32Mb,
}

impl FlashSize {
    /// Size in bytes
    pub const fn size(self) -> u32 {
        match self {
            FlashSize::_1Mb => 0x0010_0000,
            FlashSize::_2Mb => 0x0020_0000,
            FlashSize::_4Mb => 0x0040_0000,
            FlashSize::_8Mb => 0x0080_0000,
            FlashSize::_16Mb => 0x0100_0000,
            FlashSize::_32Mb => 0x0200_0000,
        }
    }
}

/// Programs a chip through its ROM serial loader
#[derive(Debug, Default, Clone)]
pub struct RomProgrammer {
    flash_size: FlashSize,
    chip: Option<Chip>,
}

impl RomProgrammer {
    pub fn new(flash_size: FlashSize) -> Self {
        RomProgrammer {
            flash_size,
            chip: None,
        }
    }

    /// The chip found by the last handshake
    pub fn chip(&self) -> Option<Chip> {
        self.chip
    }

    fn identified(&self) -> Result<Chip, ProgrammerError> {
        self.chip.ok_or_else(|| {
            ProgrammerError::Other("The device has not been identified yet".to_string())
        })
    }

    fn erase(&self, connection: &mut Connection<'_>, chip: Chip) -> Result<(), ProgrammerError> {
        // The ROM loader has no erase-all command, so begin a write spanning
        // the whole chip and never send any data
        let size = self.flash_size.size();
        debug!("Erasing {} of flash", self.flash_size);

        connection.with_timeout(CommandType::FlashBegin.timeout_for_size(size), |connection| {
            connection.command(Command::FlashBegin(Begin {
                size,
                blocks: 0,
                block_size: FLASH_WRITE_SIZE as u32,
                offset: 0,
                supports_encryption: chip.supports_encryption(),
            }))
        })?;

        Ok(())
    }
}

#[async_trait]
impl Programmer for RomProgrammer {
    async fn identify(&mut self, link: &mut dyn Link) -> Result<String, ProgrammerError> {
        block_in_place(|| {
            let mut connection = Connection::new(link);
            connection.begin()?;

            let magic = connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
            let chip = Chip::from_magic(magic)?;
            debug!("Detected {chip} (magic value {magic:#x})");

            connection.with_timeout(CommandType::SpiAttach.timeout(), |connection| {
                connection.command(Command::SpiAttach)
            })?;
            connection.with_timeout(CommandType::SpiSetParams.timeout(), |connection| {
                connection.command(Command::SpiSetParams {
                    size: self.flash_size.size(),
                })
            })?;

            self.chip = Some(chip);
            Ok(chip.to_string())
        })
    }

    async fn write_segments(
        &mut self,
        link: &mut dyn Link,
        images: &[FlashImage],
        options: &WriteOptions,
        progress: &mut (dyn ProgressCallbacks + Send),
    ) -> Result<(), ProgrammerError> {
        block_in_place(|| {
            let chip = self.identified()?;
            let mut connection = Connection::new(link);

            for (index, image) in images.iter().enumerate() {
                let data = image.data.as_slice();

                progress.init(index, image.addr, data.len());
                if options.compress {
                    write_deflated(&mut connection, chip, image.addr, data, progress)?;
                } else {
                    write_plain(&mut connection, chip, image.addr, data, progress)?;
                }
                progress.finish();
            }

            // Stay in the loader, the device is reset separately
            let end = if options.compress {
                Command::FlashDeflEnd { reboot: false }
            } else {
                Command::FlashEnd { reboot: false }
            };
            connection.write_command(end)
        })
    }

    async fn erase_all(&mut self, link: &mut dyn Link) -> Result<(), ProgrammerError> {
        block_in_place(|| {
            let chip = self.identified()?;
            let mut connection = Connection::new(link);

            self.erase(&mut connection, chip)
        })
    }

    async fn reset(&mut self, link: &mut dyn Link) -> Result<(), ProgrammerError> {
        block_in_place(|| reset::hard_reset(link))?;
        Ok(())
    }
}

/// Number of bytes to erase ahead of writing `len` bytes
fn erase_size(len: usize) -> u32 {
    (len.div_ceil(FLASH_SECTOR_SIZE) * FLASH_SECTOR_SIZE) as u32
}

fn write_deflated(
    connection: &mut Connection<'_>,
    chip: Chip,
    addr: u32,
    data: &[u8],
    progress: &mut (dyn ProgressCallbacks + Send),
) -> Result<(), ProgrammerError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;

    let size = erase_size(data.len());
    let blocks = compressed.len().div_ceil(FLASH_WRITE_SIZE) as u32;
    debug!(
        "Writing {} bytes ({} compressed) at {addr:#x}",
        data.len(),
        compressed.len()
    );

    connection.with_timeout(CommandType::FlashDeflBegin.timeout_for_size(size), |connection| {
        connection.command(Command::FlashDeflBegin(Begin {
            size,
            blocks,
            block_size: FLASH_WRITE_SIZE as u32,
            offset: addr,
            supports_encryption: chip.supports_encryption(),
        }))
    })?;

    // Inflate alongside to learn how much the device has to write per block
    let mut decoder = ZlibDecoder::new(Vec::new());
    let mut decoded = 0;

    for (sequence, chunk) in compressed.chunks(FLASH_WRITE_SIZE).enumerate() {
        decoder.write_all(chunk)?;
        decoder.flush()?;
        let size = decoder.get_ref().len() - decoded;
        decoded = decoder.get_ref().len();

        connection.with_timeout(
            CommandType::FlashDeflData.timeout_for_size(size as u32),
            |connection| {
                connection.command(Command::FlashDeflData(Block {
                    data: chunk,
                    pad_to: 0,
                    pad_byte: 0xff,
                    sequence: sequence as u32,
                }))
            },
        )?;

        progress.update(decoded);
    }

    Ok(())
}

fn write_plain(
    connection: &mut Connection<'_>,
    chip: Chip,
    addr: u32,
    data: &[u8],
    progress: &mut (dyn ProgressCallbacks + Send),
) -> Result<(), ProgrammerError> {
    let size = erase_size(data.len());
    let blocks = data.len().div_ceil(FLASH_WRITE_SIZE) as u32;
    debug!("Writing {} bytes at {addr:#x}", data.len());

    connection.with_timeout(CommandType::FlashBegin.timeout_for_size(size), |connection| {
        connection.command(Command::FlashBegin(Begin {
            size,
            blocks,
            block_size: FLASH_WRITE_SIZE as u32,
            offset: addr,
            supports_encryption: chip.supports_encryption(),
        }))
    })?;

    let mut written = 0;
    for (sequence, chunk) in data.chunks(FLASH_WRITE_SIZE).enumerate() {
        connection.with_timeout(
            CommandType::FlashData.timeout_for_size(FLASH_WRITE_SIZE as u32),
            |connection| {
                connection.command(Command::FlashData(Block {
                    data: chunk,
                    pad_to: FLASH_WRITE_SIZE,
                    pad_byte: 0xff,
                    sequence: sequence as u32,
                }))
            },
        )?;

        written += chunk.len();
        progress.update(written);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{connection::tests::ScriptedLink, *};

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl ProgressCallbacks for Recorder {
        fn init(&mut self, index: usize, addr: u32, total: usize) {
            self.events.push(format!("init {index} {addr:#x} {total}"));
        }

        fn update(&mut self, current: usize) {
            self.events.push(format!("update {current}"));
        }

        fn finish(&mut self) {
            self.events.push("finish".to_string());
        }
    }

    fn handshake(link: &mut ScriptedLink) {
        for _ in 0..connection::SYNC_REPLIES {
            link.respond(CommandType::Sync, 0, None);
        }
        link.respond(CommandType::ReadReg, 0x9, None);
        link.respond(CommandType::SpiAttach, 0, None);
        link.respond(CommandType::SpiSetParams, 0, None);
    }

    #[test]
    fn identifies_chips_by_magic() {
        assert_eq!(Chip::from_magic(0x9).unwrap(), Chip::Esp32s3);
        assert_eq!(Chip::from_magic(0x00f0_1d83).unwrap(), Chip::Esp32);
        assert_eq!(Chip::from_magic(0x7c41_a06f).unwrap(), Chip::Esp32c2);
        assert_eq!(Chip::Esp32s3.to_string(), "ESP32-S3");

        assert!(matches!(
            Chip::from_magic(0xdead_beef),
            Err(ProgrammerError::UnknownChip(0xdead_beef))
        ));
    }

    #[test]
    fn flash_sizes() {
        assert_eq!(FlashSize::default().size(), 16 * 1024 * 1024);
        assert_eq!(FlashSize::_4Mb.to_string(), "4MB");
        assert_eq!(erase_size(1), 0x1000);
        assert_eq!(erase_size(0x1000), 0x1000);
        assert_eq!(erase_size(0x1001), 0x2000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identifies_an_esp32s3() {
        let mut link = ScriptedLink::new();
        handshake(&mut link);

        let mut programmer = RomProgrammer::default();
        let identity = programmer.identify(&mut link).await.unwrap();

        assert_eq!(identity, "ESP32-S3");
        assert_eq!(programmer.chip(), Some(Chip::Esp32s3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_compressed_segments_in_order() {
        let mut link = ScriptedLink::new();
        handshake(&mut link);

        let mut programmer = RomProgrammer::default();
        programmer.identify(&mut link).await.unwrap();

        let images = vec![
            FlashImage::new(0x0, vec![0x11; 100]),
            FlashImage::new(0x8000, vec![0x22; 200]),
        ];
        for _ in &images {
            // Small, repetitive images compress into a single block each
            link.respond(CommandType::FlashDeflBegin, 0, None);
            link.respond(CommandType::FlashDeflData, 0, None);
        }

        let mut progress = Recorder::default();
        programmer
            .write_segments(&mut link, &images, &WriteOptions::default(), &mut progress)
            .await
            .unwrap();

        assert_eq!(
            progress.events,
            vec![
                "init 0 0x0 100",
                "update 100",
                "finish",
                "init 1 0x8000 200",
                "update 200",
                "finish",
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_errors_are_reported() {
        let mut link = ScriptedLink::new();
        handshake(&mut link);

        let mut programmer = RomProgrammer::default();
        programmer.identify(&mut link).await.unwrap();

        link.respond(CommandType::FlashBegin, 0, None);
        link.respond(CommandType::FlashData, 0, Some(0xc1));

        let options = WriteOptions {
            compress: false,
            ..WriteOptions::default()
        };
        let err = programmer
            .write_segments(
                &mut link,
                &[FlashImage::new(0x10000, vec![0; 16])],
                &options,
                &mut Recorder::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProgrammerError::Rom(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refuses_to_write_before_identifying() {
        let mut link = ScriptedLink::new();
        let mut programmer = RomProgrammer::default();

        assert!(programmer.erase_all(&mut link).await.is_err());
    }
}
