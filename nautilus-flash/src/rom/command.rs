//! Commands understood by the ROM serial loader
//!
//! https://docs.espressif.com/projects/esptool/en/latest/esp32s3/advanced-topics/serial-protocol.html

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const FLASH_DEFLATE_END_TIMEOUT: Duration = Duration::from_secs(10);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);

/// Payload of the SYNC command
const SYNC_FRAME: [u8; 36] = {
    let mut frame = [0x55; 36];
    frame[0] = 0x07;
    frame[1] = 0x07;
    frame[2] = 0x12;
    frame[3] = 0x20;
    frame
};

const CHECKSUM_INIT: u8 = 0xEF;

/// Operation codes of the ROM loader commands in use
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
}

impl CommandType {
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::FlashDeflEnd => FLASH_DEFLATE_END_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Timeout for a command which erases or writes `size` bytes
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        let scaled = |per_mb: Duration| {
            let mb = f64::from(size) / 1_000_000.0;
            Duration::from_millis((per_mb.as_millis() as f64 * mb) as u64)
                .max(FLASH_DEFLATE_END_TIMEOUT)
        };

        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin => {
                scaled(ERASE_REGION_TIMEOUT_PER_MB)
            }
            CommandType::FlashData | CommandType::FlashDeflData => {
                scaled(ERASE_WRITE_TIMEOUT_PER_MB)
            }
            _ => self.timeout(),
        }
    }
}

/// Parameters shared by the FLASH_BEGIN and FLASH_DEFL_BEGIN commands
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Begin {
    /// Bytes to erase
    pub size: u32,
    pub blocks: u32,
    pub block_size: u32,
    pub offset: u32,
    /// Whether the loader expects the trailing `encrypted` word
    pub supports_encryption: bool,
}

/// One block of a FLASH_DATA or FLASH_DEFL_DATA transfer
#[derive(Copy, Clone, Debug)]
pub struct Block<'a> {
    pub data: &'a [u8],
    pub pad_to: usize,
    pub pad_byte: u8,
    pub sequence: u32,
}

/// A command sent to the ROM loader
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    Sync,
    ReadReg { address: u32 },
    /// Attach the default SPI flash pins
    SpiAttach,
    /// Tell the loader the geometry of the attached flash
    SpiSetParams { size: u32 },
    FlashBegin(Begin),
    FlashData(Block<'a>),
    FlashEnd { reboot: bool },
    FlashDeflBegin(Begin),
    FlashDeflData(Block<'a>),
    FlashDeflEnd { reboot: bool },
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Sync => CommandType::Sync,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiAttach => CommandType::SpiAttach,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::FlashBegin(_) => CommandType::FlashBegin,
            Command::FlashData(_) => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::FlashDeflBegin(_) => CommandType::FlashDeflBegin,
            Command::FlashDeflData(_) => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
        }
    }

    /// Write the command packet, without SLIP framing
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        // Direction and opcode
        writer.write_all(&[0, self.command_type() as u8])?;

        match *self {
            Command::Sync => write_basic(writer, &SYNC_FRAME),
            Command::ReadReg { address } => write_basic(writer, &address.to_le_bytes()),
            // SPI configuration word of zero selects the default pins, and the
            // ROM loader expects a second, zero, word
            Command::SpiAttach => write_basic(writer, &[0; 8]),
            Command::SpiSetParams { size } => {
                let params = SpiParams {
                    id: 0,
                    total_size: size,
                    block_size: 64 * 1024,
                    sector_size: 4 * 1024,
                    page_size: 256,
                    status_mask: 0xffff,
                };
                write_basic(writer, bytes_of(&params))
            }
            Command::FlashBegin(begin) | Command::FlashDeflBegin(begin) => {
                begin_command(writer, begin)
            }
            Command::FlashData(block) | Command::FlashDeflData(block) => {
                data_command(writer, block)
            }
            // 0 reboots into the application, 1 stays in the loader
            Command::FlashEnd { reboot } | Command::FlashDeflEnd { reboot } => {
                write_basic(writer, &[u8::from(!reboot)])
            }
        }
    }
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct SpiParams {
    id: u32,
    total_size: u32,
    block_size: u32,
    sector_size: u32,
    page_size: u32,
    status_mask: u32,
}

/// Write a payload with an empty checksum
fn write_basic<W: Write>(mut writer: W, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&0u32.to_le_bytes())?;
    writer.write_all(data)
}

fn begin_command<W: Write>(writer: W, begin: Begin) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }

    let params = BeginParams {
        size: begin.size,
        blocks: begin.blocks,
        block_size: begin.block_size,
        offset: begin.offset,
        encrypted: 0,
    };

    let bytes = bytes_of(&params);
    let data = if begin.supports_encryption {
        bytes
    } else {
        &bytes[..bytes.len() - size_of::<u32>()]
    };

    write_basic(writer, data)
}

fn data_command<W: Write>(mut writer: W, block: Block<'_>) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = block.pad_to.saturating_sub(block.data.len());
    let padding = vec![block.pad_byte; pad_length];

    let params = BlockParams {
        size: (block.data.len() + pad_length) as u32,
        sequence: block.sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let check = checksum(&padding, checksum(block.data, CHECKSUM_INIT));
    let total_length = size_of::<BlockParams>() + block.data.len() + pad_length;

    writer.write_all(&(total_length as u16).to_le_bytes())?;
    writer.write_all(&u32::from(check).to_le_bytes())?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block.data)?;
    writer.write_all(&padding)
}

/// XOR checksum of the data carried by a data command
pub(crate) fn checksum(data: &[u8], seed: u8) -> u8 {
    data.iter().fold(seed, |check, byte| check ^ byte)
}
