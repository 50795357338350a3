//! The chip programming seam
//!
//! A [Programmer] knows how to talk to a device's bootloader over an open
//! [Link]. The session never speaks the protocol itself, it only hands the
//! programmer the link and the images to write.

use async_trait::async_trait;

use crate::{error::ProgrammerError, progress::ProgressCallbacks, transport::Link};

/// An image and the flash address it is written to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    pub addr: u32,
    pub data: Vec<u8>,
}

impl FlashImage {
    pub fn new(addr: u32, data: Vec<u8>) -> Self {
        FlashImage { addr, data }
    }
}

/// Options applied to a single write
///
/// Image headers are always written as they are and only the regions being
/// written are erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Deflate images before sending them
    pub compress: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions { compress: true }
    }
}

/// A device bootloader protocol
#[async_trait]
pub trait Programmer: Send {
    /// Perform the handshake and return a description of the chip
    async fn identify(&mut self, link: &mut dyn Link) -> Result<String, ProgrammerError>;

    /// Write every image, in order, as a single operation
    async fn write_segments(
        &mut self,
        link: &mut dyn Link,
        images: &[FlashImage],
        options: &WriteOptions,
        progress: &mut (dyn ProgressCallbacks + Send),
    ) -> Result<(), ProgrammerError>;

    /// Erase the entire flash
    async fn erase_all(&mut self, link: &mut dyn Link) -> Result<(), ProgrammerError>;

    /// Reset the device so it boots the application
    async fn reset(&mut self, link: &mut dyn Link) -> Result<(), ProgrammerError> {
        let _ = link;
        Err(ProgrammerError::Unsupported("reset"))
    }
}
