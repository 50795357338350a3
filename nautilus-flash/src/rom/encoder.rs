use std::io::{self, Write};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Wraps everything written to it in a single SLIP frame
pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    /// Start a frame
    pub fn new(writer: &'a mut W) -> io::Result<Self> {
        writer.write_all(&[END])?;
        Ok(Self { writer, len: 1 })
    }

    /// Close the frame, returning the number of bytes written in total
    pub fn finish(self) -> io::Result<usize> {
        self.writer.write_all(&[END])?;
        Ok(self.len + 1)
    }
}

impl<W: Write> Write for SlipEncoder<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for byte in buf {
            let escaped: &[u8] = match *byte {
                END => &[ESC, ESC_END],
                ESC => &[ESC, ESC_ESC],
                _ => std::slice::from_ref(byte),
            };

            self.writer.write_all(escaped)?;
            self.len += escaped.len();
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_frame_bytes() {
        let mut out = Vec::new();
        let mut encoder = SlipEncoder::new(&mut out).unwrap();
        encoder.write_all(&[0x01, END, 0x02, ESC]).unwrap();
        let len = encoder.finish().unwrap();

        assert_eq!(out, vec![END, 0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, END]);
        assert_eq!(len, out.len());
    }
}
