//! Low-level packet buffer operations for DNS packet handling
//!
//! Provides the `PacketBuffer` trait used by `protocol` to read and write
//! wire-format DNS messages, plus the two concrete backings the core needs:
//! a fixed 64KiB buffer for UDP datagrams and in-memory TCP reassembly
//! (`BytePacketBuffer`), and a growable buffer for serializing outbound
//! messages (`VectorPacketBuffer`).

use std::fmt;

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    #[display(fmt = "end of buffer")]
    EndOfBuffer,
    #[display(fmt = "label exceeds 63 bytes")]
    LabelTooLong,
    #[display(fmt = "too many jumps in qname compression pointer chain")]
    TooManyJumps,
    #[display(fmt = "single label exceeds 34 characters")]
    SingleLabelTooLong,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Shared interface over the buffer backings used to read and write DNS
/// wire-format messages. `protocol::DnsPacket`/`DnsHeader`/`DnsQuestion`/
/// `DnsRecord` are generic over this trait so they can be read from a
/// datagram-sized array or a TCP byte stream indifferently.
pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn pos(&self) -> usize;
    fn step(&mut self, steps: usize) -> Result<()>;
    fn seek(&mut self, pos: usize) -> Result<()>;

    fn read_u8(&mut self) -> Result<u8> {
        self.read()
    }

    fn read_u16(&mut self) -> Result<u16> {
        let hi = self.read()? as u16;
        let lo = self.read()? as u16;
        Ok((hi << 8) | lo)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut res: u32 = 0;
        for _ in 0..4 {
            res = (res << 8) | (self.read()? as u32);
        }
        Ok(res)
    }

    /// Read a (possibly compressed) domain name into `outstr`, following
    /// pointer jumps but never re-reading the same offset twice.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();

        let mut jumped = false;
        let mut jumps_performed = 0;
        const MAX_JUMPS: usize = 5;

        let mut delim = "";
        loop {
            if jumps_performed > MAX_JUMPS {
                return Err(BufferError::TooManyJumps);
            }

            let len = self.get(pos)?;

            if (len & 0xC0) == 0xC0 {
                if !jumped {
                    self.seek(pos + 2)?;
                }

                let b2 = self.get(pos + 1)? as u16;
                let offset = (((len as u16) ^ 0xC0) << 8) | b2;
                pos = offset as usize;

                jumped = true;
                jumps_performed += 1;
                continue;
            }

            pos += 1;

            if len == 0 {
                break;
            }

            outstr.push_str(delim);

            let str_buffer = self.get_range(pos, len as usize)?;
            outstr.push_str(&String::from_utf8_lossy(str_buffer));

            delim = ".";
            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }

    fn write(&mut self, val: u8) -> Result<()>;

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;
        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)?;
        Ok(())
    }

    fn write_qname(&mut self, qname: &str) -> Result<()> {
        for label in qname.split('.').filter(|s| !s.is_empty()) {
            let len = label.len();
            if len > 63 {
                return Err(BufferError::SingleLabelTooLong);
            }

            self.write_u8(len as u8)?;
            for b in label.as_bytes() {
                self.write_u8(*b)?;
            }
        }

        self.write_u8(0)?;
        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()>;

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;
        Ok(())
    }
}

/// Fixed 64KiB buffer. Large enough to hold a single UDP datagram or a
/// length-prefixed TCP message up to the DNS wire size limit.
pub struct BytePacketBuffer {
    pub buf: [u8; 65535],
    pub pos: usize,
}

impl Default for BytePacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BytePacketBuffer {
    pub fn new() -> BytePacketBuffer {
        BytePacketBuffer {
            buf: [0; 65535],
            pos: 0,
        }
    }
}

impl fmt::Debug for BytePacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytePacketBuffer").field("pos", &self.pos).finish()
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= 65535 {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;
        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= 65535 {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buf[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len >= 65535 {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buf[start..start + len])
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;
        Ok(())
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= 65535 {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[self.pos] = val;
        self.pos += 1;
        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        self.buf[pos] = val;
        Ok(())
    }
}

/// Growable buffer backing, used when serializing outbound messages whose
/// size isn't known to be bounded by a single datagram (e.g. TCP framing,
/// or measuring a message while truncating it to fit).
#[derive(Debug, Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
        }
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        let res = self.get(self.pos)?;
        self.pos += 1;
        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buffer.get(pos).copied().ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buffer[start..start + len])
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;
        Ok(())
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn write(&mut self, val: u8) -> Result<()> {
        self.buffer.push(val);
        self.pos += 1;
        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        self.buffer[pos] = val;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qname_round_trip_without_compression() {
        let mut buf = VectorPacketBuffer::new();
        buf.write_qname("example.com").unwrap();
        buf.seek(0).unwrap();

        let mut name = String::new();
        buf.read_qname(&mut name).unwrap();
        assert_eq!(name, "example.com");
    }

    #[test]
    fn qname_case_is_preserved_on_read() {
        let mut buf = VectorPacketBuffer::new();
        buf.write_qname("ExAmPlE.CoM").unwrap();
        buf.seek(0).unwrap();

        let mut name = String::new();
        buf.read_qname(&mut name).unwrap();
        assert_eq!(name, "ExAmPlE.CoM");
    }

    #[test]
    fn compression_pointer_is_followed() {
        let mut buf = BytePacketBuffer::new();
        buf.write_qname("example.com").unwrap();
        let second_start = buf.pos();
        // a pointer back to offset 0
        buf.write_u8(0xC0).unwrap();
        buf.write_u8(0x00).unwrap();

        buf.seek(second_start).unwrap();
        let mut name = String::new();
        buf.read_qname(&mut name).unwrap();
        assert_eq!(name, "example.com");
    }
}
