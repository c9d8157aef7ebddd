//! Wire codec collaborator
//!
//! Parses and serializes DNS messages. Kept behind a trait so tests can
//! substitute a codec double that never touches the real wire format,
//! but this crate ships exactly one production implementation
//! (`StdDnsCodec`), a thin wrapper over `protocol`/`buffer`.

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use crate::dns::protocol::DnsPacket;

/// Parses inbound bytes into a `DnsPacket` and serializes outbound
/// messages using length-prefixed TCP framing (the same framing is used
/// to build the UDP payload; the two-byte prefix is stripped by the
/// transport before a UDP datagram hits the wire).
pub trait DnsCodec: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<DnsPacket, crate::dns::errors::Status>;

    /// Serialize `packet`, writing a two-byte big-endian length prefix
    /// followed by the message, appending to `out`.
    fn write_tcp_framed(
        &self,
        packet: &mut DnsPacket,
        out: &mut Vec<u8>,
    ) -> Result<(), crate::dns::errors::Status>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdDnsCodec;

impl DnsCodec for StdDnsCodec {
    fn parse(&self, bytes: &[u8]) -> Result<DnsPacket, crate::dns::errors::Status> {
        let mut buffer = BytePacketBuffer::new();
        if bytes.len() > buffer.buf.len() {
            return Err(crate::dns::errors::Status::BadResp);
        }
        buffer.buf[..bytes.len()].copy_from_slice(bytes);

        DnsPacket::from_buffer(&mut buffer).map_err(|e| {
            log::debug!("failed to parse response: {}", e);
            crate::dns::errors::Status::BadResp
        })
    }

    fn write_tcp_framed(
        &self,
        packet: &mut DnsPacket,
        out: &mut Vec<u8>,
    ) -> Result<(), crate::dns::errors::Status> {
        let mut buf = VectorPacketBuffer::new();
        packet.write(&mut buf, 65535).map_err(|e| {
            log::warn!("failed to serialize outbound query: {}", e);
            crate::dns::errors::Status::NoMem
        })?;

        out.extend_from_slice(&(buf.buffer.len() as u16).to_be_bytes());
        out.extend_from_slice(&buf.buffer);
        Ok(())
    }
}
