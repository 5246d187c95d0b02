//! The five core record kinds plus the two extended kinds used by the stream/datagram
//! handshake (`CONNECTED`) and the optional server-info broadcast utility
//! (`SERVERINFORQ`). All multi-byte integers on the wire are big-endian.

use crate::packet::Packet;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};

pub const MAGIC_PACKET: i32 = 0xFEDCBA00u32 as i32;
pub const MAGIC_CHECK: i32 = 0xFEDCBA01u32 as i32;
pub const MAGIC_CHECK_REPLY: i32 = 0xFEDCBA02u32 as i32;
pub const MAGIC_LOGIN: i32 = 0xFEDCBA03u32 as i32;
pub const MAGIC_LOGOUT: i32 = 0xFEDCBA04u32 as i32;
pub const MAGIC_CONNECTED: i32 = 0xFEDCBA05u32 as i32;
pub const MAGIC_SERVERINFORQ: i32 = 0xFEDCBA06u32 as i32;

/// The non-`PACKET` record kinds. These carry no application payload, so they can be matched
/// and handled without involving the packet id mapping provider.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControlRecord {
    Check(i32),
    CheckReply(i32),
    Login,
    Logout,
    Connected,
    ServerInfoRequest,
}

impl ControlRecord {
    #[inline]
    fn magic(self) -> i32 {
        match self {
            ControlRecord::Check(_) => MAGIC_CHECK,
            ControlRecord::CheckReply(_) => MAGIC_CHECK_REPLY,
            ControlRecord::Login => MAGIC_LOGIN,
            ControlRecord::Logout => MAGIC_LOGOUT,
            ControlRecord::Connected => MAGIC_CONNECTED,
            ControlRecord::ServerInfoRequest => MAGIC_SERVERINFORQ,
        }
    }

    pub fn encode(self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8);
        out.write_i32::<BigEndian>(self.magic())?;

        match self {
            ControlRecord::Check(uuid) | ControlRecord::CheckReply(uuid) => {
                out.write_i32::<BigEndian>(uuid)?;
            }
            ControlRecord::Login
            | ControlRecord::Logout
            | ControlRecord::Connected
            | ControlRecord::ServerInfoRequest => {}
        }

        Ok(out)
    }
}

/// A record emitted by the `ByteAccumulator`. `RawPacket` is framed (id and body boundary known)
/// but deliberately not yet decoded into a concrete `Packet` — the caller chooses, via a decoder
/// pool's `is_valid_coder_thread()`, whether `decode_packet_body` runs on the calling thread or
/// is offloaded.
pub enum Frame {
    RawPacket { packet_id: i32, body: Vec<u8> },
    Control(ControlRecord),
}

/// Runs the `read_data` half of decoding a `PACKET` record's body, given the id and framed bytes
/// a `ByteAccumulator` already confirmed are mapped. The CPU-bound step `CoderPool` offloading
/// exists for.
pub fn decode_packet_body(packet_id: i32, body: &[u8], mapping: &crate::packet::PacketIdMappingProvider) -> io::Result<Box<dyn Packet>> {
    let mut packet = mapping
        .create(packet_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "packet id no longer mapped"))?;
    let mut cursor = body;
    packet.read_data(&mut cursor)?;
    Ok(packet)
}

/// Encodes a `PACKET` record for `packet`. If `packet.byte_size()` is negative the body buffer
/// starts at `encode_buffer_initial_size` and grows as `write_data` appends to it; otherwise it
/// is allocated exactly.
pub fn encode_packet(packet: &dyn Packet, encode_buffer_initial_size: usize) -> io::Result<Vec<u8>> {
    let hint = packet.byte_size();
    let mut body = Vec::with_capacity(if hint >= 0 {
        hint as usize
    } else {
        encode_buffer_initial_size
    });

    packet.write_data(&mut body)?;

    let mut out = Vec::with_capacity(12 + body.len());
    out.write_i32::<BigEndian>(MAGIC_PACKET)?;
    out.write_i32::<BigEndian>(packet.packet_id())?;
    out.write_i32::<BigEndian>(body.len() as i32)?;
    out.write_all(&body)?;

    Ok(out)
}
