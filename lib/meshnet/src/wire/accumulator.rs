//! The incremental parser that turns an arbitrarily fragmented byte feed into a stream of
//! `Frame`s. On every byte fed, exactly one phase transition may occur, and at most one fully
//! assembled record is emitted per byte — this is what lets the same accumulator handle a
//! stream split one byte at a time, in arbitrary chunks, or all at once, identically.
//!
//! Owned by exactly one connection and fed by exactly one reader thread; no locking here.

use crate::packet::PacketIdMappingProvider;
use crate::wire::frame::{
    ControlRecord, Frame, MAGIC_CHECK, MAGIC_CHECK_REPLY, MAGIC_CONNECTED, MAGIC_LOGIN,
    MAGIC_LOGOUT, MAGIC_PACKET, MAGIC_SERVERINFORQ,
};
use byteorder::{BigEndian, ReadBytesExt};
use netsupport::logging::{self, Logger};
use netsupport::{ErrorKind, NetworkError, NetworkResult};

#[derive(Debug, Eq, PartialEq)]
enum Phase {
    SearchType,
    PacketId,
    PacketLength,
    PacketData,
    CheckUuid,
    CheckReplyUuid,
}

pub struct ByteAccumulator {
    phase: Phase,
    int_buf: [u8; 4],
    int_pos: usize,
    packet_id: i32,
    payload_len: usize,
    payload: Vec<u8>,
    log: Logger,
}

impl ByteAccumulator {
    pub fn new(log: impl Into<Option<Logger>>) -> ByteAccumulator {
        ByteAccumulator {
            phase: Phase::SearchType,
            int_buf: [0; 4],
            int_pos: 0,
            packet_id: 0,
            payload_len: 0,
            payload: Vec::new(),
            log: log.into().unwrap_or_else(logging::discard),
        }
    }

    /// Feeds a chunk of bytes, returning every record fully assembled as a result. A fatal
    /// framing error (a record whose length field cannot be trusted, so there is no way to
    /// locate the next record boundary) aborts and returns `Err`; whatever was already
    /// assembled before the bad byte is still returned via `frames`.
    pub fn feed(&mut self, bytes: &[u8], mapping: &PacketIdMappingProvider) -> NetworkResult<Vec<Frame>> {
        let mut frames = Vec::new();

        for &byte in bytes {
            if let Some(frame) = self.feed_byte(byte, mapping)? {
                frames.push(frame);
            }
        }

        Ok(frames)
    }

    fn feed_byte(&mut self, byte: u8, mapping: &PacketIdMappingProvider) -> NetworkResult<Option<Frame>> {
        match self.phase {
            Phase::SearchType => self.feed_int(byte).map(|value| value.and_then(|magic| self.on_magic(magic))),
            Phase::PacketId => {
                if let Some(id) = self.feed_int(byte)? {
                    self.packet_id = id;
                    self.phase = Phase::PacketLength;
                }
                Ok(None)
            }
            Phase::PacketLength => match self.feed_int(byte)? {
                Some(length) => {
                    if length < 0 {
                        return Err(NetworkError::Fatal(ErrorKind::NegativeLength));
                    }

                    self.payload_len = length as usize;
                    self.payload = Vec::with_capacity(self.payload_len);

                    if self.payload_len == 0 {
                        Ok(self.finish_packet(mapping))
                    } else {
                        self.phase = Phase::PacketData;
                        Ok(None)
                    }
                }
                None => Ok(None),
            },
            Phase::PacketData => {
                self.payload.push(byte);

                if self.payload.len() == self.payload_len {
                    Ok(self.finish_packet(mapping))
                } else {
                    Ok(None)
                }
            }
            Phase::CheckUuid => Ok(self
                .feed_int(byte)?
                .map(|uuid| Frame::Control(ControlRecord::Check(uuid)))
                .inspect_done(&mut self.phase)),
            Phase::CheckReplyUuid => Ok(self
                .feed_int(byte)?
                .map(|uuid| Frame::Control(ControlRecord::CheckReply(uuid)))
                .inspect_done(&mut self.phase)),
        }
    }

    /// Accumulates one byte into the 4-byte integer buffer, returning the parsed big-endian
    /// `i32` once full (and resetting the buffer for the next field).
    fn feed_int(&mut self, byte: u8) -> NetworkResult<Option<i32>> {
        self.int_buf[self.int_pos] = byte;
        self.int_pos += 1;

        if self.int_pos < 4 {
            return Ok(None);
        }

        self.int_pos = 0;
        let mut cursor = &self.int_buf[..];
        Ok(Some(cursor.read_i32::<BigEndian>()?))
    }

    fn on_magic(&mut self, magic: i32) -> Option<Frame> {
        match magic {
            MAGIC_PACKET => {
                self.phase = Phase::PacketId;
                None
            }
            MAGIC_CHECK => {
                self.phase = Phase::CheckUuid;
                None
            }
            MAGIC_CHECK_REPLY => {
                self.phase = Phase::CheckReplyUuid;
                None
            }
            MAGIC_LOGIN => Some(Frame::Control(ControlRecord::Login)),
            MAGIC_LOGOUT => Some(Frame::Control(ControlRecord::Logout)),
            MAGIC_CONNECTED => Some(Frame::Control(ControlRecord::Connected)),
            MAGIC_SERVERINFORQ => Some(Frame::Control(ControlRecord::ServerInfoRequest)),
            other => {
                logging::warn!(self.log, "dropping record with unknown magic, resyncing";
                    "context" => "accumulator", "magic" => other);
                None
            }
        }
    }

    /// Only checks the id is mapped (cheap); the actual `read_data` body decode is left to the
    /// caller via `frame::decode_packet_body`, so it can be run inline or offloaded to a
    /// decoder pool without the accumulator itself knowing about pools at all.
    fn finish_packet(&mut self, mapping: &PacketIdMappingProvider) -> Option<Frame> {
        self.phase = Phase::SearchType;

        let packet_id = self.packet_id;
        let body = std::mem::take(&mut self.payload);

        if !mapping.contains(packet_id) {
            logging::warn!(self.log, "dropping packet with unmapped id";
                "context" => "accumulator", "packet_id" => packet_id);
            return None;
        }

        Some(Frame::RawPacket { packet_id, body })
    }
}

/// Small helper so the `Check`/`CheckReply` arms can reset phase only once the integer is
/// actually complete, without repeating the `if let Some` boilerplate.
trait InspectDone {
    fn inspect_done(self, phase: &mut Phase) -> Self;
}

impl InspectDone for Option<Frame> {
    fn inspect_done(self, phase: &mut Phase) -> Self {
        if self.is_some() {
            *phase = Phase::SearchType;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frame::{encode_packet, ControlRecord};
    use std::io::{Read, Write};

    struct Echo(Vec<u8>);

    impl crate::packet::Packet for Echo {
        fn packet_id(&self) -> i32 {
            7
        }
        fn write_data(&self, w: &mut dyn Write) -> std::io::Result<()> {
            w.write_all(&self.0)
        }
        fn read_data(&mut self, r: &mut dyn Read) -> std::io::Result<()> {
            self.0.clear();
            r.read_to_end(&mut self.0)
        }
    }

    fn mapping() -> PacketIdMappingProvider {
        let mapping = PacketIdMappingProvider::new();
        mapping.register(7, || Echo(Vec::new()));
        mapping
    }

    fn assert_frames_match(frames: &[Frame], expected_body: &[u8]) {
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::RawPacket { packet_id, body } => {
                assert_eq!(*packet_id, 7);
                assert_eq!(body, expected_body);
            }
            _ => panic!("expected packet frame"),
        }
        match &frames[1] {
            Frame::Control(ControlRecord::Check(id)) => assert_eq!(*id, 42),
            _ => panic!("expected check frame"),
        }
    }

    #[test]
    fn split_at_every_granularity_yields_identical_output() {
        let mapping = mapping();

        let mut bytes = encode_packet(&Echo(vec![0x61]), 64).unwrap();
        bytes.extend(ControlRecord::Check(42).encode().unwrap());

        // All at once.
        let mut acc = ByteAccumulator::new(None);
        let frames = acc.feed(&bytes, &mapping).unwrap();
        assert_frames_match(&frames, &[0x61]);

        // One byte at a time.
        let mut acc = ByteAccumulator::new(None);
        let mut frames = Vec::new();
        for &b in &bytes {
            frames.extend(acc.feed(&[b], &mapping).unwrap());
        }
        assert_frames_match(&frames, &[0x61]);

        // Two bytes at a time.
        let mut acc = ByteAccumulator::new(None);
        let mut frames = Vec::new();
        for chunk in bytes.chunks(2) {
            frames.extend(acc.feed(chunk, &mapping).unwrap());
        }
        assert_frames_match(&frames, &[0x61]);
    }

    #[test]
    fn negative_length_is_fatal() {
        let mapping = mapping();
        let mut acc = ByteAccumulator::new(None);

        let mut bytes = Vec::new();
        bytes.extend(&MAGIC_PACKET.to_be_bytes());
        bytes.extend(&7i32.to_be_bytes());
        bytes.extend(&(-1i32).to_be_bytes());

        let result = acc.feed(&bytes, &mapping);
        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorKind::NegativeLength));
    }

    #[test]
    fn unmapped_packet_id_is_dropped_not_fatal() {
        let mapping = mapping();
        let mut acc = ByteAccumulator::new(None);

        let unmapped = encode_packet(&Echo(vec![1, 2, 3]), 64).unwrap();
        let mut bytes = Vec::new();
        // Same encoding shape, but the receiver's mapping doesn't know id 999.
        bytes.extend(&MAGIC_PACKET.to_be_bytes());
        bytes.extend(&999i32.to_be_bytes());
        bytes.extend(&3i32.to_be_bytes());
        bytes.extend(&[1, 2, 3]);
        bytes.extend(ControlRecord::Login.encode().unwrap());

        let frames = acc.feed(&bytes, &mapping).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Control(ControlRecord::Login)));

        let _ = unmapped;
    }

    #[test]
    fn unknown_magic_resyncs_without_closing() {
        let mapping = mapping();
        let mut acc = ByteAccumulator::new(None);

        let mut bytes = Vec::new();
        bytes.extend(&0x11223344i32.to_be_bytes());
        bytes.extend(ControlRecord::Login.encode().unwrap());

        let frames = acc.feed(&bytes, &mapping).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Control(ControlRecord::Login)));
    }

    #[test]
    fn zero_length_packet_body() {
        let mapping = mapping();
        let mut acc = ByteAccumulator::new(None);

        let bytes = encode_packet(&Echo(Vec::new()), 64).unwrap();
        let frames = acc.feed(&bytes, &mapping).unwrap();

        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::RawPacket { packet_id, body } => {
                assert_eq!(*packet_id, 7);
                assert!(body.is_empty());
            }
            _ => panic!("expected packet"),
        }
    }
}
