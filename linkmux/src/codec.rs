// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use crate::buffer::Buffer;
use crate::error::ProtocolError;

/// Maximum total packet length (header included), per the wire protocol.
pub const MAX_PACKET: usize = 32768;

/// Size of the base header: `{type, pad, len}`.
pub const BASE_HEADER_SIZE: usize = 4;

/// Size of the multiplexed header: base header plus a 2-byte xid.
pub const MUX_HEADER_SIZE: usize = 6;

/// Whether a link carries the 2-byte xid used to demultiplex packets to
/// their owning transaction. Chosen once, at link open, and fixed for the
/// link's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// `{type, pad, len}`, no xid. Used by the link's non-multiplexed peer
    /// side, or before multiplexing is negotiated.
    Basic,
    /// `{type, pad, len, xid}`, used inside the core to demultiplex to the
    /// owning transaction.
    Multiplexed,
}

impl HeaderKind {
    /// Size in bytes of a header of this kind.
    pub const fn header_size(self) -> usize {
        match self {
            HeaderKind::Basic => BASE_HEADER_SIZE,
            HeaderKind::Multiplexed => MUX_HEADER_SIZE,
        }
    }
}

/// The packet types known to this core. Any other byte on the wire is a
/// protocol error as far as this crate is concerned (a higher layer that
/// understands more types would need its own decode step).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// `'c'` command request: `"<user> <shell command>\0"`.
    Command,
    /// `'i'` inject request: `"<user> <size> <path>\0"`.
    Inject,
    /// `'e'` extract request: `"<user> <path>\0"`.
    Extract,
    /// `'q'` quit server, empty payload.
    Quit,
    /// `'I'` interrupt, empty payload.
    Interrupt,
    /// `'0'` stdin data, raw bytes.
    StdinData,
    /// `'1'` stdout data, raw bytes.
    StdoutData,
    /// `'2'` stderr data, raw bytes.
    StderrData,
    /// `'d'` file data chunk, raw bytes.
    FileData,
    /// `'s'` file size reply, decimal ASCII + NUL.
    FileSize,
    /// `'E'` EOF on a stream, empty payload.
    Eof,
    /// `'M'` major status, decimal ASCII + NUL.
    MajorStatus,
    /// `'m'` minor status, decimal ASCII + NUL.
    MinorStatus,
    /// `'T'` timeout notification, empty payload.
    Timeout,
}

impl PacketType {
    /// The byte this packet type is encoded as on the wire.
    pub const fn as_byte(self) -> u8 {
        match self {
            PacketType::Command => b'c',
            PacketType::Inject => b'i',
            PacketType::Extract => b'e',
            PacketType::Quit => b'q',
            PacketType::Interrupt => b'I',
            PacketType::StdinData => b'0',
            PacketType::StdoutData => b'1',
            PacketType::StderrData => b'2',
            PacketType::FileData => b'd',
            PacketType::FileSize => b's',
            PacketType::Eof => b'E',
            PacketType::MajorStatus => b'M',
            PacketType::MinorStatus => b'm',
            PacketType::Timeout => b'T',
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Ok(match b {
            b'c' => PacketType::Command,
            b'i' => PacketType::Inject,
            b'e' => PacketType::Extract,
            b'q' => PacketType::Quit,
            b'I' => PacketType::Interrupt,
            b'0' => PacketType::StdinData,
            b'1' => PacketType::StdoutData,
            b'2' => PacketType::StderrData,
            b'd' => PacketType::FileData,
            b's' => PacketType::FileSize,
            b'E' => PacketType::Eof,
            b'M' => PacketType::MajorStatus,
            b'm' => PacketType::MinorStatus,
            b'T' => PacketType::Timeout,
            other => return Err(ProtocolError::UnknownPacketType(other)),
        })
    }
}

/// A parsed packet header (and, for a multiplexed link, the xid it was
/// demultiplexed by).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub len: usize,
    pub xid: Option<u16>,
}

/// Build a complete packet (header + payload) ready to hand to a socket's
/// send queue.
///
/// Allocates a buffer of exactly `header_size + payload.len()`, reserves
/// the header room, appends the payload, then prepends the header once the
/// total length is known -- the same "fill body, then patch header"
/// sequence the wire format's record mark used historically.
pub fn build(kind: HeaderKind, packet_type: PacketType, xid: u16, payload: &[u8]) -> Buffer {
    let header_size = kind.header_size();
    let total_len = header_size + payload.len();
    assert!(total_len <= MAX_PACKET, "packet exceeds MAX_PACKET");

    let mut buf = Buffer::new(total_len);
    buf.reserve_head(header_size);
    buf.append(payload);

    let mut header = Vec::with_capacity(header_size);
    header.push(packet_type.as_byte());
    header.push(0); // pad
    header.extend_from_slice(&(total_len as u16).to_be_bytes());
    if kind == HeaderKind::Multiplexed {
        header.extend_from_slice(&xid.to_be_bytes());
    }

    buf.prepend(&header);
    buf
}

/// Build a packet whose payload is a decimal-ASCII rendering of `value`
/// followed by a terminating NUL, for historical compatibility with the
/// wire format's `'M'`/`'m'`/`'s'` packets.
pub fn build_uint(kind: HeaderKind, packet_type: PacketType, xid: u16, value: u32) -> Buffer {
    let mut payload = value.to_string().into_bytes();
    payload.push(0);
    build(kind, packet_type, xid, &payload)
}

/// Parse a decimal-ASCII-plus-NUL payload, as carried by `'M'`/`'m'`/`'s'`
/// packets.
pub fn parse_uint(payload: &[u8]) -> Result<u32, ProtocolError> {
    let (nul, digits) = payload.split_last().ok_or(ProtocolError::Decode)?;
    if *nul != 0 {
        return Err(ProtocolError::Decode);
    }
    let text = std::str::from_utf8(digits).map_err(|_| ProtocolError::Decode)?;
    text.parse::<u32>().map_err(|_| ProtocolError::Decode)
}

/// Peek the total packet length out of `data`'s header without requiring
/// the full packet to have arrived yet.
///
/// Returns `None` if `data` doesn't even hold a complete header (caller
/// should keep reading). Otherwise returns `Some(Ok(total_len))`, or
/// `Some(Err(LengthOutOfRange))` if the header's own `len` field is
/// already known to be invalid -- this lets a stream reassembler (see
/// `connection::Connection`) distinguish "need more bytes" from "this
/// link is broken" before a full frame is even available to hand to
/// [`parse`].
pub fn peek_length(kind: HeaderKind, data: &[u8]) -> Option<Result<usize, ProtocolError>> {
    let header_size = kind.header_size();
    if data.len() < header_size {
        return None;
    }

    let len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if len < header_size || len > MAX_PACKET {
        return Some(Err(ProtocolError::LengthOutOfRange));
    }

    Some(Ok(len))
}

/// Parse a packet header out of `data`, validating `len` is within
/// `header_size..=MAX_PACKET` before anything downstream indexes the
/// payload. Returns the header and the payload slice following it.
pub fn parse(kind: HeaderKind, data: &[u8]) -> Result<(PacketHeader, &[u8]), ProtocolError> {
    let header_size = kind.header_size();
    if data.len() < header_size {
        return Err(ProtocolError::Decode);
    }

    let packet_type = data[0];
    let len = u16::from_be_bytes([data[2], data[3]]) as usize;

    if len < header_size || len > MAX_PACKET {
        return Err(ProtocolError::LengthOutOfRange);
    }

    if data.len() < len {
        return Err(ProtocolError::Decode);
    }

    let xid = match kind {
        HeaderKind::Basic => None,
        HeaderKind::Multiplexed => Some(u16::from_be_bytes([data[4], data[5]])),
    };

    let header = PacketHeader {
        packet_type,
        len,
        xid,
    };

    Ok((header, &data[header_size..len]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(kind: HeaderKind, packet_type: PacketType, xid: u16, payload: &[u8]) {
        let buf = build(kind, packet_type, xid, payload);
        let bytes = buf.take();

        let (header, parsed_payload) = parse(kind, &bytes).unwrap();
        assert_eq!(header.packet_type, packet_type.as_byte());
        assert_eq!(header.len, bytes.len());
        assert_eq!(parsed_payload, payload);
        match kind {
            HeaderKind::Basic => assert_eq!(header.xid, None),
            HeaderKind::Multiplexed => assert_eq!(header.xid, Some(xid)),
        }
    }

    #[test]
    fn round_trip_over_a_spread_of_payload_sizes_and_header_kinds() {
        let sizes = [0usize, 1, 2, 7, 64, 4096, MAX_PACKET - MUX_HEADER_SIZE];
        for &size in &sizes {
            let payload = vec![0xAB; size];
            round_trip(HeaderKind::Basic, PacketType::FileData, 0, &payload);
            round_trip(HeaderKind::Multiplexed, PacketType::FileData, 42, &payload);
        }
    }

    #[test]
    fn length_below_header_size_is_rejected() {
        let mut bytes = vec![b'0', 0, 0, 0];
        bytes[2..4].copy_from_slice(&3u16.to_be_bytes());
        let err = parse(HeaderKind::Basic, &bytes).unwrap_err();
        assert_eq!(err, ProtocolError::LengthOutOfRange);
    }

    #[test]
    fn length_above_max_packet_is_rejected() {
        let mut bytes = vec![0u8; 8];
        bytes[0] = b'0';
        bytes[2..4].copy_from_slice(&((MAX_PACKET + 1) as u16).to_be_bytes());
        let err = parse(HeaderKind::Basic, &bytes).unwrap_err();
        assert_eq!(err, ProtocolError::LengthOutOfRange);
    }

    #[test]
    fn uint_packet_round_trips() {
        let buf = build_uint(HeaderKind::Multiplexed, PacketType::MajorStatus, 7, 0);
        let bytes = buf.take();
        let (header, payload) = parse(HeaderKind::Multiplexed, &bytes).unwrap();
        assert_eq!(header.packet_type, b'M');
        assert_eq!(parse_uint(payload).unwrap(), 0);
    }

    #[test]
    fn uint_packet_without_trailing_nul_fails_to_parse() {
        assert!(parse_uint(b"123").is_err());
    }

    #[test]
    fn peek_length_waits_for_a_full_header_before_deciding() {
        assert_eq!(peek_length(HeaderKind::Multiplexed, &[b'0', 0, 0]), None);

        let mut bytes = [0u8; 6];
        bytes[0] = b'0';
        bytes[2..4].copy_from_slice(&20u16.to_be_bytes());
        assert_eq!(
            peek_length(HeaderKind::Multiplexed, &bytes),
            Some(Ok(20))
        );
    }

    #[test]
    fn peek_length_rejects_an_out_of_range_len_as_soon_as_the_header_is_in() {
        let mut bytes = [0u8; 4];
        bytes[0] = b'0';
        bytes[2..4].copy_from_slice(&2u16.to_be_bytes());
        assert_eq!(
            peek_length(HeaderKind::Basic, &bytes),
            Some(Err(ProtocolError::LengthOutOfRange))
        );
    }
}
