// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// Errors surfaced by the framing, channel, transaction, and poll-loop
/// layers.
#[derive(Debug)]
pub enum Error {
    /// A framing or packet-discipline violation: bad length, unknown type,
    /// duplicate status, and similar.
    Protocol(ProtocolError),

    /// A syscall returned an errno this crate needs to act on (mark a
    /// socket dead, fail a transaction).
    Errno(nix::Error),

    /// Any other I/O failure.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Errno(e) => write!(f, "system error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self::Errno(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Errors specific to the wire framing, distinct from the errno values a
/// transaction's major/minor status carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A packet's `len` field was outside `HEADER_SIZE..=MAX_PACKET`.
    LengthOutOfRange,

    /// A packet's `type` byte did not match any known `PacketType`.
    UnknownPacketType(u8),

    /// A packet arrived that no sink, EOF special-case, or `recv_hook`
    /// could account for.
    UnexpectedPacket,

    /// Generic decode failure (malformed uint payload, truncated header).
    Decode,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthOutOfRange => write!(f, "packet length out of range"),
            Self::UnknownPacketType(b) => write!(f, "unknown packet type {b:#04x}"),
            Self::UnexpectedPacket => write!(f, "unexpected packet for this transaction"),
            Self::Decode => write!(f, "error decoding packet payload"),
        }
    }
}

/// `errno` value used when a peer violates the framing/packet discipline.
/// Matches the historical wire protocol's use of `EPROTO` in the major
/// status slot.
pub const EPROTO: i32 = libc::EPROTO;
