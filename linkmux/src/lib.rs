// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The transaction multiplexing core of a test-orchestration link.
//!
//! A single byte-oriented pipe (the "link": virtio-serial, a serial line,
//! or a TCP stream -- none of which this crate opens itself) carries many
//! logically independent request/response transactions at once, each
//! identified by a 16-bit xid and framed with a small packet header. This
//! crate is the wire framing ([`codec`]), the per-transaction channel
//! adaptor between a local file descriptor and a link packet type
//! ([`channel`]), the transaction state machine that owns those channels
//! and enforces the two-word major/minor terminal status ([`transaction`]),
//! and the non-blocking poll loop that drives every live transaction from
//! a single link ([`connection`]).
//!
//! Concrete transports, the command-execution side that forks subprocesses
//! and opens files for inject/extract, CLI parsing, and configuration are
//! external collaborators this crate never touches.

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod connection;
pub mod error;
pub mod socket;
pub mod transaction;

pub use buffer::Buffer;
pub use channel::{Channel, Direction};
pub use codec::{HeaderKind, PacketHeader, PacketType, MAX_PACKET};
pub use connection::{Connection, TransactionHandle};
pub use error::{Error, ProtocolError};
pub use socket::{OpenFlags, Socket, HIGH_WATER};
pub use transaction::{Transaction, TransactionKind};

/// A `socketpair(2)`-backed link, for tests and for any caller that wants
/// a loopback link without a real transport.
pub mod pipe {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    use crate::socket::{OpenFlags, Socket};

    /// Build a connected pair of read/write [`Socket`]s.
    pub fn socketpair() -> nix::Result<(Socket, Socket)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;

        Ok((
            Socket::new_flags(a, OpenFlags::ReadWrite)?,
            Socket::new_flags(b, OpenFlags::ReadWrite)?,
        ))
    }
}
