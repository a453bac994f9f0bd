// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::os::fd::RawFd;

use log::*;
use nix::poll::PollFlags;

use crate::buffer::Buffer;
use crate::codec::{self, HeaderKind, PacketType, MAX_PACKET};
use crate::error::Error;
use crate::socket::Socket;

/// Which direction a channel moves bytes, relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We write to the local fd; payload arrives from the link.
    Sink,
    /// We read from the local fd; payload is sent out onto the link.
    Source,
}

/// A one-shot callback, consumed the first time it fires.
pub type OnceHook = Box<dyn FnOnce()>;

/// The adaptor between a local file descriptor and a link packet type.
///
/// A sink's socket is opened write-only, with read-EOF set immediately so
/// no recv buffer is ever posted to it. A source's socket is opened
/// read-only; its `poll`/`doio` pair reads local data and frames it as
/// packets of type `id` onto the transaction's link socket.
pub struct Channel {
    pub id: u8,
    socket: Option<Socket>,
    direction: Direction,
    /// A source that is attached but withheld from polling -- never posts
    /// a recv buffer -- until unplugged by the owning transaction.
    pub plugged: bool,
    read_eof_cb: Option<OnceHook>,
    write_eof_cb: Option<OnceHook>,
    header_kind: HeaderKind,
}

impl Channel {
    pub fn new_sink(socket: Socket, id: u8, header_kind: HeaderKind) -> Self {
        Self {
            id,
            socket: Some(socket),
            direction: Direction::Sink,
            plugged: false,
            read_eof_cb: None,
            write_eof_cb: None,
            header_kind,
        }
    }

    pub fn new_source(socket: Socket, id: u8, header_kind: HeaderKind, plugged: bool) -> Self {
        Self {
            id,
            socket: Some(socket),
            direction: Direction::Source,
            plugged,
            read_eof_cb: None,
            write_eof_cb: None,
            header_kind,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_dead(&self) -> bool {
        self.socket.as_ref().map(Socket::is_dead).unwrap_or(true)
    }

    pub fn set_read_eof_cb(&mut self, cb: OnceHook) {
        self.read_eof_cb = Some(cb);
    }

    pub fn set_write_eof_cb(&mut self, cb: OnceHook) {
        self.write_eof_cb = Some(cb);
    }

    /// Whether this channel has a `write_eof_cb` installed -- used by
    /// `Transaction::recv_packet` to find the sink that should absorb an
    /// `'E'` packet when no sink matches the packet's type byte directly.
    pub fn has_write_eof_cb(&self) -> bool {
        self.write_eof_cb.is_some()
    }

    /// Clone `payload` into the sink socket's send queue. If the socket has
    /// been detached, this is a silent no-op -- per the distilled spec,
    /// `write_data` on a channel with no socket must return success without
    /// touching its argument.
    pub fn write_data(&mut self, payload: &[u8]) {
        if let Some(socket) = self.socket.as_mut() {
            socket.xmit_shared(payload);
        }
    }

    /// Drain the sink socket's send queue synchronously, looping `doio`
    /// until it empties or hits an error.
    pub fn flush(&mut self) -> nix::Result<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };
        while socket.xmit_queue_bytes() > 0 {
            socket.doio()?;
        }
        Ok(())
    }

    /// Drain whatever is still queued on the sink socket, then shut it down
    /// for writing, firing its `write_eof_cb` at most once. Flushing first
    /// matters when a `'d'` data packet and the `'E'` that follows it land
    /// in the same dispatch pass: without it, bytes `write_data` just
    /// queued would be discarded before `Transaction::doio` ever wrote them
    /// out.
    pub fn write_eof(&mut self) {
        if let Err(e) = self.flush() {
            warn!("channel {}: flush before write-EOF failed: {e}", self.id);
        }
        if let Some(socket) = self.socket.as_mut() {
            socket.shutdown_write();
        }
        if let Some(cb) = self.write_eof_cb.take() {
            cb();
        }
    }

    /// Detach and drop this channel's socket, so future `write_data` calls
    /// on it become no-ops. Used by `close_sink`/`close_source`.
    pub fn detach(&mut self) {
        self.socket = None;
    }

    /// This channel's pollable descriptor and the events it wants, if any.
    ///
    /// A source never reports interest while `plugged`. Returned as a raw
    /// `(fd, events)` pair rather than a borrowed `PollFd` so a caller
    /// aggregating these across many channels and transactions (see
    /// `connection::Connection::tick`) doesn't have to keep every channel
    /// borrowed for as long as the aggregated poll set lives.
    pub fn poll_interest(&self) -> Option<(RawFd, PollFlags)> {
        let socket = self.socket.as_ref()?;
        if self.direction == Direction::Source && self.plugged {
            return None;
        }
        socket.poll_interest().map(|events| (socket.fd(), events))
    }

    /// For a source channel: if not plugged, not read-EOF, and no recv
    /// buffer is currently posted, post a fresh one sized for a full
    /// packet with header room reserved.
    pub fn ensure_source_recvbuf(&mut self) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        if self.direction != Direction::Source || self.plugged {
            return;
        }
        if socket.is_read_eof() || socket.get_recvbuf().is_some() {
            return;
        }

        let header_size = self.header_kind.header_size();
        let mut buf = Buffer::new(MAX_PACKET);
        buf.reserve_head(header_size);
        socket.post_recvbuf(buf);
    }

    /// Perform this channel's socket I/O.
    ///
    /// For a sink, this just drains/fills its own socket. For a source,
    /// once the posted recv buffer is full or read-EOF has been reached,
    /// the payload is taken, framed as a packet of type `self.id`, and
    /// queued onto `link` (the transaction's link socket). On read-EOF
    /// with an installed `read_eof_cb`, the callback fires once.
    ///
    /// Fatal I/O errors mark this channel's socket dead and are returned
    /// to the caller, which is expected to fail the owning transaction.
    pub fn doio(&mut self, xid: u16, link: &mut Socket) -> Result<(), Error> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };

        if let Err(e) = socket.doio() {
            socket.mark_dead();
            return Err(e.into());
        }

        if self.direction != Direction::Source {
            return Ok(());
        }

        let ready = socket.get_recvbuf().map(Buffer::is_full).unwrap_or(false)
            || (socket.is_read_eof() && socket.get_recvbuf().is_some());

        if !ready {
            return Ok(());
        }

        let Some(buf) = socket.take_recvbuf() else {
            return Ok(());
        };

        let payload = buf.take();
        if !payload.is_empty() {
            let packet_type = PacketType::try_from(self.id)
                .expect("source channel id must correspond to a known packet type");
            let framed = codec::build(self.header_kind, packet_type, xid, &payload);
            link.queue_xmit(framed.take());
        }

        if socket.is_read_eof() {
            trace!("source channel {} reached read-EOF", self.id);
            if let Some(cb) = self.read_eof_cb.take() {
                cb();
            }
        }

        Ok(())
    }
}
