// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::os::fd::RawFd;

use log::*;
use nix::poll::PollFlags;

use crate::channel::Channel;
use crate::codec::{self, HeaderKind, PacketHeader, PacketType};
use crate::error::{Error, EPROTO};
use crate::socket::Socket;

/// Which kind of request a transaction represents, per the `'c'`/`'i'`/`'e'`
/// packet types that open one.
///
/// `Other` preserves forward compatibility with a link peer that
/// introduces a request type this crate doesn't decode yet, the same way
/// `rpc_protocol`'s `AuthFlavor`/`AcceptedReplyBody` enums carry an escape
/// hatch for wire values outside the protocol's closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Command,
    Inject,
    Extract,
    Other(u8),
}

/// Invoked once per `doio()` round, after sinks have drained but before
/// sources are polled -- the seam a command transaction uses to notice
/// stdin read-EOF and emit its own bookkeeping, or an inject transaction
/// uses to unplug its file source once `major=0` has been observed.
pub type SendHook = Box<dyn FnMut(&mut Transaction, &mut Socket) -> Result<(), Error>>;

/// Invoked when `recv_packet` can't route an inbound packet to a sink or
/// the EOF special case -- the type-specific fallback named in the
/// distilled spec's §4.4 step 4.
pub type RecvHook = Box<dyn FnMut(&mut Transaction, &mut Socket, &PacketHeader, &[u8])>;

/// A single logical request multiplexed onto the link, identified by `id`
/// (the wire `xid`).
///
/// Owns its channel lists; the link socket it sends status and framed
/// channel data onto is threaded through explicitly to every operation
/// that needs it (see DESIGN.md's note on the non-owning link reference)
/// rather than stored as a field, so a transaction can never outlive or
/// close a link it doesn't own.
pub struct Transaction {
    id: u16,
    kind: TransactionKind,
    header_kind: HeaderKind,
    sinks: Vec<Channel>,
    sources: Vec<Channel>,
    major_sent: bool,
    minor_sent: bool,
    done: bool,
    send_hook: Option<SendHook>,
    recv_hook: Option<RecvHook>,
}

impl Transaction {
    pub fn new(id: u16, kind: TransactionKind, header_kind: HeaderKind) -> Self {
        Self {
            id,
            kind,
            header_kind,
            sinks: Vec::new(),
            sources: Vec::new(),
            major_sent: false,
            minor_sent: false,
            done: false,
            send_hook: None,
            recv_hook: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn major_sent(&self) -> bool {
        self.major_sent
    }

    pub fn minor_sent(&self) -> bool {
        self.minor_sent
    }

    pub fn set_send_hook(&mut self, hook: SendHook) {
        self.send_hook = Some(hook);
    }

    pub fn set_recv_hook(&mut self, hook: RecvHook) {
        self.recv_hook = Some(hook);
    }

    /// Attach a local sink at `id`. Any existing sink with the same id is
    /// replaced, per the "at most one sink per id" data-model invariant.
    /// The returned reference is non-owning -- ownership stays with this
    /// transaction, which frees it on `close_sink`/`close_source` or when
    /// its socket is found dead during a purge sweep.
    pub fn attach_local_sink(&mut self, socket: Socket, id: u8) -> &mut Channel {
        self.close_sink(id);
        self.sinks.push(Channel::new_sink(socket, id, self.header_kind));
        self.sinks.last_mut().expect("just pushed")
    }

    /// Attach a local source at `id`, optionally `plugged` (withheld from
    /// polling until [`Transaction::unplug_source`] releases it). See
    /// [`Transaction::attach_local_sink`] for the returned reference's
    /// ownership.
    pub fn attach_local_source(&mut self, socket: Socket, id: u8, plugged: bool) -> &mut Channel {
        self.close_source(id);
        self.sources
            .push(Channel::new_source(socket, id, self.header_kind, plugged));
        self.sources.last_mut().expect("just pushed")
    }

    /// Remove and drop sinks matching `id`, or every sink if `id == 0`.
    pub fn close_sink(&mut self, id: u8) {
        if id == 0 {
            self.sinks.clear();
        } else {
            self.sinks.retain(|c| c.id != id);
        }
    }

    /// Remove and drop sources matching `id`, or every source if `id == 0`.
    pub fn close_source(&mut self, id: u8) {
        if id == 0 {
            self.sources.clear();
        } else {
            self.sources.retain(|c| c.id != id);
        }
    }

    /// Release a previously-plugged source at `id`, letting it start
    /// polling and transmitting. Used by the client side of an inject once
    /// the server's `major=0` status arrives.
    pub fn unplug_source(&mut self, id: u8) {
        for source in self.sources.iter_mut() {
            if source.id == id {
                source.plugged = false;
            }
        }
    }

    /// Collect every channel's `(fd, events)` interest, gated by the
    /// link's own backpressure signal: sinks are always asked, sources
    /// only if `link.xmit_queue_allowed()`.
    pub fn poll_interest(&mut self, link: &Socket) -> Vec<(RawFd, PollFlags)> {
        let mut out = Vec::with_capacity(self.sinks.len() + self.sources.len());

        for sink in &self.sinks {
            if let Some(interest) = sink.poll_interest() {
                out.push(interest);
            }
        }

        if !link.xmit_queue_allowed() {
            return out;
        }

        for source in self.sources.iter_mut() {
            source.ensure_source_recvbuf();
        }
        for source in &self.sources {
            if let Some(interest) = source.poll_interest() {
                out.push(interest);
            }
        }

        out
    }

    /// Drive this transaction's channel I/O for one tick: every sink, then
    /// every source, then purge dead sinks, then the send hook, then purge
    /// dead sources -- in that order, so the hook sees this round's I/O on
    /// both sink and source channels (in particular a source's read-EOF,
    /// which it may need to emit a terminating EOF packet for) before
    /// sources are purged out from under it.
    ///
    /// A fatal I/O error on any channel fails the transaction with that
    /// channel's errno (unless it's already done) and is also returned to
    /// the caller.
    pub fn doio(&mut self, link: &mut Socket) -> Result<(), Error> {
        let mut first_err: Option<Error> = None;

        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.doio(self.id, link) {
                warn!("transaction {}: sink {} I/O error: {e}", self.id, sink.id);
                first_err.get_or_insert(e);
            }
        }

        for source in self.sources.iter_mut() {
            if let Err(e) = source.doio(self.id, link) {
                warn!(
                    "transaction {}: source {} I/O error: {e}",
                    self.id, source.id
                );
                first_err.get_or_insert(e);
            }
        }

        self.sinks.retain(|c| !c.is_dead());

        if let Some(mut hook) = self.send_hook.take() {
            let result = hook(self, link);
            self.send_hook = Some(hook);
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }

        self.sources.retain(|c| !c.is_dead());

        if let Some(e) = first_err {
            if !self.done {
                self.fail(link, error_errno(&e));
            }
            return Err(e);
        }

        Ok(())
    }

    /// Route an inbound packet per the distilled spec's precedence: a sink
    /// matching the packet's type byte, then (for an `'E'` packet) a sink
    /// with a `write_eof_cb` installed, then the `recv_hook`, then fail
    /// with `EPROTO`. Silently dropped if the transaction is already done.
    pub fn recv_packet(&mut self, link: &mut Socket, hdr: &PacketHeader, payload: &[u8]) {
        if self.done {
            trace!(
                "transaction {}: dropping late packet type {:#04x}",
                self.id, hdr.packet_type
            );
            return;
        }

        if let Some(sink) = self.sinks.iter_mut().find(|c| c.id == hdr.packet_type) {
            sink.write_data(payload);
            return;
        }

        if hdr.packet_type == PacketType::Eof.as_byte() {
            if let Some(sink) = self.sinks.iter_mut().find(|c| c.has_write_eof_cb()) {
                sink.write_eof();
                return;
            }
        }

        if let Some(mut hook) = self.recv_hook.take() {
            hook(self, link, hdr, payload);
            self.recv_hook = Some(hook);
            return;
        }

        warn!(
            "transaction {}: unexpected packet type {:#04x}, no sink/hook to route it to",
            self.id, hdr.packet_type
        );
        self.fail(link, EPROTO);
    }

    /// Enqueue a major status packet. Aborts if called a second time --
    /// per the distilled spec, a duplicate status is a caller-bug
    /// invariant violation, not a peer action to recover from.
    pub fn send_major(&mut self, link: &mut Socket, code: u32) {
        assert!(
            !self.major_sent,
            "send_major called twice for transaction {}",
            self.id
        );
        let buf = codec::build_uint(self.header_kind, PacketType::MajorStatus, self.id, code);
        link.queue_xmit(buf.take());
        self.major_sent = true;
        trace!("transaction {}: sent major={code}", self.id);
    }

    /// Enqueue a minor status packet. Aborts if called a second time, same
    /// rationale as [`Transaction::send_major`]. Once both status words
    /// have been sent, in either order and whether via this method, `fail`,
    /// or `send_status`, the transaction is done.
    pub fn send_minor(&mut self, link: &mut Socket, code: u32) {
        assert!(
            !self.minor_sent,
            "send_minor called twice for transaction {}",
            self.id
        );
        let buf = codec::build_uint(self.header_kind, PacketType::MinorStatus, self.id, code);
        link.queue_xmit(buf.take());
        self.minor_sent = true;
        if self.major_sent {
            self.done = true;
        }
        trace!("transaction {}: sent minor={code}", self.id);
    }

    /// Enqueue both status packets in order and mark the transaction done.
    /// A second call is logged and ignored rather than aborted, because
    /// higher layers sometimes race to finish a transaction from two
    /// directions at once.
    pub fn send_status(&mut self, link: &mut Socket, major: u32, minor: u32) {
        if self.done {
            warn!(
                "transaction {}: send_status called after done, ignoring",
                self.id
            );
            return;
        }
        self.send_major(link, major);
        self.send_minor(link, minor);
        self.done = true;
    }

    /// Mark the transaction done and emit whichever of major/minor hasn't
    /// already been sent, using `errno` for the missing one(s).
    ///
    /// Panics if both have already been sent: the transaction lifecycle
    /// has been violated by the caller, per the distilled spec's §7/§9 --
    /// this crate has no installed base whose release builds need to
    /// survive that bug, so it panics unconditionally rather than
    /// downgrading to a debug-only assertion.
    pub fn fail(&mut self, link: &mut Socket, errno: i32) {
        if self.major_sent && self.minor_sent {
            panic!(
                "transaction {}: fail() called after both major and minor already sent",
                self.id
            );
        }
        self.done = true;
        if !self.major_sent {
            self.send_major(link, errno as u32);
        }
        if !self.minor_sent {
            self.send_minor(link, errno as u32);
        }
    }

    /// Unconditionally send both status words and mark the transaction
    /// done, bypassing the double-send assertions in
    /// [`Transaction::send_major`]/[`Transaction::send_minor`] -- used
    /// when a caller has its own major/minor pair ready regardless of
    /// what (if anything) was sent before.
    pub fn fail2(&mut self, link: &mut Socket, major: u32, minor: u32) {
        let maj = codec::build_uint(self.header_kind, PacketType::MajorStatus, self.id, major);
        link.queue_xmit(maj.take());
        let min = codec::build_uint(self.header_kind, PacketType::MinorStatus, self.id, minor);
        link.queue_xmit(min.take());
        self.major_sent = true;
        self.minor_sent = true;
        self.done = true;
    }

    /// Enqueue a bare `'T'` timeout packet (no payload) and mark the
    /// transaction done, distinct from `EPROTO`/`ETIME` in the major slot
    /// so a caller can tell a timeout from a protocol error even when the
    /// peer never replied at all.
    pub fn send_timeout(&mut self, link: &mut Socket) {
        let buf = codec::build(self.header_kind, PacketType::Timeout, self.id, &[]);
        link.queue_xmit(buf.take());
        self.done = true;
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transaction(xid={}, kind={:?}, sinks={}, sources={}, done={})",
            self.id,
            self.kind,
            self.sinks.len(),
            self.sources.len(),
            self.done
        )
    }
}

fn error_errno(e: &Error) -> i32 {
    match e {
        Error::Errno(errno) => *errno as i32,
        Error::Io(io_err) => io_err.raw_os_error().unwrap_or(EPROTO),
        Error::Protocol(_) => EPROTO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MAX_PACKET;
    use crate::socket::{OpenFlags, HIGH_WATER};
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn link_pair() -> (Socket, Socket) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        (
            Socket::new_flags(a, OpenFlags::ReadWrite).unwrap(),
            Socket::new_flags(b, OpenFlags::ReadWrite).unwrap(),
        )
    }

    fn read_frame(peer: &mut Socket, kind: HeaderKind) -> (PacketHeader, Vec<u8>) {
        peer.post_recvbuf(crate::buffer::Buffer::new(MAX_PACKET));
        for _ in 0..100 {
            peer.doio().unwrap();
            if let Some(buf) = peer.get_recvbuf() {
                if buf.count() >= kind.header_size() {
                    let peek = codec::peek_length(kind, buf.as_slice());
                    if let Some(Ok(total)) = peek {
                        if buf.count() >= total {
                            break;
                        }
                    }
                }
            }
        }
        let buf = peer.take_recvbuf().unwrap();
        let bytes = buf.take();
        let (hdr, payload) = codec::parse(kind, &bytes).unwrap();
        (hdr, payload.to_vec())
    }

    #[test]
    fn status_monotonicity_major_then_minor_then_done() {
        let (mut client_side, mut server_side) = link_pair();
        let mut txn = Transaction::new(7, TransactionKind::Command, HeaderKind::Multiplexed);

        txn.send_status(&mut client_side, 0, 0);
        assert!(txn.is_done());
        client_side.doio().unwrap();

        let (hdr1, payload1) = read_frame(&mut server_side, HeaderKind::Multiplexed);
        assert_eq!(hdr1.packet_type, PacketType::MajorStatus.as_byte());
        assert_eq!(codec::parse_uint(&payload1).unwrap(), 0);

        let (hdr2, payload2) = read_frame(&mut server_side, HeaderKind::Multiplexed);
        assert_eq!(hdr2.packet_type, PacketType::MinorStatus.as_byte());
        assert_eq!(codec::parse_uint(&payload2).unwrap(), 0);
    }

    #[test]
    #[should_panic]
    fn send_major_twice_is_a_caller_bug() {
        let (mut link, _peer) = link_pair();
        let mut txn = Transaction::new(1, TransactionKind::Command, HeaderKind::Multiplexed);
        txn.send_major(&mut link, 0);
        txn.send_major(&mut link, 0);
    }

    #[test]
    fn fail_sends_only_the_missing_status_word() {
        let (mut link, mut peer) = link_pair();
        let mut txn = Transaction::new(3, TransactionKind::Extract, HeaderKind::Multiplexed);
        txn.send_major(&mut link, 0);
        link.doio().unwrap();
        let _ = read_frame(&mut peer, HeaderKind::Multiplexed);

        txn.fail(&mut link, 5);
        assert!(txn.is_done());
        link.doio().unwrap();

        let (hdr, payload) = read_frame(&mut peer, HeaderKind::Multiplexed);
        assert_eq!(hdr.packet_type, PacketType::MinorStatus.as_byte());
        assert_eq!(codec::parse_uint(&payload).unwrap(), 5);
    }

    #[test]
    fn routing_prefers_sink_over_recv_hook_over_fail() {
        let (mut link, _peer) = link_pair();
        let mut txn = Transaction::new(9, TransactionKind::Command, HeaderKind::Multiplexed);

        let (sink_fd, _sink_peer) = link_pair();
        txn.attach_local_sink(sink_fd, PacketType::StdoutData.as_byte());

        let hit = Rc::new(RefCell::new(false));
        let hit2 = hit.clone();
        txn.set_recv_hook(Box::new(move |_t, _link, _hdr, _payload| {
            *hit2.borrow_mut() = true;
        }));

        let hdr = PacketHeader {
            packet_type: PacketType::StdoutData.as_byte(),
            len: 4 + 2,
            xid: Some(9),
        };
        txn.recv_packet(&mut link, &hdr, b"hi");
        assert!(!*hit.borrow(), "sink should have absorbed the packet");

        let other_hdr = PacketHeader {
            packet_type: b'Z',
            len: 4,
            xid: Some(9),
        };
        txn.recv_packet(&mut link, &other_hdr, &[]);
        assert!(*hit.borrow(), "recv_hook should see an unrouted packet type");
    }

    #[test]
    fn unexpected_packet_with_no_hook_fails_with_eproto() {
        let (mut link, mut peer) = link_pair();
        let mut txn = Transaction::new(4, TransactionKind::Command, HeaderKind::Multiplexed);

        let hdr = PacketHeader {
            packet_type: b'Z',
            len: 4,
            xid: Some(4),
        };
        txn.recv_packet(&mut link, &hdr, &[]);
        assert!(txn.is_done());
        link.doio().unwrap();

        let (major_hdr, major_payload) = read_frame(&mut peer, HeaderKind::Multiplexed);
        assert_eq!(major_hdr.packet_type, PacketType::MajorStatus.as_byte());
        assert_eq!(codec::parse_uint(&major_payload).unwrap(), EPROTO as u32);
    }

    #[test]
    fn backpressure_gates_source_poll_interest_but_not_sink() {
        let (mut link, _peer) = link_pair();
        link.queue_xmit(vec![0u8; HIGH_WATER]);
        assert!(!link.xmit_queue_allowed());

        let mut txn = Transaction::new(1, TransactionKind::Inject, HeaderKind::Multiplexed);
        let (source_fd, _peer_b) = link_pair();
        txn.attach_local_source(source_fd, PacketType::FileData.as_byte(), false);

        let interest = txn.poll_interest(&link);
        assert!(
            interest.is_empty(),
            "no source should contribute pollfds while the link is over HIGH_WATER"
        );
    }

    #[test]
    fn plugged_source_contributes_no_poll_interest_until_unplugged() {
        let (link, _peer) = link_pair();
        let mut txn = Transaction::new(2, TransactionKind::Inject, HeaderKind::Multiplexed);
        let (source_fd, _peer_b) = link_pair();
        txn.attach_local_source(source_fd, PacketType::FileData.as_byte(), true);

        assert!(txn.poll_interest(&link).is_empty());
        txn.unplug_source(PacketType::FileData.as_byte());
        assert!(!txn.poll_interest(&link).is_empty());
    }
}
