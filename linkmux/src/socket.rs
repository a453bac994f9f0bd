// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use log::*;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{PollFd, PollFlags};
use nix::unistd::{read, write};

use crate::buffer::Buffer;

/// Bytes of queued, unsent data above which a socket stops granting
/// backpressure permission to its sources (`xmit_queue_allowed()` goes
/// false). ~64 KiB, per the distilled spec.
pub const HIGH_WATER: usize = 64 * 1024;

/// Which directions a socket was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenFlags {
    fn wants_read(self) -> bool {
        !matches!(self, OpenFlags::WriteOnly)
    }

    fn wants_write(self) -> bool {
        !matches!(self, OpenFlags::ReadOnly)
    }
}

/// A non-blocking file descriptor with a single posted receive buffer and a
/// FIFO send queue.
///
/// Owns `fd` for its lifetime; `Drop` closes it exactly once. Every read
/// and write is non-blocking; `EAGAIN`/`EWOULDBLOCK` from the underlying
/// syscalls is normal flow, not an error this type surfaces.
pub struct Socket {
    fd: OwnedFd,
    flags: OpenFlags,
    recvbuf: Option<Buffer>,
    send_queue: VecDeque<Vec<u8>>,
    send_queue_bytes: usize,
    send_offset: usize,
    read_eof: bool,
    write_eof: bool,
    dead: bool,
}

impl Socket {
    /// Take ownership of `fd`, put it in non-blocking mode, and track it
    /// according to `flags`.
    pub fn new_flags(fd: OwnedFd, flags: OpenFlags) -> nix::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;

        Ok(Self {
            fd,
            flags,
            recvbuf: None,
            send_queue: VecDeque::new(),
            send_queue_bytes: 0,
            send_offset: 0,
            read_eof: flags == OpenFlags::WriteOnly,
            write_eof: flags == OpenFlags::ReadOnly,
            dead: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Fill `pollfd`'s events for this socket: `POLLIN` if a recv buffer is
    /// posted and not read-EOF, `POLLOUT` if the send queue is non-empty
    /// and not write-EOF. Returns whether any event was requested.
    pub fn fill_poll(&self) -> Option<PollFd<'_>> {
        self.poll_interest()
            .map(|events| PollFd::new(self.fd.as_fd(), events))
    }

    /// Same interest computation as [`Socket::fill_poll`], but as a raw
    /// `PollFlags` value rather than a borrowed `PollFd` -- lets a caller
    /// aggregating interest across many sockets (see
    /// `connection::Connection::tick`) hold on to the result without
    /// keeping every socket borrowed for as long as the aggregate lives.
    pub fn poll_interest(&self) -> Option<PollFlags> {
        let mut events = PollFlags::empty();

        if self.recvbuf.is_some() && !self.read_eof {
            events |= PollFlags::POLLIN;
        }
        if !self.send_queue.is_empty() && !self.write_eof {
            events |= PollFlags::POLLOUT;
        }

        if events.is_empty() {
            None
        } else {
            Some(events)
        }
    }

    /// Post a fresh receive buffer. At most one may be posted at a time;
    /// panics (caller bug) if one is already outstanding.
    pub fn post_recvbuf(&mut self, buf: Buffer) {
        assert!(self.recvbuf.is_none(), "recv buffer already posted");
        self.recvbuf = Some(buf);
    }

    pub fn get_recvbuf(&self) -> Option<&Buffer> {
        self.recvbuf.as_ref()
    }

    pub fn take_recvbuf(&mut self) -> Option<Buffer> {
        self.recvbuf.take()
    }

    /// Append `buf` to the FIFO send queue.
    pub fn queue_xmit(&mut self, buf: Vec<u8>) {
        self.send_queue_bytes += buf.len();
        self.send_queue.push_back(buf);
    }

    /// Clone `buf` and queue it -- for transient (stack/short-lived)
    /// buffers a caller doesn't want to hand over ownership of.
    pub fn xmit_shared(&mut self, buf: &[u8]) {
        self.queue_xmit(buf.to_vec());
    }

    pub fn xmit_queue_bytes(&self) -> usize {
        self.send_queue_bytes
    }

    /// Whether a source is currently allowed to add more data to this
    /// socket's send queue -- false once queued bytes exceed [`HIGH_WATER`].
    pub fn xmit_queue_allowed(&self) -> bool {
        self.send_queue_bytes < HIGH_WATER
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn is_read_eof(&self) -> bool {
        self.read_eof
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Shut down the write half: stop reporting `POLLOUT` interest and
    /// stop accepting new queued data. Whatever is already queued is left
    /// as-is -- a caller that wants those bytes actually delivered first
    /// must drain the queue (e.g. via `Channel::flush`) before calling
    /// this.
    pub fn shutdown_write(&mut self) {
        self.write_eof = true;
    }

    /// Perform one non-blocking read into the posted recv buffer and/or one
    /// round of writes from the send queue.
    ///
    /// Returns `Ok(())` on a normal (possibly partial, possibly no-op)
    /// round of I/O, `Err(Errno)` on a fatal error -- the caller must mark
    /// the socket dead in that case.
    pub fn doio(&mut self) -> nix::Result<()> {
        if self.flags.wants_read() && !self.read_eof {
            self.do_read()?;
        }
        if self.flags.wants_write() && !self.write_eof {
            self.do_write()?;
        }
        Ok(())
    }

    fn do_read(&mut self) -> nix::Result<()> {
        let Some(buf) = self.recvbuf.as_mut() else {
            return Ok(());
        };

        loop {
            let spare = buf.spare_mut();
            if spare.is_empty() {
                break;
            }
            match read(&self.fd, spare) {
                Ok(0) => {
                    self.read_eof = true;
                    break;
                }
                Ok(n) => {
                    buf.advance_tail(n);
                    if n < spare.len() {
                        // Short read: try again next tick rather than
                        // spinning -- the socket isn't readable right now.
                        break;
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("read failed on fd {}: {e}", self.fd.as_raw_fd());
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn do_write(&mut self) -> nix::Result<()> {
        while let Some(front) = self.send_queue.front() {
            match write(&self.fd, &front[self.send_offset..]) {
                Ok(0) => break,
                Ok(n) => {
                    self.send_offset += n;
                    self.send_queue_bytes -= n;
                    if self.send_offset == front.len() {
                        self.send_offset = 0;
                        self.send_queue.pop_front();
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("write failed on fd {}: {e}", self.fd.as_raw_fd());
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

// `fd: OwnedFd` closes itself on drop; no manual Drop impl needed.

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let current = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut flags = OFlag::from_bits_truncate(current);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    fn pair() -> (Socket, Socket) {
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

    #[test]
    fn queue_then_doio_drains_into_the_peer() {
        let (mut a, mut b) = pair();
        a.queue_xmit(b"hello".to_vec());
        assert_eq!(a.xmit_queue_bytes(), 5);

        a.doio().unwrap();
        assert_eq!(a.xmit_queue_bytes(), 0);

        b.post_recvbuf(Buffer::new(16));
        b.doio().unwrap();
        assert_eq!(b.get_recvbuf().unwrap().as_slice(), b"hello");
    }

    #[test]
    fn high_water_gates_xmit_queue_allowed() {
        let (mut a, _b) = pair();
        assert!(a.xmit_queue_allowed());
        a.queue_xmit(vec![0u8; HIGH_WATER]);
        assert!(!a.xmit_queue_allowed());
    }

    #[test]
    fn shutdown_write_stops_requesting_pollout_but_leaves_queued_bytes_alone() {
        let (mut a, _b) = pair();
        a.queue_xmit(b"queued".to_vec());
        a.shutdown_write();
        assert_eq!(a.xmit_queue_bytes(), 6);
        assert!(a.fill_poll().is_none());
    }
}
