// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Socket I/O and the connection's interface to event loops

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::thread;
use std::time::Instant;

use mio::{Interest, Registry, Token};

use super::{Connection, Flow, Halt, Stage};
use crate::action::UpgradedConnection;
use crate::connection::{CloseReason, EventLoopInfo};
use crate::net::{IoWant, SocketError, Transport};

/// One send call. Interrupted sends count as zero bytes sent.
pub(super) fn send_some(transport: &mut dyn Transport, buf: &[u8]) -> Result<usize, Halt> {
    match transport.send(buf) {
        Ok(n) => Ok(n),
        Err(SocketError::Interrupted) => Ok(0),
        Err(SocketError::Again) => Err(Halt::Send),
        Err(err) => {
            log::debug!("send failed: {}", err);
            Err(Halt::Close(CloseReason::SocketErr))
        }
    }
}

impl Connection {
    /// Reads more data into the read buffer. `Ok` means progress: data arrived or the stage was
    /// switched to an error reply.
    pub(super) fn receive(&mut self) -> Flow {
        if self.rmt_shut_wr {
            return Err(Halt::Close(self.eof_reason()));
        }

        if self.read_buf.remaining_mut() == 0 {
            self.read_buf.compact();
            if self.read_buf.remaining_mut() == 0 && !self.grow_read_buffer() {
                return self.read_buffer_exhausted();
            }
        }

        match self.transport.recv(self.read_buf.writable()) {
            Ok(0) => {
                log::trace!("connection {}: peer closed its side", self.ctx.id);
                self.rmt_shut_wr = true;
                Err(Halt::Close(self.eof_reason()))
            }
            Ok(n) => {
                self.read_buf.mark_written(n);
                self.touch();
                Ok(())
            }
            Err(SocketError::Interrupted) => Ok(()),
            Err(SocketError::Again) => Err(Halt::Recv),
            Err(err) if err.is_disconnect() => Err(Halt::Close(self.eof_reason())),
            Err(err) => {
                log::debug!("connection {}: receive failed: {}", self.ctx.id, err);
                Err(Halt::Close(CloseReason::ReadError))
            }
        }
    }

    fn eof_reason(&self) -> CloseReason {
        if self.stage == Stage::Init && self.read_buf.is_empty() {
            CloseReason::RemoteShutdown
        } else {
            CloseReason::ClientAbort
        }
    }

    /// Doubles the read buffer within the limits of the pool.
    fn grow_read_buffer(&mut self) -> bool {
        let capacity = self.read_buf.capacity();
        let grow = capacity.max(64).min(self.pool.free());
        if grow == 0 || !self.pool.reserve_buffer(grow) {
            return false;
        }
        self.read_buf.resize(capacity + grow)
    }

    /// Gives unused read buffer space back to the pool, keeping pending bytes.
    pub(super) fn shrink_read_buffer(&mut self) {
        let capacity = self.read_buf.capacity();
        let keep = self.read_buf.remaining();
        if keep < capacity && self.read_buf.resize(keep) {
            self.pool.release_buffer(capacity - keep);
        }
    }

    /// Sends the write buffer until it is empty.
    pub(super) fn send_write_buf(&mut self) -> Flow {
        while !self.write_buf.is_empty() {
            let n = send_some(self.transport.as_mut(), self.write_buf.readable())?;
            self.write_buf.mark_read(n);
            self.touch();
        }
        Ok(())
    }

    /// Waits until the transport has nothing buffered.
    pub(super) fn flush_transport(&mut self) -> Flow {
        match self.transport.flush() {
            Ok(true) => Ok(()),
            Ok(false) => Err(Halt::Send),
            Err(err) => {
                log::debug!("connection {}: flush failed: {}", self.ctx.id, err);
                Err(Halt::Close(CloseReason::SocketErr))
            }
        }
    }

    #[inline]
    pub(super) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn id(&self) -> u64 {
        self.ctx.id
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.ctx.peer
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.transport.raw_fd()
    }

    pub(crate) fn event(&self) -> EventLoopInfo {
        self.event
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Direction the transport needs regardless of the stage, such as during a TLS handshake.
    pub(crate) fn io_want(&self) -> IoWant {
        self.transport.io_want()
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.transport
            .register(registry, token, Interest::READABLE | Interest::WRITABLE)
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.transport.deregister(registry)
    }

    /// Checks an error the poller reported for the socket. Returns `false` if the connection was
    /// closed because of it.
    pub(crate) fn check_socket_error(&mut self) -> bool {
        match self.transport.probe_error() {
            None => true,
            Some(err) => {
                let reason = if err.is_disconnect() {
                    self.rmt_shut_wr = true;
                    self.eof_reason()
                } else {
                    CloseReason::SocketErr
                };
                self.close(reason);
                false
            }
        }
    }

    /// True if the connection has been idle for longer than its timeout. Suspended connections
    /// never time out.
    pub(crate) fn timed_out(&self, now: Instant) -> bool {
        self.deadline().map_or(false, |deadline| now >= deadline)
    }

    /// When the connection times out, if it can.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        if self.suspended || self.stage == Stage::Closed {
            return None;
        }
        self.timeout.map(|t| self.last_activity + t)
    }

    /// Undoes a suspension. The next [`Connection::process`] repeats the callback that
    /// suspended.
    pub(crate) fn resume(&mut self) {
        if self.suspended {
            log::trace!("connection {} resumed", self.ctx.id);
            self.suspended = false;
            self.touch();
        }
    }

    /// Closes the connection for daemon shutdown. An upload in progress gets its final call
    /// first.
    pub(crate) fn terminate(&mut self) -> CloseReason {
        if self.stage.receiving_request() || self.stage == Stage::FullReqReceived {
            self.notify_upload_terminated();
        }
        self.close(CloseReason::DaemonShutdown)
    }

    /// Hands the stream to the upgrade handler on a thread of its own. Must only be called after
    /// [`Connection::process`] returned [`Outcome::Upgrade`](super::Outcome::Upgrade) and the
    /// connection was removed from its event loop.
    pub(crate) fn finish_upgrade(self) {
        let Connection {
            transport,
            read_buf,
            upgrade,
            ctx,
            ..
        } = self;
        let Some(handler) = upgrade else {
            crate::panic::internal_error!("upgrade without a handler");
            return;
        };
        let extra = read_buf.readable().to_vec();
        let io = match transport.into_upgraded() {
            Ok(io) => io,
            Err(err) => {
                log::warn!("connection {}: cannot hand over upgraded stream: {}", ctx.id, err);
                return;
            }
        };

        let mut builder = thread::Builder::new().name(format!("hearth-upgraded-{}", ctx.id));
        if let Some(size) = ctx.shared.config.stack_size {
            builder = builder.stack_size(size);
        }
        if let Err(err) = builder.spawn(move || handler(UpgradedConnection::new(io, extra))) {
            log::error!("connection {}: cannot start upgrade handler: {}", ctx.id, err);
        }
    }
}
