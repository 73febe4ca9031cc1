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

//! Plaintext transport and the [`Transport`] trait

use std::fmt::Debug;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::RawFd;

use mio::{Interest, Registry, Token};

use super::sendfile::sendfile;
use super::tcp_stream::TcpStream;
use super::{IoWant, SocketError};

/// Byte stream handed to the application after a protocol upgrade. The stream is blocking.
pub trait UpgradedIo: Read + Write + Send + Debug {}

impl<T> UpgradedIo for T where T: Read + Write + Send + Debug {}

/// A connected, non-blocking stream as seen by the connection state machine.
pub trait Transport: Send + Debug {
    /// Receives into `buf`. `Ok(0)` means the peer closed its write side.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError>;

    /// Sends from `buf`, returning how much was accepted.
    fn send(&mut self, buf: &[u8]) -> Result<usize, SocketError>;

    /// Sends file content without copying through user space. `None` means the transport cannot
    /// do this and the caller must read the file itself.
    fn send_file(
        &mut self,
        _file: &File,
        _offset: u64,
        _len: usize,
    ) -> Option<io::Result<usize>> {
        None
    }

    /// Pushes out data buffered inside the transport. Returns `true` once nothing is pending.
    fn flush(&mut self) -> Result<bool, SocketError> {
        Ok(true)
    }

    /// Direction the transport itself needs.
    fn io_want(&self) -> IoWant {
        IoWant::None
    }

    /// Closes the write side gracefully.
    fn shutdown_write(&mut self) -> Result<(), SocketError>;

    /// Examines a socket the poller reported as failed. `None` means no error is pending after
    /// all and the connection may continue.
    fn probe_error(&mut self) -> Option<SocketError>;

    /// Remote address, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Descriptor to watch in external event loops.
    fn raw_fd(&self) -> RawFd;

    /// True for encrypted transports.
    fn is_tls(&self) -> bool {
        false
    }

    /// Registers with a mio registry.
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;

    /// Changes the registered interest.
    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    /// Removes from a mio registry.
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    /// Turns the transport into a blocking byte stream for an upgraded protocol.
    fn into_upgraded(self: Box<Self>) -> io::Result<Box<dyn UpgradedIo>>;
}

/// Checks a stream for a pending error, first with `SO_ERROR` and then by peeking.
pub(crate) fn probe_stream<S: TcpStream>(stream: &S) -> Option<SocketError> {
    match stream.take_error() {
        Ok(Some(err)) => return Some(SocketError::from(&err)),
        Ok(None) => {}
        Err(err) => return Some(SocketError::from(&err)),
    }

    let mut scratch = [0u8; std::mem::size_of::<usize>()];
    match stream.peek(&mut scratch) {
        Ok(0) => Some(SocketError::RemoteDisconnect),
        Ok(_) => None,
        Err(err) => match SocketError::from(&err) {
            SocketError::Again | SocketError::Interrupted => None,
            other => Some(other),
        },
    }
}

/// Plaintext TCP transport
#[derive(Debug)]
pub struct PlainTransport<S>
where
    S: TcpStream,
{
    stream: S,
    peer: Option<SocketAddr>,
}

impl<S> PlainTransport<S>
where
    S: TcpStream,
{
    /// Wraps an accepted stream
    pub fn new(stream: S, peer: Option<SocketAddr>) -> Self {
        Self { stream, peer }
    }
}

impl<S> Transport for PlainTransport<S>
where
    S: TcpStream + 'static,
{
    #[inline]
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.stream.read(buf).map_err(SocketError::from)
    }

    #[inline]
    fn send(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        self.stream.write(buf).map_err(SocketError::from)
    }

    fn send_file(&mut self, file: &File, offset: u64, len: usize) -> Option<io::Result<usize>> {
        Some(sendfile(self.stream.as_raw_fd(), file, offset, len))
    }

    fn shutdown_write(&mut self) -> Result<(), SocketError> {
        self.stream
            .shutdown(Shutdown::Write)
            .map_err(SocketError::from)
    }

    fn probe_error(&mut self) -> Option<SocketError> {
        probe_stream(&self.stream)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.or_else(|| self.stream.peer_addr().ok())
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    #[inline]
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)
    }

    #[inline]
    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    #[inline]
    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn into_upgraded(self: Box<Self>) -> io::Result<Box<dyn UpgradedIo>> {
        Ok(Box::new(self.stream.into_std()?))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport for driving connections in tests.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Shared view of what a [`MockTransport`] has sent and what it will deliver.
    #[derive(Debug, Default)]
    pub(crate) struct MockState {
        pub(crate) incoming: VecDeque<Vec<u8>>,
        pub(crate) outgoing: Vec<u8>,
        pub(crate) eof: bool,
        pub(crate) write_limit: Option<usize>,
        pub(crate) fail_send: Option<SocketError>,
        pub(crate) shut_write: bool,
    }

    /// Transport whose peer is a test.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MockTransport {
        pub(crate) state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Queues bytes to be received as one read.
        pub(crate) fn push(&self, bytes: &[u8]) {
            self.state.lock().unwrap().incoming.push_back(bytes.to_vec());
        }

        /// Marks the end of incoming data once the queue is drained.
        pub(crate) fn close_remote(&self) {
            self.state.lock().unwrap().eof = true;
        }

        /// Takes everything sent so far.
        pub(crate) fn take_sent(&self) -> Vec<u8> {
            std::mem::take(&mut self.state.lock().unwrap().outgoing)
        }

        pub(crate) fn set_write_limit(&self, limit: Option<usize>) {
            self.state.lock().unwrap().write_limit = limit;
        }
    }

    impl Transport for MockTransport {
        fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
            let mut state = self.state.lock().unwrap();
            match state.incoming.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        chunk.drain(..n);
                        state.incoming.push_front(chunk);
                    }
                    Ok(n)
                }
                None if state.eof => Ok(0),
                None => Err(SocketError::Again),
            }
        }

        fn send(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.fail_send {
                return Err(err);
            }
            let n = match state.write_limit {
                Some(0) => return Err(SocketError::Again),
                Some(limit) => limit.min(buf.len()),
                None => buf.len(),
            };
            state.outgoing.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn shutdown_write(&mut self) -> Result<(), SocketError> {
            self.state.lock().unwrap().shut_write = true;
            Ok(())
        }

        fn probe_error(&mut self) -> Option<SocketError> {
            None
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            Some(SocketAddr::from(([127, 0, 0, 1], 40000)))
        }

        fn raw_fd(&self) -> RawFd {
            -1
        }

        fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _: &Registry) -> io::Result<()> {
            Ok(())
        }

        fn into_upgraded(self: Box<Self>) -> io::Result<Box<dyn UpgradedIo>> {
            Ok(Box::new(MockUpgraded { inner: *self }))
        }
    }

    /// Blocking-style view of a mock transport after an upgrade.
    #[derive(Debug)]
    pub(crate) struct MockUpgraded {
        inner: MockTransport,
    }

    impl Read for MockUpgraded {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inner.recv(buf) {
                Ok(n) => Ok(n),
                Err(SocketError::Again) => Ok(0),
                Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
            }
        }
    }

    impl Write for MockUpgraded {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner
                .send(buf)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
