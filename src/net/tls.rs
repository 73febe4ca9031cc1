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

//! TLS transport on top of rustls

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::RawFd;
use std::sync::Arc;

use mio::{Interest, Registry, Token};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use super::tcp_stream::TcpStream;
use super::transport::{probe_stream, Transport, UpgradedIo};
use super::{IoWant, SocketError};

/// TLS server transport
#[derive(Debug)]
pub struct TlsTransport<S>
where
    S: TcpStream,
{
    stream: S,
    tls: Box<ServerConnection>,
    peer: Option<SocketAddr>,
    eof: bool,
}

impl<S> TlsTransport<S>
where
    S: TcpStream,
{
    /// Starts a server-side TLS session over `stream`
    pub fn new(
        stream: S,
        peer: Option<SocketAddr>,
        config: Arc<ServerConfig>,
    ) -> Result<Self, rustls::Error> {
        Ok(Self {
            stream,
            tls: Box::new(ServerConnection::new(config)?),
            peer,
            eof: false,
        })
    }

    /// True while the handshake is in progress.
    #[inline]
    pub fn is_handshaking(&self) -> bool {
        self.tls.is_handshaking()
    }

    /// Negotiated ALPN protocol
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.tls.alpn_protocol()
    }

    #[inline]
    fn read_tls(&mut self) -> Result<usize, SocketError> {
        let mut read = 0;
        loop {
            match self.tls.read_tls(&mut self.stream) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(read);
                }
                Ok(n) => {
                    read += n;
                    if !self.tls.wants_read() {
                        return Ok(read);
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        if read == 0 {
                            return Err(SocketError::Again);
                        } else {
                            return Ok(read);
                        }
                    }
                    ErrorKind::Interrupted => {}
                    _ => return Err(SocketError::from(&e)),
                },
            }
        }
    }

    #[inline]
    fn write_tls(&mut self) -> Result<(), SocketError> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(SocketError::from(&e)),
            }
        }
        Ok(())
    }

    fn process_packets(&mut self) -> Result<(), SocketError> {
        if let Err(err) = self.tls.process_new_packets() {
            log::debug!("TLS error: {}", err);
            // try to let the peer know about the alert
            let _ = self.write_tls();
            return Err(SocketError::Other);
        }
        Ok(())
    }
}

impl<S> Transport for TlsTransport<S>
where
    S: TcpStream + 'static,
{
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        loop {
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(SocketError::RemoteDisconnect)
                }
                Err(e) => return Err(SocketError::from(&e)),
            }

            if self.eof {
                return Err(SocketError::RemoteDisconnect);
            }

            self.read_tls()?;
            self.process_packets()?;
            // handshake responses go out as soon as they are produced
            match self.write_tls() {
                Ok(()) | Err(SocketError::Again) => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        if self.tls.is_handshaking() {
            return Err(SocketError::Again);
        }
        // keep at most one record set buffered so back-pressure reaches the caller
        match self.write_tls() {
            Ok(()) => {}
            Err(SocketError::Again) => return Err(SocketError::Again),
            Err(e) => return Err(e),
        }

        let n = self
            .tls
            .writer()
            .write(buf)
            .map_err(|e| SocketError::from(&e))?;
        match self.write_tls() {
            Ok(()) | Err(SocketError::Again) => Ok(n),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> Result<bool, SocketError> {
        match self.write_tls() {
            Ok(()) => Ok(true),
            Err(SocketError::Again) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn io_want(&self) -> IoWant {
        if self.tls.is_handshaking() {
            if self.tls.wants_write() {
                IoWant::Write
            } else {
                IoWant::Read
            }
        } else if self.tls.wants_write() {
            IoWant::Write
        } else {
            IoWant::None
        }
    }

    fn shutdown_write(&mut self) -> Result<(), SocketError> {
        self.tls.send_close_notify();
        let _ = self.write_tls();
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

    fn is_tls(&self) -> bool {
        true
    }

    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn into_upgraded(self: Box<Self>) -> io::Result<Box<dyn UpgradedIo>> {
        let this = *self;
        let stream = this.stream.into_std()?;
        Ok(Box::new(StreamOwned::new(*this.tls, stream)))
    }
}
