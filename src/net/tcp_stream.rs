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

//! Accepted TCP streams

use std::io::{Error, Read, Result, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

use mio::event::Source;

/// Socket operations a connection needs beyond `Read` and `Write`.
pub trait TcpStream: Read + Write + Source + AsRawFd + Send + std::fmt::Debug {
    /// Address of the peer
    fn peer_addr(&self) -> Result<SocketAddr>;

    /// Shuts down one or both halves of the stream
    fn shutdown(&self, how: Shutdown) -> Result<()>;

    /// Takes the pending `SO_ERROR`
    fn take_error(&self) -> Result<Option<Error>>;

    /// Reads without consuming
    fn peek(&self, buf: &mut [u8]) -> Result<usize>;

    /// Converts into a blocking standard library stream, for upgraded connections.
    fn into_std(self) -> Result<std::net::TcpStream>
    where
        Self: Sized;
}

impl TcpStream for mio::net::TcpStream {
    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }

    fn into_std(self) -> Result<std::net::TcpStream> {
        // SAFETY: the descriptor is owned by `self`, which is consumed here, so the new stream is
        // its only owner.
        let stream = unsafe { std::net::TcpStream::from_raw_fd(self.into_raw_fd()) };
        stream.set_nonblocking(false)?;
        Ok(stream)
    }
}
