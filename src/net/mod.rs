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

//! Socket transports
//!
//! Connections talk to the network exclusively through the [`Transport`] trait so the state
//! machine is the same for plaintext and TLS streams, and can be driven by an in-memory stream in
//! tests.

use std::io::{self, ErrorKind};

pub mod sendfile;
pub mod tcp_listener;
pub mod tcp_stream;
pub mod tls;
pub mod transport;

pub use tls::TlsTransport;
pub use transport::{PlainTransport, Transport, UpgradedIo};

/// Reasons a socket operation did not transfer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    /// The operation would block.
    #[error("operation would block")]
    Again,
    /// The remote side closed the connection.
    #[error("remote side disconnected")]
    RemoteDisconnect,
    /// The connection was reset by the peer.
    #[error("connection reset by peer")]
    ConnReset,
    /// Writing to a socket whose write side is closed.
    #[error("broken pipe")]
    Pipe,
    /// Kernel or TLS buffers are exhausted.
    #[error("no memory for socket operation")]
    NoMem,
    /// Interrupted by a signal; the operation may be retried.
    #[error("interrupted")]
    Interrupted,
    /// An error was reported but could not be identified.
    #[error("unidentified socket error")]
    NotChecked,
    /// Any other failure, including TLS protocol errors.
    #[error("socket error")]
    Other,
}

impl SocketError {
    /// True if retrying the operation later can succeed.
    #[inline]
    pub fn is_soft(&self) -> bool {
        matches!(self, SocketError::Again | SocketError::Interrupted)
    }

    /// True if the error means the peer has gone.
    #[inline]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            SocketError::RemoteDisconnect | SocketError::ConnReset | SocketError::Pipe
        )
    }
}

impl From<&io::Error> for SocketError {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock => return SocketError::Again,
            ErrorKind::Interrupted => return SocketError::Interrupted,
            ErrorKind::ConnectionReset => return SocketError::ConnReset,
            ErrorKind::BrokenPipe => return SocketError::Pipe,
            ErrorKind::ConnectionAborted | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => {
                return SocketError::RemoteDisconnect
            }
            ErrorKind::OutOfMemory => return SocketError::NoMem,
            _ => {}
        }

        match err.raw_os_error() {
            Some(libc::ENOMEM) | Some(libc::ENOBUFS) => SocketError::NoMem,
            Some(libc::ECONNRESET) => SocketError::ConnReset,
            Some(libc::EPIPE) => SocketError::Pipe,
            Some(libc::ENOTCONN) | Some(libc::ESHUTDOWN) => SocketError::RemoteDisconnect,
            Some(_) => SocketError::Other,
            None => SocketError::NotChecked,
        }
    }
}

impl From<io::Error> for SocketError {
    #[inline]
    fn from(err: io::Error) -> Self {
        SocketError::from(&err)
    }
}

/// Direction a transport needs before it can make progress, regardless of what the connection
/// is waiting for. TLS handshakes and buffered records set this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoWant {
    /// No override.
    #[default]
    None,
    /// Needs the socket to become readable.
    Read,
    /// Needs the socket to become writable.
    Write,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_by_kind() {
        let err = io::Error::from(ErrorKind::WouldBlock);
        assert_eq!(SocketError::Again, SocketError::from(&err));
        let err = io::Error::from(ErrorKind::ConnectionReset);
        assert_eq!(SocketError::ConnReset, SocketError::from(err));
    }

    #[test]
    fn classify_by_errno() {
        let err = io::Error::from_raw_os_error(libc::ENOBUFS);
        assert_eq!(SocketError::NoMem, SocketError::from(&err));
        let err = io::Error::from_raw_os_error(libc::EPIPE);
        assert_eq!(SocketError::Pipe, SocketError::from(&err));
    }

    #[test]
    fn unidentified_errors() {
        let err = io::Error::new(ErrorKind::Other, "boom");
        assert_eq!(SocketError::NotChecked, SocketError::from(&err));
        assert!(!SocketError::NotChecked.is_soft());
        assert!(SocketError::Interrupted.is_soft());
        assert!(SocketError::Pipe.is_disconnect());
    }
}
