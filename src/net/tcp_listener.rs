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

//! Listening sockets

use std::io::{Error, Result};
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::tcp_stream::TcpStream;

/// A listening socket producing streams of type `S`.
pub trait TcpListener<S>: mio::event::Source + Send
where
    S: TcpStream,
{
    /// Accepts a pending connection
    fn accept(&self) -> Result<(S, SocketAddr)>;

    /// Local address the socket is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Takes the pending `SO_ERROR`
    fn take_error(&self) -> Result<Option<Error>>;
}

impl TcpListener<mio::net::TcpStream> for mio::net::TcpListener {
    #[inline]
    fn accept(&self) -> Result<(mio::net::TcpStream, SocketAddr)> {
        Self::accept(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }
}

/// Socket options applied before `listen(2)`.
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// `SO_REUSEADDR`, and `SO_REUSEPORT` where available
    pub reuse_addr: bool,
    /// Accept IPv4 connections on an IPv6 socket. `None` keeps the system default.
    pub dual_stack: Option<bool>,
    /// Queue length for `TCP_FASTOPEN`, if enabled
    pub fast_open: Option<u32>,
    /// `listen(2)` backlog
    pub backlog: Option<i32>,
}

const DEFAULT_BACKLOG: i32 = 1024;

/// Creates, configures and binds a non-blocking listening socket.
pub fn bind(addr: SocketAddr, options: &ListenOptions) -> Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if options.reuse_addr {
        socket.set_reuse_address(true)?;
        #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
        socket.set_reuse_port(true)?;
    }
    if addr.is_ipv6() {
        if let Some(dual) = options.dual_stack {
            socket.set_only_v6(!dual)?;
        }
    }
    if let Some(queue) = options.fast_open {
        set_fast_open(&socket, queue)?;
    }

    socket.bind(&SockAddr::from(addr))?;
    socket.listen(options.backlog.unwrap_or(DEFAULT_BACKLOG))?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Prepares an application-provided listener for the event loop.
pub fn adopt(listener: std::net::TcpListener) -> Result<std::net::TcpListener> {
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(target_os = "linux")]
fn set_fast_open(socket: &Socket, queue: u32) -> Result<()> {
    use std::os::fd::AsRawFd;

    let value = queue as libc::c_int;
    // SAFETY: the pointer and length describe a live c_int for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_fast_open(_socket: &Socket, _queue: u32) -> Result<()> {
    log::warn!("TCP fast open is not supported on this platform, ignoring");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    const TEST_IO_TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn bind_ephemeral_port() {
        let listener = bind(
            "127.0.0.1:0".parse().unwrap(),
            &ListenOptions {
                reuse_addr: true,
                ..Default::default()
            },
        )
        .unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(0, addr.port());

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(TEST_IO_TIMEOUT)).unwrap();

        let mio_listener = mio::net::TcpListener::from_std(listener);
        let (mut accepted, peer) = loop {
            match TcpListener::accept(&mio_listener) {
                Ok(pair) => break pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("{}", e),
            }
        };
        assert_eq!(client.local_addr().unwrap(), peer);

        accepted.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(b"hi", &buf);
    }
}
