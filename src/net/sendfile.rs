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

//! Sending file content to sockets
//!
//! Files are sent with `sendfile(2)` when the platform and file allow it. Otherwise the content is
//! read with positional reads into the connection's write buffer.

use std::fs::File;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::FileExt;

/// Largest amount passed to a single `sendfile(2)` call.
pub const SENDFILE_CHUNK_LIMIT: usize = 0x7fff_f000;

/// Sends up to `count` bytes of `file` starting at `offset` to the socket `out`.
#[cfg(target_os = "linux")]
pub fn sendfile(out: RawFd, file: &File, offset: u64, count: usize) -> io::Result<usize> {
    use std::os::fd::AsRawFd;

    let mut off = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file offset too large"))?;
    let count = count.min(SENDFILE_CHUNK_LIMIT);
    // SAFETY: both descriptors are valid for the duration of the call and `off` is a live off_t.
    let ret = unsafe { libc::sendfile(out, file.as_raw_fd(), &mut off, count) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Sends up to `count` bytes of `file` starting at `offset` to the socket `out`.
#[cfg(not(target_os = "linux"))]
pub fn sendfile(_out: RawFd, _file: &File, _offset: u64, _count: usize) -> io::Result<usize> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// True if a `sendfile(2)` failure means the file can never be sent natively, so the positional
/// read fallback should be used from now on.
pub fn is_unsupported(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::Unsupported | io::ErrorKind::InvalidInput)
        || matches!(
            err.raw_os_error(),
            Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP)
        )
}

/// Fills `buf` from `file` at `offset`, stopping early only at end of file.
pub fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
