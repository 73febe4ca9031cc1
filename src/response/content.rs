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

//! Reply body sources

use std::fmt;
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// What a dynamic content creator wants to happen next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynamicContentAction {
    /// `n` bytes were written to the start of the provided buffer.
    Continue(usize),
    /// Send these bytes next; the provided buffer was not used.
    ContinueIov(Vec<Vec<u8>>),
    /// The body is complete. Only valid when the content size was not given.
    Finish,
    /// The body is complete; send these trailer fields. Only valid for chunked replies.
    FinishWithFooters(Vec<(String, String)>),
    /// No data is available now; the request is suspended until resumed.
    Suspend,
    /// Stop and close the connection.
    Abort,
}

/// Produces reply body bytes on demand.
///
/// Called with the offset of the next byte of the body and a buffer to fill. The creator is
/// shared between every connection a reusable response is attached to.
pub type ContentCreator = Box<dyn FnMut(u64, &mut [u8]) -> DynamicContentAction + Send>;

/// Called once when the response content is released.
pub type FreeCallback = Box<dyn FnOnce() + Send>;

pub(crate) enum Content {
    /// No body bytes.
    Empty,
    /// Owned buffer.
    Buffer(Vec<u8>),
    /// Buffer valid for the program's lifetime.
    Static(&'static [u8]),
    /// Several buffers sent back to back.
    Iovec(Vec<Box<[u8]>>),
    /// Regular file or pipe.
    File {
        file: File,
        offset: u64,
        is_pipe: bool,
        use_sendfile: AtomicBool,
    },
    /// Generated by the application.
    Callback(Mutex<ContentCreator>),
}

impl Content {
    pub(crate) fn file(file: File, offset: u64, is_pipe: bool) -> Self {
        Content::File {
            file,
            offset,
            is_pipe,
            use_sendfile: AtomicBool::new(!is_pipe),
        }
    }

    /// Bytes available in memory for in-memory sources.
    pub(crate) fn memory_len(&self) -> Option<u64> {
        match self {
            Content::Empty => Some(0),
            Content::Buffer(b) => Some(b.len() as u64),
            Content::Static(b) => Some(b.len() as u64),
            Content::Iovec(parts) => Some(parts.iter().map(|p| p.len() as u64).sum()),
            Content::File { .. } | Content::Callback(_) => None,
        }
    }

    /// Copies in-memory content starting at `offset` into `out`, returning the number of bytes
    /// copied.
    pub(crate) fn copy_memory(&self, offset: u64, out: &mut [u8]) -> usize {
        match self {
            Content::Buffer(b) => copy_parts(std::iter::once(b.as_slice()), offset, out),
            Content::Static(b) => copy_parts(std::iter::once(*b), offset, out),
            Content::Iovec(parts) => copy_parts(parts.iter().map(|p| &p[..]), offset, out),
            _ => 0,
        }
    }

    /// Returns the contiguous in-memory slice starting at `offset`, if the content is in memory.
    pub(crate) fn memory_slice(&self, offset: u64) -> Option<&[u8]> {
        let slice: &[u8] = match self {
            Content::Empty => &[],
            Content::Buffer(b) => b,
            Content::Static(b) => b,
            Content::Iovec(parts) => {
                let mut offset = offset;
                for part in parts {
                    if offset < part.len() as u64 {
                        return Some(&part[offset as usize..]);
                    }
                    offset -= part.len() as u64;
                }
                return Some(&[]);
            }
            _ => return None,
        };
        Some(slice.get(offset as usize..).unwrap_or(&[]))
    }

    pub(crate) fn sendfile_enabled(&self) -> bool {
        match self {
            Content::File { use_sendfile, .. } => use_sendfile.load(Ordering::Relaxed),
            _ => false,
        }
    }

    /// Switches a file source to the read fallback for good.
    pub(crate) fn disable_sendfile(&self) {
        if let Content::File { use_sendfile, .. } = self {
            use_sendfile.store(false, Ordering::Relaxed);
        }
    }
}

fn copy_parts<'a>(
    parts: impl Iterator<Item = &'a [u8]>,
    mut offset: u64,
    out: &mut [u8],
) -> usize {
    let mut copied = 0;
    for part in parts {
        if offset >= part.len() as u64 {
            offset -= part.len() as u64;
            continue;
        }
        let src = &part[offset as usize..];
        let n = src.len().min(out.len() - copied);
        out[copied..copied + n].copy_from_slice(&src[..n]);
        copied += n;
        offset = 0;
        if copied == out.len() {
            break;
        }
    }
    copied
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::Empty => f.write_str("Empty"),
            Content::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
            Content::Static(b) => write!(f, "Static({} bytes)", b.len()),
            Content::Iovec(parts) => write!(f, "Iovec({} parts)", parts.len()),
            Content::File {
                offset, is_pipe, ..
            } => f
                .debug_struct("File")
                .field("offset", offset)
                .field("is_pipe", is_pipe)
                .field("use_sendfile", &self.sendfile_enabled())
                .finish(),
            Content::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn iovec_copy_spans_parts() {
        let content = Content::Iovec(vec![
            b"ab".to_vec().into_boxed_slice(),
            b"".to_vec().into_boxed_slice(),
            b"cde".to_vec().into_boxed_slice(),
        ]);
        assert_eq!(Some(5), content.memory_len());

        let mut out = [0u8; 3];
        assert_eq!(3, content.copy_memory(1, &mut out));
        assert_eq!(b"bcd", &out);
        assert_eq!(Some(b"de" as &[u8]), content.memory_slice(3));
    }

    #[test]
    fn buffer_slice_past_end_is_empty() {
        let content = Content::Static(b"hi");
        assert_eq!(Some(b"" as &[u8]), content.memory_slice(5));
    }
}
