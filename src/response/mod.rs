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

//! Responses
//!
//! A [`Response`] is created by the application, configured, and then handed to the server
//! through an [`Action`](crate::Action). The first time that happens the response is frozen:
//! its headers and options can no longer change and connections read them without locking.
//!
//! Regular responses are used once. Responses with [`ResponseOption::Reusable`] can be attached
//! to any number of requests, concurrently; their content is released when the last connection
//! and the last application handle are gone.

use std::fmt;
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::parser::h1::chunked::is_forbidden_trailer;
use crate::parser::h1::tokens::is_tchar;
use crate::parser::StatusCode;

mod challenge;
mod content;
mod options;
pub(crate) mod special;

pub use challenge::DigestChallenge;
pub(crate) use content::Content;
pub use content::{ContentCreator, DynamicContentAction, FreeCallback};
pub(crate) use options::Flags;
pub use options::ResponseOption;

/// Position of a nonce placeholder inside a `WWW-Authenticate` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NonceSlot {
    pub(crate) header: usize,
    pub(crate) offset: usize,
}

/// Headers and flags of a response. Mutable until the response is frozen.
#[derive(Debug, Default)]
pub(crate) struct Head {
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) footers: Vec<(String, String)>,
    /// Tokens of the application's `Connection` header other than `close` and `keep-alive`
    pub(crate) connection: Option<String>,
    pub(crate) flags: Flags,
    /// Header line sent after all others, without line terminator
    pub(crate) special: Option<&'static str>,
    pub(crate) nonce_slots: Vec<NonceSlot>,
}

struct Inner {
    status: StatusCode,
    size: Option<u64>,
    content: Content,
    free_cb: Mutex<Option<FreeCallback>>,
    settings: Mutex<Option<Head>>,
    frozen: OnceLock<Head>,
    use_count: AtomicUsize,
    used: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let cb = match self.free_cb.get_mut() {
            Ok(cb) => cb.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(cb) = cb {
            cb();
        }
    }
}

/// HTTP response. Cloning creates another handle to the same response.
#[derive(Clone)]
pub struct Response {
    inner: Arc<Inner>,
}

impl Response {
    fn new(status: u16, size: Option<u64>, content: Content, free_cb: Option<FreeCallback>) -> Option<Self> {
        let status = StatusCode::from_u16(status)?;
        Some(Response {
            inner: Arc::new(Inner {
                status,
                size,
                content,
                free_cb: Mutex::new(free_cb),
                settings: Mutex::new(Some(Head::default())),
                frozen: OnceLock::new(),
                use_count: AtomicUsize::new(0),
                used: AtomicBool::new(false),
            }),
        })
    }

    /// Internal response that is frozen from the start.
    pub(crate) fn prefrozen(status: StatusCode, content: Content, size: u64, head: Head) -> Self {
        let frozen = OnceLock::new();
        let _ = frozen.set(head);
        Response {
            inner: Arc::new(Inner {
                status,
                size: Some(size),
                content,
                free_cb: Mutex::new(None),
                settings: Mutex::new(None),
                frozen,
                use_count: AtomicUsize::new(0),
                used: AtomicBool::new(false),
            }),
        }
    }

    /// Response without a body. `Content-Length: 0` is sent where a body is allowed.
    pub fn empty(status: u16) -> Option<Self> {
        Self::new(status, Some(0), Content::Empty, None)
    }

    /// Response with an owned buffer as body. `free_cb` runs when the response is released.
    pub fn from_buffer(status: u16, buffer: Vec<u8>, free_cb: Option<FreeCallback>) -> Option<Self> {
        let size = buffer.len() as u64;
        Self::new(status, Some(size), Content::Buffer(buffer), free_cb)
    }

    /// Response with a static body.
    ///
    /// ```
    /// # use hearth::Response;
    /// let response = Response::from_buffer_static(200, b"hi").unwrap();
    /// assert_eq!(Some(2), response.content_size());
    /// assert!(Response::from_buffer_static(42, b"").is_none());
    /// ```
    pub fn from_buffer_static(status: u16, buffer: &'static [u8]) -> Option<Self> {
        Self::new(status, Some(buffer.len() as u64), Content::Static(buffer), None)
    }

    /// Response whose body is the concatenation of `parts`.
    pub fn from_iovec(status: u16, parts: &[&[u8]]) -> Option<Self> {
        let parts: Vec<Box<[u8]>> = parts.iter().map(|p| Box::from(*p)).collect();
        let size = parts.iter().map(|p| p.len() as u64).sum();
        Self::new(status, Some(size), Content::Iovec(parts), None)
    }

    /// Response with `len` bytes of `file`, starting at `offset`.
    pub fn from_file(status: u16, file: File, offset: u64, len: u64) -> Option<Self> {
        Self::new(status, Some(len), Content::file(file, offset, false), None)
    }

    /// Response streaming everything read from a pipe. The size is unknown, so the body is
    /// chunked or ends with the connection.
    pub fn from_pipe(status: u16, pipe: File) -> Option<Self> {
        Self::new(status, None, Content::file(pipe, 0, true), None)
    }

    /// Response generated by `creator`. With `size == None` the creator signals the end with
    /// [`DynamicContentAction::Finish`].
    pub fn from_callback(
        status: u16,
        size: Option<u64>,
        creator: ContentCreator,
        free_cb: Option<FreeCallback>,
    ) -> Option<Self> {
        Self::new(status, size, Content::Callback(Mutex::new(creator)), free_cb)
    }

    /// Status code
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.inner.status
    }

    /// Size of the body, if known
    #[inline]
    pub fn content_size(&self) -> Option<u64> {
        self.inner.size
    }

    /// True once the response was used and can no longer be changed.
    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.get().is_some()
    }

    /// Number of requests the response is currently attached to.
    pub fn use_count(&self) -> usize {
        self.inner.use_count.load(Ordering::Acquire)
    }

    fn with_settings<R>(&self, f: impl FnOnce(&mut Head) -> Result<R>) -> Result<R> {
        let mut guard = self
            .inner
            .settings
            .lock()
            .map_err(|_| Error::ResponseMutexLockFailed)?;
        match guard.as_mut() {
            Some(head) => f(head),
            None => Err(Error::TooLate),
        }
    }

    /// Adds a header. Headers are sent in the order they were added.
    ///
    /// `Content-Length` needs [`ResponseOption::InsanityHeaderContentLength`];
    /// `Transfer-Encoding: chunked` enables chunked encoding; `Connection: close` forces the
    /// connection to close after the reply.
    pub fn add_header(&self, name: &str, value: &str) -> Result<()> {
        validate_field(name, value)?;
        self.with_settings(|head| {
            if name.eq_ignore_ascii_case("content-length") {
                if !head.flags.insanity_content_length {
                    return Err(Error::RespHeadersConflict);
                }
                head.flags.cnt_len_by_app = true;
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                if !value.trim().eq_ignore_ascii_case("chunked") || head.flags.mode_1_0 {
                    return Err(Error::RespHeadersConflict);
                }
                head.flags.chunked = true;
                return Ok(());
            } else if name.eq_ignore_ascii_case("connection") {
                let mut kept = Vec::new();
                for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    if token.eq_ignore_ascii_case("close") {
                        head.flags.close_forced = true;
                    } else if !token.eq_ignore_ascii_case("keep-alive") {
                        kept.push(token);
                    }
                }
                if !kept.is_empty() {
                    let joined = kept.join(", ");
                    head.connection = Some(match head.connection.take() {
                        Some(existing) => format!("{}, {}", existing, joined),
                        None => joined,
                    });
                    head.flags.has_hdr_conn = true;
                }
                return Ok(());
            } else if name.eq_ignore_ascii_case("date") {
                head.flags.has_hdr_date = true;
            }

            head.headers.push((name.to_string(), value.to_string()));
            Ok(())
        })
    }

    /// Adds a trailer field, sent after the body of chunked replies.
    pub fn add_footer(&self, name: &str, value: &str) -> Result<()> {
        validate_field(name, value)?;
        if is_forbidden_trailer(name.as_bytes()) {
            return Err(Error::RespHeadersConflict);
        }
        self.with_settings(|head| {
            head.footers.push((name.to_string(), value.to_string()));
            Ok(())
        })
    }

    /// Sets an option.
    pub fn set_option(&self, option: ResponseOption) -> Result<()> {
        if option == ResponseOption::Reusable {
            if let Content::File { is_pipe: true, .. } = self.inner.content {
                return Err(Error::OptionConflict("pipe content cannot be reused"));
            }
        }
        self.with_settings(|head| head.flags.apply(option).map_err(Error::OptionConflict))
    }

    /// Freezes the response, returning the immutable view.
    pub(crate) fn freeze(&self) -> Result<&Head> {
        if let Some(head) = self.inner.frozen.get() {
            return Ok(head);
        }

        let mut guard = self
            .inner
            .settings
            .lock()
            .map_err(|_| Error::ResponseMutexLockFailed)?;
        if let Some(head) = guard.take() {
            // only the holder of the settings lock can get here, so the cell is empty
            let _ = self.inner.frozen.set(head);
        }
        drop(guard);

        self.inner.frozen.get().ok_or(Error::TooLate)
    }

    /// The frozen view. Only valid after [`Response::freeze`].
    pub(crate) fn head(&self) -> Option<&Head> {
        self.inner.frozen.get()
    }

    pub(crate) fn content(&self) -> &Content {
        &self.inner.content
    }

    /// Freezes the response and counts a new user of it. Regular responses can only be attached
    /// once.
    pub(crate) fn attach(self) -> Result<AttachedResponse> {
        let reusable = self.freeze()?.flags.reusable;
        if !reusable && self.inner.used.swap(true, Ordering::AcqRel) {
            return Err(Error::TooLate);
        }
        self.inner.use_count.fetch_add(1, Ordering::AcqRel);
        Ok(AttachedResponse { response: self })
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.inner.status)
            .field("size", &self.inner.size)
            .field("content", &self.inner.content)
            .field("frozen", &self.is_frozen())
            .field("use_count", &self.use_count())
            .finish()
    }
}

/// A response in use by a connection. Dropping it releases the connection's use.
#[derive(Debug)]
pub(crate) struct AttachedResponse {
    response: Response,
}

impl AttachedResponse {
    #[inline]
    pub(crate) fn response(&self) -> &Response {
        &self.response
    }

    /// Frozen head. Attachment always freezes first.
    pub(crate) fn head(&self) -> &Head {
        static EMPTY: OnceLock<Head> = OnceLock::new();
        self.response
            .head()
            .unwrap_or_else(|| EMPTY.get_or_init(Head::default))
    }
}

impl Drop for AttachedResponse {
    fn drop(&mut self) {
        self.response.inner.use_count.fetch_sub(1, Ordering::AcqRel);
    }
}

fn validate_field(name: &str, value: &str) -> Result<()> {
    if name.is_empty() || !name.bytes().all(is_tchar) {
        return Err(Error::RespHeaderValueInvalid);
    }
    if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(Error::RespHeaderValueInvalid);
    }
    Ok(())
}

/// Reads the next bytes of a pipe or file source into `buf`.
pub(crate) fn read_file_content(content: &Content, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    match content {
        Content::File {
            file,
            offset: base,
            is_pipe: false,
            ..
        } => crate::net::sendfile::read_at(file, base + offset, buf),
        Content::File {
            file, is_pipe: true, ..
        } => {
            use std::io::Read;
            let mut reader: &File = file;
            loop {
                match reader.read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    other => return other,
                }
            }
        }
        _ => Ok(0),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn factories_reject_invalid_status() {
        assert!(Response::empty(99).is_none());
        assert!(Response::empty(1000).is_none());
        assert!(Response::empty(599).is_some());
    }

    #[test]
    fn mutation_after_freeze_is_too_late() {
        let response = Response::from_buffer_static(200, b"ok").unwrap();
        response.add_header("X-A", "1").unwrap();
        response.freeze().unwrap();
        assert!(matches!(response.add_header("X-B", "2"), Err(Error::TooLate)));
        assert!(matches!(
            response.set_option(ResponseOption::ForceClose),
            Err(Error::TooLate)
        ));
        assert_eq!(1, response.head().unwrap().headers.len());
    }

    #[test]
    fn header_validation() {
        let response = Response::empty(200).unwrap();
        assert!(matches!(
            response.add_header("X-A", "a\r\nInjected: 1"),
            Err(Error::RespHeaderValueInvalid)
        ));
        assert!(matches!(
            response.add_header("Bad Name", "1"),
            Err(Error::RespHeaderValueInvalid)
        ));
        assert!(matches!(
            response.add_header("Content-Length", "3"),
            Err(Error::RespHeadersConflict)
        ));
        assert!(matches!(
            response.add_header("Transfer-Encoding", "gzip"),
            Err(Error::RespHeadersConflict)
        ));
        response
            .set_option(ResponseOption::InsanityHeaderContentLength)
            .unwrap();
        response.add_header("Content-Length", "3").unwrap();
        assert!(response.freeze().unwrap().flags.cnt_len_by_app);
    }

    #[test]
    fn connection_header_sets_flags() {
        let response = Response::empty(200).unwrap();
        response.add_header("Connection", "close, Upgrade").unwrap();
        let head = response.freeze().unwrap();
        assert!(head.flags.close_forced);
        assert_eq!(Some("Upgrade"), head.connection.as_deref());
        assert!(head.headers.is_empty());
    }

    #[test]
    fn regular_response_attaches_once() {
        let response = Response::empty(204).unwrap();
        let first = response.clone().attach().unwrap();
        assert_eq!(1, response.use_count());
        assert!(matches!(response.clone().attach(), Err(Error::TooLate)));
        drop(first);
        assert_eq!(0, response.use_count());
    }

    #[test]
    fn reusable_counting_across_threads() {
        static FREED: AtomicUsize = AtomicUsize::new(0);
        let response = Response::from_buffer(
            200,
            b"shared".to_vec(),
            Some(Box::new(|| {
                FREED.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        response.set_option(ResponseOption::Reusable).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let response = response.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let attached = response.clone().attach().unwrap();
                        assert!(attached.response().use_count() >= 1);
                        drop(attached);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(0, response.use_count());
        let attached = response.clone().attach().unwrap();
        drop(response);
        assert_eq!(0, FREED.load(Ordering::SeqCst));
        drop(attached);
        assert_eq!(1, FREED.load(Ordering::SeqCst));
    }

    #[test]
    fn pipes_are_not_reusable() {
        let (reader, _writer) = std::os::unix::net::UnixStream::pair().unwrap();
        let file = File::from(std::os::fd::OwnedFd::from(reader));
        let response = Response::from_pipe(200, file).unwrap();
        assert!(matches!(
            response.set_option(ResponseOption::Reusable),
            Err(Error::OptionConflict(_))
        ));
        assert_eq!(None, response.content_size());
    }
}
