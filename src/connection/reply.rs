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

//! Sending side: reply head, body and trailers

use std::borrow::Cow;
use std::sync::atomic::Ordering;

use super::io::send_some;
use super::recv::BodySink;
use super::{Connection, Flow, Halt, Stage, WRITE_BUFFER_SIZE};
use crate::auth::nonce::NONCE_LEN;
use crate::connection::{CloseReason, ConnReuse};
use crate::date::with_http_date;
use crate::mem::ByteBuffer;
use crate::net::sendfile::{is_unsupported, SENDFILE_CHUNK_LIMIT};
use crate::net::SocketError;
use crate::parser::h1::chunked::{
    ChunkEncoder, CHUNK_PREFIX_RESERVE, CHUNK_SUFFIX, MAX_CHUNK_SIZE,
};
use crate::parser::h1::response::{Framing, ReplyHead, ReplyVersion};
use crate::parser::{Method, StatusCode, Version};
use crate::response::{read_file_content, AttachedResponse, Content, DynamicContentAction};

/// Where reply body bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Location {
    Nowhere,
    /// Contiguous or vectored memory of the response, sent without copying
    Memory,
    File,
    Callback,
}

/// Result of producing the next piece of a body.
enum Fill {
    Data(usize),
    End,
    Suspend,
    Abort,
    Fail(CloseReason),
}

/// The reply in progress.
pub(super) struct Reply {
    response: AttachedResponse,
    send_body: bool,
    chunked: bool,
    location: Location,
    size: Option<u64>,
    sent: u64,
    use_sendfile: bool,
    /// Bytes from a vectored callback result that did not fit yet
    pending: Vec<u8>,
    pending_off: usize,
    /// Trailers returned by the content creator
    footers: Vec<(String, String)>,
    finished: bool,
}

impl Reply {
    fn remaining(&self) -> Option<u64> {
        self.size.map(|size| size.saturating_sub(self.sent))
    }

    /// Produces the next body bytes into `buf`.
    fn fill(&mut self, buf: &mut [u8]) -> Fill {
        let limit = match self.remaining() {
            Some(0) => return Fill::End,
            Some(left) => left.min(buf.len() as u64) as usize,
            None => buf.len(),
        };
        let buf = &mut buf[..limit];

        if self.pending_off < self.pending.len() {
            let n = (self.pending.len() - self.pending_off).min(buf.len());
            buf[..n].copy_from_slice(&self.pending[self.pending_off..self.pending_off + n]);
            self.pending_off += n;
            self.sent += n as u64;
            return Fill::Data(n);
        }

        let content = self.response.response().content();
        let n = match content {
            Content::Empty => return Fill::End,
            Content::Buffer(_) | Content::Static(_) | Content::Iovec(_) => {
                match content.copy_memory(self.sent, buf) {
                    0 => return Fill::End,
                    n => n,
                }
            }
            Content::File { .. } => match read_file_content(content, self.sent, buf) {
                Ok(0) if self.size.is_some() => {
                    log::warn!("response file ended {} bytes early", limit);
                    return Fill::Fail(CloseReason::IntError);
                }
                Ok(0) => return Fill::End,
                Ok(n) => n,
                Err(err) => {
                    log::warn!("reading response file failed: {}", err);
                    return Fill::Fail(CloseReason::IntError);
                }
            },
            Content::Callback(creator) => {
                let Ok(mut creator) = creator.lock() else {
                    log::warn!("content creator lock poisoned");
                    return Fill::Fail(CloseReason::AppError);
                };
                match (*creator)(self.sent, buf) {
                    DynamicContentAction::Continue(0) => {
                        log::warn!("content creator continued without data");
                        return Fill::Fail(CloseReason::AppError);
                    }
                    DynamicContentAction::Continue(n) if n > buf.len() => {
                        log::warn!("content creator wrote {} bytes into {}", n, buf.len());
                        return Fill::Fail(CloseReason::AppError);
                    }
                    DynamicContentAction::Continue(n) => n,
                    DynamicContentAction::ContinueIov(parts) => {
                        let total: usize = parts.iter().map(Vec::len).sum();
                        if total == 0 || self.remaining().map_or(false, |r| total as u64 > r) {
                            log::warn!("content creator returned {} bytes of vectored data", total);
                            return Fill::Fail(CloseReason::AppError);
                        }
                        self.pending = parts.concat();
                        let n = self.pending.len().min(buf.len());
                        buf[..n].copy_from_slice(&self.pending[..n]);
                        self.pending_off = n;
                        n
                    }
                    DynamicContentAction::Finish if self.size.is_none() => return Fill::End,
                    DynamicContentAction::FinishWithFooters(footers) if self.size.is_none() => {
                        self.footers = footers;
                        return Fill::End;
                    }
                    DynamicContentAction::Finish | DynamicContentAction::FinishWithFooters(_) => {
                        log::warn!("content creator finished before the announced size");
                        return Fill::Fail(CloseReason::AppError);
                    }
                    DynamicContentAction::Suspend => return Fill::Suspend,
                    DynamicContentAction::Abort => return Fill::Abort,
                }
            }
        };

        self.sent += n as u64;
        Fill::Data(n)
    }
}

impl Connection {
    pub(super) fn start_reply(&mut self) -> Flow {
        let Some(attached) = self.response.take() else {
            crate::panic::internal_error!("reply started without a response");
            return Err(Halt::Close(CloseReason::IntError));
        };
        self.body = BodySink::None;
        self.shrink_read_buffer();

        let (reply, head) = self.compose_head(attached)?;
        let min = if reply.chunked && reply.send_body {
            head.len().max(CHUNK_PREFIX_RESERVE + CHUNK_SUFFIX.len() + 1)
        } else {
            head.len()
        };
        self.allocate_write_buffer(min)?;
        if !self.write_buf.try_append(&head) {
            crate::panic::internal_error!("reply head does not fit its buffer");
            return Err(Halt::Close(CloseReason::IntError));
        }

        self.reply = Some(reply);
        self.stage = Stage::HeadersSending;
        Ok(())
    }

    /// Decides framing and persistence and serializes the reply head.
    fn compose_head(&mut self, attached: AttachedResponse) -> Result<(Reply, Vec<u8>), Halt> {
        let response = attached.response();
        let head = attached.head();
        let flags = head.flags;
        let status = response.status();
        let size = response.content_size();
        let config = &self.ctx.shared.config;
        let peer_version = self.request.version.unwrap_or(Version::H1_1);
        let is_head = self.request.method == Some(Method::Head);

        let body_headers = !status.forbids_body();
        let send_body = body_headers && !is_head && !flags.head_only;

        let mut must_close = self.reuse == ConnReuse::MustClose
            || self.stop_with_error
            || self.discard_request
            || flags.close_forced
            || self.request.conn_close
            || self.ctx.shared.stopping.load(Ordering::Acquire);
        if peer_version == Version::H1_0 && (!self.request.conn_keep_alive || self.request.chunked)
        {
            must_close = true;
        }

        let chunked = body_headers
            && !flags.mode_1_0
            && peer_version >= Version::H1_1
            && (flags.chunked || (send_body && size.is_none()));
        let framing = match size {
            _ if !body_headers => Framing::None,
            _ if chunked => Framing::Chunked,
            Some(n) if !flags.suppress_content_length && !flags.cnt_len_by_app => {
                Framing::ContentLength(n)
            }
            _ => Framing::None,
        };
        // without a length or chunks the end of the body is the end of the connection
        if send_body && framing == Framing::None && !flags.cnt_len_by_app {
            must_close = true;
        }
        if must_close {
            self.reuse = ConnReuse::MustClose;
        }

        let version = if flags.shoutcast && config.enable_shoutcast {
            ReplyVersion::Icy
        } else if flags.mode_1_0 {
            ReplyVersion::H1_0
        } else {
            ReplyVersion::H1_1
        };

        let connection = if must_close {
            Some(match &head.connection {
                Some(tokens) => format!("close, {}", tokens),
                None => "close".to_string(),
            })
        } else if peer_version == Version::H1_0 {
            Some("Keep-Alive".to_string())
        } else {
            head.connection.clone()
        };
        let date = (!config.suppress_date && !flags.has_hdr_date).then(|| with_http_date(|d: &str| d.to_owned()));

        let mut headers = Vec::with_capacity(head.headers.len());
        for (idx, (name, value)) in head.headers.iter().enumerate() {
            if !body_headers && name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let value = match head.nonce_slots.iter().find(|slot| slot.header == idx) {
                Some(slot) => Cow::Owned(self.splice_nonce(value, slot.offset)?),
                None => Cow::Borrowed(value.as_str()),
            };
            headers.push((name.as_str(), value));
        }

        let reply_head = ReplyHead {
            version,
            status,
            connection: connection.as_deref(),
            headers,
            date: date.as_deref(),
            framing,
            special: head.special,
        };
        let mut out = Vec::with_capacity(256);
        reply_head.write_to(&mut out);
        log::trace!(
            "connection {}: reply {} ({:?}, close: {})",
            self.ctx.id,
            status,
            framing,
            must_close
        );

        let content = response.content();
        let location = match content {
            _ if !send_body => Location::Nowhere,
            Content::Empty => Location::Nowhere,
            Content::Buffer(_) | Content::Static(_) | Content::Iovec(_) => Location::Memory,
            Content::File { .. } => Location::File,
            Content::Callback(_) => Location::Callback,
        };
        let use_sendfile = location == Location::File
            && !chunked
            && size.is_some()
            && content.sendfile_enabled()
            && !self.transport.is_tls();

        let reply = Reply {
            send_body,
            chunked,
            location,
            size,
            sent: 0,
            use_sendfile,
            pending: Vec::new(),
            pending_off: 0,
            footers: Vec::new(),
            finished: false,
            response: attached,
        };
        Ok((reply, out))
    }

    /// Replaces the nonce placeholder at `offset` with a fresh nonce.
    fn splice_nonce(&self, value: &str, offset: usize) -> Result<String, Halt> {
        let nonces = &self.ctx.shared.nonces;
        let span = |s: Option<crate::mem::Span>| s.and_then(|s| self.pool.get(s)).unwrap_or(&[]);
        let key = nonces.bind_key(
            span(self.request.method_raw),
            span(self.request.target),
            self.ctx.peer.map(|p| p.ip()),
        );
        let Some(nonce) = nonces.generate(key) else {
            log::error!("cannot generate a digest nonce");
            return Err(Halt::Close(CloseReason::IntError));
        };
        if value.get(offset..offset + NONCE_LEN).is_none() {
            crate::panic::internal_error!("nonce placeholder outside header value");
            return Err(Halt::Close(CloseReason::IntError));
        }
        let mut value = value.to_string();
        value.replace_range(offset..offset + NONCE_LEN, &String::from_utf8_lossy(&nonce));
        Ok(value)
    }

    /// Takes the write buffer from the pool: at least `min` bytes, more if the pool allows.
    fn allocate_write_buffer(&mut self, min: usize) -> Flow {
        self.pool.release_buffer(self.write_buf.capacity());
        let free = self.pool.free();
        let size = min.max(free.min(WRITE_BUFFER_SIZE));
        if size > free || !self.pool.reserve_buffer(size) {
            log::debug!(
                "connection {}: {} bytes needed for the reply, {} free",
                self.ctx.id,
                min,
                free
            );
            self.write_buf = ByteBuffer::default();
            return Err(Halt::Close(CloseReason::NoPoolMemForReply));
        }
        self.write_buf = ByteBuffer::new(size);
        Ok(())
    }

    /// Writes the `101` reply of a protocol upgrade.
    pub(super) fn write_upgrade_head(
        &mut self,
        protocol: &str,
        headers: &[(String, String)],
    ) -> Flow {
        let mut head = ReplyHead::new(ReplyVersion::H1_1, StatusCode::SWITCHING_PROTOCOLS);
        head.connection = Some("Upgrade");
        head.headers.push(("Upgrade", Cow::Borrowed(protocol)));
        for (name, value) in headers {
            head.headers.push((name.as_str(), Cow::Borrowed(value.as_str())));
        }
        let date = (!self.ctx.shared.config.suppress_date).then(|| with_http_date(|d: &str| d.to_owned()));
        head.date = date.as_deref();

        let mut out = Vec::with_capacity(128);
        head.write_to(&mut out);
        self.shrink_read_buffer();
        self.allocate_write_buffer(out.len())?;
        if self.write_buf.try_append(&out) {
            Ok(())
        } else {
            Err(Halt::Close(CloseReason::NoPoolMemForReply))
        }
    }

    fn reply_mut(&mut self) -> Result<&mut Reply, Halt> {
        match self.reply.as_mut() {
            Some(reply) => Ok(reply),
            None => {
                crate::panic::internal_error!("reply stage without a reply");
                Err(Halt::Close(CloseReason::IntError))
            }
        }
    }

    pub(super) fn headers_sent(&mut self) -> Flow {
        let reply = self.reply_mut()?;
        let next = if !reply.send_body {
            Stage::FullReplySent
        } else if reply.chunked {
            Stage::ChunkedBodyUnready
        } else if reply.location == Location::Memory {
            Stage::NormalBodyReady
        } else if reply.location == Location::Nowhere {
            Stage::FullReplySent
        } else {
            Stage::NormalBodyUnready
        };
        self.stage = next;
        Ok(())
    }

    pub(super) fn normal_body_unready(&mut self) -> Flow {
        if self.reply_mut()?.use_sendfile {
            return self.send_file_part();
        }

        let Some(reply) = self.reply.as_mut() else {
            return Err(Halt::Close(CloseReason::IntError));
        };
        match reply.fill(self.write_buf.writable()) {
            Fill::Data(n) => self.write_buf.mark_written(n),
            Fill::End => reply.finished = true,
            other => return self.fill_halt(other),
        }
        self.stage = Stage::NormalBodyReady;
        Ok(())
    }

    pub(super) fn normal_body_ready(&mut self) -> Flow {
        let Some(reply) = self.reply.as_mut() else {
            return Err(Halt::Close(CloseReason::IntError));
        };

        if reply.location == Location::Memory {
            let content = reply.response.response().content();
            let left = reply.remaining().unwrap_or(0) as usize;
            let slice = content.memory_slice(reply.sent).unwrap_or(&[]);
            let slice = &slice[..slice.len().min(left)];
            if slice.is_empty() {
                if left > 0 {
                    crate::panic::internal_error!("response memory shorter than its size");
                    return Err(Halt::Close(CloseReason::IntError));
                }
                self.stage = Stage::FullReplySent;
                return Ok(());
            }
            let n = send_some(self.transport.as_mut(), slice)?;
            reply.sent += n as u64;
            self.touch();
            return Ok(());
        }

        self.send_write_buf()?;
        let reply = self.reply_mut()?;
        let next = if reply.finished || reply.remaining() == Some(0) {
            Stage::FullReplySent
        } else {
            Stage::NormalBodyUnready
        };
        self.stage = next;
        Ok(())
    }

    /// Sends file content with `sendfile`, falling back to reading when that is not possible.
    fn send_file_part(&mut self) -> Flow {
        let Some(reply) = self.reply.as_mut() else {
            return Err(Halt::Close(CloseReason::IntError));
        };
        let left = reply.remaining().unwrap_or(0);
        if left == 0 {
            self.stage = Stage::FullReplySent;
            return Ok(());
        }
        let content = reply.response.response().content();
        let Content::File { file, offset, .. } = content else {
            reply.use_sendfile = false;
            return Ok(());
        };

        let len = left.min(SENDFILE_CHUNK_LIMIT as u64) as usize;
        match self.transport.send_file(file, offset + reply.sent, len) {
            None => reply.use_sendfile = false,
            Some(Ok(0)) => {
                log::warn!("connection {}: response file ended early", self.ctx.id);
                return Err(Halt::Close(CloseReason::IntError));
            }
            Some(Ok(n)) => {
                reply.sent += n as u64;
                self.touch();
            }
            Some(Err(err)) => match SocketError::from(&err) {
                SocketError::Again => return Err(Halt::Send),
                SocketError::Interrupted => {}
                _ if is_unsupported(&err) => {
                    log::debug!("sendfile unsupported, reading the file instead: {}", err);
                    content.disable_sendfile();
                    reply.use_sendfile = false;
                }
                _ => {
                    log::debug!("connection {}: sendfile failed: {}", self.ctx.id, err);
                    return Err(Halt::Close(CloseReason::SocketErr));
                }
            },
        }
        Ok(())
    }

    pub(super) fn chunked_body_unready(&mut self) -> Flow {
        let Some(reply) = self.reply.as_mut() else {
            return Err(Halt::Close(CloseReason::IntError));
        };

        self.write_buf.clear();
        if !self.write_buf.reserve_front(CHUNK_PREFIX_RESERVE) {
            return Err(Halt::Close(CloseReason::NoPoolMemForReply));
        }
        let room = self
            .write_buf
            .remaining_mut()
            .saturating_sub(CHUNK_SUFFIX.len())
            .min(MAX_CHUNK_SIZE);
        if room == 0 {
            return Err(Halt::Close(CloseReason::NoPoolMemForReply));
        }

        match reply.fill(&mut self.write_buf.writable()[..room]) {
            Fill::Data(n) => {
                self.write_buf.mark_written(n);
                let mut prefix = [0u8; CHUNK_PREFIX_RESERVE];
                let used = ChunkEncoder::encode_prefix(n, &mut prefix);
                self.write_buf.unread(used);
                self.write_buf.readable_mut()[..used]
                    .copy_from_slice(&prefix[CHUNK_PREFIX_RESERVE - used..]);
                // room for the suffix was left above, so this never compacts
                self.write_buf.try_append(CHUNK_SUFFIX);
                self.stage = Stage::ChunkedBodyReady;
                Ok(())
            }
            Fill::End => {
                self.write_buf.clear();
                self.stage = Stage::ChunkedBodySent;
                Ok(())
            }
            other => {
                self.write_buf.clear();
                self.fill_halt(other)
            }
        }
    }

    /// Writes the last chunk and the trailer section.
    pub(super) fn chunked_body_sent(&mut self) -> Flow {
        let reply = self.reply_mut()?;
        let mut footers = reply.response.head().footers.clone();
        footers.append(&mut reply.footers);

        let mut tail = Vec::with_capacity(64);
        ChunkEncoder::encode_last(&footers, &mut tail);
        self.write_buf.clear();
        if tail.len() > self.write_buf.capacity() {
            self.allocate_write_buffer(tail.len())?;
        }
        if !self.write_buf.try_append(&tail) {
            return Err(Halt::Close(CloseReason::NoPoolMemForReply));
        }
        self.stage = Stage::FootersSending;
        Ok(())
    }

    fn fill_halt(&mut self, fill: Fill) -> Flow {
        match fill {
            Fill::Suspend => self.suspend(),
            Fill::Abort => Err(Halt::Close(CloseReason::AppAborted)),
            Fill::Fail(reason) => Err(Halt::Close(reason)),
            Fill::Data(_) | Fill::End => Ok(()),
        }
    }

    pub(super) fn full_reply_sent(&mut self) -> Flow {
        self.flush_transport()?;
        self.reply = None;

        if self.reuse != ConnReuse::KeepalivePossible || self.rmt_shut_wr {
            return Err(Halt::Close(if self.stop_with_error {
                CloseReason::WithError
            } else {
                CloseReason::CompletedOk
            }));
        }
        self.reset_for_next_request();
        Ok(())
    }
}
