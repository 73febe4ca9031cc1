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

//! Receiving side: request line, header section, body and trailers

use std::borrow::Cow;
use std::sync::Arc;

use super::{Connection, Flow, Halt, Stage};
use crate::action::{
    ActionKind, PostDoneCallback, PostParseResult, UploadAction, UploadActionKind, UploadCallback,
    UpgradeHandler,
};
use crate::connection::{CloseReason, ConnReuse};
use crate::daemon::Shared;
use crate::parser::h1::chunked::{is_forbidden_trailer, Decoded};
use crate::parser::h1::request::{
    parse_header_line, parse_request_line, skip_empty_lines, HeaderLine,
};
use crate::parser::h1::trim_ows;
use crate::parser::{ParseError, ParseResult, Status, StatusCode, StrictLevel, Version};
use crate::request::{parse_cookies, parse_urlencoded, percent_decode, FieldKind, Request};
use crate::response::Response;

/// Body bytes buffered against the daemon-wide large buffer budget. The charge is returned when
/// the buffer is dropped.
pub(super) struct LargeBuffer {
    data: Vec<u8>,
    shared: Arc<Shared>,
}

impl LargeBuffer {
    fn new(shared: Arc<Shared>) -> Self {
        LargeBuffer {
            data: Vec::new(),
            shared,
        }
    }

    /// Appends `bytes` unless that would exceed `limit` or the daemon budget. The error is the
    /// status to reply with: `413` past the limit, `503` when the budget is used up.
    fn extend(&mut self, bytes: &[u8], limit: usize) -> Result<(), StatusCode> {
        if self.data.len() + bytes.len() > limit {
            return Err(StatusCode::CONTENT_TOO_LARGE);
        }
        if !self.shared.take_large(bytes.len()) {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

impl Drop for LargeBuffer {
    fn drop(&mut self) {
        self.shared.release_large(self.data.len());
    }
}

/// Where received body bytes go.
pub(super) enum BodySink {
    /// No decision was made yet.
    None,
    /// A response was chosen; the body is read and dropped.
    Discard,
    Full {
        cb: UploadCallback,
        data: LargeBuffer,
        limit: usize,
    },
    Incremental {
        cb: UploadCallback,
    },
    Post {
        done: PostDoneCallback,
        max: usize,
        data: LargeBuffer,
        /// Set once the outcome is known; failures are recorded early and the body discarded
        result: Option<PostParseResult>,
    },
}

enum Delivery {
    Stored,
    Refused(StatusCode),
    Upload(Option<UploadAction>),
}

enum Final {
    Upload(Option<UploadAction>),
    Post(Option<crate::action::Action>),
    Missing,
}

enum FieldLine {
    More,
    End,
    Reject(StatusCode),
}

impl Connection {
    pub(super) fn init(&mut self) -> Flow {
        if self.read_buf.is_empty() {
            return Err(Halt::Recv);
        }
        self.stage = Stage::ReqLineReceiving;
        Ok(())
    }

    pub(super) fn req_line_receiving(&mut self) -> Flow {
        let strict = self.strict();
        let skipped = match skip_empty_lines(
            self.read_buf.readable(),
            strict,
            &mut self.request.skipped_lines,
        ) {
            Ok(n) => n,
            Err(err) => return self.protocol_error(err),
        };
        self.read_buf.mark_read(skipped);
        if self.read_buf.is_empty() {
            return Err(Halt::Recv);
        }

        let (line, consumed) = match parse_request_line(self.read_buf.readable(), strict) {
            Ok(Status::Complete(parsed)) => parsed,
            Ok(Status::Partial) => return Err(Halt::Recv),
            Err(err) => return self.protocol_error(err),
        };
        let (method, version) = (line.method, line.version);
        let method_raw = self.pool.alloc_copy(line.method_raw);
        let target = self.pool.alloc_copy(line.target);
        let (Some(method_raw), Some(target)) = (method_raw, target) else {
            return self.error_reply(StatusCode::URI_TOO_LONG);
        };

        self.request.method = Some(method);
        self.request.method_raw = Some(method_raw);
        self.request.target = Some(target);
        self.request.version = Some(version);
        self.read_buf.mark_read(consumed);
        self.stage = Stage::ReqLineReceived;
        Ok(())
    }

    pub(super) fn req_line_received(&mut self) -> Flow {
        if let Some(logger) = &self.ctx.shared.config.early_uri_logger {
            if let Some(target) = self.request.target.and_then(|t| self.pool.get(t)) {
                logger(&String::from_utf8_lossy(target));
            }
        }
        log::trace!(
            "connection {}: request line {:?} {:?}",
            self.ctx.id,
            self.request.method,
            self.request.version
        );
        self.stage = Stage::ReqHeadersReceiving;
        Ok(())
    }

    /// Receives the header section, or the trailer section after a chunked body.
    pub(super) fn fields_receiving(&mut self, footers: bool) -> Flow {
        let strict = self.strict();
        let kind = if footers {
            FieldKind::Footer
        } else {
            FieldKind::Header
        };

        loop {
            let (line, consumed) = match parse_header_line(self.read_buf.readable(), strict) {
                Ok(Status::Complete(parsed)) => parsed,
                Ok(Status::Partial) => return Err(Halt::Recv),
                Err(err) => return self.protocol_error(err),
            };

            let next = match line {
                HeaderLine::End => FieldLine::End,
                HeaderLine::Skipped => {
                    self.request.repairs += 1;
                    FieldLine::More
                }
                HeaderLine::Field { name, value } => {
                    if matches!(value, Cow::Owned(_)) {
                        self.request.repairs += 1;
                    }
                    if footers && is_forbidden_trailer(name) {
                        if strict.at_least(1) {
                            FieldLine::Reject(StatusCode::BAD_REQUEST)
                        } else {
                            FieldLine::More
                        }
                    } else if self
                        .request
                        .push_field(&mut self.pool, kind, name, Some(value.as_ref()))
                    {
                        FieldLine::More
                    } else {
                        FieldLine::Reject(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
                    }
                }
            };

            match next {
                FieldLine::More => self.read_buf.mark_read(consumed),
                FieldLine::End => {
                    self.read_buf.mark_read(consumed);
                    self.stage = if footers {
                        Stage::FootersReceived
                    } else {
                        Stage::HeadersReceived
                    };
                    return Ok(());
                }
                FieldLine::Reject(status) => return self.error_reply(status),
            }
        }
    }

    pub(super) fn headers_received(&mut self) -> Flow {
        let strict = self.strict();
        let version = self.request.version.unwrap_or(Version::H1_1);

        let hosts = self.request.find_all(&self.pool, "Host").count();
        if hosts > 1 || (hosts == 0 && version == Version::H1_1 && strict.at_least(0)) {
            return self.protocol_error(ParseError::Host);
        }

        let length = content_length(self.request.find_all(&self.pool, "Content-Length"), strict);
        let length = match length {
            Ok(length) => length,
            Err(err) => return self.protocol_error(err),
        };
        let chunked = match transfer_coding(self.request.find_all(&self.pool, "Transfer-Encoding")) {
            Ok(chunked) => chunked,
            Err(err) => return self.protocol_error(err),
        };
        if chunked {
            self.request.chunked = true;
            self.request.content_size = None;
            if length.is_some() {
                self.request.conn_close = true;
            }
        } else {
            self.request.content_size = Some(length.unwrap_or(0));
        }

        if version >= Version::H1_1 {
            self.request.expect_100 = self
                .request
                .find(&self.pool, FieldKind::Header, "Expect")
                .map_or(false, |v| trim_ows(v).eq_ignore_ascii_case(b"100-continue"));
        }

        let (mut close, mut keep_alive) = (false, false);
        for value in self.request.find_all(&self.pool, "Connection") {
            for token in value.split(|&b| b == b',').map(trim_ows) {
                close |= token.eq_ignore_ascii_case(b"close");
                keep_alive |= token.eq_ignore_ascii_case(b"keep-alive");
            }
        }
        self.request.conn_close |= close;
        self.request.conn_keep_alive = keep_alive;

        let cookies: Vec<Vec<u8>> = self
            .request
            .find_all(&self.pool, "Cookie")
            .map(<[u8]>::to_vec)
            .collect();
        for cookie in cookies {
            if !parse_cookies(&mut self.request, &mut self.pool, &cookie) {
                return self.error_reply(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
            }
        }

        if !self.parse_target() {
            return self.error_reply(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        }

        self.stage = Stage::HeadersProcessed;
        Ok(())
    }

    /// Splits the target into the decoded path and the query arguments.
    fn parse_target(&mut self) -> bool {
        let target = self
            .request
            .target
            .and_then(|t| self.pool.get(t))
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let (path, query) = match target.iter().position(|&b| b == b'?') {
            Some(q) => (&target[..q], Some(&target[q + 1..])),
            None => (&target[..], None),
        };

        match self.pool.alloc_copy(&percent_decode(path, false)) {
            Some(span) => self.request.path = Some(span),
            None => return false,
        }
        match query {
            Some(query) => parse_urlencoded(
                &mut self.request,
                &mut self.pool,
                FieldKind::GetArgument,
                query,
                self.ctx.shared.config.plus_as_space,
            ),
            None => true,
        }
    }

    pub(super) fn headers_processed(&mut self) -> Flow {
        self.request.action_taken = false;
        let action = {
            let mut req = Request {
                state: &mut self.request,
                pool: &mut self.pool,
                ctx: &self.ctx,
                timeout: &mut self.timeout,
            };
            (self.ctx.shared.handler)(&mut req)
        };

        let Some(action) = action else {
            log::debug!("connection {}: request aborted by application", self.ctx.id);
            return Err(Halt::Close(CloseReason::AppAborted));
        };

        match action.kind {
            ActionKind::Suspend => self.suspend(),
            ActionKind::Response(response) => {
                self.attach_response(response)?;
                self.skip_or_discard_body()
            }
            ActionKind::Upload {
                large_buffer_size,
                full,
                incremental,
            } => self.start_upload(large_buffer_size, full, incremental),
            ActionKind::PostParse { max_size, done } => self.start_post_parse(max_size, done),
            ActionKind::Upgrade {
                protocol,
                headers,
                handler,
            } => self.start_upgrade(&protocol, &headers, handler),
        }
    }

    pub(super) fn suspend(&mut self) -> Flow {
        if self.ctx.shared.config.disallow_suspend_resume {
            return self.app_error("suspending is disallowed by the daemon");
        }
        log::trace!("connection {} suspended", self.ctx.id);
        self.suspended = true;
        Err(Halt::Block)
    }

    fn attach_response(&mut self, response: Response) -> Flow {
        if response.status().is_informational() {
            return self.app_error("an informational status cannot be the final reply");
        }
        match response.attach() {
            Ok(attached) => {
                self.response = Some(attached);
                Ok(())
            }
            Err(err) => self.app_error(&format!("response cannot be used: {}", err)),
        }
    }

    /// A response was chosen right after the header section.
    fn skip_or_discard_body(&mut self) -> Flow {
        if !self.request.has_body() {
            self.stage = Stage::FullReqReceived;
        } else if self.request.expect_100 && self.read_buf.is_empty() {
            // the client waits for 100 Continue and sends no body without it
            self.reuse = ConnReuse::MustClose;
            self.discard_request = true;
            self.stage = Stage::FullReqReceived;
        } else {
            self.body = BodySink::Discard;
            self.stage = Stage::BodyReceiving;
        }
        Ok(())
    }

    fn start_upload(
        &mut self,
        large_buffer_size: usize,
        full: Option<UploadCallback>,
        incremental: Option<UploadCallback>,
    ) -> Flow {
        let shared = &self.ctx.shared;
        let size = self.request.content_size;
        let within_limit = size.map_or(false, |s| s <= large_buffer_size as u64);
        let fits = within_limit && size.map_or(false, |s| shared.large_available(s as usize));

        self.body = match (full, incremental) {
            (Some(cb), _) if fits => BodySink::Full {
                cb,
                data: LargeBuffer::new(shared.clone()),
                limit: large_buffer_size,
            },
            (_, Some(cb)) => BodySink::Incremental { cb },
            (Some(cb), None) if size.is_none() => BodySink::Full {
                cb,
                data: LargeBuffer::new(shared.clone()),
                limit: large_buffer_size,
            },
            // the body is acceptable but the daemon-wide budget is taken for now
            (Some(_), None) if within_limit => {
                return self.error_reply(StatusCode::SERVICE_UNAVAILABLE)
            }
            (Some(_), None) => return self.error_reply(StatusCode::CONTENT_TOO_LARGE),
            (None, None) => return self.app_error("upload action without callbacks"),
        };
        self.enter_body();
        Ok(())
    }

    fn start_post_parse(&mut self, max_size: usize, done: PostDoneCallback) -> Flow {
        let urlencoded = self
            .request
            .find(&self.pool, FieldKind::Header, "Content-Type")
            .map_or(false, |v| {
                let mime = v.split(|&b| b == b';').next().map(trim_ows).unwrap_or(b"");
                mime.eq_ignore_ascii_case(b"application/x-www-form-urlencoded")
            });
        let result = if !urlencoded {
            Some(PostParseResult::UnsupportedEncoding)
        } else if self
            .request
            .content_size
            .map_or(false, |s| s > max_size as u64)
        {
            Some(PostParseResult::NoMemory)
        } else {
            None
        };

        self.body = BodySink::Post {
            done,
            max: max_size,
            data: LargeBuffer::new(self.ctx.shared.clone()),
            result,
        };
        self.enter_body();
        Ok(())
    }

    fn enter_body(&mut self) {
        self.stage =
            if self.request.expect_100 && self.request.has_body() && self.read_buf.is_empty() {
                Stage::ContinueSending
            } else {
                Stage::BodyReceiving
            };
    }

    fn start_upgrade(
        &mut self,
        protocol: &str,
        headers: &[(String, String)],
        handler: UpgradeHandler,
    ) -> Flow {
        if self.ctx.shared.config.disallow_upgrade {
            return self.app_error("upgrading is disallowed by the daemon");
        }
        if self.request.version != Some(Version::H1_1) || self.request.has_body() {
            return self.app_error("only HTTP/1.1 requests without a body can be upgraded");
        }
        self.write_upgrade_head(protocol, headers)?;
        self.upgrade = Some(handler);
        self.reuse = ConnReuse::MustUpgrade;
        self.stage = Stage::UpgradeHeadersSending;
        Ok(())
    }

    pub(super) fn continue_sending(&mut self) -> Flow {
        use crate::parser::h1::response::CONTINUE_REPLY;

        while self.continue_sent < CONTINUE_REPLY.len() {
            let n = super::io::send_some(
                self.transport.as_mut(),
                &CONTINUE_REPLY[self.continue_sent..],
            )?;
            self.continue_sent += n;
            self.touch();
        }
        self.stage = Stage::BodyReceiving;
        Ok(())
    }

    pub(super) fn body_receiving(&mut self) -> Flow {
        if self.request.chunked {
            self.receive_chunked()
        } else {
            self.receive_identity()
        }
    }

    fn receive_identity(&mut self) -> Flow {
        let size = self.request.content_size.unwrap_or(0);
        loop {
            let left = size - self.body_received;
            if left == 0 {
                self.stage = Stage::BodyReceived;
                return Ok(());
            }
            let available = self.read_buf.remaining();
            if available == 0 {
                return Err(Halt::Recv);
            }

            let n = (available as u64).min(left) as usize;
            let delivery = self.deliver(n);
            self.read_buf.mark_read(n);
            self.body_received += n as u64;
            self.after_delivery(delivery)?;
            if self.stage != Stage::BodyReceiving {
                return Ok(());
            }
        }
    }

    fn receive_chunked(&mut self) -> Flow {
        let strict = self.strict();
        loop {
            let decoded = match self.decoder.decode(self.read_buf.readable(), strict) {
                Ok(Status::Complete(decoded)) => decoded,
                Ok(Status::Partial) => return Err(Halt::Recv),
                Err(err) => return self.protocol_error(err),
            };

            match decoded {
                (Decoded::Data { start, len }, consumed) => {
                    debug_assert_eq!(0, start);
                    let delivery = self.deliver(len);
                    self.read_buf.mark_read(consumed);
                    self.body_received += len as u64;
                    self.after_delivery(delivery)?;
                    if self.stage != Stage::BodyReceiving {
                        return Ok(());
                    }
                }
                (Decoded::Framing, consumed) => self.read_buf.mark_read(consumed),
                (Decoded::End, consumed) => {
                    self.read_buf.mark_read(consumed);
                    self.stage = Stage::BodyReceived;
                    return Ok(());
                }
            }
        }
    }

    /// Hands the first `len` pending bytes to the body sink. The caller consumes them.
    fn deliver(&mut self, len: usize) -> Delivery {
        let Connection {
            read_buf,
            request,
            pool,
            ctx,
            timeout,
            body,
            ..
        } = self;
        let data = &read_buf.readable()[..len];

        match body {
            BodySink::None | BodySink::Discard => Delivery::Stored,
            BodySink::Full {
                data: buffer,
                limit,
                ..
            } => {
                match buffer.extend(data, *limit) {
                    Ok(()) => Delivery::Stored,
                    Err(status) => Delivery::Refused(status),
                }
            }
            BodySink::Incremental { cb } => {
                request.action_taken = false;
                let mut req = Request {
                    state: request,
                    pool,
                    ctx,
                    timeout,
                };
                Delivery::Upload(cb(&mut req, data))
            }
            BodySink::Post {
                max,
                data: buffer,
                result,
                ..
            } => {
                if result.is_none() && buffer.extend(data, *max).is_err() {
                    *result = Some(PostParseResult::NoMemory);
                }
                Delivery::Stored
            }
        }
    }

    fn after_delivery(&mut self, delivery: Delivery) -> Flow {
        match delivery {
            Delivery::Stored => Ok(()),
            Delivery::Refused(status) => self.error_reply(status),
            Delivery::Upload(action) => self.upload_action(action, false),
        }
    }

    fn upload_action(&mut self, action: Option<UploadAction>, last: bool) -> Flow {
        let Some(action) = action else {
            return Err(Halt::Close(CloseReason::AppAborted));
        };
        match action.kind {
            UploadActionKind::Continue if last => {
                self.app_error("the upload is complete and cannot be continued")
            }
            UploadActionKind::Continue => Ok(()),
            UploadActionKind::Suspend => self.suspend(),
            UploadActionKind::Response(response) => {
                self.attach_response(response)?;
                if last {
                    self.stage = Stage::StartReply;
                } else {
                    self.body = BodySink::Discard;
                }
                Ok(())
            }
            UploadActionKind::Abort => Err(Halt::Close(CloseReason::AppAborted)),
        }
    }

    pub(super) fn full_req_received(&mut self) -> Flow {
        if self.response.is_some() {
            self.stage = Stage::StartReply;
            return Ok(());
        }

        let outcome = {
            let Connection {
                request,
                pool,
                ctx,
                timeout,
                body,
                ..
            } = self;
            request.action_taken = false;
            let plus_as_space = ctx.shared.config.plus_as_space;
            let mut req = Request {
                state: request,
                pool,
                ctx,
                timeout,
            };

            match body {
                BodySink::Full { cb, data, .. } => Final::Upload(cb(&mut req, &data.data)),
                BodySink::Incremental { cb } => Final::Upload(cb(&mut req, &[])),
                BodySink::Post {
                    done, data, result, ..
                } => {
                    let parsed = match *result {
                        Some(parsed) => parsed,
                        None if parse_urlencoded(
                            req.state,
                            req.pool,
                            FieldKind::PostData,
                            &data.data,
                            plus_as_space,
                        ) =>
                        {
                            PostParseResult::Ok
                        }
                        None => PostParseResult::NoMemory,
                    };
                    *result = Some(parsed);
                    Final::Post(done(&mut req, parsed))
                }
                BodySink::None | BodySink::Discard => Final::Missing,
            }
        };

        match outcome {
            Final::Upload(action) => self.upload_action(action, true),
            Final::Post(action) => self.post_done(action),
            Final::Missing => {
                crate::panic::internal_error!("request complete without a reply");
                self.error_reply(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    fn post_done(&mut self, action: Option<crate::action::Action>) -> Flow {
        let Some(action) = action else {
            return Err(Halt::Close(CloseReason::AppAborted));
        };
        match action.kind {
            ActionKind::Response(response) => {
                self.attach_response(response)?;
                self.stage = Stage::StartReply;
                Ok(())
            }
            ActionKind::Suspend => self.suspend(),
            _ => self.app_error("only a response or suspend can follow POST parsing"),
        }
    }

    /// Gives the final upload callback its terminating call before the daemon closes the
    /// connection.
    pub(super) fn notify_upload_terminated(&mut self) {
        let Connection {
            request,
            pool,
            ctx,
            timeout,
            body,
            ..
        } = self;
        if matches!(body, BodySink::None | BodySink::Discard) {
            return;
        }
        request.terminating = true;
        request.action_taken = false;
        let mut req = Request {
            state: request,
            pool,
            ctx,
            timeout,
        };
        // actions returned here are ignored, the connection closes regardless
        match body {
            BodySink::Incremental { cb } => {
                let _ = cb(&mut req, &[]);
            }
            BodySink::Full { cb, data, .. } => {
                let _ = cb(&mut req, &data.data);
            }
            BodySink::Post { done, result, .. } => {
                let _ = done(&mut req, result.unwrap_or(PostParseResult::Broken));
            }
            BodySink::None | BodySink::Discard => {}
        }
    }

    pub(super) fn protocol_error(&mut self, err: ParseError) -> Flow {
        log::debug!(
            "connection {} from {:?}: {}",
            self.ctx.id,
            self.ctx.peer,
            err
        );
        self.error_reply(err.status())
    }

    /// Abandons the request and replies with an error status. The connection closes afterwards.
    pub(super) fn error_reply(&mut self, status: StatusCode) -> Flow {
        if self.stage.reply_committed() {
            return Err(Halt::Close(CloseReason::WithError));
        }
        log::debug!("connection {}: replying {}", self.ctx.id, status);

        self.stop_with_error = true;
        self.discard_request = true;
        self.reuse = ConnReuse::MustClose;
        self.body = BodySink::None;
        self.response = None;

        // request strings are no longer needed; the pool and read buffer go to the reply
        self.pool.reset(self.pool_mark);
        self.request.fields.clear();
        self.request.method_raw = None;
        self.request.target = None;
        self.request.path = None;
        self.request.basic = None;
        self.pool.release_buffer(self.read_buf.capacity());
        self.read_buf = crate::mem::ByteBuffer::default();

        let response = crate::response::special::error_reply(status);
        match response.attach() {
            Ok(attached) => self.response = Some(attached),
            Err(_) => return Err(Halt::Close(CloseReason::IntError)),
        }
        self.stage = Stage::StartReply;
        Ok(())
    }

    /// The read buffer is full and cannot grow.
    pub(super) fn read_buffer_exhausted(&mut self) -> Flow {
        match self.stage {
            Stage::Init | Stage::ReqLineReceiving => self.error_reply(StatusCode::URI_TOO_LONG),
            Stage::ReqHeadersReceiving | Stage::FootersReceiving => {
                self.error_reply(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            Stage::BodyReceiving => self.error_reply(StatusCode::BAD_REQUEST),
            _ => {
                crate::panic::internal_error!("read buffer full in stage {:?}", self.stage);
                Err(Halt::Close(CloseReason::IntError))
            }
        }
    }
}

/// Value of the `Content-Length` headers. Identical duplicates are tolerated unless the strict
/// level is above 1.
fn content_length<'a>(
    values: impl Iterator<Item = &'a [u8]>,
    strict: StrictLevel,
) -> ParseResult<Option<u64>> {
    let mut length = None;
    for value in values {
        let value = trim_ows(value);
        if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
            return Err(ParseError::ContentLength);
        }
        let n = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(ParseError::ContentTooLarge)?;
        match length {
            None => length = Some(n),
            Some(prev) if prev == n && strict.at_most(1) => {}
            Some(_) => return Err(ParseError::ContentLength),
        }
    }
    Ok(length)
}

/// True if the request body is chunked. Codings other than a single `chunked` are not
/// supported.
fn transfer_coding<'a>(values: impl Iterator<Item = &'a [u8]>) -> ParseResult<bool> {
    let mut chunked = false;
    for value in values {
        for coding in value.split(|&b| b == b',').map(trim_ows) {
            if coding.is_empty() {
                continue;
            }
            if chunked || !coding.eq_ignore_ascii_case(b"chunked") {
                return Err(ParseError::TransferEncoding);
            }
            chunked = true;
        }
    }
    Ok(chunked)
}
