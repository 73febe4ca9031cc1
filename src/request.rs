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

//! The request as seen by the application
//!
//! A [`Request`] is a view of the connection that is only valid for the duration of a callback.
//! All strings it hands out live in the connection memory pool.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::action::{
    Action, ActionKind, PostDoneCallback, UploadAction, UploadActionKind, UploadCallback,
    UpgradeHandler,
};
use crate::auth::basic::{self, BasicSpans};
use crate::auth::digest::{self, DigestRequest};
use crate::auth::{BasicCredentials, DigestCheck, DigestParams};
use crate::connection::{ConnContext, LoopHandle};
use crate::error::{Error, Result};
use crate::mem::{MemoryPool, Span};
use crate::parser::{Method, Version};
use crate::response::Response;

/// Where a request field came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Request header
    Header,
    /// Argument in the query part of the target
    GetArgument,
    /// `Cookie` header entry
    Cookie,
    /// Trailer of a chunked body
    Footer,
    /// Field of an `application/x-www-form-urlencoded` body
    PostData,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Field {
    pub(crate) kind: FieldKind,
    pub(crate) name: Span,
    pub(crate) value: Option<Span>,
}

/// Everything known about the request currently being served on a connection.
#[derive(Debug, Default)]
pub(crate) struct RequestState {
    pub(crate) method: Option<Method>,
    pub(crate) method_raw: Option<Span>,
    pub(crate) target: Option<Span>,
    pub(crate) path: Option<Span>,
    pub(crate) version: Option<Version>,
    pub(crate) fields: Vec<Field>,
    /// `None` while the size is unknown (chunked upload)
    pub(crate) content_size: Option<u64>,
    pub(crate) chunked: bool,
    pub(crate) expect_100: bool,
    pub(crate) conn_close: bool,
    pub(crate) conn_keep_alive: bool,
    pub(crate) skipped_lines: u32,
    pub(crate) repairs: u32,
    pub(crate) basic: Option<BasicSpans>,
    pub(crate) digest: Option<DigestParams>,
    pub(crate) action_taken: bool,
    pub(crate) terminating: bool,
}

impl RequestState {
    pub(crate) fn has_body(&self) -> bool {
        self.chunked || self.content_size.map_or(false, |n| n > 0)
    }

    /// Adds a field, copying name and value into the pool.
    pub(crate) fn push_field(
        &mut self,
        pool: &mut MemoryPool,
        kind: FieldKind,
        name: &[u8],
        value: Option<&[u8]>,
    ) -> bool {
        let Some(name) = pool.alloc_copy(name) else {
            return false;
        };
        let value = match value {
            Some(v) => match pool.alloc_copy(v) {
                Some(span) => Some(span),
                None => return false,
            },
            None => None,
        };
        self.fields.push(Field { kind, name, value });
        true
    }

    pub(crate) fn find<'p>(&self, pool: &'p MemoryPool, kind: FieldKind, name: &str) -> Option<&'p [u8]> {
        self.fields
            .iter()
            .filter(|f| f.kind == kind)
            .find(|f| {
                pool.get(f.name).map_or(false, |n| match kind {
                    FieldKind::Header | FieldKind::Footer => n.eq_ignore_ascii_case(name.as_bytes()),
                    _ => n == name.as_bytes(),
                })
            })
            .map(|f| f.value.and_then(|v| pool.get(v)).unwrap_or(&[]))
    }

    /// Every value of a header, in order.
    pub(crate) fn find_all<'a, 'p: 'a>(
        &'a self,
        pool: &'p MemoryPool,
        name: &'a str,
    ) -> impl Iterator<Item = &'p [u8]> + 'a {
        self.fields
            .iter()
            .filter(|f| f.kind == FieldKind::Header)
            .filter(move |f| pool.get(f.name).map_or(false, |n| n.eq_ignore_ascii_case(name.as_bytes())))
            .map(move |f| f.value.and_then(|v| pool.get(v)).unwrap_or(&[]))
    }
}

/// Resumes a suspended request from any thread.
#[derive(Clone)]
pub struct RequestHandle {
    token: usize,
    id: u64,
    waker: Arc<dyn LoopHandle>,
}

impl RequestHandle {
    /// Wakes the request. The callback that suspended it is called again.
    pub fn resume(&self) {
        self.waker.resume(self.token, self.id);
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("token", &self.token)
            .field("id", &self.id)
            .finish()
    }
}

/// A request, passed to application callbacks.
pub struct Request<'c> {
    pub(crate) state: &'c mut RequestState,
    pub(crate) pool: &'c mut MemoryPool,
    pub(crate) ctx: &'c ConnContext,
    pub(crate) timeout: &'c mut Option<Duration>,
}

impl<'c> Request<'c> {
    /// Request method
    pub fn method(&self) -> Method {
        self.state.method.unwrap_or(Method::Other)
    }

    /// Method token as sent by the client
    pub fn method_str(&self) -> &str {
        self.span_str(self.state.method_raw)
    }

    /// Request target as sent by the client
    pub fn target(&self) -> &str {
        self.span_str(self.state.target)
    }

    /// Percent-decoded path of the target, without the query
    pub fn path(&self) -> &str {
        self.span_str(self.state.path)
    }

    /// Protocol version of the request
    pub fn version(&self) -> Version {
        self.state.version.unwrap_or(Version::H1_1)
    }

    /// First header with `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_bytes(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// First header with `name`, as raw bytes. Values may contain obs-text.
    pub fn header_bytes(&self, name: &str) -> Option<&[u8]> {
        self.state.find(self.pool, FieldKind::Header, name)
    }

    /// All fields of `kind` in the order they were received.
    pub fn fields(&self, kind: FieldKind) -> impl Iterator<Item = (&str, Option<&str>)> + '_ {
        self.state
            .fields
            .iter()
            .filter(move |f| f.kind == kind)
            .filter_map(move |f| {
                let name = self.pool.str(f.name)?;
                let value = match f.value {
                    Some(v) => Some(self.pool.str(v)?),
                    None => None,
                };
                Some((name, value))
            })
    }

    /// Decoded query argument. Arguments without `=` have an empty value.
    pub fn get_argument(&self, name: &str) -> Option<&str> {
        self.field_str(FieldKind::GetArgument, name)
    }

    /// Cookie value.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.field_str(FieldKind::Cookie, name)
    }

    /// Trailer field of a chunked upload.
    pub fn footer(&self, name: &str) -> Option<&str> {
        self.field_str(FieldKind::Footer, name)
    }

    /// Field of a parsed POST body.
    pub fn post_field(&self, name: &str) -> Option<&str> {
        self.field_str(FieldKind::PostData, name)
    }

    /// Size of the request body, if known in advance.
    pub fn content_size(&self) -> Option<u64> {
        self.state.content_size
    }

    /// Address of the client.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.ctx.peer
    }

    /// True if the request arrived over TLS.
    pub fn is_tls(&self) -> bool {
        self.ctx.is_tls
    }

    /// True when the daemon is shutting down. The upload callback sees this on its final call.
    pub fn is_terminating(&self) -> bool {
        self.state.terminating || self.ctx.shared.stopping.load(Ordering::Acquire)
    }

    /// Overrides the daemon's idle timeout for this connection. `None` disables the timeout.
    pub fn set_connection_timeout(&mut self, timeout: Option<Duration>) {
        *self.timeout = timeout;
    }

    /// Handle to resume the request after it was suspended.
    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            token: self.ctx.token,
            id: self.ctx.id,
            waker: self.ctx.loop_handle.clone(),
        }
    }

    /// Credentials of the `Basic` scheme.
    ///
    /// Fails with [`Error::AuthAbsent`] if there are none, [`Error::ReqAuthDataBroken`] if they
    /// cannot be decoded, and [`Error::ConnectionPoolNoMemAuthData`] if the pool is exhausted.
    pub fn basic_auth(&mut self) -> Result<BasicCredentials<'_>> {
        if self.state.basic.is_none() {
            let value = self.header_bytes("Authorization").map(<[u8]>::to_vec);
            self.state.basic = Some(basic::decode(value.as_deref(), self.pool)?);
        }
        match &self.state.basic {
            Some(spans) => spans.resolve(self.pool),
            None => Err(Error::AuthAbsent),
        }
    }

    /// Parameters of the `Digest` scheme.
    pub fn digest_auth_params(&mut self) -> Result<&DigestParams> {
        if self.state.digest.is_none() {
            let params = digest::parse(self.header_bytes("Authorization"))?;
            self.state.digest = Some(params);
        }
        self.state.digest.as_ref().ok_or(Error::AuthAbsent)
    }

    /// Checks `Digest` credentials for a user whose password is known.
    ///
    /// Responses using `MD5` cannot be verified and fail with
    /// [`Error::AuthDigestAlgoNotSupported`].
    pub fn check_digest_auth(
        &mut self,
        realm: &str,
        username: &str,
        password: &str,
    ) -> Result<DigestCheck> {
        self.digest_auth_params()?;
        let shared = &self.ctx.shared;
        let method = self.span_str(self.state.method_raw);
        let target = self.span_str(self.state.target);
        let request = DigestRequest {
            method,
            target,
            bind_key: shared.nonces.bind_key(
                method.as_bytes(),
                target.as_bytes(),
                self.ctx.peer.map(|p| p.ip()),
            ),
        };
        match &self.state.digest {
            Some(params) => digest::check(params, request, &shared.nonces, realm, username, password),
            None => Err(Error::AuthAbsent),
        }
    }

    fn take_action(&mut self) -> bool {
        !std::mem::replace(&mut self.state.action_taken, true)
    }

    /// Replies with `response`. `None` is accepted so that a failed factory call can be passed
    /// straight through; the result is then `None` as well.
    pub fn action_from_response(&mut self, response: Option<Response>) -> Option<Action> {
        let response = response?;
        self.take_action().then(|| Action {
            kind: ActionKind::Response(response),
        })
    }

    /// Suspends the request until [`RequestHandle::resume`] is called.
    pub fn action_suspend(&mut self) -> Option<Action> {
        self.take_action().then(|| Action {
            kind: ActionKind::Suspend,
        })
    }

    /// Receives the request body.
    ///
    /// `full` is called once with the whole body when it fits in `large_buffer_size`;
    /// otherwise `incremental` is called with each piece as it arrives. At least one callback
    /// must be given.
    pub fn action_upload(
        &mut self,
        large_buffer_size: usize,
        full: Option<UploadCallback>,
        incremental: Option<UploadCallback>,
    ) -> Option<Action> {
        if full.is_none() && incremental.is_none() {
            return None;
        }
        self.take_action().then(|| Action {
            kind: ActionKind::Upload {
                large_buffer_size,
                full,
                incremental,
            },
        })
    }

    /// Parses an `application/x-www-form-urlencoded` body of at most `max_size` bytes into POST
    /// fields, then calls `done`.
    pub fn action_post_parse(&mut self, max_size: usize, done: PostDoneCallback) -> Option<Action> {
        self.take_action().then(|| Action {
            kind: ActionKind::PostParse { max_size, done },
        })
    }

    /// Switches the connection to `protocol`. `headers` are added to the `101` reply.
    pub fn action_upgrade(
        &mut self,
        protocol: &str,
        headers: &[(&str, &str)],
        handler: UpgradeHandler,
    ) -> Option<Action> {
        let valid = |s: &str| !s.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0);
        if protocol.is_empty()
            || !valid(protocol)
            || !headers.iter().all(|(n, v)| !n.is_empty() && valid(n) && valid(v))
        {
            return None;
        }
        self.take_action().then(|| Action {
            kind: ActionKind::Upgrade {
                protocol: protocol.to_string(),
                headers: headers
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect(),
                handler,
            },
        })
    }

    /// Keeps receiving the upload.
    pub fn upload_action_continue(&mut self) -> Option<UploadAction> {
        self.take_upload_action(UploadActionKind::Continue)
    }

    /// Suspends the upload until [`RequestHandle::resume`] is called.
    pub fn upload_action_suspend(&mut self) -> Option<UploadAction> {
        self.take_upload_action(UploadActionKind::Suspend)
    }

    /// Replies with `response`; the rest of the upload is discarded.
    pub fn upload_action_from_response(&mut self, response: Option<Response>) -> Option<UploadAction> {
        let response = response?;
        self.take_upload_action(UploadActionKind::Response(response))
    }

    /// Aborts the request and closes the connection.
    pub fn upload_action_abort(&mut self) -> Option<UploadAction> {
        self.take_upload_action(UploadActionKind::Abort)
    }

    fn take_upload_action(&mut self, kind: UploadActionKind) -> Option<UploadAction> {
        self.take_action().then_some(UploadAction { kind })
    }

    fn field_str(&self, kind: FieldKind, name: &str) -> Option<&str> {
        self.state
            .find(self.pool, kind, name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    fn span_str(&self, span: Option<Span>) -> &str {
        span.and_then(|s| self.pool.str(s)).unwrap_or("")
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method_str())
            .field("target", &self.target())
            .field("version", &self.version())
            .field("peer", &self.ctx.peer)
            .finish()
    }
}

/// Decodes `%XX` escapes. Malformed escapes are kept as they are.
pub(crate) fn percent_decode(input: &[u8], plus_as_space: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'%' if i + 2 < input.len() => {
                match (hex_val(input[i + 1]), hex_val(input[i + 2])) {
                    (Some(h), Some(l)) => {
                        out.push(h << 4 | l);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' if plus_as_space => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Splits `a=1&b&c=%20` into fields of `kind`. Returns `false` when the pool is exhausted.
pub(crate) fn parse_urlencoded(
    state: &mut RequestState,
    pool: &mut MemoryPool,
    kind: FieldKind,
    input: &[u8],
    plus_as_space: bool,
) -> bool {
    for pair in input.split(|&b| b == b'&').filter(|p| !p.is_empty()) {
        let (name, value) = match pair.iter().position(|&b| b == b'=') {
            Some(eq) => (&pair[..eq], Some(&pair[eq + 1..])),
            None => (pair, None),
        };
        let name = percent_decode(name, plus_as_space);
        let value = value.map(|v| percent_decode(v, plus_as_space));
        if !state.push_field(pool, kind, &name, value.as_deref()) {
            return false;
        }
    }
    true
}

/// Parses `Cookie: a=1; b="2"` into cookie fields. Entries without `=` are ignored. Returns
/// `false` when the pool is exhausted.
pub(crate) fn parse_cookies(state: &mut RequestState, pool: &mut MemoryPool, header: &[u8]) -> bool {
    for entry in header.split(|&b| b == b';') {
        let entry = crate::parser::h1::trim_ows(entry);
        let Some(eq) = entry.iter().position(|&b| b == b'=') else {
            continue;
        };
        let name = crate::parser::h1::trim_ows(&entry[..eq]);
        if name.is_empty() {
            continue;
        }
        let mut value = crate::parser::h1::trim_ows(&entry[eq + 1..]);
        if value.len() >= 2 && value[0] == b'"' && value[value.len() - 1] == b'"' {
            value = &value[1..value.len() - 1];
        }
        if !state.push_field(pool, FieldKind::Cookie, name, Some(value)) {
            return false;
        }
    }
    true
}
