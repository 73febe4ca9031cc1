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

//! What the application wants done with a request
//!
//! Actions are created through methods of [`Request`], which makes sure a callback produces at
//! most one of them. Returning `None` from a callback closes the connection.

use std::fmt;

use crate::net::UpgradedIo;
use crate::request::Request;
use crate::response::Response;

/// Called with each piece of an uploaded body, or once with the whole body. A final call with an
/// empty slice marks the end of an incremental upload.
pub type UploadCallback =
    Box<dyn FnMut(&mut Request<'_>, &[u8]) -> Option<UploadAction> + Send>;

/// Called once the POST body has been parsed into fields.
pub type PostDoneCallback =
    Box<dyn FnMut(&mut Request<'_>, PostParseResult) -> Option<Action> + Send>;

/// Takes over the connection after `101 Switching Protocols` was sent.
pub type UpgradeHandler = Box<dyn FnOnce(UpgradedConnection) + Send>;

/// Outcome of parsing a POST body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostParseResult {
    /// All fields were parsed.
    Ok,
    /// The body or its fields did not fit into the memory available.
    NoMemory,
    /// The body uses a content type that cannot be parsed.
    UnsupportedEncoding,
    /// The body is not valid for its content type.
    Broken,
}

/// Next step for a request.
pub struct Action {
    pub(crate) kind: ActionKind,
}

pub(crate) enum ActionKind {
    Suspend,
    Response(Response),
    Upload {
        large_buffer_size: usize,
        full: Option<UploadCallback>,
        incremental: Option<UploadCallback>,
    },
    PostParse {
        max_size: usize,
        done: PostDoneCallback,
    },
    Upgrade {
        protocol: String,
        headers: Vec<(String, String)>,
        handler: UpgradeHandler,
    },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ActionKind::Suspend => f.write_str("Action::Suspend"),
            ActionKind::Response(r) => f.debug_tuple("Action::Response").field(r).finish(),
            ActionKind::Upload {
                large_buffer_size,
                full,
                incremental,
            } => f
                .debug_struct("Action::Upload")
                .field("large_buffer_size", large_buffer_size)
                .field("full", &full.is_some())
                .field("incremental", &incremental.is_some())
                .finish(),
            ActionKind::PostParse { max_size, .. } => f
                .debug_struct("Action::PostParse")
                .field("max_size", max_size)
                .finish(),
            ActionKind::Upgrade { protocol, .. } => f
                .debug_struct("Action::Upgrade")
                .field("protocol", protocol)
                .finish(),
        }
    }
}

/// Next step while receiving an upload.
pub struct UploadAction {
    pub(crate) kind: UploadActionKind,
}

#[derive(Debug)]
pub(crate) enum UploadActionKind {
    Continue,
    Suspend,
    Response(Response),
    Abort,
}

impl fmt::Debug for UploadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadAction::{:?}", self.kind)
    }
}

/// A connection after a protocol upgrade. The stream is blocking.
pub struct UpgradedConnection {
    io: Box<dyn UpgradedIo>,
    extra: Vec<u8>,
}

impl UpgradedConnection {
    pub(crate) fn new(io: Box<dyn UpgradedIo>, extra: Vec<u8>) -> Self {
        UpgradedConnection { io, extra }
    }

    /// Bytes the client sent after the request head that were already read by the server.
    pub fn extra_data(&self) -> &[u8] {
        &self.extra
    }

    /// The raw stream.
    pub fn io(&mut self) -> &mut dyn UpgradedIo {
        self.io.as_mut()
    }

    /// Splits into the stream and the already-read bytes.
    pub fn into_parts(self) -> (Box<dyn UpgradedIo>, Vec<u8>) {
        (self.io, self.extra)
    }
}

impl fmt::Debug for UpgradedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradedConnection")
            .field("io", &self.io)
            .field("extra", &self.extra.len())
            .finish()
    }
}
