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

//! Connection stages and the vocabulary around them

use std::fmt;

/// Position of a connection in the request/reply cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Stage {
    Init,
    ReqLineReceiving,
    ReqLineReceived,
    ReqHeadersReceiving,
    HeadersReceived,
    HeadersProcessed,
    ContinueSending,
    BodyReceiving,
    BodyReceived,
    FootersReceiving,
    FootersReceived,
    FullReqReceived,
    StartReply,
    HeadersSending,
    HeadersSent,
    NormalBodyUnready,
    NormalBodyReady,
    ChunkedBodyUnready,
    ChunkedBodyReady,
    ChunkedBodySent,
    FootersSending,
    FullReplySent,
    UpgradeHeadersSending,
    Upgraded,
    Closed,
}

impl Stage {
    /// True once reply bytes may have reached the client, after which errors can no longer be
    /// reported with a reply.
    pub(crate) fn reply_committed(&self) -> bool {
        *self >= Stage::HeadersSending
    }

    /// True while parts of the request are still expected from the client.
    pub(crate) fn receiving_request(&self) -> bool {
        *self < Stage::FullReqReceived
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A socket error other than the client closing.
    SocketErr,
    /// The client closed its side of an idle connection.
    RemoteShutdown,
    /// The connection memory pool had no room for the reply.
    NoPoolMemForReply,
    /// The application asked for the connection to be closed.
    AppAborted,
    /// The application used the API incorrectly.
    AppError,
    /// The server reached an inconsistent state.
    IntError,
    /// No activity within the connection timeout.
    TimeoutReached,
    /// The exchange completed and the connection was not kept alive.
    CompletedOk,
    /// Receiving failed.
    ReadError,
    /// An error reply was sent for a broken request.
    WithError,
    /// The client closed the connection in the middle of a request.
    ClientAbort,
    /// The daemon is shutting down.
    DaemonShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::SocketErr => "socket error",
            CloseReason::RemoteShutdown => "remote shutdown",
            CloseReason::NoPoolMemForReply => "no pool memory for reply",
            CloseReason::AppAborted => "aborted by application",
            CloseReason::AppError => "application error",
            CloseReason::IntError => "internal error",
            CloseReason::TimeoutReached => "timeout",
            CloseReason::CompletedOk => "completed",
            CloseReason::ReadError => "read error",
            CloseReason::WithError => "closed after error reply",
            CloseReason::ClientAbort => "client aborted",
            CloseReason::DaemonShutdown => "daemon shutdown",
        })
    }
}

/// Whether the connection can serve another request after the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnReuse {
    KeepalivePossible,
    MustClose,
    MustUpgrade,
}

/// What the connection waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopInfo {
    /// Incoming data
    Recv,
    /// Room to send
    Send,
    /// Nothing; the connection is suspended
    Block,
    /// The connection is finished and must be cleaned up
    Cleanup,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reply_commits_with_headers() {
        assert!(!Stage::StartReply.reply_committed());
        assert!(Stage::HeadersSending.reply_committed());
        assert!(Stage::BodyReceiving.receiving_request());
        assert!(!Stage::FullReqReceived.receiving_request());
    }
}
