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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! Embeddable HTTP/1.1 server core
//!
//! A [`Daemon`] accepts TCP (optionally TLS) connections and drives each through a
//! non-blocking state machine: the request line and headers are parsed into a per-connection
//! memory pool, the application is called with a [`Request`] and answers with an [`Action`],
//! and the chosen [`Response`] is written back with the framing HTTP/1.1 requires. Request
//! bodies can be streamed to the application, buffered, or parsed as form data; replies can come
//! from memory, files, pipes or callbacks.
//!
//! Logging goes through the [`log`] facade; no logger is installed by the library.

pub mod action;
pub mod auth;
mod connection;
pub mod daemon;
mod date;
pub mod error;
mod mem;
pub mod net;
pub mod panic;
pub mod parser;
pub mod request;
pub mod response;

pub use action::{Action, PostParseResult, UpgradedConnection, UploadAction};
pub use auth::{BasicCredentials, DigestAlgorithm, DigestCheck, DigestParams, NonceBindType};
pub use connection::CloseReason;
pub use daemon::{
    ConnectionNotice, Daemon, DaemonBuilder, DaemonInfo, DaemonOption, EventToken, InfoType,
    WatchFor, WorkMode,
};
pub use error::{Error, Result};
pub use parser::{Method, StatusCode, StrictHow, Version};
pub use request::{FieldKind, Request, RequestHandle};
pub use response::{DigestChallenge, DynamicContentAction, Response, ResponseOption};
