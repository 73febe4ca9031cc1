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

//! HTTP/1.1 Response head

use std::borrow::Cow;
use std::io::Write;

use crate::parser::StatusCode;

/// Protocol token sent at the start of the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyVersion {
    /// `HTTP/1.1`
    #[default]
    H1_1,
    /// `HTTP/1.0`
    H1_0,
    /// `ICY`, for SHOUTcast clients
    Icy,
}

impl ReplyVersion {
    fn as_bytes(&self) -> &'static [u8] {
        match self {
            ReplyVersion::H1_1 => b"HTTP/1.1",
            ReplyVersion::H1_0 => b"HTTP/1.0",
            ReplyVersion::Icy => b"ICY",
        }
    }
}

/// How the end of the reply body is signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body headers.
    None,
    /// `Content-Length`
    ContentLength(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
}

/// Everything that goes into a reply head, in the order it is written.
#[derive(Debug, Clone)]
pub struct ReplyHead<'a> {
    /// Status line protocol
    pub version: ReplyVersion,
    /// Status code
    pub status: StatusCode,
    /// Value of the `Connection` header, written first
    pub connection: Option<&'a str>,
    /// Application headers in insertion order
    pub headers: Vec<(&'a str, Cow<'a, str>)>,
    /// Formatted date for the `Date` header
    pub date: Option<&'a str>,
    /// Body framing
    pub framing: Framing,
    /// Additional header line for internal error replies, without line terminator
    pub special: Option<&'a str>,
}

impl<'a> ReplyHead<'a> {
    /// Creates a head with only a status line.
    pub fn new(version: ReplyVersion, status: StatusCode) -> Self {
        ReplyHead {
            version,
            status,
            connection: None,
            headers: Vec::new(),
            date: None,
            framing: Framing::None,
            special: None,
        }
    }

    /// Serializes the head, including the empty line that ends it.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_status_line(out, self.version, self.status);
        if let Some(connection) = self.connection {
            write_header(out, "Connection", connection);
        }
        for (name, value) in &self.headers {
            write_header(out, name, value);
        }
        if let Some(date) = self.date {
            write_header(out, "Date", date);
        }
        match self.framing {
            Framing::None => {}
            Framing::ContentLength(len) => {
                // writing to a Vec cannot fail
                let _ = write!(out, "Content-Length: {}\r\n", len);
            }
            Framing::Chunked => write_header(out, "Transfer-Encoding", "chunked"),
        }
        if let Some(special) = self.special {
            out.extend_from_slice(special.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// Writes `version SP code SP reason CRLF`.
pub fn write_status_line(out: &mut Vec<u8>, version: ReplyVersion, status: StatusCode) {
    out.extend_from_slice(version.as_bytes());
    let _ = write!(out, " {:03} {}\r\n", status.as_u16(), status.reason_phrase());
}

/// Writes `name: value CRLF`.
#[inline]
pub fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// The fixed interim reply to `Expect: 100-continue`.
pub const CONTINUE_REPLY: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
