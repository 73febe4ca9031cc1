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

//! Canned replies for requests the server refuses on its own.

use super::{Content, Head, Response};
use crate::parser::StatusCode;

const BAD_REQUEST: &[u8] =
    b"<html><head><title>Request broken</title></head><body>Your HTTP request is broken.</body></html>";
const CONTENT_TOO_LARGE: &[u8] =
    b"<html><head><title>Request too big</title></head><body>The request body is too large.</body></html>";
const URI_TOO_LONG: &[u8] =
    b"<html><head><title>Request too big</title></head><body>The request URI is too long.</body></html>";
const HEADERS_TOO_LARGE: &[u8] =
    b"<html><head><title>Request too big</title></head><body>The request header fields are too large.</body></html>";
const NOT_IMPLEMENTED: &[u8] =
    b"<html><head><title>Not implemented</title></head><body>The transfer encoding is not supported.</body></html>";
const VERSION_NOT_SUPPORTED: &[u8] =
    b"<html><head><title>Version not supported</title></head><body>The HTTP version is not supported.</body></html>";
const INTERNAL_ERROR: &[u8] =
    b"<html><head><title>Internal server error</title></head><body>Please ask the developer to fix it.</body></html>";
const UNAVAILABLE: &[u8] =
    b"<html><head><title>Service unavailable</title></head><body>The server is busy, try again later.</body></html>";

/// Builds the reply sent for a request error detected by the server. The reply always closes the
/// connection.
pub(crate) fn error_reply(status: StatusCode) -> Response {
    let (status, body, special) = match status.as_u16() {
        413 => (status, CONTENT_TOO_LARGE, None),
        414 => (status, URI_TOO_LONG, None),
        431 => (status, HEADERS_TOO_LARGE, None),
        501 => (status, NOT_IMPLEMENTED, None),
        505 => (status, VERSION_NOT_SUPPORTED, None),
        500 => (status, INTERNAL_ERROR, None),
        503 => (status, UNAVAILABLE, Some("Retry-After: 1")),
        _ => (StatusCode::BAD_REQUEST, BAD_REQUEST, None),
    };

    let mut head = Head {
        special,
        ..Head::default()
    };
    head.flags.int_err_resp = true;
    head.flags.close_forced = true;
    head.headers
        .push(("Content-Type".to_string(), "text/html".to_string()));

    Response::prefrozen(status, Content::Static(body), body.len() as u64, head)
}
