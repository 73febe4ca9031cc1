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

//! Parser implementations for HTTP/1.x
//!
//! Every parsing function here is a pure function of the bytes it is given and the configured
//! [`StrictLevel`]. Functions either consume a complete syntactic element
//! ([`Status::Complete`]), ask for more input ([`Status::Partial`]), or fail with a
//! [`ParseError`] that maps onto the HTTP status the server replies with.

pub mod h1;
pub mod method;
pub mod raw_request;
pub mod status;
pub mod version;

pub use method::Method;
pub use status::StatusCode;
pub use version::Version;

/// Outcome of an incremental parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status<T> {
    /// A complete element was parsed.
    Complete(T),
    /// More input is required.
    Partial,
}

impl<T> Status<T> {
    /// True if the element was complete.
    #[inline]
    pub fn is_complete(&self) -> bool {
        matches!(self, Status::Complete(_))
    }

    /// Maps the complete value.
    #[inline]
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Status<U> {
        match self {
            Status::Complete(t) => Status::Complete(f(t)),
            Status::Partial => Status::Partial,
        }
    }
}

/// Represents possible failures while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Invalid byte in method.
    #[error("invalid token in method")]
    Method,
    /// Invalid byte in target.
    #[error("invalid token in target")]
    Target,
    /// Malformed HTTP version.
    #[error("invalid version")]
    Version,
    /// Well-formed but unsupported HTTP version.
    #[error("HTTP version not supported")]
    VersionNotSupported,
    /// Invalid whitespace in the request line.
    #[error("invalid whitespace")]
    Whitespace,
    /// Too many empty lines before the request line.
    #[error("unexpected empty line before request")]
    EmptyLines,
    /// Invalid byte in header name.
    #[error("invalid token in header name")]
    HeaderName,
    /// Invalid byte in header value.
    #[error("invalid token in header value")]
    HeaderValue,
    /// Header line without a colon.
    #[error("header line without colon")]
    MissingColon,
    /// Obsolete line folding is not accepted.
    #[error("obsolete header line folding")]
    ObsFold,
    /// Invalid or missing new line.
    #[error("invalid or missing new line")]
    NewLine,
    /// HTTP/1.1 request without `Host`, or with several.
    #[error("missing or duplicated Host header")]
    Host,
    /// Invalid or conflicting `Content-Length`.
    #[error("invalid Content-Length")]
    ContentLength,
    /// `Content-Length` is larger than can be represented.
    #[error("Content-Length too large")]
    ContentTooLarge,
    /// A transfer coding other than chunked.
    #[error("unsupported Transfer-Encoding")]
    TransferEncoding,
    /// Malformed chunk size line.
    #[error("invalid chunk size")]
    ChunkSize,
    /// Missing CRLF after chunk data.
    #[error("invalid chunk terminator")]
    ChunkTerminator,
    /// A field name that may not be sent as a trailer.
    #[error("forbidden trailer field")]
    ForbiddenTrailer,
}

impl ParseError {
    /// HTTP status sent to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::VersionNotSupported => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            ParseError::ContentTooLarge => StatusCode::CONTENT_TOO_LARGE,
            ParseError::TransferEncoding => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Result alias for parsing functions.
pub type ParseResult<T> = Result<T, ParseError>;

/// How a requested strict level outside the supported range is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictHow {
    /// Refuse levels outside the range.
    #[default]
    Exact,
    /// Clamp to the nearest supported level.
    Nearest,
}

/// Parser tolerance. Negative levels accept historical deviations, zero follows the RFCs, positive
/// levels reject borderline input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct StrictLevel(i8);

impl StrictLevel {
    /// Most lenient level.
    pub const MIN: StrictLevel = StrictLevel(-3);
    /// RFC compliant.
    pub const DEFAULT: StrictLevel = StrictLevel(0);
    /// Most strict level.
    pub const MAX: StrictLevel = StrictLevel(3);

    /// Creates a level, clamping or refusing out-of-range values according to `how`.
    pub fn new(level: i8, how: StrictHow) -> Option<Self> {
        match how {
            StrictHow::Exact if !(Self::MIN.0..=Self::MAX.0).contains(&level) => None,
            _ => Some(StrictLevel(level.clamp(Self::MIN.0, Self::MAX.0))),
        }
    }

    /// The numeric level.
    #[inline]
    pub fn get(&self) -> i8 {
        self.0
    }

    /// True if this level is at most `level`.
    #[inline]
    pub(crate) fn at_most(&self, level: i8) -> bool {
        self.0 <= level
    }

    /// True if this level is at least `level`.
    #[inline]
    pub(crate) fn at_least(&self, level: i8) -> bool {
        self.0 >= level
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strict_level_exact_refuses_out_of_range() {
        assert_eq!(None, StrictLevel::new(4, StrictHow::Exact));
        assert_eq!(Some(StrictLevel(-3)), StrictLevel::new(-3, StrictHow::Exact));
    }

    #[test]
    fn strict_level_nearest_clamps() {
        assert_eq!(Some(StrictLevel::MAX), StrictLevel::new(9, StrictHow::Nearest));
        assert_eq!(Some(StrictLevel::MIN), StrictLevel::new(-9, StrictHow::Nearest));
    }

    #[test]
    fn parse_errors_map_to_reply_status() {
        assert_eq!(StatusCode::BAD_REQUEST, ParseError::ContentLength.status());
        assert_eq!(
            StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            ParseError::VersionNotSupported.status()
        );
        assert_eq!(StatusCode::NOT_IMPLEMENTED, ParseError::TransferEncoding.status());
    }
}
