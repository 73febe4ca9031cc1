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

//! H1 parser implementation

use super::{raw_request::RawRequest, ParseError, ParseResult, StrictLevel};

pub mod chunked;
pub mod request;
pub mod response;
pub mod tokens;

/// Position of one line inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line {
    /// End of the line content, excluding the terminator.
    pub end: usize,
    /// Start of the next line.
    pub next: usize,
}

/// Locates the end of the first line in `buf`.
///
/// Lines end with `CRLF`. A bare `LF` is tolerated at strict level 0 and below. Returns `None` if
/// no terminator is present yet.
#[inline]
pub fn find_line(buf: &[u8], strict: StrictLevel) -> ParseResult<Option<Line>> {
    let Some(lf) = buf.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };

    if lf > 0 && buf[lf - 1] == b'\r' {
        Ok(Some(Line {
            end: lf - 1,
            next: lf + 1,
        }))
    } else if strict.at_most(0) {
        Ok(Some(Line {
            end: lf,
            next: lf + 1,
        }))
    } else {
        Err(ParseError::NewLine)
    }
}

/// Consumes whitespace characters from `buf`.
/// Whitespace is defined by RFC 9110 Secion 5.6.3 by ABNF
/// ```abnf
/// OWS = *( SP / HTAB )
/// ```
#[inline]
pub fn discard_whitespace(buf: &mut RawRequest<'_>) -> usize {
    buf.skip_while(tokens::is_ows)
}

/// Consumes the separator between request-line elements. Strict parsing demands exactly one `SP`;
/// at level -1 and below any run of `SP` and `HTAB` is accepted.
#[inline]
pub fn discard_required_whitespace(
    buf: &mut RawRequest<'_>,
    strict: StrictLevel,
) -> ParseResult<()> {
    if strict.at_most(-1) {
        if discard_whitespace(buf) == 0 {
            return Err(ParseError::Whitespace);
        }
        return Ok(());
    }

    if buf.peek() != Some(b' ') {
        return Err(ParseError::Whitespace);
    }
    buf.advance(1);
    if matches!(buf.peek(), Some(b' ') | Some(b'\t')) {
        return Err(ParseError::Whitespace);
    }

    Ok(())
}

/// Strips leading and trailing `OWS`.
#[inline]
pub fn trim_ows(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|&b| !tokens::is_ows(b))
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|&b| !tokens::is_ows(b))
        .map_or(start, |p| p + 1);
    &value[start..end]
}
