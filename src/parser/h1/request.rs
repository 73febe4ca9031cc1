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

//! HTTP/1.1 Request
//!
//! The functions here work on whatever prefix of the request has been received so far. Each
//! returns how many bytes it consumed so the caller can advance its read buffer, and none of them
//! keeps state between calls.

use std::borrow::Cow;
use std::fmt::Display;

use super::tokens::{
    is_field_value_byte, is_lenient_field_name_byte, is_ows, is_request_target_token, is_tchar,
};
use super::{discard_required_whitespace, find_line, trim_ows};
use crate::parser::raw_request::RawRequest;
use crate::parser::{Method, ParseError, ParseResult, Status, StrictLevel, Version};

/// Request line of an HTTP/1.x request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine<'buf> {
    /// Classified method
    pub method: Method,
    /// Method token as received
    pub method_raw: &'buf [u8],
    /// Request target, unmodified
    pub target: &'buf [u8],
    /// Protocol version
    pub version: Version,
}

/// One parsed header section line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderLine<'buf> {
    /// A field. The value has surrounding whitespace removed; it is only copied when folded lines
    /// were joined or bare CRs replaced.
    Field {
        /// Field name
        name: &'buf [u8],
        /// Field value
        value: Cow<'buf, [u8]>,
    },
    /// The empty line ending the header section.
    End,
    /// A malformed line that was tolerated and ignored.
    Skipped,
}

/// Consumes empty lines that precede the request line. `skipped` carries the number of empty
/// lines seen in earlier calls for the same request.
pub fn skip_empty_lines(buf: &[u8], strict: StrictLevel, skipped: &mut u32) -> ParseResult<usize> {
    let mut pos = 0;
    loop {
        let rest = &buf[pos..];
        let len = if rest.starts_with(b"\r\n") {
            2
        } else if rest.first() == Some(&b'\n') && strict.at_most(0) {
            1
        } else {
            return Ok(pos);
        };

        *skipped += 1;
        let allowed = match strict.get() {
            i8::MIN..=0 => u32::MAX,
            1 => 1,
            _ => 0,
        };
        if *skipped > allowed {
            return Err(ParseError::EmptyLines);
        }
        pos += len;
    }
}

/// Parses the request line.
///
/// # Example
/// ```
/// # use hearth::parser::{Method, Status, StrictLevel, Version};
/// # use hearth::parser::h1::request::parse_request_line;
/// let Status::Complete((line, consumed)) =
///     parse_request_line(b"GET /index.html HTTP/1.1\r\nHost: a\r\n", StrictLevel::DEFAULT)
///         .unwrap()
/// else {
///     panic!("incomplete");
/// };
/// assert_eq!(Method::Get, line.method);
/// assert_eq!(b"/index.html", line.target);
/// assert_eq!(Version::H1_1, line.version);
/// assert_eq!(26, consumed);
/// ```
pub fn parse_request_line(
    buf: &[u8],
    strict: StrictLevel,
) -> ParseResult<Status<(RequestLine<'_>, usize)>> {
    let Some(line) = find_line(buf, strict)? else {
        return Ok(Status::Partial);
    };

    let mut req = RawRequest::new(&buf[..line.end]);
    let method_raw = req
        .take_until(|b| !is_tchar(b))
        .ok_or(ParseError::Method)?;
    let method = Method::from_token(method_raw).ok_or(ParseError::Method)?;
    discard_required_whitespace(&mut req, strict)?;

    let target = req
        .take_until(|b| !is_request_target_token(b))
        .ok_or(ParseError::Version)?;
    if target.is_empty() {
        return Err(ParseError::Target);
    }
    discard_required_whitespace(&mut req, strict)?;

    let mut version_raw = req.take_rest();
    if strict.at_most(-1) {
        version_raw = trim_ows(version_raw);
    }
    let version = Version::parse(version_raw, strict)?;

    Ok(Status::Complete((
        RequestLine {
            method,
            method_raw,
            target,
            version,
        },
        line.next,
    )))
}

/// Parses one line of a header or trailer section, including any obs-fold continuation lines.
pub fn parse_header_line(
    buf: &[u8],
    strict: StrictLevel,
) -> ParseResult<Status<(HeaderLine<'_>, usize)>> {
    let Some(line) = find_line(buf, strict)? else {
        return Ok(Status::Partial);
    };

    if line.end == 0 {
        return Ok(Status::Complete((HeaderLine::End, line.next)));
    }

    let content = &buf[..line.end];
    if is_ows(content[0]) {
        // continuation without a field to continue
        return if strict.at_most(-3) {
            Ok(Status::Complete((HeaderLine::Skipped, line.next)))
        } else {
            Err(ParseError::ObsFold)
        };
    }

    let Some(colon) = content.iter().position(|&b| b == b':') else {
        return if strict.at_most(-3) {
            Ok(Status::Complete((HeaderLine::Skipped, line.next)))
        } else {
            Err(ParseError::MissingColon)
        };
    };

    let mut name = &content[..colon];
    if name.last().copied().is_some_and(is_ows) {
        if !strict.at_most(-1) {
            return Err(ParseError::HeaderName);
        }
        name = trim_ows(name);
    }
    validate_name(name, strict)?;

    // A folded value continues on lines starting with whitespace; the first byte after the line
    // must be seen before the field is complete.
    let mut consumed = line.next;
    let mut folded: Option<Vec<u8>> = None;
    loop {
        match buf.get(consumed) {
            None => return Ok(Status::Partial),
            Some(&b) if is_ows(b) => {
                if !strict.at_most(-2) {
                    return Err(ParseError::ObsFold);
                }
                let Some(next) = find_line(&buf[consumed..], strict)? else {
                    return Ok(Status::Partial);
                };
                let value = folded.get_or_insert_with(|| trim_ows(&content[colon + 1..]).to_vec());
                let more = trim_ows(&buf[consumed..consumed + next.end]);
                if !more.is_empty() {
                    if !value.is_empty() {
                        value.push(b' ');
                    }
                    value.extend_from_slice(more);
                }
                consumed += next.next;
            }
            Some(_) => break,
        }
    }

    let value = match folded {
        Some(v) => Cow::Owned(v),
        None => Cow::Borrowed(trim_ows(&content[colon + 1..])),
    };
    let value = validate_value(value, strict)?;

    Ok(Status::Complete((HeaderLine::Field { name, value }, consumed)))
}

fn validate_name(name: &[u8], strict: StrictLevel) -> ParseResult<()> {
    if name.is_empty() {
        return Err(ParseError::HeaderName);
    }
    if name.iter().all(|&b| is_tchar(b)) {
        return Ok(());
    }
    if strict.at_most(2) && name.iter().all(|&b| is_lenient_field_name_byte(b)) {
        return Ok(());
    }

    Err(ParseError::HeaderName)
}

fn validate_value(value: Cow<'_, [u8]>, strict: StrictLevel) -> ParseResult<Cow<'_, [u8]>> {
    if value.is_empty() && !strict.at_most(1) {
        return Err(ParseError::HeaderValue);
    }

    if value.iter().all(|&b| is_field_value_byte(b)) {
        return Ok(value);
    }

    if !strict.at_most(-3) {
        return Err(ParseError::HeaderValue);
    }

    let mut owned = value.into_owned();
    for b in owned.iter_mut() {
        if *b == b'\r' {
            *b = b' ';
        } else if !is_field_value_byte(*b) {
            return Err(ParseError::HeaderValue);
        }
    }
    Ok(Cow::Owned(owned))
}

/// A request header
#[derive(Debug, PartialEq, Eq)]
pub struct Header<'buf> {
    /// Header name
    pub name: &'buf [u8],
    /// Header value
    pub value: Cow<'buf, [u8]>,
}

/// Parsed H1 Request head
/// IETF RFC 9112
///
/// Convenience wrapper over [`parse_request_line`] and [`parse_header_line`] for a head that is
/// entirely in memory.
#[derive(Debug, Default)]
pub struct H1Request<'buf> {
    /// method
    pub method: Option<Method>,
    /// target
    pub target: Option<&'buf [u8]>,
    /// version
    pub version: Option<Version>,
    /// headers
    pub headers: Vec<Header<'buf>>,
    strict: StrictLevel,
}

impl<'b> H1Request<'b> {
    /// Creates an empty request parsed at the default strict level
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty request parsed at `strict`
    pub fn with_strict_level(strict: StrictLevel) -> Self {
        H1Request {
            strict,
            ..Self::default()
        }
    }

    /// Parses a request head, returning the number of bytes consumed.
    ///
    /// # Example
    /// ```
    /// # use hearth::parser::{Method, Status, Version, ParseError};
    /// # use hearth::parser::h1::request::H1Request;
    /// # fn main() -> Result<(), ParseError> {
    /// let mut req = H1Request::new();
    /// let status = req.parse(b"GET / HTTP/1.1\r\nHost:www.example.org\r\n\r\n")?;
    /// assert_eq!(Status::Complete(40), status);
    /// assert_eq!(Some(Method::Get), req.method);
    /// assert_eq!(Some(b"/" as &[u8]), req.target);
    /// assert_eq!(Some(Version::H1_1), req.version);
    /// assert_eq!(b"www.example.org", &*req.headers[0].value);
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(&mut self, buf: &'b [u8]) -> ParseResult<Status<usize>> {
        let mut skipped = 0;
        let mut pos = skip_empty_lines(buf, self.strict, &mut skipped)?;

        let (line, consumed) = match parse_request_line(&buf[pos..], self.strict)? {
            Status::Complete(v) => v,
            Status::Partial => return Ok(Status::Partial),
        };
        self.method = Some(line.method);
        self.target = Some(line.target);
        self.version = Some(line.version);
        pos += consumed;

        loop {
            match parse_header_line(&buf[pos..], self.strict)? {
                Status::Partial => return Ok(Status::Partial),
                Status::Complete((HeaderLine::End, consumed)) => {
                    return Ok(Status::Complete(pos + consumed))
                }
                Status::Complete((HeaderLine::Skipped, consumed)) => pos += consumed,
                Status::Complete((HeaderLine::Field { name, value }, consumed)) => {
                    self.headers.push(Header { name, value });
                    pos += consumed;
                }
            }
        }
    }

    /// Finds the first header called `name`, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
            .map(|h| &*h.value)
    }
}

impl Display for H1Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{} {} {}\r\n",
            self.method.as_ref().unwrap_or(&Method::Get),
            String::from_utf8_lossy(self.target.unwrap_or(b"")),
            self.version.as_ref().unwrap_or(&Version::H1_0)
        ))?;

        for header in self.headers.iter() {
            f.write_fmt(format_args!(
                "{}: {}\r\n",
                String::from_utf8_lossy(header.name),
                String::from_utf8_lossy(&header.value)
            ))?;
        }

        f.write_str("\r\n")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser::StrictHow;
    use fake::Fake;

    fn level(l: i8) -> StrictLevel {
        StrictLevel::new(l, StrictHow::Exact).unwrap()
    }

    fn complete<T>(s: Status<T>) -> T {
        match s {
            Status::Complete(t) => t,
            Status::Partial => panic!("expected a complete element"),
        }
    }

    #[test]
    fn request_line_basic() {
        let (line, consumed) =
            complete(parse_request_line(b"POST /a?b=c HTTP/1.0\r\n", level(0)).unwrap());
        assert_eq!(Method::Post, line.method);
        assert_eq!(b"/a?b=c", line.target);
        assert_eq!(Version::H1_0, line.version);
        assert_eq!(22, consumed);
    }

    #[test]
    fn request_line_other_method_keeps_token() {
        let (line, _) = complete(parse_request_line(b"PROPFIND / HTTP/1.1\r\n", level(0)).unwrap());
        assert_eq!(Method::Other, line.method);
        assert_eq!(b"PROPFIND", line.method_raw);
    }

    #[test]
    fn request_line_partial() {
        assert_eq!(
            Status::Partial,
            parse_request_line(b"GET / HTTP/1.1", level(0)).unwrap()
        );
    }

    #[test]
    fn request_line_tab_separator_depends_on_level() {
        let buf = b"GET\t/ HTTP/1.1\r\n";
        assert_eq!(Err(ParseError::Whitespace), parse_request_line(buf, level(0)));
        assert!(parse_request_line(buf, level(-1)).is_ok());

        let buf = b"GET  /  HTTP/1.1\r\n";
        assert_eq!(Err(ParseError::Whitespace), parse_request_line(buf, level(0)));
        let (line, _) = complete(parse_request_line(buf, level(-1)).unwrap());
        assert_eq!(b"/", line.target);
    }

    #[test]
    fn request_line_http_0_9_is_rejected() {
        assert!(parse_request_line(b"GET /\r\n", level(0)).is_err());
    }

    #[test]
    fn request_line_unsupported_version() {
        let err = parse_request_line(b"GET / HTTP/2.0\r\n", level(0)).unwrap_err();
        assert_eq!(ParseError::VersionNotSupported, err);
        assert_eq!(505, err.status().as_u16());
    }

    #[test]
    fn empty_lines_before_request() {
        let mut skipped = 0;
        assert_eq!(Ok(6), skip_empty_lines(b"\r\n\r\n\r\nGET", level(0), &mut skipped));
        assert_eq!(3, skipped);

        let mut skipped = 0;
        assert_eq!(Ok(2), skip_empty_lines(b"\r\nGET", level(1), &mut skipped));
        let mut skipped = 0;
        assert_eq!(
            Err(ParseError::EmptyLines),
            skip_empty_lines(b"\r\n\r\nGET", level(1), &mut skipped)
        );
        let mut skipped = 0;
        assert_eq!(
            Err(ParseError::EmptyLines),
            skip_empty_lines(b"\r\nGET", level(2), &mut skipped)
        );
    }

    #[test]
    fn empty_lines_split_cr() {
        let mut skipped = 0;
        assert_eq!(Ok(0), skip_empty_lines(b"\r", level(0), &mut skipped));
        assert_eq!(0, skipped);
    }

    #[test]
    fn header_line_trims_ows() {
        let (line, consumed) =
            complete(parse_header_line(b"Host: \t example.org \r\n\r\n", level(0)).unwrap());
        assert_eq!(
            HeaderLine::Field {
                name: b"Host",
                value: Cow::Borrowed(b"example.org")
            },
            line
        );
        assert_eq!(22, consumed);
    }

    #[test]
    fn header_line_needs_next_byte_for_folding() {
        assert_eq!(
            Status::Partial,
            parse_header_line(b"Host: a\r\n", level(0)).unwrap()
        );
    }

    #[test]
    fn header_line_end() {
        assert_eq!(
            Status::Complete((HeaderLine::End, 2)),
            parse_header_line(b"\r\n", level(0)).unwrap()
        );
    }

    #[test]
    fn header_line_obs_fold() {
        let buf = b"X-A: one\r\n  two\r\n\tthree\r\n\r\n";
        assert_eq!(Err(ParseError::ObsFold), parse_header_line(buf, level(-1)));

        let (line, consumed) = complete(parse_header_line(buf, level(-2)).unwrap());
        assert_eq!(
            HeaderLine::Field {
                name: b"X-A",
                value: Cow::Owned(b"one two three".to_vec())
            },
            line
        );
        assert_eq!(buf.len() - 2, consumed);
    }

    #[test]
    fn header_line_space_before_colon() {
        let buf = b"Host : a\r\n\r\n";
        assert_eq!(Err(ParseError::HeaderName), parse_header_line(buf, level(0)));
        let (line, _) = complete(parse_header_line(buf, level(-1)).unwrap());
        assert!(matches!(line, HeaderLine::Field { name: b"Host", .. }));
    }

    #[test]
    fn header_line_bare_cr() {
        let buf = b"X: a\rb\r\n\r\n";
        assert_eq!(Err(ParseError::HeaderValue), parse_header_line(buf, level(-2)));
        let (line, _) = complete(parse_header_line(buf, level(-3)).unwrap());
        assert_eq!(
            HeaderLine::Field {
                name: b"X",
                value: Cow::Owned(b"a b".to_vec())
            },
            line
        );
    }

    #[test]
    fn header_line_without_colon() {
        let buf = b"garbage\r\n\r\n";
        assert_eq!(Err(ParseError::MissingColon), parse_header_line(buf, level(0)));
        assert_eq!(
            Status::Complete((HeaderLine::Skipped, 9)),
            parse_header_line(buf, level(-3)).unwrap()
        );
    }

    #[test]
    fn header_line_empty_value() {
        let buf = b"X-Empty:\r\n\r\n";
        assert!(parse_header_line(buf, level(1)).is_ok());
        assert_eq!(Err(ParseError::HeaderValue), parse_header_line(buf, level(2)));
    }

    #[test]
    fn header_line_non_token_name() {
        let buf = b"X(a): b\r\n\r\n";
        assert!(parse_header_line(buf, level(2)).is_ok());
        assert_eq!(Err(ParseError::HeaderName), parse_header_line(buf, level(3)));
    }

    #[test]
    fn header_line_rejects_control_bytes() {
        assert_eq!(
            Err(ParseError::HeaderValue),
            parse_header_line(b"X: a\x00b\r\n\r\n", level(-3))
        );
    }

    #[test]
    fn h1_request_parse() {
        let buf = b"GET /x HTTP/1.1\r\nHost: h\r\nAccept: */*\r\n\r\nbody";
        let mut req = H1Request::new();
        assert_eq!(Ok(Status::Complete(buf.len() - 4)), req.parse(buf));
        assert_eq!(Some(b"h" as &[u8]), req.header("host"));
        assert_eq!(2, req.headers.len());
    }

    #[test]
    fn h1_request_display_reparses_identically() {
        let buf = b"\r\nDELETE  /p HTTP/1.1\r\nHost:  h \r\nX-A: 1\r\n\r\n";
        let mut first = H1Request::with_strict_level(level(-1));
        assert!(first.parse(buf).unwrap().is_complete());

        let printed = first.to_string();
        let mut second = H1Request::new();
        assert!(second.parse(printed.as_bytes()).unwrap().is_complete());
        assert_eq!(first.method, second.method);
        assert_eq!(first.target, second.target);
        assert_eq!(first.headers, second.headers);
    }

    fn random_token(min: usize) -> String {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.~!";
        let len: usize = (min..12).fake();
        (0..len)
            .map(|_| ALPHABET[(0..ALPHABET.len()).fake::<usize>()] as char)
            .collect()
    }

    #[test]
    fn agrees_with_reference_decoder() {
        for _ in 0..200 {
            let mut head = format!("GET /{} HTTP/1.1\r\n", random_token(0));
            let count: usize = (0..8).fake();
            for _ in 0..count {
                head.push_str(&format!(
                    "{}: {}\r\n",
                    random_token(1),
                    random_token(1)
                ));
            }
            head.push_str("\r\n");

            let mut ours = H1Request::new();
            let consumed = complete(ours.parse(head.as_bytes()).unwrap());

            let mut headers = [httparse::EMPTY_HEADER; 16];
            let mut theirs = httparse::Request::new(&mut headers);
            let httparse::Status::Complete(expected) = theirs.parse(head.as_bytes()).unwrap()
            else {
                panic!("reference decoder wants more input");
            };

            assert_eq!(expected, consumed);
            assert_eq!(theirs.path.map(str::as_bytes), ours.target);
            assert_eq!(theirs.headers.len(), ours.headers.len());
            for (t, o) in theirs.headers.iter().zip(ours.headers.iter()) {
                assert_eq!(t.name.as_bytes(), o.name);
                assert_eq!(t.value, &*o.value);
            }
        }
    }

    #[test]
    fn split_anywhere_gives_partial_then_same_result() {
        let buf = b"GET /x HTTP/1.1\r\nHost: h\r\nA: b\r\n c\r\n\r\n";
        let mut whole = H1Request::with_strict_level(level(-2));
        let total = complete(whole.parse(buf).unwrap());

        for cut in 0..total {
            let mut part = H1Request::with_strict_level(level(-2));
            assert_eq!(Ok(Status::Partial), part.parse(&buf[..cut]), "cut at {}", cut);
        }
    }
}
