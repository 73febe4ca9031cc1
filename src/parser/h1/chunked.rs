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

//! Chunked transfer coding, RFC 9112 Section 7.1

use super::find_line;
use crate::parser::{ParseError, ParseResult, Status, StrictLevel};

/// Largest chunk emitted by [`ChunkEncoder`].
pub const MAX_CHUNK_SIZE: usize = 0x00FF_FFFF;

/// Bytes reserved in front of a chunk: six hex digits and CRLF.
pub const CHUNK_PREFIX_RESERVE: usize = 8;

/// Bytes following every chunk.
pub const CHUNK_SUFFIX: &[u8] = b"\r\n";

/// Last chunk with an empty trailer section.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

const MAX_SIZE_DIGITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Size,
    Data(u64),
    DataEnd,
    Done,
}

/// Output of a single [`ChunkedDecoder::decode`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// Payload bytes at `start..start + len` of the input.
    Data {
        /// Offset in the input
        start: usize,
        /// Number of payload bytes
        len: usize,
    },
    /// Framing was consumed, no payload produced.
    Framing,
    /// The last chunk was read. Trailer fields follow.
    End,
}

/// Incremental decoder for a chunked request body.
#[derive(Debug, Default, Clone)]
pub struct ChunkedDecoder {
    state: State,
    received: u64,
}

impl ChunkedDecoder {
    /// Creates a decoder expecting a chunk-size line
    pub fn new() -> Self {
        Self::default()
    }

    /// True after the last chunk was consumed.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Total payload bytes decoded so far.
    #[inline]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Bytes still expected for the current chunk, if inside chunk data.
    #[inline]
    pub fn chunk_remaining(&self) -> Option<u64> {
        match self.state {
            State::Data(n) => Some(n),
            _ => None,
        }
    }

    /// Decodes the next element from `buf`, returning the bytes consumed. Payload is reported in
    /// place so it can be delivered without copying.
    pub fn decode(
        &mut self,
        buf: &[u8],
        strict: StrictLevel,
    ) -> ParseResult<Status<(Decoded, usize)>> {
        match self.state {
            State::Size => {
                let Some(line) = find_line(buf, strict)? else {
                    return Ok(Status::Partial);
                };
                let size = parse_chunk_size(&buf[..line.end])?;
                self.state = if size == 0 {
                    State::Done
                } else {
                    State::Data(size)
                };
                let decoded = if size == 0 {
                    Decoded::End
                } else {
                    Decoded::Framing
                };
                Ok(Status::Complete((decoded, line.next)))
            }
            State::Data(remaining) => {
                if buf.is_empty() {
                    return Ok(Status::Partial);
                }
                let len = remaining.min(buf.len() as u64) as usize;
                let left = remaining - len as u64;
                self.received += len as u64;
                self.state = if left == 0 {
                    State::DataEnd
                } else {
                    State::Data(left)
                };
                Ok(Status::Complete((Decoded::Data { start: 0, len }, len)))
            }
            State::DataEnd => {
                let consumed = match buf {
                    [b'\r', b'\n', ..] => 2,
                    [b'\n', ..] if strict.at_most(0) => 1,
                    [] | [b'\r'] => return Ok(Status::Partial),
                    _ => return Err(ParseError::ChunkTerminator),
                };
                self.state = State::Size;
                Ok(Status::Complete((Decoded::Framing, consumed)))
            }
            State::Done => Ok(Status::Complete((Decoded::End, 0))),
        }
    }
}

/// Parses `chunk-size [ chunk-ext ]`. Extensions are ignored.
fn parse_chunk_size(line: &[u8]) -> ParseResult<u64> {
    let digits = line.iter().take_while(|b| b.is_ascii_hexdigit()).count();
    if digits == 0 || digits > MAX_SIZE_DIGITS {
        return Err(ParseError::ChunkSize);
    }

    let rest = &line[digits..];
    let rest_start = rest
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(rest.len());
    match rest.get(rest_start) {
        None | Some(b';') => {}
        Some(_) => return Err(ParseError::ChunkSize),
    }

    let mut size = 0u64;
    for &b in &line[..digits] {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::ChunkSize),
        };
        size = (size << 4) | u64::from(nibble);
    }

    Ok(size)
}

/// Writes chunk framing around payload that was placed in a buffer after
/// [`CHUNK_PREFIX_RESERVE`] bytes of reserved space.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkEncoder;

impl ChunkEncoder {
    /// Encodes the size line for a chunk of `len` bytes into `out`, right aligned so it ends
    /// exactly where the payload starts. Returns the number of bytes used.
    ///
    /// `len` must be in `1..=MAX_CHUNK_SIZE`.
    pub fn encode_prefix(len: usize, out: &mut [u8; CHUNK_PREFIX_RESERVE]) -> usize {
        debug_assert!(len > 0 && len <= MAX_CHUNK_SIZE);
        const HEX: &[u8; 16] = b"0123456789abcdef";

        let mut digits = 0;
        let mut value = len;
        while value != 0 || digits == 0 {
            digits += 1;
            value >>= 4;
        }

        let used = digits + 2;
        let start = CHUNK_PREFIX_RESERVE - used;
        let mut value = len;
        for i in (0..digits).rev() {
            out[start + i] = HEX[value & 0xf];
            value >>= 4;
        }
        out[CHUNK_PREFIX_RESERVE - 2] = b'\r';
        out[CHUNK_PREFIX_RESERVE - 1] = b'\n';
        used
    }

    /// Formats the last chunk followed by `footers` and the final empty line.
    pub fn encode_last(footers: &[(String, String)], out: &mut Vec<u8>) {
        out.extend_from_slice(b"0\r\n");
        for (name, value) in footers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// Trailer fields that must not be sent in a trailer section (RFC 9110 Section 6.5.1).
pub fn is_forbidden_trailer(name: &[u8]) -> bool {
    const FORBIDDEN: &[&[u8]] = &[
        b"content-length",
        b"transfer-encoding",
        b"host",
        b"content-type",
        b"content-encoding",
        b"content-range",
        b"trailer",
        b"authorization",
        b"proxy-authorization",
        b"set-cookie",
        b"cache-control",
        b"expect",
        b"max-forwards",
        b"pragma",
        b"range",
        b"te",
        b"connection",
    ];
    FORBIDDEN.iter().any(|f| f.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod test {
    use super::*;
    use fake::{Fake, Faker};

    fn decode_all(input: &[u8], schedule: &[usize]) -> ParseResult<(Vec<u8>, usize)> {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let mut available = 0;
        let mut pos = 0;
        let mut steps = schedule.iter().cycle();

        while !decoder.is_done() {
            match decoder.decode(&input[pos..available], StrictLevel::DEFAULT)? {
                Status::Complete((decoded, consumed)) => {
                    if let Decoded::Data { start, len } = decoded {
                        out.extend_from_slice(&input[pos + start..pos + start + len]);
                    }
                    pos += consumed;
                }
                Status::Partial => {
                    assert!(available < input.len(), "decoder stalled at {}", pos);
                    available = input.len().min(available + steps.next().copied().unwrap_or(1));
                }
            }
        }

        Ok((out, pos))
    }

    fn encode(payload: &[u8], chunk_sizes: &[usize]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut rest = payload;
        let mut sizes = chunk_sizes.iter().cycle();
        while !rest.is_empty() {
            let n = rest.len().min(*sizes.next().unwrap_or(&1)).max(1);
            let mut prefix = [0u8; CHUNK_PREFIX_RESERVE];
            let used = ChunkEncoder::encode_prefix(n, &mut prefix);
            out.extend_from_slice(&prefix[CHUNK_PREFIX_RESERVE - used..]);
            out.extend_from_slice(&rest[..n]);
            out.extend_from_slice(CHUNK_SUFFIX);
            rest = &rest[n..];
        }
        ChunkEncoder::encode_last(&[], &mut out);
        out
    }

    #[test]
    fn decodes_simple_body() {
        let input = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n";
        let (out, consumed) = decode_all(input, &[input.len()]).unwrap();
        assert_eq!(b"hello world", out.as_slice());
        // trailer section left for the header parser
        assert_eq!(input.len() - 2, consumed);
    }

    #[test]
    fn rejects_oversized_size_line() {
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(
            Err(ParseError::ChunkSize),
            decoder.decode(b"00000000000000001\r\n", StrictLevel::DEFAULT)
        );
        let mut decoder = ChunkedDecoder::new();
        assert!(decoder
            .decode(b"000000000000000f\r\n", StrictLevel::DEFAULT)
            .is_ok());
    }

    #[test]
    fn rejects_garbage_after_size() {
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(
            Err(ParseError::ChunkSize),
            decoder.decode(b"5x\r\n", StrictLevel::DEFAULT)
        );
    }

    #[test]
    fn rejects_missing_data_terminator() {
        assert_eq!(
            Err(ParseError::ChunkTerminator),
            decode_all(b"1\r\nab\r\n0\r\n\r\n", &[64]).map(|_| ())
        );
    }

    #[test]
    fn prefix_is_minimal_hex() {
        let mut prefix = [0u8; CHUNK_PREFIX_RESERVE];
        let used = ChunkEncoder::encode_prefix(0x1a2, &mut prefix);
        assert_eq!(b"1a2\r\n", &prefix[CHUNK_PREFIX_RESERVE - used..]);
        let used = ChunkEncoder::encode_prefix(MAX_CHUNK_SIZE, &mut prefix);
        assert_eq!(b"ffffff\r\n", &prefix[..used]);
    }

    #[test]
    fn last_chunk_with_footers() {
        let mut out = Vec::new();
        ChunkEncoder::encode_last(&[("X-Sum".into(), "1".into())], &mut out);
        assert_eq!(b"0\r\nX-Sum: 1\r\n\r\n", out.as_slice());
    }

    #[test]
    fn forbidden_trailers() {
        assert!(is_forbidden_trailer(b"Content-Length"));
        assert!(!is_forbidden_trailer(b"X-Checksum"));
    }

    #[test]
    fn decode_inverts_encode_under_random_schedules() {
        for _ in 0..100 {
            let len: usize = (0..4096).fake();
            let payload: Vec<u8> = (0..len).map(|_| Faker.fake::<u8>()).collect();
            let chunk_sizes: Vec<usize> = (0..4).map(|_| (1..700).fake()).collect();
            let schedule: Vec<usize> = (0..8).map(|_| (1..300).fake()).collect();

            let encoded = encode(&payload, &chunk_sizes);
            let (decoded, consumed) = decode_all(&encoded, &schedule).unwrap();
            assert_eq!(payload, decoded);
            assert_eq!(encoded.len() - 2, consumed);
        }
    }
}
