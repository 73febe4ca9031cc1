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

//! Raw Request cursor

/// Cursor over the bytes of a single line of a request.
///
/// Elements are taken off the front with [`RawRequest::take_until`]; everything taken is gone
/// from the cursor, and what remains is always available through [`AsRef`].
#[derive(Debug, Clone)]
pub struct RawRequest<'a> {
    inner: &'a [u8],
    pos: usize,
}

impl<'a> RawRequest<'a> {
    /// Creates a cursor at the beginning of `slice`.
    pub fn new(slice: &'a [u8]) -> Self {
        RawRequest {
            inner: slice,
            pos: 0,
        }
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// True when every byte has been consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == self.inner.len()
    }

    /// Next byte without consuming it.
    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.inner.get(self.pos).copied()
    }

    /// Consumes `n` bytes.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.pos = self.inner.len().min(self.pos + n);
    }

    /// Consumes bytes until `predicate` matches, returning the consumed bytes. The matching byte
    /// is left in place. Returns `None` if the end was reached without a match.
    #[inline]
    pub fn take_until<F>(&mut self, mut predicate: F) -> Option<&'a [u8]>
    where
        F: FnMut(u8) -> bool,
    {
        let start = self.pos;
        let rest = &self.inner[start..];
        let found = rest.iter().position(|&b| predicate(b))?;
        self.pos = start + found;
        Some(&rest[..found])
    }

    /// Consumes every remaining byte.
    #[inline]
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.inner[self.pos..];
        self.pos = self.inner.len();
        rest
    }

    /// Consumes a run of bytes matching `predicate`, returning how many were consumed.
    #[inline]
    pub fn skip_while<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(u8) -> bool,
    {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !predicate(b) {
                break;
            }
            self.pos += 1;
        }
        self.pos - start
    }
}

impl<'a> Iterator for RawRequest<'a> {
    type Item = &'a u8;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let result = self.inner.get(self.pos);
        if result.is_some() {
            self.pos += 1;
        }

        result
    }
}

impl<'a> AsRef<[u8]> for RawRequest<'a> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.inner[self.pos..]
    }
}

#[cfg(test)]
mod test {

    use super::RawRequest;

    #[test]
    fn raw_request_constructs_at_start() {
        let req = RawRequest::new(b"GET / HTTP/1.1");
        assert_eq!(0, req.pos());
        assert!(!req.is_empty());
    }

    #[test]
    fn raw_request_next_iterates() {
        let mut req = RawRequest::new(b"GET / HTTP/1.1");
        assert_eq!(Some(&b'G'), req.next());
        assert_eq!(Some(&b'E'), req.next());
        assert_eq!(Some(&b'T'), req.next());
        assert_eq!(3, req.pos());
    }

    #[test]
    fn raw_request_take_until_leaves_delimiter() {
        let mut req = RawRequest::new(b"GET / HTTP/1.1");
        assert_eq!(Some(b"GET" as &[u8]), req.take_until(|b| b == b' '));
        assert_eq!(Some(b' '), req.peek());
        assert_eq!(b" / HTTP/1.1", req.as_ref());
    }

    #[test]
    fn raw_request_take_until_without_match_consumes_nothing() {
        let mut req = RawRequest::new(b"GET");
        assert_eq!(None, req.take_until(|b| b == b' '));
        assert_eq!(0, req.pos());
        assert_eq!(b"GET", req.take_rest());
        assert!(req.is_empty());
    }

    #[test]
    fn raw_request_skip_while_counts() {
        let req = &mut RawRequest::new(b"  \tx");
        assert_eq!(3, req.skip_while(|b| b == b' ' || b == b'\t'));
        assert_eq!(Some(b'x'), req.peek());
    }
}
