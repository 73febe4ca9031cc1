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

//! Per-connection memory pool
//!
//! The pool is a fixed-size arena. Small, short-lived strings produced while parsing a request
//! are bump-allocated from the front and addressed through [`Span`]s. Large transient buffers
//! (the connection read and write buffers) are charged against the same budget from the tail, so
//! a connection can never use more than its configured memory limit in total.

const ALIGN: usize = 8;

/// Handle to bytes allocated from a [`MemoryPool`].
///
/// A span remembers the pool generation it was allocated in. After the pool is reset past it,
/// looking it up yields `None` instead of stale data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    offset: u32,
    len: u32,
    generation: u32,
}

impl Span {
    /// Length of the allocation in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True for zero-length spans.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Position in the pool that can be rewound to with [`MemoryPool::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

/// Bump allocator backing a single connection.
#[derive(Debug)]
pub struct MemoryPool {
    arena: Box<[u8]>,
    front: usize,
    tail_reserved: usize,
    last: Option<(usize, usize)>,
    generation: u32,
}

impl MemoryPool {
    /// Creates a pool with `size` bytes of budget.
    pub fn new(size: usize) -> Self {
        Self {
            arena: vec![0; size].into_boxed_slice(),
            front: 0,
            tail_reserved: 0,
            last: None,
            generation: 0,
        }
    }

    /// Total budget of the pool.
    pub fn size(&self) -> usize {
        self.arena.len()
    }

    /// Bytes neither allocated from the front nor reserved from the tail.
    pub fn free(&self) -> usize {
        self.arena.len() - self.front - self.tail_reserved
    }

    /// Allocates `n` zeroed bytes from the front.
    pub fn alloc(&mut self, n: usize) -> Option<Span> {
        let start = align_up(self.front);
        let end = start.checked_add(n)?;
        if end > self.arena.len() - self.tail_reserved || end > u32::MAX as usize {
            return None;
        }
        self.arena[start..end].fill(0);
        self.front = end;
        self.last = Some((start, n));
        Some(Span {
            offset: start as u32,
            len: n as u32,
            generation: self.generation,
        })
    }

    /// Allocates a copy of `bytes`.
    pub fn alloc_copy(&mut self, bytes: &[u8]) -> Option<Span> {
        let span = self.alloc(bytes.len())?;
        self.get_mut(span)?.copy_from_slice(bytes);
        Some(span)
    }

    /// Resizes an allocation. The most recent allocation grows or shrinks in place; any other
    /// allocation is copied into a fresh region when growing.
    pub fn reallocate_tail(&mut self, span: Span, new_len: usize) -> Option<Span> {
        if span.generation != self.generation {
            return None;
        }
        let offset = span.offset as usize;

        if self.last == Some((offset, span.len())) {
            let end = offset.checked_add(new_len)?;
            if end > self.arena.len() - self.tail_reserved {
                return None;
            }
            if new_len > span.len() {
                self.arena[offset + span.len()..end].fill(0);
            }
            self.front = end;
            self.last = Some((offset, new_len));
            return Some(Span {
                offset: span.offset,
                len: new_len as u32,
                generation: span.generation,
            });
        }

        if new_len <= span.len() {
            return Some(Span {
                len: new_len as u32,
                ..span
            });
        }

        let fresh = self.alloc(new_len)?;
        let (src, dst) = (offset, fresh.offset as usize);
        self.arena.copy_within(src..src + span.len(), dst);
        Some(fresh)
    }

    /// Appends `bytes` to an allocation, reallocating as needed.
    pub fn append(&mut self, span: Span, bytes: &[u8]) -> Option<Span> {
        let old = span.len();
        let grown = self.reallocate_tail(span, old + bytes.len())?;
        self.get_mut(grown)?[old..].copy_from_slice(bytes);
        Some(grown)
    }

    /// Current front position.
    pub fn mark(&self) -> Mark {
        Mark(self.front)
    }

    /// Rewinds front allocations to `mark`. Every span allocated so far becomes stale.
    pub fn reset(&mut self, mark: Mark) {
        self.front = mark.0.min(self.front);
        self.last = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Charges `n` bytes against the tail of the pool.
    pub fn reserve_buffer(&mut self, n: usize) -> bool {
        if n > self.free() {
            return false;
        }
        self.tail_reserved += n;
        true
    }

    /// Returns `n` bytes previously charged with [`MemoryPool::reserve_buffer`].
    pub fn release_buffer(&mut self, n: usize) {
        self.tail_reserved = self.tail_reserved.saturating_sub(n);
    }

    /// Bytes currently charged against the tail.
    pub fn reserved(&self) -> usize {
        self.tail_reserved
    }

    /// Looks up the bytes of a span.
    pub fn get(&self, span: Span) -> Option<&[u8]> {
        if span.generation != self.generation {
            return None;
        }
        let start = span.offset as usize;
        self.arena.get(start..start + span.len())
    }

    /// Looks up the bytes of a span for writing.
    pub fn get_mut(&mut self, span: Span) -> Option<&mut [u8]> {
        if span.generation != self.generation {
            return None;
        }
        let start = span.offset as usize;
        self.arena.get_mut(start..start + span.len())
    }

    /// Looks up a span as a string. Spans that are not valid UTF-8 yield `None`.
    pub fn str(&self, span: Span) -> Option<&str> {
        self.get(span).and_then(|b| std::str::from_utf8(b).ok())
    }
}

#[inline]
fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_is_aligned_and_bounded() {
        let mut pool = MemoryPool::new(32);
        let a = pool.alloc(3).unwrap();
        let b = pool.alloc(3).unwrap();
        assert_eq!(0, a.offset);
        assert_eq!(8, b.offset);
        assert!(pool.alloc(17).is_none());
        assert!(pool.alloc(16).is_some());
        assert_eq!(0, pool.free());
    }

    #[test]
    fn reallocate_tail_grows_last_allocation_in_place() {
        let mut pool = MemoryPool::new(64);
        let a = pool.alloc_copy(b"abc").unwrap();
        let a = pool.append(a, b"def").unwrap();
        assert_eq!(0, a.offset);
        assert_eq!(Some(b"abcdef" as &[u8]), pool.get(a));
    }

    #[test]
    fn reallocate_tail_copies_older_allocations() {
        let mut pool = MemoryPool::new(64);
        let a = pool.alloc_copy(b"abc").unwrap();
        let _b = pool.alloc_copy(b"zz").unwrap();
        let a = pool.append(a, b"d").unwrap();
        assert_eq!(16, a.offset);
        assert_eq!(Some("abcd"), pool.str(a));
    }

    #[test]
    fn reset_invalidates_spans() {
        let mut pool = MemoryPool::new(64);
        let mark = pool.mark();
        let a = pool.alloc_copy(b"Host").unwrap();
        pool.reset(mark);
        assert_eq!(None, pool.get(a));
        assert_eq!(64, pool.free());
    }

    #[test]
    fn tail_reservations_share_budget_with_strings() {
        let mut pool = MemoryPool::new(64);
        assert!(pool.reserve_buffer(48));
        assert!(pool.alloc(17).is_none());
        assert!(pool.alloc(16).is_some());
        assert!(!pool.reserve_buffer(1));
        pool.release_buffer(48);
        assert!(pool.reserve_buffer(48));
    }
}
