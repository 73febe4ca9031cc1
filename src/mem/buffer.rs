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

//! Connection read and write buffers

use std::{borrow::Borrow, io::Write, ops::Deref};

/// A contiguous byte buffer with separate read and write positions.
///
/// Bytes between the read and write offsets are pending; bytes after the write offset are free
/// space. The capacity never changes implicitly: growing is an explicit decision of the owner so
/// that the memory can be charged against the connection pool first.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
    read_offset: usize,
    write_offset: usize,
}

impl ByteBuffer {
    /// Creates a new buffer with exactly `capacity` bytes of space.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_offset: 0,
            write_offset: 0,
        }
    }

    /// Total size of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of pending bytes available to be read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// Space available for writing without compacting.
    #[inline]
    pub fn remaining_mut(&self) -> usize {
        self.data.len() - self.write_offset
    }

    /// True if nothing is pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Pending bytes.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_offset..self.write_offset]
    }

    /// Free space after the write position. Call [`ByteBuffer::mark_written`] after filling it.
    #[inline]
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.write_offset..]
    }

    /// Mark a certain amount of bytes read from the buffer. If this is not called after reading
    /// from the buffer, the next read will receive the same data.
    pub fn mark_read(&mut self, amount: usize) {
        self.read_offset = self.write_offset.min(self.read_offset + amount);
        if self.read_offset == self.write_offset {
            self.read_offset = 0;
            self.write_offset = 0;
        }
    }

    /// Mark a certain amount of bytes written to the buffer. If this is not called after writing,
    /// the next write will overwrite the previously written data.
    pub fn mark_written(&mut self, amount: usize) {
        self.write_offset = self.data.len().min(self.write_offset + amount);
    }

    /// Moves pending bytes to the beginning of the buffer to make room for further writes.
    pub fn compact(&mut self) {
        if self.read_offset == 0 {
            return;
        }
        self.data.copy_within(self.read_offset..self.write_offset, 0);
        self.write_offset -= self.read_offset;
        self.read_offset = 0;
    }

    /// Changes the capacity. Shrinking below the pending bytes is refused.
    pub fn resize(&mut self, capacity: usize) -> bool {
        if capacity < self.remaining() {
            return false;
        }
        self.compact();
        self.data.resize(capacity, 0);
        true
    }

    /// Appends all of `bytes` or nothing.
    pub fn try_append(&mut self, bytes: &[u8]) -> bool {
        if self.remaining_mut() < bytes.len() {
            self.compact();
            if self.remaining_mut() < bytes.len() {
                return false;
            }
        }
        let end = self.write_offset + bytes.len();
        self.data[self.write_offset..end].copy_from_slice(bytes);
        self.write_offset = end;
        true
    }

    /// Skips `amount` bytes of free space without initialising them for the reader. Used to leave
    /// room in front of data that is formatted later.
    pub fn reserve_front(&mut self, amount: usize) -> bool {
        if self.remaining() != 0 || self.data.len() < amount {
            return false;
        }
        self.read_offset = amount;
        self.write_offset = amount;
        true
    }

    /// Gives mutable access to the pending bytes.
    pub fn readable_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.read_offset..self.write_offset]
    }

    /// Moves the read position backwards into previously reserved space, exposing `amount` bytes
    /// in front of the pending data.
    pub fn unread(&mut self, amount: usize) -> bool {
        if amount > self.read_offset {
            return false;
        }
        self.read_offset -= amount;
        true
    }

    /// Reset the buffer to a clean initial state
    pub fn clear(&mut self) {
        self.read_offset = 0;
        self.write_offset = 0;
    }
}

impl Borrow<[u8]> for ByteBuffer {
    fn borrow(&self) -> &[u8] {
        self.readable()
    }
}

impl Deref for ByteBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.readable()
    }
}

impl Write for ByteBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.remaining_mut() < buf.len() {
            self.compact();
        }
        let amount = buf.len().min(self.remaining_mut());
        let start = self.write_offset;
        self.data[start..start + amount].copy_from_slice(&buf[..amount]);
        self.mark_written(amount);
        Ok(amount)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::ByteBuffer;
    use std::io::Write;

    #[test]
    fn buffer_tracks_read_and_write_offsets() {
        let mut buf = ByteBuffer::new(8);
        buf.writable()[..3].copy_from_slice(b"abc");
        buf.mark_written(3);
        assert_eq!(b"abc", buf.readable());
        assert_eq!(5, buf.remaining_mut());

        buf.mark_read(1);
        assert_eq!(b"bc", &buf[..]);
    }

    #[test]
    fn buffer_resets_offsets_when_drained() {
        let mut buf = ByteBuffer::new(4);
        assert!(buf.try_append(b"abcd"));
        buf.mark_read(4);
        assert!(buf.is_empty());
        assert_eq!(4, buf.remaining_mut());
    }

    #[test]
    fn try_append_compacts_or_refuses() {
        let mut buf = ByteBuffer::new(4);
        assert!(buf.try_append(b"abc"));
        buf.mark_read(2);
        assert!(buf.try_append(b"de"));
        assert_eq!(b"cde", buf.readable());
        assert!(!buf.try_append(b"fg"));
        assert_eq!(b"cde", buf.readable());
    }

    #[test]
    fn resize_refuses_to_drop_pending_bytes() {
        let mut buf = ByteBuffer::new(4);
        buf.try_append(b"abc");
        assert!(!buf.resize(2));
        assert!(buf.resize(16));
        assert_eq!(13, buf.remaining_mut());
        assert_eq!(b"abc", buf.readable());
    }

    #[test]
    fn reserved_front_space_can_be_exposed() {
        let mut buf = ByteBuffer::new(16);
        assert!(buf.reserve_front(6));
        buf.try_append(b"data");
        assert!(buf.unread(2));
        buf.readable_mut()[..2].copy_from_slice(b"4\n");
        assert_eq!(b"4\ndata", buf.readable());
    }

    #[test]
    fn write_impl_is_partial_when_full() {
        let mut buf = ByteBuffer::new(3);
        assert_eq!(3, buf.write(b"abcdef").unwrap());
        assert!(write!(buf, "x").is_err());
    }
}
