//! Reference-counted byte buffer with read/write cursors.
//!
//! The external contract (§6) assumes a ref-counted buffer with reader and
//! writer cursors, mark/reset on the reader side, and big-endian primitive
//! access. `bytes::BytesMut`/`Bytes` already give us the ref-counted part;
//! this wraps them in the teacher's `circular_buffer::Buffer` newtype idiom
//! (a thin `Deref`-able wrapper) to restore the cursor semantics the
//! contract names, which `bytes`' own consuming cursor doesn't provide.

use std::ops::Deref;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A growable byte buffer with an independent reader cursor.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    data: BytesMut,
    reader_index: usize,
    mark: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            reader_index: 0,
            mark: 0,
        }
    }

    pub fn from_bytes(bytes: impl Into<BytesMut>) -> Self {
        Self {
            data: bytes.into(),
            reader_index: 0,
            mark: 0,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.data.len() - self.reader_index
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.data.len()
    }

    pub fn mark_reader_index(&mut self) {
        self.mark = self.reader_index;
    }

    pub fn reset_reader_index(&mut self) {
        self.reader_index = self.mark;
    }

    /// Appends raw bytes at the writer cursor.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Copies out `n` bytes starting at the reader cursor and advances it.
    pub fn read_bytes(&mut self, n: usize) -> Bytes {
        assert!(
            n <= self.readable_bytes(),
            "read_bytes past the writer cursor"
        );
        let start = self.reader_index;
        let taken = Bytes::copy_from_slice(&self.data[start..start + n]);
        self.reader_index += n;
        taken
    }

    /// Drops this buffer's handle; when the last refcounted handle to the
    /// backing storage is dropped, `bytes` frees it.
    pub fn release(self) {
        drop(self);
    }

    /// Discards already-read bytes before the reader cursor, shifting the
    /// unread tail to the front. Without this a long-lived buffer that's
    /// only ever appended to and read from grows with total bytes ever
    /// received rather than with the current backlog.
    pub fn compact(&mut self) {
        if self.reader_index == 0 {
            return;
        }
        let _ = self.data.split_to(self.reader_index);
        self.mark = self.mark.saturating_sub(self.reader_index);
        self.reader_index = 0;
    }
}

// Big-endian primitive accessors, grouped the way the external contract
// names them (readInt/readShort/... and their write counterparts).
impl Buffer {
    pub fn write_u16(&mut self, v: u16) {
        self.data.put_u16(v);
    }
    pub fn write_i32(&mut self, v: i32) {
        self.data.put_i32(v);
    }
    pub fn write_i64(&mut self, v: i64) {
        self.data.put_i64(v);
    }
    pub fn write_f32(&mut self, v: f32) {
        self.data.put_f32(v);
    }
    pub fn write_f64(&mut self, v: f64) {
        self.data.put_f64(v);
    }

    pub fn read_u16(&mut self) -> u16 {
        let mut slice = &self.data[self.reader_index..];
        let v = slice.get_u16();
        self.reader_index += 2;
        v
    }
    pub fn read_i32(&mut self) -> i32 {
        let mut slice = &self.data[self.reader_index..];
        let v = slice.get_i32();
        self.reader_index += 4;
        v
    }
    pub fn read_i64(&mut self) -> i64 {
        let mut slice = &self.data[self.reader_index..];
        let v = slice.get_i64();
        self.reader_index += 8;
        v
    }
    pub fn read_f32(&mut self) -> f32 {
        let mut slice = &self.data[self.reader_index..];
        let v = slice.get_f32();
        self.reader_index += 4;
        v
    }
    pub fn read_f64(&mut self) -> f64 {
        let mut slice = &self.data[self.reader_index..];
        let v = slice.get_f64();
        self.reader_index += 8;
        v
    }
}

impl Deref for Buffer {
    type Target = [u8];

    /// Exposes the unread tail of the buffer, matching the teacher's
    /// `circular_buffer::Buffer<'a>` newtype-with-`Deref` idiom.
    fn deref(&self) -> &[u8] {
        &self.data[self.reader_index..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_big_endian() {
        let mut buf = Buffer::new();
        buf.write_i32(42);
        buf.write_u16(7);
        assert_eq!(buf.read_i32(), 42);
        assert_eq!(buf.read_u16(), 7);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn mark_and_reset_rewinds_reader_cursor() {
        let mut buf = Buffer::new();
        buf.write_bytes(&[1, 2, 3, 4]);
        buf.mark_reader_index();
        let _ = buf.read_bytes(2);
        assert_eq!(buf.readable_bytes(), 2);
        buf.reset_reader_index();
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn compact_drops_consumed_bytes_but_keeps_the_unread_tail() {
        let mut buf = Buffer::new();
        buf.write_bytes(&[1, 2, 3, 4, 5, 6]);
        let _ = buf.read_bytes(4);
        assert_eq!(buf.reader_index(), 4);
        buf.compact();
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(&buf[..], &[5, 6]);
    }

    #[test]
    fn compact_on_an_untouched_buffer_is_a_no_op() {
        let mut buf = Buffer::new();
        buf.write_bytes(&[1, 2, 3]);
        buf.compact();
        assert_eq!(&buf[..], &[1, 2, 3]);
    }
}
