// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Growable byte buffer backing both the encoded traces and the string table.
//!
//! A [`Chunk`] keeps a logical length that is distinct from its allocated capacity. Every write goes
//! through [`Chunk::reserve`] first, so callers never see raw offsets: the only way to put bytes in is
//! one of the append methods, and the only way to read them back is [`Chunk::as_slice`].

use crate::encoder::tokens;
use crate::error::EncodeError;

/// Initial allocation of a chunk, matching what a handful of small traces need.
pub const DEFAULT_MIN_SIZE: usize = 64 * 1024;

/// A reserved 32-bit length, written once the number of entries that follow it is known.
#[derive(Debug)]
#[must_use]
pub struct LengthSlot {
    offset: usize,
}

#[derive(Debug)]
pub struct Chunk {
    buffer: Vec<u8>,
    length: usize,
}

impl Default for Chunk {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MIN_SIZE)
    }
}

impl Chunk {
    pub fn with_capacity(min_size: usize) -> Self {
        Chunk {
            buffer: vec![0; min_size.max(1)],
            length: 0,
        }
    }

    /// Number of bytes logically written since the last [`Chunk::clear`].
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of bytes allocated. Always `>= len()`.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    /// Forgets the written bytes but keeps the allocation for the next cycle.
    pub fn clear(&mut self) {
        self.length = 0;
    }

    /// Drops every byte written past `length`. Has no effect if the chunk is already shorter.
    pub fn truncate(&mut self, length: usize) {
        self.length = self.length.min(length);
    }

    /// Guarantees that at least `size` more bytes can be written at the current length.
    ///
    /// Grows by doubling, or straight to the required size when doubling is not enough. Existing
    /// bytes are carried over by the reallocation.
    pub fn reserve(&mut self, size: usize) {
        let required = self.length + size;
        if required > self.buffer.len() {
            let new_size = (self.buffer.len() * 2).max(required);
            self.buffer.resize(new_size, 0);
        }
    }

    /// Reserves `size` bytes and hands back the writable window, advancing the length past it.
    fn claim(&mut self, size: usize) -> &mut [u8] {
        self.reserve(size);
        let offset = self.length;
        self.length += size;
        &mut self.buffer[offset..offset + size]
    }

    pub fn push(&mut self, byte: u8) {
        self.claim(1)[0] = byte;
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.claim(bytes.len()).copy_from_slice(bytes);
    }

    /// A one-byte marker followed by a big-endian `u32`.
    pub fn push_marker_u32(&mut self, marker: u8, value: u32) {
        let window = self.claim(5);
        window[0] = marker;
        window[1..].copy_from_slice(&value.to_be_bytes());
    }

    /// A one-byte marker followed by eight big-endian bytes.
    pub fn push_marker_u64(&mut self, marker: u8, value: u64) {
        let window = self.claim(9);
        window[0] = marker;
        window[1..].copy_from_slice(&value.to_be_bytes());
    }

    /// Writes `marker` followed by a zeroed 32-bit length to be set later with [`Chunk::fill`].
    pub fn placeholder_u32(&mut self, marker: u8) -> LengthSlot {
        let offset = self.length;
        self.push_marker_u32(marker, 0);
        LengthSlot { offset }
    }

    pub fn fill(&mut self, slot: LengthSlot, value: u32) {
        let start = slot.offset + 1;
        self.buffer[start..start + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Appends `value` as a msgpack string (length header followed by its UTF-8 bytes) and returns
    /// the number of bytes written.
    pub fn write(&mut self, value: &str) -> Result<usize, EncodeError> {
        let start = self.length;
        let bytes = value.as_bytes();
        match u16::try_from(bytes.len()) {
            Ok(length) => self.extend_from_slice(tokens::str_header(length)),
            Err(_) => {
                let length =
                    u32::try_from(bytes.len()).map_err(|_| EncodeError::LengthOverflow {
                        kind: "string",
                        length: bytes.len(),
                    })?;
                self.push_marker_u32(tokens::STR32, length);
            }
        }
        self.extend_from_slice(bytes);
        Ok(self.length - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_is_distinct_from_capacity() {
        let mut chunk = Chunk::with_capacity(16);
        assert_eq!(chunk.len(), 0);
        assert_eq!(chunk.capacity(), 16);

        chunk.push(0x01);
        chunk.push(0x02);
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.capacity(), 16);
        assert_eq!(chunk.as_slice(), &[0x01, 0x02]);
    }

    #[test]
    fn test_reserve_doubles_capacity() {
        let mut chunk = Chunk::with_capacity(8);
        chunk.extend_from_slice(&[0xaa; 8]);
        assert_eq!(chunk.capacity(), 8);

        chunk.reserve(1);
        assert_eq!(chunk.capacity(), 16);
        // reserve alone does not move the logical length
        assert_eq!(chunk.len(), 8);
    }

    #[test]
    fn test_reserve_grows_to_required_size_when_doubling_is_not_enough() {
        let mut chunk = Chunk::with_capacity(8);
        chunk.push(0x01);
        chunk.reserve(100);
        assert_eq!(chunk.capacity(), 101);
    }

    #[test]
    fn test_growth_preserves_existing_bytes() {
        let mut chunk = Chunk::with_capacity(4);
        chunk.extend_from_slice(&[1, 2, 3, 4]);
        chunk.extend_from_slice(&[5, 6, 7, 8, 9, 10]);
        assert_eq!(chunk.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_clear_keeps_allocation() {
        let mut chunk = Chunk::with_capacity(4);
        chunk.extend_from_slice(&[0; 32]);
        let capacity = chunk.capacity();
        chunk.clear();
        assert!(chunk.is_empty());
        assert_eq!(chunk.capacity(), capacity);
    }

    #[test]
    fn test_markers_are_big_endian() {
        let mut chunk = Chunk::with_capacity(4);
        chunk.push_marker_u32(0xdd, 0x0102_0304);
        chunk.push_marker_u64(0xcf, 0x0102_0304_0506_0708);
        assert_eq!(
            chunk.as_slice(),
            &[0xdd, 1, 2, 3, 4, 0xcf, 1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_write_short_string() {
        let mut chunk = Chunk::default();
        let written = chunk.write("svc").unwrap();
        assert_eq!(written, 4);
        assert_eq!(chunk.as_slice(), &[0xa3, b's', b'v', b'c']);
    }

    #[test]
    fn test_write_empty_string() {
        let mut chunk = Chunk::default();
        assert_eq!(chunk.write("").unwrap(), 1);
        assert_eq!(chunk.as_slice(), &[0xa0]);
    }

    #[test]
    fn test_write_counts_utf8_bytes() {
        let mut chunk = Chunk::default();
        // "é" is two bytes in UTF-8
        assert_eq!(chunk.write("é").unwrap(), 3);
        assert_eq!(chunk.as_slice()[0], 0xa2);
    }

    #[test]
    fn test_write_string_decodes_with_reference_decoder() {
        let long = "x".repeat(300);
        let mut chunk = Chunk::with_capacity(2);
        chunk.write(&long).unwrap();

        let value = rmpv::decode::read_value(&mut chunk.as_slice()).unwrap();
        assert_eq!(value.as_str(), Some(long.as_str()));
    }

    #[test]
    fn test_write_string_longer_than_u16() {
        let long = "y".repeat(70_000);
        let mut chunk = Chunk::with_capacity(2);
        let written = chunk.write(&long).unwrap();
        assert_eq!(written, 70_005);
        assert_eq!(chunk.as_slice()[0], 0xdb);

        let value = rmpv::decode::read_value(&mut chunk.as_slice()).unwrap();
        assert_eq!(value.as_str().map(str::len), Some(70_000));
    }

    #[test]
    fn test_placeholder_is_filled_in_place() {
        let mut chunk = Chunk::with_capacity(2);
        let slot = chunk.placeholder_u32(0xdf);
        chunk.push(0x01);
        chunk.fill(slot, 3);
        assert_eq!(chunk.as_slice(), &[0xdf, 0, 0, 0, 3, 0x01]);
    }

    #[test]
    fn test_placeholder_survives_growth() {
        let mut chunk = Chunk::with_capacity(1);
        let slot = chunk.placeholder_u32(0xdd);
        chunk.extend_from_slice(&[0xaa; 100]);
        chunk.fill(slot, 0x0102_0304);
        assert_eq!(&chunk.as_slice()[..5], &[0xdd, 1, 2, 3, 4]);
        assert_eq!(chunk.len(), 105);
    }

    #[test]
    fn test_truncate_only_shrinks() {
        let mut chunk = Chunk::with_capacity(8);
        chunk.extend_from_slice(&[1, 2, 3, 4]);
        chunk.truncate(2);
        assert_eq!(chunk.as_slice(), &[1, 2]);
        chunk.truncate(10);
        assert_eq!(chunk.len(), 2);
    }
}
