// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Precomputed msgpack headers for every value that fits in 16 bits.
//!
//! Small unsigned integers (string-table references, error flags) and string length prefixes are
//! looked up instead of being branch-encoded on every write. Anything wider falls back to the
//! fixed-width 32-bit forms.

use std::sync::OnceLock;

pub const UINT16: u8 = 0xcd;
pub const UINT32: u8 = 0xce;
pub const UINT64: u8 = 0xcf;
pub const INT64: u8 = 0xd3;
pub const FLOAT64: u8 = 0xcb;
pub const STR8: u8 = 0xd9;
pub const STR16: u8 = 0xda;
pub const STR32: u8 = 0xdb;
pub const ARRAY32: u8 = 0xdd;
pub const MAP32: u8 = 0xdf;
pub const FIXARRAY: u8 = 0x90;
pub const FIXMAP: u8 = 0x80;
pub const NIL: u8 = 0xc0;
pub const FALSE: u8 = 0xc2;
pub const TRUE: u8 = 0xc3;
pub const BIN32: u8 = 0xc6;
const UINT8: u8 = 0xcc;
const FIXSTR: u8 = 0xa0;

const TABLE_SIZE: usize = u16::MAX as usize + 1;

#[derive(Clone, Copy)]
struct Token {
    bytes: [u8; 3],
    len: u8,
}

impl Token {
    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

struct Tokens {
    uint: Box<[Token]>,
    str_header: Box<[Token]>,
}

impl Tokens {
    fn build() -> Self {
        let uint = (0..TABLE_SIZE)
            .map(|value| {
                let [hi, lo] = (value as u16).to_be_bytes();
                match value {
                    0..=0x7f => Token {
                        bytes: [lo, 0, 0],
                        len: 1,
                    },
                    0x80..=0xff => Token {
                        bytes: [UINT8, lo, 0],
                        len: 2,
                    },
                    _ => Token {
                        bytes: [UINT16, hi, lo],
                        len: 3,
                    },
                }
            })
            .collect();

        let str_header = (0..TABLE_SIZE)
            .map(|length| {
                let [hi, lo] = (length as u16).to_be_bytes();
                match length {
                    0..=0x1f => Token {
                        bytes: [FIXSTR | lo, 0, 0],
                        len: 1,
                    },
                    0x20..=0xff => Token {
                        bytes: [STR8, lo, 0],
                        len: 2,
                    },
                    _ => Token {
                        bytes: [STR16, hi, lo],
                        len: 3,
                    },
                }
            })
            .collect();

        Tokens { uint, str_header }
    }
}

static TOKENS: OnceLock<Tokens> = OnceLock::new();

fn tokens() -> &'static Tokens {
    TOKENS.get_or_init(Tokens::build)
}

/// Smallest msgpack encoding of an unsigned integer up to `0xFFFF`.
pub fn uint(value: u16) -> &'static [u8] {
    tokens().uint[value as usize].as_slice()
}

/// Msgpack string header for a UTF-8 payload of `length` bytes.
pub fn str_header(length: u16) -> &'static [u8] {
    tokens().str_header[length as usize].as_slice()
}
