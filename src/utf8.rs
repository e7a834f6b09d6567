//! Incremental utf-8 validation for text messages.
//!
//! Text payloads arrive in arbitrary chunks; validation must reject a bad
//! byte as soon as it is seen and must not be confused by a multi-byte
//! code point split across fragments. This is the classic Hoehrmann DFA:
//! the first 256 table entries map bytes to character classes, the rest
//! are the state transitions. Overlong encodings and the surrogate range
//! U+D800..U+DFFF land in the reject state by construction.

const UTF8_ACCEPT: u8 = 0;
const UTF8_REJECT: u8 = 12;

#[rustfmt::skip]
const UTF8_TABLE: [u8; 364] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    8, 8, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    10, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 4, 3, 3,
    11, 6, 6, 6, 5, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
    0, 12, 24, 36, 60, 96, 84, 12, 12, 12, 48, 72,
    12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12,
    12, 0, 12, 12, 12, 12, 12, 0, 12, 0, 12, 12,
    12, 24, 12, 12, 12, 12, 12, 24, 12, 24, 12, 12,
    12, 12, 12, 12, 12, 12, 12, 24, 12, 12, 12, 12,
    12, 24, 12, 12, 12, 12, 12, 12, 12, 24, 12, 12,
    12, 12, 12, 12, 12, 12, 12, 36, 12, 36, 12, 12,
    12, 36, 12, 12, 12, 12, 12, 36, 12, 36, 12, 12,
    12, 36, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12,
];

/// streaming utf-8 validator, one per text message
#[derive(Debug, Default)]
pub(crate) struct Utf8Validator {
    state: u8,
}

impl Utf8Validator {
    pub(crate) fn new() -> Self {
        Self { state: UTF8_ACCEPT }
    }

    /// feed the next chunk, returns false at the first offending byte
    pub(crate) fn feed(&mut self, data: &[u8]) -> bool {
        let mut state = self.state;
        for &byte in data {
            let class = UTF8_TABLE[byte as usize];
            state = UTF8_TABLE[256 + state as usize + class as usize];
            if state == UTF8_REJECT {
                self.state = state;
                return false;
            }
        }
        self.state = state;
        true
    }

    /// true when no code point is left dangling
    pub(crate) fn is_complete(&self) -> bool {
        self.state == UTF8_ACCEPT
    }

    pub(crate) fn reset(&mut self) {
        self.state = UTF8_ACCEPT;
    }
}
