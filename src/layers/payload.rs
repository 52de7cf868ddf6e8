// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw trailing bytes carried after the protocol headers of a frame.

use core::fmt::Write as _;

/// Opaque payload bytes. An unset payload is a wildcard that matches any
/// observed payload (including none); a set payload must match exactly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Payload {
    pub bytes: Option<Vec<u8>>,
}

impl Payload {
    #[inline]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Payload {
            bytes: Some(bytes.into()),
        }
    }

    #[inline]
    pub(crate) fn length(&self) -> usize {
        self.bytes.as_ref().map_or(0, Vec::len)
    }

    #[inline]
    pub(crate) fn serialize(&self) -> Vec<u8> {
        self.bytes.clone().unwrap_or_default()
    }

    #[inline]
    pub(crate) fn parse(bytes: &[u8]) -> Payload {
        Payload {
            bytes: Some(bytes.to_vec()),
        }
    }

    pub(crate) fn merge_fields(&mut self, other: &Self) {
        if other.bytes.is_some() {
            self.bytes = other.bytes.clone();
        }
    }

    pub(crate) fn match_fields(&self, observed: &Self) -> bool {
        match &self.bytes {
            None => true,
            Some(want) => observed.bytes.as_deref() == Some(want.as_slice()),
        }
    }

    pub(crate) fn diff_fields(&self, observed: &Self, out: &mut String) {
        if let Some(want) = &self.bytes {
            let got = observed.bytes.as_deref();
            if got != Some(want.as_slice()) {
                let got = got.map_or_else(|| "none".to_string(), fmt_bytes);
                let _ = writeln!(out, "  Bytes: got {}, want {}", got, fmt_bytes(want));
            }
        }
    }
}

fn fmt_bytes(bytes: &[u8]) -> String {
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        match core::str::from_utf8(bytes) {
            Ok(text) => return format!("{:?}", text),
            Err(_) => (),
        }
    }
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
