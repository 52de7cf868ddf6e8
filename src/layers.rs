// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol layer values and ordered frames of them.
//!
//! Every header field of every layer is optional. An unset field acts as a
//! wildcard when a frame is matched against an expectation, and is filled
//! with a computed default (length, checksum, next-protocol indicator) when
//! a frame is serialized. [`Layers`] owns an ordered sequence of layers,
//! outermost first, and drives the operations that need neighboring layers:
//! serialization (length and pseudo-header checksums), parsing, merging and
//! field-wise matching.

use core::fmt;
use core::ops;

use crate::error::LayerError;

pub mod ip;
pub mod l2;
pub mod payload;
pub mod tcp;
pub mod udp;

pub use self::ip::Ipv4;
pub use self::l2::{Ether, MacAddr};
pub use self::payload::Payload;
pub use self::tcp::{Tcp, TcpFlags};
pub use self::udp::Udp;

/// Generates the field-wise overlay, match and diff operations for a layer
/// struct whose fields are all `Option`s. The label names the field in diff
/// output.
macro_rules! optional_fields {
    ($layer:ident, { $($field:ident => $label:literal),+ $(,)? }) => {
        impl $layer {
            /// Overlays every set field of `other` onto `self`.
            pub(crate) fn merge_fields(&mut self, other: &Self) {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field.clone();
                    }
                )+
            }

            /// Field-wise equality restricted to the fields set in `self`.
            pub(crate) fn match_fields(&self, observed: &Self) -> bool {
                $(
                    if let Some(want) = &self.$field {
                        if observed.$field.as_ref() != Some(want) {
                            return false;
                        }
                    }
                )+
                true
            }

            /// Writes a `got/want` line for every set field that differs.
            pub(crate) fn diff_fields(&self, observed: &Self, out: &mut String) {
                use core::fmt::Write as _;
                $(
                    if let Some(want) = &self.$field {
                        match observed.$field.as_ref() {
                            Some(got) if got == want => (),
                            Some(got) => {
                                let _ = writeln!(out, "  {}: got {}, want {}", $label, got, want);
                            }
                            None => {
                                let _ = writeln!(out, "  {}: got none, want {}", $label, want);
                            }
                        }
                    }
                )+
            }
        }
    };
}
pub(crate) use optional_fields;

/// One protocol layer of a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Layer {
    Ether(Ether),
    Ipv4(Ipv4),
    Tcp(Tcp),
    Udp(Udp),
    Payload(Payload),
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Ether(_) => "Ether",
            Layer::Ipv4(_) => "Ipv4",
            Layer::Tcp(_) => "Tcp",
            Layer::Udp(_) => "Udp",
            Layer::Payload(_) => "Payload",
        }
    }

    /// The number of bytes this layer alone contributes to a serialized
    /// frame.
    pub fn length(&self) -> usize {
        match self {
            Layer::Ether(ether) => ether.length(),
            Layer::Ipv4(ipv4) => ipv4.length(),
            Layer::Tcp(tcp) => tcp.length(),
            Layer::Udp(udp) => udp.length(),
            Layer::Payload(payload) => payload.length(),
        }
    }

    /// Overlays every set field of `other` onto `self`. Fails when the two
    /// layers are different variants.
    pub fn merge(&mut self, other: &Layer) -> Result<(), LayerError> {
        match (&mut *self, other) {
            (Layer::Ether(a), Layer::Ether(b)) => a.merge_fields(b),
            (Layer::Ipv4(a), Layer::Ipv4(b)) => a.merge_fields(b),
            (Layer::Tcp(a), Layer::Tcp(b)) => a.merge_fields(b),
            (Layer::Udp(a), Layer::Udp(b)) => a.merge_fields(b),
            (Layer::Payload(a), Layer::Payload(b)) => a.merge_fields(b),
            (expected, found) => {
                return Err(LayerError::MergeMismatch {
                    expected: expected.name(),
                    found: found.name(),
                })
            }
        }
        Ok(())
    }

    /// True iff `observed` is the same variant and every set field of `self`
    /// equals the corresponding observed field.
    pub(crate) fn field_match(&self, observed: &Layer) -> bool {
        match (self, observed) {
            (Layer::Ether(a), Layer::Ether(b)) => a.match_fields(b),
            (Layer::Ipv4(a), Layer::Ipv4(b)) => a.match_fields(b),
            (Layer::Tcp(a), Layer::Tcp(b)) => a.match_fields(b),
            (Layer::Udp(a), Layer::Udp(b)) => a.match_fields(b),
            (Layer::Payload(a), Layer::Payload(b)) => a.match_fields(b),
            _ => false,
        }
    }

    pub(crate) fn diff_fields_into(&self, observed: &Layer, out: &mut String) {
        use core::fmt::Write as _;
        match (self, observed) {
            (Layer::Ether(a), Layer::Ether(b)) => a.diff_fields(b, out),
            (Layer::Ipv4(a), Layer::Ipv4(b)) => a.diff_fields(b, out),
            (Layer::Tcp(a), Layer::Tcp(b)) => a.diff_fields(b, out),
            (Layer::Udp(a), Layer::Udp(b)) => a.diff_fields(b, out),
            (Layer::Payload(a), Layer::Payload(b)) => a.diff_fields(b, out),
            (want, got) => {
                let _ = writeln!(out, "  got a {} layer, want a {} layer", got.name(), want.name());
            }
        }
    }
}

impl From<Ether> for Layer {
    fn from(value: Ether) -> Self {
        Layer::Ether(value)
    }
}

impl From<Ipv4> for Layer {
    fn from(value: Ipv4) -> Self {
        Layer::Ipv4(value)
    }
}

impl From<Tcp> for Layer {
    fn from(value: Tcp) -> Self {
        Layer::Tcp(value)
    }
}

impl From<Udp> for Layer {
    fn from(value: Udp) -> Self {
        Layer::Udp(value)
    }
}

impl From<Payload> for Layer {
    fn from(value: Payload) -> Self {
        Layer::Payload(value)
    }
}

/// An ordered sequence of layers representing one frame, outermost first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Layers(Vec<Layer>);

impl Layers {
    #[inline]
    pub fn new(layers: Vec<Layer>) -> Self {
        Layers(layers)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Layer> {
        self.0.get(index)
    }

    #[inline]
    pub fn as_slice(&self) -> &[Layer] {
        &self.0
    }

    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, Layer> {
        self.0.iter()
    }

    /// Overlays an expectation onto this frame, index by index. `None`
    /// entries leave the layer at that index untouched; entries one past the
    /// end are appended (e.g. a trailing payload expectation). An entry that
    /// would leave a gap cannot be aligned and fails.
    pub fn merge(&mut self, expected: &[Option<Layer>]) -> Result<(), LayerError> {
        for (i, overlay) in expected.iter().enumerate() {
            let Some(overlay) = overlay else { continue };
            if i < self.0.len() {
                self.0[i].merge(overlay)?;
            } else if i == self.0.len() {
                self.0.push(overlay.clone());
            } else {
                return Err(LayerError::Unaligned { index: i });
            }
        }
        Ok(())
    }

    /// True iff every set field of every layer in `self` equals the
    /// corresponding field of `observed`. An observed frame that is shorter
    /// than the expectation never matches; one that is longer may (its tail
    /// is unconstrained).
    pub fn matches(&self, observed: &Layers) -> bool {
        if observed.0.len() < self.0.len() {
            return false;
        }
        self.0
            .iter()
            .zip(&observed.0)
            .all(|(want, got)| want.field_match(got))
    }

    /// A human-readable field-wise report of where `got` deviates from the
    /// expectation in `self`.
    pub fn diff(&self, got: &Layers) -> String {
        use core::fmt::Write as _;

        let mut out = String::new();
        if got.0.len() < self.0.len() {
            let _ = writeln!(
                out,
                "got {} layer(s) ({}), want at least {} ({})",
                got.0.len(),
                got,
                self.0.len(),
                self
            );
        }
        for (i, want) in self.0.iter().enumerate() {
            let Some(got_layer) = got.0.get(i) else {
                let _ = writeln!(out, "#{} {}: missing", i, want.name());
                continue;
            };
            let mut fields = String::new();
            want.diff_fields_into(got_layer, &mut fields);
            if !fields.is_empty() {
                let _ = writeln!(out, "#{} {}:", i, want.name());
                out.push_str(&fields);
            }
        }
        if out.is_empty() {
            out.push_str("frames are equivalent under the fields specified\n");
        }
        out
    }

    /// Serializes the frame, innermost layer first so that length fields and
    /// checksums see the bytes and addresses they depend on.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LayerError> {
        let mut tail: Vec<u8> = Vec::new();
        for idx in (0..self.0.len()).rev() {
            let next = self.0.get(idx + 1);
            let enclosing = match idx.checked_sub(1).map(|i| &self.0[i]) {
                Some(Layer::Ipv4(ipv4)) => Some(ipv4),
                _ => None,
            };
            let mut bytes = match &self.0[idx] {
                Layer::Ether(ether) => ether.serialize(next)?,
                Layer::Ipv4(ipv4) => ipv4.serialize(next, tail.len())?,
                Layer::Tcp(tcp) => tcp.serialize(enclosing, &tail)?,
                Layer::Udp(udp) => udp.serialize(enclosing, &tail)?,
                Layer::Payload(payload) => payload.serialize(),
            };
            bytes.extend_from_slice(&tail);
            tail = bytes;
        }
        Ok(tail)
    }

    /// Parses a raw Ethernet frame into its layers. Parsing never fails:
    /// headers that are truncated or carry an unrecognized protocol leave
    /// the remaining bytes in a trailing [`Payload`] layer, and a frame
    /// shorter than an Ethernet header yields a single partial Ether layer.
    pub fn parse(bytes: &[u8]) -> Layers {
        let mut layers = Vec::new();
        let (ether, consumed) = Ether::parse(bytes);
        let eth_type = ether.eth_type;
        layers.push(Layer::Ether(ether));

        let rest = &bytes[consumed..];
        if eth_type == Some(l2::ETH_PROTOCOL_IP) {
            parse_ip(rest, &mut layers);
        } else if !rest.is_empty() {
            layers.push(Layer::Payload(Payload::parse(rest)));
        }
        Layers(layers)
    }
}

fn parse_ip(bytes: &[u8], layers: &mut Vec<Layer>) {
    let Some((ipv4, header_len, payload_len)) = Ipv4::parse(bytes) else {
        if !bytes.is_empty() {
            layers.push(Layer::Payload(Payload::parse(bytes)));
        }
        return;
    };
    let protocol = ipv4.protocol;
    layers.push(Layer::Ipv4(ipv4));

    let payload = &bytes[header_len..header_len + payload_len];
    match protocol {
        Some(ip::DATA_PROTO_TCP) => {
            if let Some((tcp, header_len)) = Tcp::parse(payload) {
                layers.push(Layer::Tcp(tcp));
                let trailing = &payload[header_len..];
                if !trailing.is_empty() {
                    layers.push(Layer::Payload(Payload::parse(trailing)));
                }
            } else if !payload.is_empty() {
                layers.push(Layer::Payload(Payload::parse(payload)));
            }
        }
        Some(ip::DATA_PROTO_UDP) => {
            if let Some((udp, payload_len)) = Udp::parse(payload) {
                layers.push(Layer::Udp(udp));
                let trailing = &payload[udp::UDP_HEADER_LEN..udp::UDP_HEADER_LEN + payload_len];
                if !trailing.is_empty() {
                    layers.push(Layer::Payload(Payload::parse(trailing)));
                }
            } else if !payload.is_empty() {
                layers.push(Layer::Payload(Payload::parse(payload)));
            }
        }
        _ => {
            if !payload.is_empty() {
                layers.push(Layer::Payload(Payload::parse(payload)));
            }
        }
    }
}

impl ops::Index<usize> for Layers {
    type Output = Layer;

    fn index(&self, index: usize) -> &Layer {
        &self.0[index]
    }
}

impl fmt::Display for Layers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(empty)");
        }
        for (i, layer) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(layer.name())?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Layers {
    type Item = &'a Layer;
    type IntoIter = core::slice::Iter<'a, Layer>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
