// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Ethernet link layer.

use core::fmt;
use core::str::FromStr;

use crate::error::LayerError;
use crate::layers::{optional_fields, Layer};
use crate::utils;

pub(crate) const ETH_PROTOCOL_IP: u16 = 0x0800;
pub(crate) const ETH_PROTOCOL_EXPERIMENTAL: u16 = 0x88B5;

pub(crate) const ETHER_HEADER_LEN: usize = 14;

/// A 48-bit IEEE 802 MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    #[inline]
    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    #[inline]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

/// Error returned when a MAC address string is malformed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidMacAddr;

impl fmt::Display for InvalidMacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MAC address must be six colon-separated hex octets")
    }
}

impl std::error::Error for InvalidMacAddr {}

impl FromStr for MacAddr {
    type Err = InvalidMacAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or(InvalidMacAddr)?;
            if part.is_empty() || part.len() > 2 {
                return Err(InvalidMacAddr);
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| InvalidMacAddr)?;
        }
        if parts.next().is_some() {
            return Err(InvalidMacAddr);
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

/// An Ethernet II header. Unset fields are wildcards when matching and are
/// derived from neighboring layers when serializing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ether {
    pub dst: Option<MacAddr>,
    pub src: Option<MacAddr>,
    pub eth_type: Option<u16>,
}

optional_fields!(Ether, {
    dst => "DstAddr",
    src => "SrcAddr",
    eth_type => "EtherType",
});

impl Ether {
    #[inline]
    pub(crate) fn length(&self) -> usize {
        ETHER_HEADER_LEN
    }

    pub(crate) fn serialize(&self, next: Option<&Layer>) -> Result<Vec<u8>, LayerError> {
        let dst = self.dst.ok_or(LayerError::MissingField {
            layer: "Ether",
            field: "DstAddr",
        })?;
        let src = self.src.ok_or(LayerError::MissingField {
            layer: "Ether",
            field: "SrcAddr",
        })?;
        let eth_type = match self.eth_type {
            Some(eth_type) => eth_type,
            None => match next {
                Some(Layer::Ipv4(_)) => ETH_PROTOCOL_IP,
                // Default to the experimental protocol indicator.
                _ => ETH_PROTOCOL_EXPERIMENTAL,
            },
        };

        let mut bytes = Vec::with_capacity(ETHER_HEADER_LEN);
        bytes.extend(dst.octets());
        bytes.extend(src.octets());
        bytes.extend(eth_type.to_be_bytes());
        Ok(bytes)
    }

    /// Decodes as much of an Ethernet header as `bytes` holds. Fields whose
    /// bytes are missing stay unset, so a runt frame still yields a (partial)
    /// layer rather than a parse failure.
    pub(crate) fn parse(bytes: &[u8]) -> (Ether, usize) {
        let ether = Ether {
            dst: utils::to_array::<6>(bytes, 0).map(MacAddr::new),
            src: utils::to_array::<6>(bytes, 6).map(MacAddr::new),
            eth_type: utils::to_array::<2>(bytes, 12).map(u16::from_be_bytes),
        };
        (ether, bytes.len().min(ETHER_HEADER_LEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_addr_round_trips_through_text() {
        let mac: MacAddr = "02:42:c0:a8:00:01".parse().unwrap();
        assert_eq!(mac.octets(), [0x02, 0x42, 0xc0, 0xa8, 0x00, 0x01]);
        assert_eq!(mac.to_string(), "02:42:c0:a8:00:01");
    }

    #[test]
    fn mac_addr_rejects_malformed_text() {
        assert!("02:42:c0:a8:00".parse::<MacAddr>().is_err());
        assert!("02:42:c0:a8:00:01:02".parse::<MacAddr>().is_err());
        assert!("02:42:c0:a8:00:zz".parse::<MacAddr>().is_err());
        assert!("0242:c0:a8:00:01:".parse::<MacAddr>().is_err());
    }

    #[test]
    fn parse_of_runt_frame_leaves_fields_unset() {
        let (ether, consumed) = Ether::parse(&[0xff; 8]);
        assert_eq!(consumed, 8);
        assert_eq!(ether.dst, Some(MacAddr::new([0xff; 6])));
        assert_eq!(ether.src, None);
        assert_eq!(ether.eth_type, None);
    }

    #[test]
    fn serialize_defaults_eth_type_from_next_layer() {
        let ether = Ether {
            dst: Some(MacAddr::new([1; 6])),
            src: Some(MacAddr::new([2; 6])),
            eth_type: None,
        };
        let next = Layer::Ipv4(crate::layers::Ipv4::default());
        let bytes = ether.serialize(Some(&next)).unwrap();
        assert_eq!(&bytes[12..14], &ETH_PROTOCOL_IP.to_be_bytes());

        let bytes = ether.serialize(None).unwrap();
        assert_eq!(&bytes[12..14], &ETH_PROTOCOL_EXPERIMENTAL.to_be_bytes());
    }
}
