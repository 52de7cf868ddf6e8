// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Internet Protocol version 4 network layer.

use std::net::Ipv4Addr;

use crate::error::LayerError;
use crate::layers::{optional_fields, Layer};
use crate::utils;

pub(crate) const DATA_PROTO_TCP: u8 = 0x06;
pub(crate) const DATA_PROTO_UDP: u8 = 0x11;

const MIN_HEADER_LEN: usize = 20;

/// An IPv4 header. Unset fields are wildcards when matching; when
/// serializing they fall back to protocol defaults, values derived from the
/// surrounding layers (total length, data protocol) or a computed checksum.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ipv4 {
    pub version: Option<u8>,
    /// Header length in 32-bit words.
    pub ihl: Option<u8>,
    pub dscp: Option<u8>,
    pub ecn: Option<u8>,
    pub total_length: Option<u16>,
    pub id: Option<u16>,
    pub flags: Option<u8>,
    pub frag_offset: Option<u16>,
    pub ttl: Option<u8>,
    pub protocol: Option<u8>,
    pub checksum: Option<u16>,
    pub src: Option<Ipv4Addr>,
    pub dst: Option<Ipv4Addr>,
}

optional_fields!(Ipv4, {
    version => "Version",
    ihl => "IHL",
    dscp => "DSCP",
    ecn => "ECN",
    total_length => "TotalLength",
    id => "ID",
    flags => "Flags",
    frag_offset => "FragmentOffset",
    ttl => "TTL",
    protocol => "Protocol",
    checksum => "Checksum",
    src => "SrcAddr",
    dst => "DstAddr",
});

impl Ipv4 {
    #[inline]
    pub(crate) fn length(&self) -> usize {
        usize::from(self.ihl.unwrap_or(5)) * 4
    }

    pub(crate) fn serialize(
        &self,
        next: Option<&Layer>,
        payload_len: usize,
    ) -> Result<Vec<u8>, LayerError> {
        let ihl = self.ihl.unwrap_or(5);
        if !(5..=15).contains(&ihl) {
            return Err(LayerError::InvalidField {
                layer: "Ipv4",
                field: "IHL",
                reason: "must be between 5 and 15 words",
            });
        }
        let version = self.version.unwrap_or(4);
        if version > 0x0f {
            return Err(LayerError::InvalidField {
                layer: "Ipv4",
                field: "Version",
                reason: "exceeds four bits",
            });
        }
        let dscp = self.dscp.unwrap_or(0);
        let ecn = self.ecn.unwrap_or(0);
        if dscp > 0x3f || ecn > 0x03 {
            return Err(LayerError::InvalidField {
                layer: "Ipv4",
                field: "DSCP",
                reason: "DSCP exceeds six bits or ECN exceeds two",
            });
        }
        let flags = self.flags.unwrap_or(0);
        let frag_offset = self.frag_offset.unwrap_or(0);
        if flags > 0x07 || frag_offset > 0x1fff {
            return Err(LayerError::InvalidField {
                layer: "Ipv4",
                field: "Flags",
                reason: "flags exceed three bits or fragment offset exceeds thirteen",
            });
        }

        let header_len = usize::from(ihl) * 4;
        let total_length = match self.total_length {
            Some(total_length) => total_length,
            None => {
                u16::try_from(header_len + payload_len).map_err(|_| LayerError::InvalidField {
                    layer: "Ipv4",
                    field: "TotalLength",
                    reason: "packet exceeds 65535 bytes",
                })?
            }
        };
        let protocol = match self.protocol {
            Some(protocol) => protocol,
            None => match next {
                Some(Layer::Tcp(_)) => DATA_PROTO_TCP,
                Some(Layer::Udp(_)) => DATA_PROTO_UDP,
                _ => {
                    return Err(LayerError::MissingField {
                        layer: "Ipv4",
                        field: "Protocol",
                    })
                }
            },
        };
        let src = self.src.ok_or(LayerError::MissingField {
            layer: "Ipv4",
            field: "SrcAddr",
        })?;
        let dst = self.dst.ok_or(LayerError::MissingField {
            layer: "Ipv4",
            field: "DstAddr",
        })?;

        let mut bytes = Vec::with_capacity(header_len);
        bytes.push((version << 4) | ihl);
        bytes.push((dscp << 2) | ecn);
        bytes.extend(total_length.to_be_bytes());
        bytes.extend(self.id.unwrap_or_else(rand::random).to_be_bytes());
        bytes.extend(((u16::from(flags) << 13) | frag_offset).to_be_bytes());
        bytes.push(self.ttl.unwrap_or(64));
        bytes.push(protocol);
        bytes.extend([0, 0]); // checksum, patched below
        bytes.extend(src.octets());
        bytes.extend(dst.octets());
        bytes.resize(header_len, 0); // zero-filled options region

        let checksum = match self.checksum {
            Some(checksum) => checksum,
            None => utils::internet_checksum(&bytes),
        };
        bytes[10..12].copy_from_slice(&checksum.to_be_bytes());
        Ok(bytes)
    }

    /// Decodes an IPv4 header, returning the layer together with the header
    /// length and the payload length advertised by the total-length field
    /// (clamped to the bytes actually present, so link-layer padding is not
    /// mistaken for payload).
    pub(crate) fn parse(bytes: &[u8]) -> Option<(Ipv4, usize, usize)> {
        if bytes.len() < MIN_HEADER_LEN {
            return None;
        }
        let ihl = bytes[0] & 0x0f;
        let header_len = usize::from(ihl) * 4;
        if ihl < 5 || bytes.len() < header_len {
            return None;
        }

        let total_length = u16::from_be_bytes(utils::to_array(bytes, 2)?);
        let flags_frag = u16::from_be_bytes(utils::to_array(bytes, 6)?);
        let ipv4 = Ipv4 {
            version: Some(bytes[0] >> 4),
            ihl: Some(ihl),
            dscp: Some(bytes[1] >> 2),
            ecn: Some(bytes[1] & 0x03),
            total_length: Some(total_length),
            id: Some(u16::from_be_bytes(utils::to_array(bytes, 4)?)),
            flags: Some((flags_frag >> 13) as u8),
            frag_offset: Some(flags_frag & 0x1fff),
            ttl: Some(bytes[8]),
            protocol: Some(bytes[9]),
            checksum: Some(u16::from_be_bytes(utils::to_array(bytes, 10)?)),
            src: Some(Ipv4Addr::from(utils::to_array::<4>(bytes, 12)?)),
            dst: Some(Ipv4Addr::from(utils::to_array::<4>(bytes, 16)?)),
        };

        let advertised = usize::from(total_length).saturating_sub(header_len);
        let payload_len = advertised.min(bytes.len() - header_len);
        Some((ipv4, header_len, payload_len))
    }
}

/// Builds the 12-byte IPv4 pseudo-header that transport checksums are
/// computed over. `layer` names the transport layer for error reporting.
pub(crate) fn pseudo_header(
    enclosing: Option<&Ipv4>,
    protocol: u8,
    segment_len: usize,
    layer: &'static str,
) -> Result<[u8; 12], LayerError> {
    let ip = enclosing.ok_or(LayerError::MissingEnclosing { layer })?;
    let src = ip.src.ok_or(LayerError::MissingField {
        layer: "Ipv4",
        field: "SrcAddr",
    })?;
    let dst = ip.dst.ok_or(LayerError::MissingField {
        layer: "Ipv4",
        field: "DstAddr",
    })?;
    let length = u16::try_from(segment_len).map_err(|_| LayerError::InvalidField {
        layer,
        field: "Length",
        reason: "segment exceeds 65535 bytes",
    })?;

    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&length.to_be_bytes());
    Ok(pseudo)
}
