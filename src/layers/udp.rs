// SPDX-License-Identifier: MIT OR Apache-2.0

//! The User Datagram Protocol (UDP) transport layer.

use crate::error::LayerError;
use crate::layers::ip::{self, Ipv4};
use crate::layers::optional_fields;
use crate::utils;

pub(crate) const UDP_HEADER_LEN: usize = 8;

/// A UDP header. Unset fields are wildcards when matching; the length and
/// checksum are computed at serialization when left unset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Udp {
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub length: Option<u16>,
    pub checksum: Option<u16>,
}

optional_fields!(Udp, {
    src_port => "SrcPort",
    dst_port => "DstPort",
    length => "Length",
    checksum => "Checksum",
});

impl Udp {
    #[inline]
    pub(crate) fn length(&self) -> usize {
        UDP_HEADER_LEN
    }

    pub(crate) fn serialize(
        &self,
        enclosing: Option<&Ipv4>,
        payload: &[u8],
    ) -> Result<Vec<u8>, LayerError> {
        let src_port = self.src_port.ok_or(LayerError::MissingField {
            layer: "Udp",
            field: "SrcPort",
        })?;
        let dst_port = self.dst_port.ok_or(LayerError::MissingField {
            layer: "Udp",
            field: "DstPort",
        })?;
        let length = match self.length {
            Some(length) => length,
            None => u16::try_from(UDP_HEADER_LEN + payload.len()).map_err(|_| {
                LayerError::InvalidField {
                    layer: "Udp",
                    field: "Length",
                    reason: "datagram exceeds 65535 bytes",
                }
            })?,
        };

        let mut bytes = Vec::with_capacity(UDP_HEADER_LEN);
        bytes.extend(src_port.to_be_bytes());
        bytes.extend(dst_port.to_be_bytes());
        bytes.extend(length.to_be_bytes());
        bytes.extend([0, 0]); // checksum, patched below

        let checksum = match self.checksum {
            Some(checksum) => checksum,
            None => {
                let pseudo = ip::pseudo_header(
                    enclosing,
                    ip::DATA_PROTO_UDP,
                    UDP_HEADER_LEN + payload.len(),
                    "Udp",
                )?;
                let mut summed = Vec::with_capacity(pseudo.len() + UDP_HEADER_LEN + payload.len());
                summed.extend(pseudo);
                summed.extend(&bytes);
                summed.extend(payload);
                match utils::internet_checksum(&summed) {
                    // A computed checksum of zero is transmitted as all ones;
                    // zero on the wire means "no checksum" (RFC 768).
                    0 => 0xffff,
                    sum => sum,
                }
            }
        };
        bytes[6..8].copy_from_slice(&checksum.to_be_bytes());
        Ok(bytes)
    }

    /// Decodes a UDP header, returning the layer and the payload length
    /// advertised by the length field (clamped to the bytes present).
    pub(crate) fn parse(bytes: &[u8]) -> Option<(Udp, usize)> {
        if bytes.len() < UDP_HEADER_LEN {
            return None;
        }
        let length = u16::from_be_bytes(utils::to_array(bytes, 4)?);
        let udp = Udp {
            src_port: Some(u16::from_be_bytes(utils::to_array(bytes, 0)?)),
            dst_port: Some(u16::from_be_bytes(utils::to_array(bytes, 2)?)),
            length: Some(length),
            checksum: Some(u16::from_be_bytes(utils::to_array(bytes, 6)?)),
        };
        let advertised = usize::from(length).saturating_sub(UDP_HEADER_LEN);
        let payload_len = advertised.min(bytes.len() - UDP_HEADER_LEN);
        Some((udp, payload_len))
    }
}
