// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Transmission Control Protocol (TCP) transport layer.

use core::fmt;

use bitflags::bitflags;

use crate::error::LayerError;
use crate::layers::ip::{self, Ipv4};
use crate::layers::optional_fields;
use crate::utils;

const MIN_HEADER_LEN: usize = 20;
const DEFAULT_WINDOW: u16 = 32768;

bitflags! {
    /// The nine TCP header flag bits.
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u16 {
        const FIN = 0b0_0000_0001;
        const SYN = 0b0_0000_0010;
        const RST = 0b0_0000_0100;
        const PSH = 0b0_0000_1000;
        const ACK = 0b0_0001_0000;
        const URG = 0b0_0010_0000;
        const ECE = 0b0_0100_0000;
        const CWR = 0b0_1000_0000;
        const NS  = 0b1_0000_0000;
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("0");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpFlags({})", self)
    }
}

/// A TCP header. Unset fields are wildcards when matching; when serializing
/// they fall back to protocol defaults or a checksum computed over the
/// enclosing IPv4 pseudo-header.
///
/// Options are not modeled: a data offset larger than five words emits a
/// zero-filled options region, and parsing skips over whatever options the
/// peer sent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tcp {
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub seq_num: Option<u32>,
    pub ack_num: Option<u32>,
    /// Header length in 32-bit words.
    pub data_offset: Option<u8>,
    pub flags: Option<TcpFlags>,
    pub window: Option<u16>,
    pub checksum: Option<u16>,
    pub urgent_ptr: Option<u16>,
}

optional_fields!(Tcp, {
    src_port => "SrcPort",
    dst_port => "DstPort",
    seq_num => "SeqNum",
    ack_num => "AckNum",
    data_offset => "DataOffset",
    flags => "Flags",
    window => "WindowSize",
    checksum => "Checksum",
    urgent_ptr => "UrgentPointer",
});

impl Tcp {
    #[inline]
    pub(crate) fn length(&self) -> usize {
        usize::from(self.data_offset.unwrap_or(5)) * 4
    }

    pub(crate) fn serialize(
        &self,
        enclosing: Option<&Ipv4>,
        payload: &[u8],
    ) -> Result<Vec<u8>, LayerError> {
        let src_port = self.src_port.ok_or(LayerError::MissingField {
            layer: "Tcp",
            field: "SrcPort",
        })?;
        let dst_port = self.dst_port.ok_or(LayerError::MissingField {
            layer: "Tcp",
            field: "DstPort",
        })?;
        let data_offset = self.data_offset.unwrap_or(5);
        if !(5..=15).contains(&data_offset) {
            return Err(LayerError::InvalidField {
                layer: "Tcp",
                field: "DataOffset",
                reason: "must be between 5 and 15 words",
            });
        }
        let header_len = usize::from(data_offset) * 4;
        let flags = self.flags.unwrap_or(TcpFlags::empty());

        let mut bytes = Vec::with_capacity(header_len);
        bytes.extend(src_port.to_be_bytes());
        bytes.extend(dst_port.to_be_bytes());
        bytes.extend(self.seq_num.unwrap_or(0).to_be_bytes());
        bytes.extend(self.ack_num.unwrap_or(0).to_be_bytes());
        bytes.push((data_offset << 4) | ((flags.bits() >> 8) & 0x01) as u8);
        bytes.push((flags.bits() & 0xff) as u8);
        bytes.extend(self.window.unwrap_or(DEFAULT_WINDOW).to_be_bytes());
        bytes.extend([0, 0]); // checksum, patched below
        bytes.extend(self.urgent_ptr.unwrap_or(0).to_be_bytes());
        bytes.resize(header_len, 0); // zero-filled options region

        let checksum = match self.checksum {
            Some(checksum) => checksum,
            None => {
                let pseudo = ip::pseudo_header(
                    enclosing,
                    ip::DATA_PROTO_TCP,
                    header_len + payload.len(),
                    "Tcp",
                )?;
                let mut summed = Vec::with_capacity(pseudo.len() + header_len + payload.len());
                summed.extend(pseudo);
                summed.extend(&bytes);
                summed.extend(payload);
                utils::internet_checksum(&summed)
            }
        };
        bytes[16..18].copy_from_slice(&checksum.to_be_bytes());
        Ok(bytes)
    }

    /// Decodes a TCP header, returning the layer and the header length so
    /// the caller can locate the segment payload.
    pub(crate) fn parse(bytes: &[u8]) -> Option<(Tcp, usize)> {
        if bytes.len() < MIN_HEADER_LEN {
            return None;
        }
        let data_offset = bytes[12] >> 4;
        let header_len = usize::from(data_offset) * 4;
        if data_offset < 5 || bytes.len() < header_len {
            return None;
        }

        let raw_flags = (u16::from(bytes[12] & 0x01) << 8) | u16::from(bytes[13]);
        let tcp = Tcp {
            src_port: Some(u16::from_be_bytes(utils::to_array(bytes, 0)?)),
            dst_port: Some(u16::from_be_bytes(utils::to_array(bytes, 2)?)),
            seq_num: Some(u32::from_be_bytes(utils::to_array(bytes, 4)?)),
            ack_num: Some(u32::from_be_bytes(utils::to_array(bytes, 8)?)),
            data_offset: Some(data_offset),
            flags: Some(TcpFlags::from_bits_truncate(raw_flags)),
            window: Some(u16::from_be_bytes(utils::to_array(bytes, 14)?)),
            checksum: Some(u16::from_be_bytes(utils::to_array(bytes, 16)?)),
            urgent_ptr: Some(u16::from_be_bytes(utils::to_array(bytes, 18)?)),
        };
        Some((tcp, header_len))
    }
}
