// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classic BPF receive filters.
//!
//! Capture filtering happens in the kernel via `SO_ATTACH_FILTER`, so frames
//! that are not addressed to the test host never reach userspace.

use std::io;
use std::net::Ipv4Addr;
use std::{mem, ptr};

use crate::layers::l2::MacAddr;

// Classic BPF opcode constants (linux/filter.h); not yet exposed by libc.
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_ABS: u16 = 0x20;

const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

const ACCEPT_WHOLE_FRAME: u32 = u32::MAX;

#[inline]
const fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

#[inline]
const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// A classic BPF program that decides which frames a capture socket keeps.
pub struct PacketFilter {
    prog: Vec<libc::sock_filter>,
}

impl PacketFilter {
    /// A filter that drops every frame.
    pub fn reject_all() -> Self {
        PacketFilter {
            prog: vec![stmt(BPF_RET | BPF_K, 0)],
        }
    }

    /// A filter that accepts exactly the frames addressed to the given
    /// link-layer and IPv4 destination: destination MAC, EtherType 0x0800
    /// and IPv4 destination address all must match.
    pub fn dst_host(mac: MacAddr, addr: Ipv4Addr) -> Self {
        let m = mac.octets();
        let mac_hi = u32::from(u16::from_be_bytes([m[0], m[1]]));
        let mac_lo = u32::from_be_bytes([m[2], m[3], m[4], m[5]]);
        PacketFilter {
            prog: vec![
                stmt(BPF_LD | BPF_H | BPF_ABS, 0), // destination MAC, upper half
                jump(BPF_JMP | BPF_JEQ | BPF_K, mac_hi, 0, 7),
                stmt(BPF_LD | BPF_W | BPF_ABS, 2), // destination MAC, lower word
                jump(BPF_JMP | BPF_JEQ | BPF_K, mac_lo, 0, 5),
                stmt(BPF_LD | BPF_H | BPF_ABS, 12), // EtherType
                jump(BPF_JMP | BPF_JEQ | BPF_K, 0x0800, 0, 3),
                stmt(BPF_LD | BPF_W | BPF_ABS, 30), // IPv4 destination address
                jump(BPF_JMP | BPF_JEQ | BPF_K, u32::from(addr), 0, 1),
                stmt(BPF_RET | BPF_K, ACCEPT_WHOLE_FRAME),
                stmt(BPF_RET | BPF_K, 0),
            ],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.prog.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.prog.is_empty()
    }

    pub(crate) fn attach(&mut self, fd: libc::c_int) -> io::Result<()> {
        let prog = libc::sock_fprog {
            len: self.prog.len() as libc::c_ushort,
            filter: self.prog.as_mut_ptr(),
        };

        match unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                ptr::addr_of!(prog) as *const libc::c_void,
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}
