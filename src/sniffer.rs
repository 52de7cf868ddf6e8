// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw frame capture.
//!
//! A [`Sniffer`] owns an `AF_PACKET`/`SOCK_RAW` socket bound to the
//! configured device with a kernel filter attached at construction, so the
//! only frames it ever returns are those addressed to the local MAC and
//! IPv4 address.
//!
//! # Permissions
//!
//! Opening the socket requires the `CAP_NET_RAW` capability; without it,
//! construction fails with `EPERM`.

use std::io;
use std::time::Duration;
use std::{mem, ptr};

use tracing::debug;

use crate::config::Config;
use crate::connection::Sniff;
use crate::error::Error;
use crate::filter::PacketFilter;

const RECV_BUFFER_LEN: usize = 1 << 16;

/// A capture socket returning frames addressed to the test host.
pub struct Sniffer {
    fd: libc::c_int,
}

impl Sniffer {
    /// Opens a capture socket on the configured device, filtered to frames
    /// destined for the configured local MAC/IPv4 addresses.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let if_index = config.device_index()?;

        let fd = match unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as libc::c_int,
            )
        } {
            ..=-1 => return Err(io::Error::last_os_error().into()),
            fd => fd,
        };

        // The filter must be in place before bind() starts packet delivery.
        let mut filter = PacketFilter::dst_host(config.local_mac, config.local_ipv4);
        if let Err(e) = filter.attach(fd) {
            unsafe { libc::close(fd) };
            return Err(e.into());
        }

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = if_index as libc::c_int;

        if unsafe {
            libc::bind(
                fd,
                ptr::addr_of!(addr) as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        } != 0
        {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err.into());
        }

        debug!(device = %config.device, "sniffer attached");
        Ok(Sniffer { fd })
    }
}

impl Sniff for Sniffer {
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        if timeout.is_zero() {
            return Ok(None);
        }
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        match unsafe { libc::poll(&mut pfd, 1, millis) } {
            ..=-1 => Err(io::Error::last_os_error()),
            0 => Ok(None),
            _ => {
                let mut buf = vec![0u8; RECV_BUFFER_LEN];
                match unsafe {
                    libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
                } {
                    ..=-1 => Err(io::Error::last_os_error()),
                    n => {
                        buf.truncate(n as usize);
                        Ok(Some(buf))
                    }
                }
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.fd < 0 {
            return Ok(());
        }
        match unsafe { libc::close(self.fd) } {
            0 => {
                self.fd = -1;
                Ok(())
            }
            _ => Err(io::Error::last_os_error()),
        }
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}
