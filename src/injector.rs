// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw frame transmission.
//!
//! An [`Injector`] owns an `AF_PACKET`/`SOCK_RAW` socket bound to the
//! configured device with protocol zero, so it transmits arbitrary
//! link-layer frames without ever receiving any.
//!
//! # Permissions
//!
//! Opening the socket requires the `CAP_NET_RAW` capability; without it,
//! construction fails with `EPERM`.

use std::io;
use std::{mem, ptr};

use tracing::debug;

use crate::config::Config;
use crate::connection::Inject;
use crate::error::Error;

/// A transmit socket writing raw Ethernet frames to the wire.
pub struct Injector {
    fd: libc::c_int,
}

impl Injector {
    /// Opens a transmit socket on the configured device.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let if_index = config.device_index()?;

        // Protocol zero: the socket never queues received packets.
        let fd = match unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, 0) } {
            ..=-1 => return Err(io::Error::last_os_error().into()),
            fd => fd,
        };

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
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

        debug!(device = %config.device, "injector attached");
        Ok(Injector { fd })
    }
}

impl Inject for Injector {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        match unsafe { libc::send(self.fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0) }
        {
            ..=-1 => Err(io::Error::last_os_error()),
            n if n as usize == frame.len() => Ok(()),
            n => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short frame write: {} of {} bytes", n, frame.len()),
            )),
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

impl Drop for Injector {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}
