// SPDX-License-Identifier: MIT OR Apache-2.0

//! Harness configuration.
//!
//! The test runner resolves the local and remote endpoint addresses once at
//! startup and hands an immutable [`Config`] to every connection factory;
//! nothing below the factories reads global state.

use std::ffi::CString;
use std::net::Ipv4Addr;

use crate::error::Error;
use crate::layers::l2::MacAddr;

/// Addresses of the two ends of the wire and the capture device to use.
///
/// `local_*` identify the test host, `remote_*` the device under test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub local_ipv4: Ipv4Addr,
    pub remote_ipv4: Ipv4Addr,
    pub local_mac: MacAddr,
    pub remote_mac: MacAddr,
    /// Name of the network interface that faces the device under test.
    pub device: String,
}

impl Config {
    /// Parses a configuration from the textual forms the harness flags use:
    /// dotted-quad IPv4 addresses and colon-separated MAC addresses.
    pub fn parse(
        local_ipv4: &str,
        remote_ipv4: &str,
        local_mac: &str,
        remote_mac: &str,
        device: &str,
    ) -> Result<Self, Error> {
        Ok(Config {
            local_ipv4: parse_ipv4("local_ipv4", local_ipv4)?,
            remote_ipv4: parse_ipv4("remote_ipv4", remote_ipv4)?,
            local_mac: parse_mac("local_mac", local_mac)?,
            remote_mac: parse_mac("remote_mac", remote_mac)?,
            device: device.to_string(),
        })
    }

    /// Resolves the configured device name to its kernel interface index.
    ///
    /// The capture and transmit sockets bind by index, so an unknown device
    /// surfaces here as a configuration error before any socket is opened.
    pub fn device_index(&self) -> Result<u32, Error> {
        let device = CString::new(self.device.as_str())
            .map_err(|_| Error::Config(format!("device {:?} contains a nul byte", self.device)))?;
        match unsafe { libc::if_nametoindex(device.as_ptr()) } {
            0 => Err(Error::Config(format!(
                "device {:?} not found",
                self.device
            ))),
            index => Ok(index),
        }
    }
}

fn parse_ipv4(flag: &str, value: &str) -> Result<Ipv4Addr, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{}: {:?} is not an IPv4 address", flag, value)))
}

fn parse_mac(flag: &str, value: &str) -> Result<MacAddr, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{}: {:?} is not a MAC address", flag, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_addresses() {
        let config = Config::parse(
            "192.0.2.1",
            "192.0.2.2",
            "02:42:c0:00:02:01",
            "02:42:c0:00:02:02",
            "eth2",
        )
        .unwrap();
        assert_eq!(config.local_ipv4, Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(config.remote_mac.octets(), [0x02, 0x42, 0xc0, 0x00, 0x02, 0x02]);
        assert_eq!(config.device, "eth2");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(Config::parse("192.0.2", "192.0.2.2", "02:42:c0:00:02:01", "02:42:c0:00:02:02", "eth2").is_err());
        assert!(Config::parse("192.0.2.1", "192.0.2.2", "02:42:c0:00:02", "02:42:c0:00:02:02", "eth2").is_err());
        assert!(Config::parse("192.0.2.1", "192.0.2.2", "02:42:c0:00:02:zz", "02:42:c0:00:02:02", "eth2").is_err());
    }

    fn config_for_device(device: &str) -> Config {
        Config::parse(
            "192.0.2.1",
            "192.0.2.2",
            "02:42:c0:00:02:01",
            "02:42:c0:00:02:02",
            device,
        )
        .unwrap()
    }

    #[test]
    fn loopback_device_resolves_to_an_index() {
        assert!(config_for_device("lo").device_index().unwrap() > 0);
    }

    #[test]
    fn unknown_device_is_a_config_error() {
        assert!(matches!(
            config_for_device("wirebench-does-not-exist").device_index(),
            Err(Error::Config(_))
        ));
    }
}
