// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw-frame conformance testing for TCP/UDP devices under test.
//!
//! This crate drives stateful protocol exchanges from userspace: frames are
//! composed from per-layer templates merged with caller overrides, injected
//! through a raw packet socket, and received frames are matched field by
//! field against expectations in which every unset field is a wildcard. TCP
//! sequence and acknowledgement numbers are tracked across the exchange
//! without a TCP stack behind them, so tests can hold a device under test
//! to exact wire behavior.
//!
//! ```no_run
//! use std::time::Duration;
//! use wirebench::{Config, Payload, Tcp, TcpFlags, TcpIpv4};
//!
//! # fn main() -> Result<(), wirebench::Error> {
//! let config = Config::parse(
//!     "192.0.2.1",
//!     "192.0.2.2",
//!     "02:42:c0:00:02:01",
//!     "02:42:c0:00:02:02",
//!     "eth2",
//! )?;
//!
//! let mut conn = TcpIpv4::new(&config, Tcp { dst_port: Some(80), ..Tcp::default() }, Tcp::default())?;
//! conn.handshake()?;
//! conn.send(
//!     Tcp { flags: Some(TcpFlags::PSH | TcpFlags::ACK), ..Tcp::default() },
//!     &[Payload::new(*b"GET / HTTP/1.1\r\n\r\n").into()],
//! )?;
//! let response = conn.expect(
//!     Tcp { flags: Some(TcpFlags::ACK), ..Tcp::default() },
//!     Duration::from_secs(1),
//! )?;
//! assert!(response.window.is_some());
//! conn.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! Capturing and injecting raw frames requires the `CAP_NET_RAW`
//! capability.

pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod injector;
pub mod layers;
pub mod seq;
pub mod sniffer;
pub mod utils;

pub use config::Config;
pub use connection::{Connection, Inject, Sniff, TcpIpv4};
pub use error::Error;
pub use injector::Injector;
pub use layers::{Ether, Ipv4, Layer, Layers, MacAddr, Payload, Tcp, TcpFlags, Udp};
pub use seq::SeqNum;
pub use sniffer::Sniffer;
