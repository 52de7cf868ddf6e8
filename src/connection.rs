// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stateful connections for exercising a device under test.
//!
//! A [`Connection`] composes one state object per protocol layer with a
//! transmit/capture socket pair. Outgoing frames are built from per-layer
//! templates merged with caller overrides; incoming frames are matched
//! against per-layer expectations in which any unset field is a wildcard.
//! After every frame sent or matched, each layer state updates itself from
//! the concrete bytes that crossed the wire, so TCP sequence and
//! acknowledgement numbers track the exchange without a TCP stack behind
//! them.
//!
//! All of a connection's state lives on the calling thread: the only
//! blocking point is the capture socket's timed receive, and nothing is
//! shared between connections.

use core::any::Any;
use std::io;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use std::{mem, ptr};

use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{CloseError, Error, LayerError, LayersError, MismatchError};
use crate::injector::Injector;
use crate::layers::{Ether, Ipv4, Layer, Layers, Payload, Tcp, TcpFlags, Udp};
use crate::seq::SeqNum;
use crate::sniffer::Sniffer;

/// How long a handshake waits for the SYN-ACK.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// An extension to [`Any`]; adds methods for retrieving a `dyn Any`
/// reference or mutable reference.
pub(crate) trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }

    #[inline]
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The frame-reception half of the wire: returns the next captured frame
/// within the timeout, or `None` when the timeout passes first.
pub trait Sniff {
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;

    fn close(&mut self) -> io::Result<()>;
}

/// The frame-transmission half of the wire.
pub trait Inject {
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

/// Per-layer connection state.
///
/// `sent` and `received` are handed the whole parsed frame along with the
/// index of this state's layer in it, so states whose updates depend on the
/// layers after their own (TCP advancing by the payload length) can see
/// them.
pub(crate) trait LayerState: AsAny {
    /// The canonical outgoing layer for a frame about to be sent. Callers
    /// own (and may mutate) the returned copy.
    fn outgoing(&self) -> Layer;

    /// The canonical expectation to match `observed` against, or `None`
    /// when `observed` is a layer variant this state cannot match. The
    /// observed layer is consulted where the expectation depends on it: the
    /// acknowledgement number is only expected when the observed segment
    /// actually carries the ACK flag.
    fn incoming(&self, observed: &Layer) -> Option<Layer>;

    /// Updates state from a frame that was put on the wire, as re-parsed
    /// from the transmitted bytes.
    fn sent(&mut self, _frame: &Layers, _idx: usize) -> Result<(), Error> {
        Ok(())
    }

    /// Updates state from a received frame that matched this connection's
    /// expectations.
    fn received(&mut self, _frame: &Layers, _idx: usize) -> Result<(), Error> {
        Ok(())
    }

    /// Releases any resources held.
    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

// =============================================================================
//                          Ephemeral port reservation
// =============================================================================

/// A kernel-reserved ephemeral port.
///
/// Binding a socket to port zero makes the kernel pick a free port; keeping
/// the descriptor open keeps that port out of reach of every other process
/// on the test host until [`close()`](Self::close) releases it.
#[derive(Debug)]
pub(crate) struct PortPicker {
    fd: libc::c_int,
    port: u16,
}

impl PortPicker {
    pub(crate) fn reserve(local: Ipv4Addr) -> io::Result<Self> {
        let fd = match unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) } {
            ..=-1 => return Err(io::Error::last_os_error()),
            fd => fd,
        };

        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr = libc::in_addr {
            s_addr: u32::from(local).to_be(),
        };

        if unsafe {
            libc::bind(
                fd,
                ptr::addr_of!(addr) as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        } != 0
        {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let mut bound: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        if unsafe {
            libc::getsockname(
                fd,
                ptr::addr_of_mut!(bound) as *mut libc::sockaddr,
                &mut len,
            )
        } != 0
        {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(PortPicker {
            fd,
            port: u16::from_be(bound.sin_port),
        })
    }

    #[cfg(test)]
    pub(crate) fn fake(port: u16) -> Self {
        PortPicker { fd: -1, port }
    }

    #[inline]
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn close(&mut self) -> io::Result<()> {
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

impl Drop for PortPicker {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

// =============================================================================
//                            Concrete layer states
// =============================================================================

/// Link-layer state: fixed outgoing and mirrored incoming MAC addresses.
struct EtherState {
    out: Ether,
    inn: Ether,
}

impl EtherState {
    fn new(config: &Config, out: Ether, inn: Ether) -> Self {
        let mut state = EtherState {
            out: Ether {
                src: Some(config.local_mac),
                dst: Some(config.remote_mac),
                ..Ether::default()
            },
            inn: Ether {
                src: Some(config.remote_mac),
                dst: Some(config.local_mac),
                ..Ether::default()
            },
        };
        state.out.merge_fields(&out);
        state.inn.merge_fields(&inn);
        state
    }
}

impl LayerState for EtherState {
    fn outgoing(&self) -> Layer {
        Layer::Ether(self.out.clone())
    }

    fn incoming(&self, observed: &Layer) -> Option<Layer> {
        match observed {
            Layer::Ether(_) => Some(Layer::Ether(self.inn.clone())),
            _ => None,
        }
    }
}

/// Network-layer state: fixed outgoing and mirrored incoming IPv4 addresses.
struct Ipv4State {
    out: Ipv4,
    inn: Ipv4,
}

impl Ipv4State {
    fn new(config: &Config, out: Ipv4, inn: Ipv4) -> Self {
        let mut state = Ipv4State {
            out: Ipv4 {
                src: Some(config.local_ipv4),
                dst: Some(config.remote_ipv4),
                ..Ipv4::default()
            },
            inn: Ipv4 {
                src: Some(config.remote_ipv4),
                dst: Some(config.local_ipv4),
                ..Ipv4::default()
            },
        };
        state.out.merge_fields(&out);
        state.inn.merge_fields(&inn);
        state
    }
}

impl LayerState for Ipv4State {
    fn outgoing(&self) -> Layer {
        Layer::Ipv4(self.out.clone())
    }

    fn incoming(&self, observed: &Layer) -> Option<Layer> {
        match observed {
            Layer::Ipv4(_) => Some(Layer::Ipv4(self.inn.clone())),
            _ => None,
        }
    }
}

/// UDP state: a reserved local port written into outgoing source and
/// incoming destination ports.
struct UdpState {
    out: Udp,
    inn: Udp,
    port_picker: PortPicker,
}

impl UdpState {
    fn new(config: &Config, out: Udp, inn: Udp) -> Result<Self, Error> {
        let port_picker = PortPicker::reserve(config.local_ipv4)?;
        let local_port = port_picker.port();
        let mut state = UdpState {
            out: Udp {
                src_port: Some(local_port),
                ..Udp::default()
            },
            inn: Udp {
                dst_port: Some(local_port),
                ..Udp::default()
            },
            port_picker,
        };
        state.out.merge_fields(&out);
        state.inn.merge_fields(&inn);
        Ok(state)
    }
}

impl LayerState for UdpState {
    fn outgoing(&self) -> Layer {
        Layer::Udp(self.out.clone())
    }

    fn incoming(&self, observed: &Layer) -> Option<Layer> {
        match observed {
            Layer::Udp(_) => Some(Layer::Udp(self.inn.clone())),
            _ => None,
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.port_picker.close()?;
        Ok(())
    }
}

/// TCP state: a reserved local port plus both halves of the sequence-number
/// exchange. `local_seq` starts at a random initial sequence number and is
/// advanced by every byte (and SYN/FIN) this side sends; `remote_seq`
/// mirrors the peer and is unset until the first segment arrives.
struct TcpState {
    out: Tcp,
    inn: Tcp,
    local_seq: SeqNum,
    remote_seq: Option<SeqNum>,
    syn_ack: Option<Tcp>,
    port_picker: PortPicker,
}

impl TcpState {
    fn new(config: &Config, out: Tcp, inn: Tcp) -> Result<Self, Error> {
        let port_picker = PortPicker::reserve(config.local_ipv4)?;
        let local_port = port_picker.port();
        let mut state = TcpState {
            out: Tcp {
                src_port: Some(local_port),
                ..Tcp::default()
            },
            inn: Tcp {
                dst_port: Some(local_port),
                ..Tcp::default()
            },
            local_seq: SeqNum::random(),
            remote_seq: None,
            syn_ack: None,
            port_picker,
        };
        state.out.merge_fields(&out);
        state.inn.merge_fields(&inn);
        Ok(state)
    }

    /// The byte length of everything after the layer at `idx`.
    fn tail_len(frame: &Layers, idx: usize) -> usize {
        frame.as_slice()[idx + 1..].iter().map(Layer::length).sum()
    }

    fn segment<'a>(&self, frame: &'a Layers, idx: usize) -> Result<&'a Tcp, Error> {
        match frame.get(idx) {
            Some(Layer::Tcp(tcp)) => Ok(tcp),
            Some(other) => Err(LayerError::StateMismatch {
                layer: "Tcp",
                found: other.name(),
            }
            .into()),
            None => Err(LayerError::StateMismatch {
                layer: "Tcp",
                found: "missing",
            }
            .into()),
        }
    }
}

impl LayerState for TcpState {
    fn outgoing(&self) -> Layer {
        let mut out = self.out.clone();
        out.seq_num = Some(self.local_seq.value());
        if let Some(remote_seq) = self.remote_seq {
            out.ack_num = Some(remote_seq.value());
        }
        Layer::Tcp(out)
    }

    fn incoming(&self, observed: &Layer) -> Option<Layer> {
        let Layer::Tcp(observed_tcp) = observed else {
            return None;
        };
        let mut inn = self.inn.clone();
        if let Some(remote_seq) = self.remote_seq {
            inn.seq_num = Some(remote_seq.value());
        }
        // The acknowledgement number is only meaningful when the observed
        // segment carries ACK; otherwise it stays a wildcard.
        if observed_tcp.flags.map_or(false, |f| f.contains(TcpFlags::ACK)) {
            inn.ack_num = Some(self.local_seq.value());
        }
        Some(Layer::Tcp(inn))
    }

    fn sent(&mut self, frame: &Layers, idx: usize) -> Result<(), Error> {
        let tcp = self.segment(frame, idx)?;
        let flags = tcp.flags;
        self.local_seq.update_forward(Self::tail_len(frame, idx));
        if flags.map_or(false, |f| f.intersects(TcpFlags::SYN | TcpFlags::FIN)) {
            self.local_seq.update_forward(1);
        }
        Ok(())
    }

    fn received(&mut self, frame: &Layers, idx: usize) -> Result<(), Error> {
        let tcp = self.segment(frame, idx)?;
        let Some(seq_num) = tcp.seq_num else {
            return Err(LayerError::MissingField {
                layer: "Tcp",
                field: "SeqNum",
            }
            .into());
        };
        let mut remote_seq = SeqNum::new(seq_num);
        if tcp.flags.map_or(false, |f| f.intersects(TcpFlags::SYN | TcpFlags::FIN)) {
            remote_seq.update_forward(1);
        }
        remote_seq.update_forward(Self::tail_len(frame, idx));
        self.remote_seq = Some(remote_seq);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.port_picker.close()?;
        Ok(())
    }
}

// =============================================================================
//                             The connection engine
// =============================================================================

/// An ordered stack of layer states plus the socket pair that carries their
/// frames.
pub struct Connection {
    layer_states: Vec<Box<dyn LayerState>>,
    injector: Box<dyn Inject>,
    sniffer: Box<dyn Sniff>,
}

impl Connection {
    pub(crate) fn new(
        layer_states: Vec<Box<dyn LayerState>>,
        injector: Box<dyn Inject>,
        sniffer: Box<dyn Sniff>,
    ) -> Self {
        assert!(
            !layer_states.is_empty(),
            "a connection needs at least one layer state"
        );
        Connection {
            layer_states,
            injector,
            sniffer,
        }
    }

    /// Creates a UDP/IPv4 connection with the usual defaults: configured
    /// MAC and IPv4 endpoints, and a freshly reserved local port.
    pub fn udp_ipv4(config: &Config, outgoing: Udp, incoming: Udp) -> Result<Self, Error> {
        let ether = EtherState::new(config, Ether::default(), Ether::default());
        let ipv4 = Ipv4State::new(config, Ipv4::default(), Ipv4::default());
        let udp = UdpState::new(config, outgoing, incoming)?;
        let injector = Injector::new(config)?;
        let sniffer = Sniffer::new(config)?;
        Ok(Connection::new(
            vec![Box::new(ether), Box::new(ipv4), Box::new(udp)],
            Box::new(injector),
            Box::new(sniffer),
        ))
    }

    /// Builds a frame from every state's outgoing template, with `layer`
    /// merged into the innermost of them and `additional` layers appended
    /// after it.
    pub fn create_frame(&self, layer: &Layer, additional: &[Layer]) -> Result<Layers, Error> {
        let mut layers: Vec<Layer> = self
            .layer_states
            .iter()
            .map(|state| state.outgoing())
            .collect();
        layers
            .last_mut()
            .expect("connection has no layer states")
            .merge(layer)?;
        layers.extend(additional.iter().cloned());
        Ok(Layers::new(layers))
    }

    /// Serializes `frame`, puts it on the wire and updates every layer
    /// state from the bytes actually transmitted.
    ///
    /// The transmitted bytes are re-parsed before the state update: the
    /// caller may have left fields unset for the serializer to fill in
    /// (lengths, checksums, identifiers), and state must reflect the
    /// concrete values that went out, not the skeleton.
    pub fn send_frame(&mut self, frame: &Layers) -> Result<(), Error> {
        let bytes = frame.to_bytes()?;
        self.injector.send(&bytes)?;
        debug!(frame = %frame, len = bytes.len(), "frame injected");

        let sent = Layers::parse(&bytes);
        for (idx, state) in self.layer_states.iter_mut().enumerate() {
            state.sent(&sent, idx)?;
        }
        Ok(())
    }

    /// Sends a frame with reasonable defaults, `layer` overriding the
    /// innermost layer state and `additional` layers appended after it.
    pub fn send(&mut self, layer: &Layer, additional: &[Layer]) -> Result<(), Error> {
        let frame = self.create_frame(layer, additional)?;
        self.send_frame(&frame)
    }

    /// The default expectation for a received frame, built by consulting
    /// each layer state with the corresponding observed layer. `None` when
    /// the frame has too few layers or a state cannot match its layer's
    /// variant. A frame with more layers than states can still match; the
    /// extra layers are unconstrained.
    fn incoming(&self, observed: &Layers) -> Option<Layers> {
        if observed.len() < self.layer_states.len() {
            return None;
        }
        let mut expectation = Vec::with_capacity(self.layer_states.len());
        for (idx, state) in self.layer_states.iter().enumerate() {
            expectation.push(state.incoming(&observed[idx])?);
        }
        Some(Layers::new(expectation))
    }

    /// Waits until a frame matching `expected` arrives, or until `timeout`
    /// passes.
    ///
    /// Each received frame is parsed and matched against the per-state
    /// expectations overlaid with `expected` (index-aligned; `None` entries
    /// constrain nothing). The first matching frame updates every layer
    /// state and is returned whole, trailing layers included. When the
    /// deadline passes, the error carries the field-wise diff of every
    /// rejected candidate, or [`Error::NoFrames`] if nothing was ever
    /// rejected.
    pub fn expect_frame(
        &mut self,
        expected: &[Option<Layer>],
        timeout: Duration,
    ) -> Result<Layers, Error> {
        let deadline = Instant::now() + timeout;
        let mut rejections: Vec<LayersError> = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let bytes = if remaining.is_zero() {
                None
            } else {
                self.sniffer.recv(remaining)?
            };
            let Some(bytes) = bytes else {
                return Err(if rejections.is_empty() {
                    Error::NoFrames
                } else {
                    MismatchError { rejections }.into()
                });
            };

            let got = Layers::parse(&bytes);
            let Some(mut to_match) = self.incoming(&got) else {
                trace!(got = %got, "frame skipped: too few layers or wrong shape");
                continue;
            };
            if let Err(err) = to_match.merge(expected) {
                trace!(got = %got, %err, "frame skipped: expectation does not align");
                continue;
            }
            if to_match.matches(&got) {
                for (idx, state) in self.layer_states.iter_mut().enumerate() {
                    state.received(&got, idx)?;
                }
                return Ok(got);
            }
            trace!(got = %got, "frame rejected");
            rejections.push(LayersError {
                got,
                want: to_match,
            });
        }
    }

    /// Waits for a frame whose innermost state layer matches `layer`,
    /// returning that layer of the received frame.
    pub fn expect(&mut self, layer: Layer, timeout: Duration) -> Result<Layer, Error> {
        let mut expected: Vec<Option<Layer>> = vec![None; self.layer_states.len()];
        *expected
            .last_mut()
            .expect("connection has no layer states") = Some(layer);

        let frame = self.expect_frame(&expected, timeout)?;
        let idx = self.layer_states.len() - 1;
        Ok(frame
            .get(idx)
            .expect("matched frame shorter than the connection's layer states")
            .clone())
    }

    /// Releases the sockets and every layer state's resources, aggregating
    /// all failures rather than stopping at the first.
    pub fn close(&mut self) -> Result<(), Error> {
        let mut errors: Vec<Error> = Vec::new();
        if let Err(err) = self.sniffer.close() {
            errors.push(err.into());
        }
        if let Err(err) = self.injector.close() {
            errors.push(err.into());
        }
        for state in &mut self.layer_states {
            if let Err(err) = state.close() {
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            debug!(count = errors.len(), "close failures");
            Err(CloseError { errors }.into())
        }
    }
}

// =============================================================================
//                           TCP/IPv4 specialization
// =============================================================================

/// A TCP-over-IPv4 connection with typed send/expect wrappers and the
/// three-way handshake.
pub struct TcpIpv4 {
    conn: Connection,
}

impl TcpIpv4 {
    /// Creates a TCP/IPv4 connection with the usual defaults: configured
    /// MAC and IPv4 endpoints, a freshly reserved local port and a random
    /// initial sequence number.
    pub fn new(config: &Config, outgoing: Tcp, incoming: Tcp) -> Result<Self, Error> {
        let ether = EtherState::new(config, Ether::default(), Ether::default());
        let ipv4 = Ipv4State::new(config, Ipv4::default(), Ipv4::default());
        let tcp = TcpState::new(config, outgoing, incoming)?;
        let injector = Injector::new(config)?;
        let sniffer = Sniffer::new(config)?;
        Ok(TcpIpv4 {
            conn: Connection::new(
                vec![Box::new(ether), Box::new(ipv4), Box::new(tcp)],
                Box::new(injector),
                Box::new(sniffer),
            ),
        })
    }

    /// Performs the TCP three-way handshake: SYN out, SYN-ACK expected
    /// within one second, ACK out. The captured SYN-ACK segment is retained
    /// by the TCP state.
    pub fn handshake(&mut self) -> Result<(), Error> {
        self.send(
            Tcp {
                flags: Some(TcpFlags::SYN),
                ..Tcp::default()
            },
            &[],
        )?;

        let syn_ack = self.expect(
            Tcp {
                flags: Some(TcpFlags::SYN | TcpFlags::ACK),
                ..Tcp::default()
            },
            HANDSHAKE_TIMEOUT,
        )?;
        self.tcp_state_mut().syn_ack = Some(syn_ack);

        self.send(
            Tcp {
                flags: Some(TcpFlags::ACK),
                ..Tcp::default()
            },
            &[],
        )
    }

    /// Sends a segment with reasonable defaults, `tcp` overriding the TCP
    /// layer and `additional` layers (typically a payload) appended.
    pub fn send(&mut self, tcp: Tcp, additional: &[Layer]) -> Result<(), Error> {
        self.conn.send(&Layer::Tcp(tcp), additional)
    }

    /// Waits for a segment matching `tcp`, returning the received TCP
    /// layer.
    pub fn expect(&mut self, tcp: Tcp, timeout: Duration) -> Result<Tcp, Error> {
        match self.conn.expect(Layer::Tcp(tcp), timeout)? {
            Layer::Tcp(got) => Ok(got),
            other => panic!("expected the matched {} layer to be Tcp", other.name()),
        }
    }

    /// Waits for a segment matching `tcp`, with `payload` (when given)
    /// matched as a trailing layer after it. The whole received frame is
    /// returned.
    pub fn expect_data(
        &mut self,
        tcp: Tcp,
        payload: Option<Payload>,
        timeout: Duration,
    ) -> Result<Layers, Error> {
        let mut expected: Vec<Option<Layer>> = vec![None; self.conn.layer_states.len()];
        *expected
            .last_mut()
            .expect("connection has no layer states") = Some(Layer::Tcp(tcp));
        if let Some(payload) = payload {
            expected.push(Some(Layer::Payload(payload)));
        }
        self.conn.expect_frame(&expected, timeout)
    }

    /// The next sequence number expected from the device under test, or
    /// `None` before any TCP segment has been received.
    pub fn remote_seq_num(&self) -> Option<SeqNum> {
        self.tcp_state().remote_seq
    }

    /// This side's next sequence number.
    pub fn local_seq_num(&self) -> SeqNum {
        self.tcp_state().local_seq
    }

    pub(crate) fn syn_ack(&self) -> Option<&Tcp> {
        self.tcp_state().syn_ack.as_ref()
    }

    /// Releases all resources held by the connection.
    pub fn close(&mut self) -> Result<(), Error> {
        self.conn.close()
    }

    fn tcp_state(&self) -> &TcpState {
        self.conn
            .layer_states
            .last()
            .expect("connection has no layer states")
            .as_ref()
            .as_any()
            .downcast_ref::<TcpState>()
            .expect("the final layer state of a TCP/IPv4 connection must be TCP")
    }

    fn tcp_state_mut(&mut self) -> &mut TcpState {
        self.conn
            .layer_states
            .last_mut()
            .expect("connection has no layer states")
            .as_mut()
            .as_any_mut()
            .downcast_mut::<TcpState>()
            .expect("the final layer state of a TCP/IPv4 connection must be TCP")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::MacAddr;

    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::thread;

    const LOCAL_MAC: [u8; 6] = [0x02, 0x42, 0xc0, 0x00, 0x02, 0x01];
    const REMOTE_MAC: [u8; 6] = [0x02, 0x42, 0xc0, 0x00, 0x02, 0x02];
    const LOCAL_PORT: u16 = 30000;
    const REMOTE_PORT: u16 = 8080;
    const ISN: u32 = 1000;

    fn test_config() -> Config {
        Config {
            local_ipv4: Ipv4Addr::new(192, 0, 2, 1),
            remote_ipv4: Ipv4Addr::new(192, 0, 2, 2),
            local_mac: MacAddr::new(LOCAL_MAC),
            remote_mac: MacAddr::new(REMOTE_MAC),
            device: "testdev".to_string(),
        }
    }

    struct ScriptedSniffer {
        frames: VecDeque<Vec<u8>>,
        closed: Rc<RefCell<bool>>,
    }

    impl Sniff for ScriptedSniffer {
        fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
            match self.frames.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None => {
                    thread::sleep(timeout);
                    Ok(None)
                }
            }
        }

        fn close(&mut self) -> io::Result<()> {
            *self.closed.borrow_mut() = true;
            Ok(())
        }
    }

    struct RecordingInjector {
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl Inject for RecordingInjector {
        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            self.sent.borrow_mut().push(frame.to_vec());
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct TestWire {
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
        sniffer_closed: Rc<RefCell<bool>>,
    }

    fn test_tcp_state() -> TcpState {
        TcpState {
            out: Tcp {
                src_port: Some(LOCAL_PORT),
                dst_port: Some(REMOTE_PORT),
                ..Tcp::default()
            },
            inn: Tcp {
                dst_port: Some(LOCAL_PORT),
                src_port: Some(REMOTE_PORT),
                ..Tcp::default()
            },
            local_seq: SeqNum::new(ISN),
            remote_seq: None,
            syn_ack: None,
            port_picker: PortPicker::fake(LOCAL_PORT),
        }
    }

    fn test_tcp_conn(frames: Vec<Vec<u8>>) -> (TcpIpv4, TestWire) {
        let config = test_config();
        let wire = TestWire {
            sent: Rc::new(RefCell::new(Vec::new())),
            sniffer_closed: Rc::new(RefCell::new(false)),
        };
        let conn = Connection::new(
            vec![
                Box::new(EtherState::new(&config, Ether::default(), Ether::default())),
                Box::new(Ipv4State::new(&config, Ipv4::default(), Ipv4::default())),
                Box::new(test_tcp_state()),
            ],
            Box::new(RecordingInjector {
                sent: wire.sent.clone(),
            }),
            Box::new(ScriptedSniffer {
                frames: frames.into(),
                closed: wire.sniffer_closed.clone(),
            }),
        );
        (TcpIpv4 { conn }, wire)
    }

    /// A frame as the device under test would send it, addressed to the
    /// local endpoint.
    fn remote_frame(tcp: Tcp, payload: Option<Payload>) -> Vec<u8> {
        let config = test_config();
        let mut layers = vec![
            Layer::Ether(Ether {
                dst: Some(config.local_mac),
                src: Some(config.remote_mac),
                ..Ether::default()
            }),
            Layer::Ipv4(Ipv4 {
                src: Some(config.remote_ipv4),
                dst: Some(config.local_ipv4),
                ..Ipv4::default()
            }),
            Layer::Tcp(Tcp {
                src_port: Some(REMOTE_PORT),
                dst_port: Some(LOCAL_PORT),
                ..tcp
            }),
        ];
        if let Some(payload) = payload {
            layers.push(Layer::Payload(payload));
        }
        Layers::new(layers).to_bytes().unwrap()
    }

    fn sent_tcp(wire: &TestWire, idx: usize) -> Tcp {
        let sent = wire.sent.borrow();
        let parsed = Layers::parse(&sent[idx]);
        let Layer::Tcp(tcp) = &parsed[2] else {
            panic!("sent frame {} has no TCP layer: {}", idx, parsed);
        };
        tcp.clone()
    }

    #[test]
    fn local_seq_advances_by_one_on_syn_and_fin() {
        let mut state = test_tcp_state();
        let frame = Layers::new(vec![
            Layer::Ether(Ether::default()),
            Layer::Ipv4(Ipv4::default()),
            Layer::Tcp(Tcp {
                flags: Some(TcpFlags::SYN),
                ..Tcp::default()
            }),
        ]);
        state.sent(&frame, 2).unwrap();
        assert_eq!(state.local_seq, SeqNum::new(ISN + 1));
    }

    #[test]
    fn local_seq_advances_by_payload_length() {
        let mut state = test_tcp_state();
        let frame = Layers::new(vec![
            Layer::Ether(Ether::default()),
            Layer::Ipv4(Ipv4::default()),
            Layer::Tcp(Tcp {
                flags: Some(TcpFlags::ACK),
                ..Tcp::default()
            }),
            Layer::Payload(Payload::new(vec![0u8; 100])),
        ]);
        state.sent(&frame, 2).unwrap();
        assert_eq!(state.local_seq, SeqNum::new(ISN + 100));
    }

    #[test]
    fn remote_seq_initializes_from_received_syn() {
        let mut state = test_tcp_state();
        let frame = Layers::new(vec![
            Layer::Ether(Ether::default()),
            Layer::Ipv4(Ipv4::default()),
            Layer::Tcp(Tcp {
                seq_num: Some(5000),
                flags: Some(TcpFlags::SYN),
                ..Tcp::default()
            }),
        ]);
        state.received(&frame, 2).unwrap();
        assert_eq!(state.remote_seq, Some(SeqNum::new(5001)));
    }

    #[test]
    fn state_update_rejects_wrong_layer_variant() {
        let mut state = test_tcp_state();
        let frame = Layers::new(vec![Layer::Udp(Udp::default())]);
        assert!(state.sent(&frame, 0).is_err());
        assert!(state.received(&frame, 0).is_err());
    }

    #[test]
    fn incoming_leaves_ack_num_wildcard_without_ack_flag() {
        let state = test_tcp_state();
        let observed = Layer::Tcp(Tcp {
            flags: Some(TcpFlags::FIN),
            ..Tcp::default()
        });
        let Some(Layer::Tcp(expectation)) = state.incoming(&observed) else {
            panic!("incoming() must produce a TCP expectation");
        };
        assert_eq!(expectation.ack_num, None);

        let observed = Layer::Tcp(Tcp {
            flags: Some(TcpFlags::FIN | TcpFlags::ACK),
            ..Tcp::default()
        });
        let Some(Layer::Tcp(expectation)) = state.incoming(&observed) else {
            panic!("incoming() must produce a TCP expectation");
        };
        assert_eq!(expectation.ack_num, Some(ISN));
    }

    #[test]
    fn incoming_rejects_wrong_layer_variant() {
        let state = test_tcp_state();
        assert!(state.incoming(&Layer::Udp(Udp::default())).is_none());
    }

    #[test]
    fn create_frame_lets_caller_override_state_values() {
        let (conn, _wire) = test_tcp_conn(Vec::new());
        let frame = conn
            .conn
            .create_frame(
                &Layer::Tcp(Tcp {
                    seq_num: Some(777),
                    flags: Some(TcpFlags::RST),
                    ..Tcp::default()
                }),
                &[],
            )
            .unwrap();
        let Layer::Tcp(tcp) = &frame[2] else {
            panic!("innermost layer must be TCP");
        };
        assert_eq!(tcp.seq_num, Some(777));
        assert_eq!(tcp.src_port, Some(LOCAL_PORT));
    }

    #[test]
    fn handshake_traces_syn_synack_ack() {
        let syn_ack = remote_frame(
            Tcp {
                seq_num: Some(5000),
                ack_num: Some(ISN + 1),
                flags: Some(TcpFlags::SYN | TcpFlags::ACK),
                ..Tcp::default()
            },
            None,
        );
        let (mut conn, wire) = test_tcp_conn(vec![syn_ack]);
        conn.handshake().unwrap();

        let syn = sent_tcp(&wire, 0);
        assert_eq!(syn.flags, Some(TcpFlags::SYN));
        assert_eq!(syn.seq_num, Some(ISN));

        let ack = sent_tcp(&wire, 1);
        assert_eq!(ack.flags, Some(TcpFlags::ACK));
        assert_eq!(ack.seq_num, Some(ISN + 1));
        assert_eq!(ack.ack_num, Some(5001));

        assert_eq!(conn.remote_seq_num(), Some(SeqNum::new(5001)));
        assert_eq!(conn.local_seq_num(), SeqNum::new(ISN + 1));
        assert_eq!(conn.syn_ack().and_then(|t| t.seq_num), Some(5000));
    }

    #[test]
    fn data_segment_after_handshake_carries_updated_numbers() {
        let syn_ack = remote_frame(
            Tcp {
                seq_num: Some(5000),
                ack_num: Some(ISN + 1),
                flags: Some(TcpFlags::SYN | TcpFlags::ACK),
                ..Tcp::default()
            },
            None,
        );
        let (mut conn, wire) = test_tcp_conn(vec![syn_ack]);
        conn.handshake().unwrap();

        conn.send(
            Tcp {
                flags: Some(TcpFlags::PSH | TcpFlags::ACK),
                ..Tcp::default()
            },
            &[Layer::Payload(Payload::new(*b"hello"))],
        )
        .unwrap();

        let data = sent_tcp(&wire, 2);
        assert_eq!(data.seq_num, Some(ISN + 1));
        assert_eq!(data.ack_num, Some(5001));
        assert_eq!(conn.local_seq_num(), SeqNum::new(ISN + 6));
    }

    #[test]
    fn expect_matches_despite_unspecified_fields() {
        let ack = remote_frame(
            Tcp {
                seq_num: Some(4000),
                ack_num: Some(ISN),
                flags: Some(TcpFlags::ACK),
                window: Some(123),
                urgent_ptr: Some(77),
                ..Tcp::default()
            },
            None,
        );
        let (mut conn, _wire) = test_tcp_conn(vec![ack]);
        let got = conn
            .expect(
                Tcp {
                    flags: Some(TcpFlags::ACK),
                    ..Tcp::default()
                },
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(got.window, Some(123));
        assert_eq!(got.urgent_ptr, Some(77));
    }

    #[test]
    fn expect_mismatch_reports_field_diff() {
        let fin_ack = remote_frame(
            Tcp {
                seq_num: Some(4000),
                ack_num: Some(ISN),
                flags: Some(TcpFlags::FIN | TcpFlags::ACK),
                ..Tcp::default()
            },
            None,
        );
        let (mut conn, _wire) = test_tcp_conn(vec![fin_ack]);
        let err = conn
            .expect(
                Tcp {
                    flags: Some(TcpFlags::RST),
                    ..Tcp::default()
                },
                Duration::from_millis(100),
            )
            .unwrap_err();
        let Error::Mismatch(mismatch) = &err else {
            panic!("want a mismatch error, got: {}", err);
        };
        assert_eq!(mismatch.rejections.len(), 1);
        let report = err.to_string();
        assert!(
            report.contains("Flags: got FIN|ACK, want RST"),
            "report was: {report}"
        );
    }

    #[test]
    fn short_frames_are_skipped_without_matching_or_erroring() {
        let garbage = vec![vec![0xde, 0xad, 0xbe, 0xef, 1, 2, 3, 4]; 3];
        let (mut conn, _wire) = test_tcp_conn(garbage);

        let start = Instant::now();
        let err = conn
            .expect(
                Tcp {
                    flags: Some(TcpFlags::ACK),
                    ..Tcp::default()
                },
                Duration::from_millis(150),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoFrames), "got: {}", err);
        assert!(start.elapsed() >= Duration::from_millis(140));
    }

    #[test]
    fn expect_deadline_is_honored() {
        let (mut conn, _wire) = test_tcp_conn(Vec::new());
        let start = Instant::now();
        let err = conn
            .expect(
                Tcp {
                    flags: Some(TcpFlags::ACK),
                    ..Tcp::default()
                },
                Duration::from_millis(100),
            )
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, Error::NoFrames));
        assert!(elapsed >= Duration::from_millis(95), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "returned after {elapsed:?}");
    }

    #[test]
    fn zero_timeout_returns_no_frames_immediately() {
        let (mut conn, _wire) = test_tcp_conn(Vec::new());
        let err = conn
            .expect(Tcp::default(), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::NoFrames));
    }

    #[test]
    fn expect_data_returns_trailing_payload_and_advances_remote() {
        let syn_ack = remote_frame(
            Tcp {
                seq_num: Some(5000),
                ack_num: Some(ISN + 1),
                flags: Some(TcpFlags::SYN | TcpFlags::ACK),
                ..Tcp::default()
            },
            None,
        );
        let data = remote_frame(
            Tcp {
                seq_num: Some(5001),
                ack_num: Some(ISN + 1),
                flags: Some(TcpFlags::PSH | TcpFlags::ACK),
                ..Tcp::default()
            },
            Some(Payload::new(*b"hello")),
        );
        let (mut conn, _wire) = test_tcp_conn(vec![syn_ack, data]);
        conn.handshake().unwrap();

        let frame = conn
            .expect_data(
                Tcp {
                    flags: Some(TcpFlags::PSH | TcpFlags::ACK),
                    ..Tcp::default()
                },
                Some(Payload::new(*b"hello")),
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(frame.len(), 4);
        assert_eq!(conn.remote_seq_num(), Some(SeqNum::new(5006)));
    }

    #[test]
    fn close_releases_everything_and_is_idempotent() {
        let (mut conn, wire) = test_tcp_conn(Vec::new());
        conn.close().unwrap();
        assert!(*wire.sniffer_closed.borrow());
        conn.close().unwrap();
    }

    #[test]
    fn close_aggregates_failures() {
        struct FailingSniffer;
        impl Sniff for FailingSniffer {
            fn recv(&mut self, _timeout: Duration) -> io::Result<Option<Vec<u8>>> {
                Ok(None)
            }
            fn close(&mut self) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "sniffer stuck"))
            }
        }
        struct FailingInjector;
        impl Inject for FailingInjector {
            fn send(&mut self, _frame: &[u8]) -> io::Result<()> {
                Ok(())
            }
            fn close(&mut self) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "injector stuck"))
            }
        }

        let config = test_config();
        let mut conn = Connection::new(
            vec![Box::new(EtherState::new(
                &config,
                Ether::default(),
                Ether::default(),
            ))],
            Box::new(FailingInjector),
            Box::new(FailingSniffer),
        );
        let err = conn.close().unwrap_err();
        let Error::Close(close_err) = err else {
            panic!("want a close error, got: {}", err);
        };
        assert_eq!(close_err.errors.len(), 2);
        let report = close_err.to_string();
        assert!(report.contains("sniffer stuck") && report.contains("injector stuck"));
    }

    #[test]
    fn reserved_ports_are_unique_until_closed() {
        let local = Ipv4Addr::new(127, 0, 0, 1);
        let mut first = PortPicker::reserve(local).unwrap();
        let mut second = PortPicker::reserve(local).unwrap();
        assert_ne!(first.port(), second.port());
        assert!(first.port() > 0 && second.port() > 0);

        first.close().unwrap();
        first.close().unwrap(); // idempotent
        second.close().unwrap();
    }

    #[test]
    fn udp_state_installs_reserved_port_in_templates() {
        let state = UdpState {
            out: Udp {
                src_port: Some(LOCAL_PORT),
                dst_port: Some(REMOTE_PORT),
                ..Udp::default()
            },
            inn: Udp {
                dst_port: Some(LOCAL_PORT),
                ..Udp::default()
            },
            port_picker: PortPicker::fake(LOCAL_PORT),
        };
        let Layer::Udp(out) = state.outgoing() else {
            panic!("outgoing() must produce a UDP layer");
        };
        assert_eq!(out.src_port, Some(LOCAL_PORT));
        assert!(state.incoming(&Layer::Udp(Udp::default())).is_some());
        assert!(state.incoming(&Layer::Tcp(Tcp::default())).is_none());
    }
}
