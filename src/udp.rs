//! The stateless per-endpoint UDP controller pool.

use crate::config::{MAX_UDP, MTU_STORAGE, UDP_EPHEMERAL_END, UDP_EPHEMERAL_START};
use crate::error::{Error, Result};
use crate::wire::{
    endian, EthernetAddress, EthernetFrame, EthernetProtocol, Ipv4Address, Ipv4Packet, Ipv4Protocol,
    Ipv4Repr, UdpPacket, ETHERNET_HEADER_LEN, IPV4_HEADER_LEN, UDP_HEADER_LEN,
};

/// Capability the application installs on a UDP controller.
pub trait UdpHandler {
    /// Invoked on a datagram accepted for this controller; `(remote_ip,
    /// remote_port)` is supplied so a server-mode controller's
    /// cross-talk guard is visible to the callback too.
    fn on_recv(&mut self, _remote_ip: Ipv4Address, _remote_port: u16, _data: &[u8]) {}
}

impl UdpHandler for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unused,
    /// Server mode: accepts datagrams from any source; the remote
    /// endpoint is learned from the first (or latest) sender.
    AnyTarget,
    /// Client mode: `connect` has pinned a single remote endpoint.
    KnownTarget,
}

/// A slot index into the adapter's UDP controller pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHandle(pub(crate) usize);

pub struct UdpController<H> {
    state: State,
    local_ip: Ipv4Address,
    local_port: u16,
    remote_ip: Ipv4Address,
    remote_port: u16,
    remote_mac: EthernetAddress,
    point_to_point: bool,
    frame: [u8; MTU_STORAGE],
    frame_len: usize,
    frame_initialized: bool,
    pub handler: H,
}

impl<H> UdpController<H> {
    fn new(local_ip: Ipv4Address, local_port: u16, point_to_point: bool, handler: H) -> Self {
        UdpController {
            state: State::AnyTarget,
            local_ip,
            local_port,
            remote_ip: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
            remote_mac: EthernetAddress::BROADCAST,
            point_to_point,
            frame: [0; MTU_STORAGE],
            frame_len: 0,
            frame_initialized: false,
            handler,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_endpoint(&self) -> (Ipv4Address, u16) {
        (self.remote_ip, self.remote_port)
    }

    /// True once a peer has been learned, either pinned by `connect`
    /// or picked up from the source address of an inbound datagram.
    fn has_peer(&self) -> bool {
        !self.remote_ip.is_unspecified()
    }
}

/// Owns the fixed `MAX_UDP`-entry controller pool. Lives inside
/// `NetworkAdapter`.
pub struct UdpPool<H> {
    controllers: [Option<UdpController<H>>; MAX_UDP],
    next_ephemeral: u16,
}

impl<H> UdpPool<H> {
    pub const fn new() -> UdpPool<H> {
        UdpPool {
            controllers: [const { None }; MAX_UDP],
            next_ephemeral: UDP_EPHEMERAL_START,
        }
    }

    fn alloc_ephemeral_port(&mut self) -> u16 {
        let port = self.next_ephemeral;
        self.next_ephemeral = if self.next_ephemeral >= UDP_EPHEMERAL_END {
            UDP_EPHEMERAL_START
        } else {
            self.next_ephemeral + 1
        };
        port
    }

    /// `udp_new`: allocates from the pool; assigns an ephemeral port if
    /// `port == 0`.
    pub fn new_controller(
        &mut self,
        local_ip: Ipv4Address,
        port: u16,
        point_to_point: bool,
        handler: H,
    ) -> Result<UdpHandle> {
        let slot = self.controllers.iter().position(|c| c.is_none()).ok_or(Error::UdpMem)?;
        let port = if port == 0 {
            self.alloc_ephemeral_port()
        } else {
            port
        };
        self.controllers[slot] = Some(UdpController::new(local_ip, port, point_to_point, handler));
        Ok(UdpHandle(slot))
    }

    pub fn get(&self, handle: UdpHandle) -> Option<&UdpController<H>> {
        self.controllers[handle.0].as_ref()
    }

    pub fn get_mut(&mut self, handle: UdpHandle) -> Option<&mut UdpController<H>> {
        self.controllers[handle.0].as_mut()
    }

    pub fn delete(&mut self, handle: UdpHandle) {
        self.controllers[handle.0] = None;
    }

    fn find_by_port_mut(&mut self, port: u16) -> Option<&mut UdpController<H>> {
        self.controllers
            .iter_mut()
            .filter_map(|c| c.as_mut())
            .find(|c| c.local_port == port)
    }
}

impl<H> Default for UdpPool<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// `udp_connect`: resolves the peer MAC (idempotent after first
/// success) and pins the remote endpoint.
pub fn connect<H>(
    controller: &mut UdpController<H>,
    local_mac: EthernetAddress,
    remote_mac: Result<EthernetAddress>,
    ip: Ipv4Address,
    port: u16,
) -> Result<()> {
    if controller.state == State::KnownTarget {
        return Ok(());
    }
    if ip.is_unspecified() || port == 0 {
        return Err(Error::Val);
    }
    controller.remote_ip = ip;
    controller.remote_port = port;
    let mac = remote_mac?;
    controller.remote_mac = mac;
    controller.state = State::KnownTarget;
    controller.frame_initialized = false;
    let _ = local_mac;
    Ok(())
}

/// A pending frame ready to hand to the driver: the caller (the
/// adapter) owns `send`; this module only builds bytes.
pub struct OutgoingFrame<'a> {
    pub bytes: &'a [u8],
}

/// `udp_send`: builds an outgoing datagram into the controller's
/// frame buffer, reusing the constant prefix when `reuse` and
/// `frame_initialized` both hold.
#[allow(clippy::too_many_arguments)]
pub fn send<'a, H>(
    controller: &'a mut UdpController<H>,
    local_mac: EthernetAddress,
    payload: &[u8],
    reuse: bool,
) -> Result<OutgoingFrame<'a>> {
    if !controller.has_peer() {
        return Err(Error::Val);
    }
    let total_len = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    if total_len > MTU_STORAGE {
        return Err(Error::Val);
    }

    let rebuild = !reuse || !controller.frame_initialized;
    if rebuild {
        let mut eth = EthernetFrame::new_unchecked(&mut controller.frame[..]);
        eth.set_destination(controller.remote_mac);
        eth.set_source(local_mac);
        eth.set_ethertype(EthernetProtocol::Ipv4);
    }

    {
        let eth_payload = &mut controller.frame[ETHERNET_HEADER_LEN..];
        let mut ip = Ipv4Packet::new_unchecked(eth_payload);
        let repr = Ipv4Repr {
            src_addr: controller.local_ip,
            dst_addr: controller.remote_ip,
            protocol: Ipv4Protocol::Udp,
            payload_len: (UDP_HEADER_LEN + payload.len()) as u16,
        };
        repr.emit(&mut ip, !rebuild);

        let udp_len = UDP_HEADER_LEN + payload.len();
        let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
        udp.set_src_port(controller.local_port);
        udp.set_dst_port(controller.remote_port);
        udp.set_length(udp_len as u16);
        udp.payload_mut()[..payload.len()].copy_from_slice(payload);

        if controller.point_to_point {
            udp.set_checksum(0);
        } else {
            let pseudo = endian::pseudo_header_sum(
                controller.local_ip.to_bits(),
                controller.remote_ip.to_bits(),
                udp_len as u16,
                Ipv4Protocol::Udp.into(),
            );
            udp.fill_checksum(pseudo);
        }
    }

    controller.frame_initialized = true;
    controller.frame_len = total_len;
    Ok(OutgoingFrame {
        bytes: &controller.frame[..total_len],
    })
}

/// `udp_parse`: matches by local port, verifies the checksum (optional
/// NIC-offload tolerance gated by the `permissive-checksum` feature),
/// re-targets server-mode controllers on a new source, and enforces
/// the cross-talk guard before invoking the callback.
pub fn parse<H: UdpHandler>(
    pool: &mut UdpPool<H>,
    src_ip: Ipv4Address,
    dst_ip: Ipv4Address,
    src_mac: EthernetAddress,
    payload: &[u8],
) -> Result<()> {
    let udp = UdpPacket::new_checked(payload)?;
    let controller = pool
        .find_by_port_mut(udp.dst_port())
        .ok_or(Error::Val)?;

    if udp.checksum() != 0 {
        let pseudo = endian::pseudo_header_sum(
            src_ip.to_bits(),
            dst_ip.to_bits(),
            udp.length(),
            Ipv4Protocol::Udp.into(),
        );
        let body_sum = endian::ip_checksum(udp.as_bytes());
        let folded = endian::complement(endian::fold_checksum(pseudo + body_sum));
        let pseudo_only = endian::complement(endian::fold_checksum(pseudo));
        let accepted = folded == 0xFFFF
            || (cfg!(feature = "permissive-checksum") && udp.checksum() == pseudo_only);
        if !accepted {
            return Err(Error::Checksum);
        }
    }

    let src_port = udp.src_port();
    if controller.state == State::AnyTarget {
        if (src_ip, src_port) != (controller.remote_ip, controller.remote_port) {
            controller.remote_ip = src_ip;
            controller.remote_port = src_port;
            controller.remote_mac = src_mac;
            controller.frame_initialized = false;
        }
    } else if (src_ip, src_port) != (controller.remote_ip, controller.remote_port) {
        // Cross-talk guard: a client-mode controller only accepts
        // datagrams from the endpoint it connected to.
        return Ok(());
    }

    controller.handler.on_recv(src_ip, src_port, udp.payload());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        last: heapless::Vec<u8, 64>,
        from: Option<(Ipv4Address, u16)>,
    }

    impl UdpHandler for Recorder {
        fn on_recv(&mut self, remote_ip: Ipv4Address, remote_port: u16, data: &[u8]) {
            self.last.clear();
            let _ = self.last.extend_from_slice(data);
            self.from = Some((remote_ip, remote_port));
        }
    }

    #[test]
    fn new_controller_assigns_ephemeral_port_when_zero() {
        let mut pool: UdpPool<()> = UdpPool::new();
        let h = pool
            .new_controller(Ipv4Address::new(10, 0, 0, 1), 0, false, ())
            .unwrap();
        let port = pool.get(h).unwrap().local_port();
        assert!((UDP_EPHEMERAL_START..=UDP_EPHEMERAL_END).contains(&port));
    }

    #[test]
    fn send_reuse_does_not_rewrite_constant_prefix() {
        let mut pool: UdpPool<()> = UdpPool::new();
        let h = pool
            .new_controller(Ipv4Address::new(10, 0, 0, 1), 9000, true, ())
            .unwrap();
        let c = pool.get_mut(h).unwrap();
        connect(
            c,
            EthernetAddress::new([1; 6]),
            Ok(EthernetAddress::new([2; 6])),
            Ipv4Address::new(10, 0, 0, 2),
            9001,
        )
        .unwrap();

        let local_mac = EthernetAddress::new([1; 6]);
        let payload = [0u8; 32];
        let frame1 = send(c, local_mac, &payload, true).unwrap();
        let len1 = frame1.bytes.len();
        assert_eq!(len1, ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + 32);
        let udp_checksum_offset = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + 6;
        assert_eq!(frame1.bytes[udp_checksum_offset], 0);
        assert_eq!(frame1.bytes[udp_checksum_offset + 1], 0);

        let frame2 = send(c, local_mac, &payload, true).unwrap();
        assert_eq!(frame2.bytes.len(), len1);
    }

    #[test]
    fn parse_learns_new_source_in_server_mode() {
        let mut pool: UdpPool<Recorder> = UdpPool::new();
        let h = pool
            .new_controller(Ipv4Address::new(10, 0, 0, 1), 9000, false, Recorder::default())
            .unwrap();
        let _ = h;

        let mut buf = [0u8; UDP_HEADER_LEN + 4];
        let mut udp = UdpPacket::new_unchecked(&mut buf[..]);
        udp.set_src_port(12345);
        udp.set_dst_port(9000);
        udp.set_length((UDP_HEADER_LEN + 4) as u16);
        udp.payload_mut().copy_from_slice(b"ping");
        udp.set_checksum(0);

        parse(
            &mut pool,
            Ipv4Address::new(10, 0, 0, 9),
            Ipv4Address::new(10, 0, 0, 1),
            EthernetAddress::new([9; 6]),
            &buf,
        )
        .unwrap();

        let c = pool.get(h).unwrap();
        assert_eq!(c.remote_endpoint(), (Ipv4Address::new(10, 0, 0, 9), 12345));
        assert_eq!(c.handler.last.as_slice(), b"ping");
    }

    #[test]
    fn server_mode_controller_can_send_after_learning_peer() {
        let mut pool: UdpPool<Recorder> = UdpPool::new();
        let h = pool
            .new_controller(Ipv4Address::new(10, 0, 0, 1), 9000, false, Recorder::default())
            .unwrap();

        let mut buf = [0u8; UDP_HEADER_LEN + 4];
        let mut udp = UdpPacket::new_unchecked(&mut buf[..]);
        udp.set_src_port(12345);
        udp.set_dst_port(9000);
        udp.set_length((UDP_HEADER_LEN + 4) as u16);
        udp.payload_mut().copy_from_slice(b"ping");
        udp.set_checksum(0);

        parse(
            &mut pool,
            Ipv4Address::new(10, 0, 0, 9),
            Ipv4Address::new(10, 0, 0, 1),
            EthernetAddress::new([9; 6]),
            &buf,
        )
        .unwrap();

        // An AnyTarget controller, never connect()'d, must still be able to
        // reply once it has learned a peer from an inbound datagram.
        let c = pool.get_mut(h).unwrap();
        let local_mac = EthernetAddress::new([1; 6]);
        let frame = send(c, local_mac, b"pong", false).unwrap();
        assert_eq!(frame.bytes.len(), ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + 4);
    }

    #[test]
    fn connect_is_idempotent_after_first_success() {
        let mut pool: UdpPool<()> = UdpPool::new();
        let h = pool
            .new_controller(Ipv4Address::new(10, 0, 0, 1), 9000, false, ())
            .unwrap();
        let c = pool.get_mut(h).unwrap();
        connect(
            c,
            EthernetAddress::new([1; 6]),
            Ok(EthernetAddress::new([2; 6])),
            Ipv4Address::new(10, 0, 0, 2),
            9001,
        )
        .unwrap();

        // A second connect to a different endpoint, even one that would fail
        // MAC resolution, must not disturb the pinned peer.
        connect(
            c,
            EthernetAddress::new([1; 6]),
            Err(Error::MacAddrUnknown),
            Ipv4Address::new(10, 0, 0, 3),
            9002,
        )
        .unwrap();

        assert_eq!(c.remote_endpoint(), (Ipv4Address::new(10, 0, 0, 2), 9001));
    }
}
