//! Ties the wire codecs, ARP cache, ingress ring, and the UDP/TCP pools
//! into one object an embedder constructs once per network interface.
//!
//! `NetworkAdapter` owns the frame dispatch loop: [`poll`](NetworkAdapter::poll)
//! drains one frame from the ingress ring and demultiplexes it by
//! Ethernet/IP/transport header; [`tick`](NetworkAdapter::tick) drives
//! every TCP controller's retransmission and state timers once per
//! `TCP_TIMER_PERIOD_MS`. Neither method blocks or allocates.

use heapless::Vec;
use log::{debug, trace, warn};

use crate::arp_cache::ArpCache;
use crate::config::{MAX_TCP, MTU_STORAGE, TCP_EPHEMERAL_START};
use crate::error::{Error, Result, StackError};
use crate::icmp::{self, IcmpHandler};
use crate::ingress::IngressRing;
use crate::phy::Driver;
use crate::tcp::{self, TcpController, TcpHandle, TcpHandler, TcpOptions, TcpPool};
use crate::udp::{self, UdpController, UdpHandle, UdpHandler, UdpPool};
use crate::wire::{
    tcp_flags, ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    Icmpv4Message, Icmpv4Packet, Ipv4Address, Ipv4Packet, Ipv4Protocol, Ipv4Repr, TcpPacket,
    ARP_HEADER_LEN, ETHERNET_HEADER_LEN, ICMPV4_HEADER_LEN,
};

/// The addressing an adapter was configured with: its own MAC/IP, the
/// subnet mask used for ARP's local/remote split, and an optional
/// default gateway (`Ipv4Address::UNSPECIFIED` for none).
#[derive(Debug, Clone, Copy)]
pub struct AdapterIdentity {
    pub mac: EthernetAddress,
    pub ip: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
}

fn send_via<D: Driver>(driver: &mut D, bytes: &[u8]) -> bool {
    driver.send(bytes, bytes.len())
}

/// One network interface: a driver, the ISR-fed ingress ring, the ARP
/// cache, and the UDP/TCP controller pools. `IH`/`UH`/`TH` are the
/// application's ICMP/UDP/TCP callback types; all three default to
/// `()`, the no-op handler, for adapters that only need a subset.
pub struct NetworkAdapter<D: Driver, IH: IcmpHandler = (), UH: UdpHandler = (), TH: TcpHandler + Clone = ()> {
    name: [u8; 2],
    identity: AdapterIdentity,
    driver: D,
    ingress: IngressRing,
    arp: ArpCache,
    icmp_handler: IH,
    icmp_seq: u16,
    udp: UdpPool<UH>,
    tcp: TcpPool<TH>,
    tcp_active: Vec<TcpHandle, MAX_TCP>,
    tcp_listen: Vec<TcpHandle, MAX_TCP>,
    next_tcp_ephemeral: u16,
    isn_counter: u32,
    last_error: Option<StackError>,
}

impl<D: Driver, IH: IcmpHandler, UH: UdpHandler, TH: TcpHandler + Clone> NetworkAdapter<D, IH, UH, TH> {
    pub fn new(name: [u8; 2], identity: AdapterIdentity, driver: D, icmp_handler: IH) -> Self {
        NetworkAdapter {
            name,
            identity,
            driver,
            ingress: IngressRing::new(),
            arp: ArpCache::new(),
            icmp_handler,
            icmp_seq: 0,
            udp: UdpPool::new(),
            tcp: TcpPool::new(),
            tcp_active: Vec::new(),
            tcp_listen: Vec::new(),
            next_tcp_ephemeral: TCP_EPHEMERAL_START,
            isn_counter: 0,
            last_error: None,
        }
    }

    pub fn identity(&self) -> AdapterIdentity {
        self.identity
    }

    pub fn last_error(&self) -> Option<StackError> {
        self.last_error
    }

    fn record_error(&mut self, err: Error, function: &'static str, line: u32) {
        warn!("{}: {} at {}:{}", self.name_str(), err, function, line);
        self.last_error = Some(StackError::new(err, self.name, function, line));
    }

    fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name).unwrap_or("??")
    }

    /// The ISR's entry point: applies the coarse admission filter and,
    /// if accepted, pushes the frame into the ingress ring.
    pub fn isr_recv(&mut self) {
        let mut buf = [0u8; MTU_STORAGE];
        if let Some(len) = self.driver.recv(&mut buf) {
            if self.accepts(&buf[..len]) {
                self.ingress.isr_push(&buf[..len]);
            }
        }
    }

    /// Coarse admission filter: accepts in-subnet IPv4 UDP/TCP/ICMP and
    /// ARP targeting this adapter, discards everything else before it
    /// ever reaches the ingress ring.
    fn accepts(&self, frame: &[u8]) -> bool {
        let eth = match EthernetFrame::new_checked(frame) {
            Ok(e) => e,
            Err(_) => return false,
        };
        match eth.ethertype() {
            EthernetProtocol::Ipv4 => {
                let ip = match Ipv4Packet::new_checked(eth.payload()) {
                    Ok(p) => p,
                    Err(_) => return false,
                };
                if !matches!(ip.protocol(), Ipv4Protocol::Udp | Ipv4Protocol::Tcp | Ipv4Protocol::Icmp) {
                    return false;
                }
                (ip.dst_addr().to_bits() & self.identity.netmask.to_bits())
                    == (self.identity.ip.to_bits() & self.identity.netmask.to_bits())
            }
            EthernetProtocol::Arp => {
                let packet = match ArpPacket::new_checked(eth.payload()) {
                    Ok(p) => p,
                    Err(_) => return false,
                };
                match ArpRepr::parse(&packet) {
                    Ok(repr) => repr.target_protocol_addr == self.identity.ip,
                    Err(_) => false,
                }
            }
            EthernetProtocol::Unknown(_) => false,
        }
    }

    /// Drains and dispatches at most one ingress frame. Returns whether
    /// a frame was processed.
    pub fn poll(&mut self) -> bool {
        let mut buf = [0u8; MTU_STORAGE];
        let mut len = 0usize;
        let got = self.ingress.dispatch_one(|frame| {
            len = frame.len().min(MTU_STORAGE);
            buf[..len].copy_from_slice(&frame[..len]);
        });
        if got {
            self.handle_frame(&mut buf, len);
        }
        got
    }

    fn handle_frame(&mut self, frame: &mut [u8; MTU_STORAGE], frame_len: usize) {
        let eth = match EthernetFrame::new_checked(&frame[..frame_len]) {
            Ok(e) => e,
            Err(_) => return,
        };
        let ethertype = eth.ethertype();
        let remote_mac = eth.source();
        match ethertype {
            EthernetProtocol::Arp => self.handle_arp(frame, frame_len),
            EthernetProtocol::Ipv4 => self.handle_ipv4(frame, frame_len, remote_mac),
            EthernetProtocol::Unknown(other) => trace!("{}: dropping unknown ethertype {:?}", self.name_str(), other),
        }
    }

    fn handle_arp(&mut self, frame: &mut [u8; MTU_STORAGE], frame_len: usize) {
        if frame_len < ETHERNET_HEADER_LEN + ARP_HEADER_LEN {
            return;
        }
        let repr = {
            let packet = match ArpPacket::new_checked(&frame[ETHERNET_HEADER_LEN..frame_len]) {
                Ok(p) => p,
                Err(_) => return,
            };
            match ArpRepr::parse(&packet) {
                Ok(r) => r,
                Err(_) => return,
            }
        };

        if !repr.source_protocol_addr.is_unspecified() {
            trace!("{}: arp learned {} -> {:?}", self.name_str(), repr.source_protocol_addr, repr.source_hardware_addr);
            self.arp.insert(repr.source_protocol_addr, repr.source_hardware_addr);
        }

        if repr.operation != ArpOperation::Request || repr.target_protocol_addr != self.identity.ip {
            return;
        }

        debug!("{}: arp reply to {}", self.name_str(), repr.source_protocol_addr);
        let reply = ArpRepr {
            operation: ArpOperation::Reply,
            source_hardware_addr: self.identity.mac,
            source_protocol_addr: self.identity.ip,
            target_hardware_addr: repr.source_hardware_addr,
            target_protocol_addr: repr.source_protocol_addr,
        };
        let total_len = ETHERNET_HEADER_LEN + ARP_HEADER_LEN;
        {
            let mut eth = EthernetFrame::new_unchecked(&mut frame[..total_len]);
            eth.set_destination(repr.source_hardware_addr);
            eth.set_source(self.identity.mac);
            eth.set_ethertype(EthernetProtocol::Arp);
        }
        {
            let mut packet = ArpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..total_len]);
            reply.emit(&mut packet);
        }
        if !send_via(&mut self.driver, &frame[..total_len]) {
            self.record_error(Error::DeviceDriver, "adapter::handle_arp", line!());
        }
    }

    fn handle_ipv4(&mut self, frame: &mut [u8; MTU_STORAGE], frame_len: usize, remote_mac: EthernetAddress) {
        let repr = {
            let ip = match Ipv4Packet::new_checked(&frame[ETHERNET_HEADER_LEN..frame_len]) {
                Ok(p) => p,
                Err(_) => return,
            };
            match Ipv4Repr::parse(&ip) {
                Ok(r) => r,
                Err(_) => return,
            }
        };

        if repr.dst_addr != self.identity.ip && !repr.dst_addr.is_broadcast() {
            return;
        }
        if !repr.src_addr.is_unspecified() {
            self.arp.insert(repr.src_addr, remote_mac);
        }

        match repr.protocol {
            Ipv4Protocol::Icmp => self.handle_icmp(frame, frame_len),
            Ipv4Protocol::Udp => self.handle_udp(frame, frame_len, repr.src_addr, repr.dst_addr, remote_mac),
            Ipv4Protocol::Tcp => self.handle_tcp(frame, frame_len, repr.src_addr, repr.dst_addr, remote_mac),
            Ipv4Protocol::Unknown(other) => trace!("{}: dropping unknown IP protocol {:?}", self.name_str(), other),
        }
    }

    fn handle_icmp(&mut self, frame: &mut [u8; MTU_STORAGE], frame_len: usize) {
        let decision = {
            let ip = match Ipv4Packet::new_checked(&frame[ETHERNET_HEADER_LEN..frame_len]) {
                Ok(p) => p,
                Err(_) => return,
            };
            let icmp = match Icmpv4Packet::new_checked(ip.payload()) {
                Ok(p) => p,
                Err(_) => return,
            };
            match icmp.msg_type() {
                Icmpv4Message::EchoRequest => IcmpDecision::Request,
                Icmpv4Message::EchoReply if icmp.verify_checksum() => {
                    let header_start = ETHERNET_HEADER_LEN + ip.header_len() as usize;
                    let payload_start = header_start + ICMPV4_HEADER_LEN;
                    let payload_end = ETHERNET_HEADER_LEN + ip.total_len() as usize;
                    IcmpDecision::Reply {
                        from: ip.src_addr(),
                        seq: icmp.echo_seq_no(),
                        payload_start,
                        payload_end,
                    }
                }
                _ => IcmpDecision::Ignore,
            }
        };

        match decision {
            IcmpDecision::Request => {
                if let Ok(new_len) = icmp::build_echo_reply(frame, frame_len, self.identity.mac) {
                    if !send_via(&mut self.driver, &frame[..new_len]) {
                        self.record_error(Error::DeviceDriver, "adapter::handle_icmp", line!());
                    }
                }
            }
            IcmpDecision::Reply { from, seq, payload_start, payload_end } => {
                self.icmp_handler.on_echo_reply(from, seq, &frame[payload_start..payload_end]);
            }
            IcmpDecision::Ignore => {}
        }
    }

    fn handle_udp(
        &mut self,
        frame: &[u8; MTU_STORAGE],
        frame_len: usize,
        src_ip: Ipv4Address,
        dst_ip: Ipv4Address,
        remote_mac: EthernetAddress,
    ) {
        let (payload_start, payload_end) = {
            let ip = match Ipv4Packet::new_checked(&frame[ETHERNET_HEADER_LEN..frame_len]) {
                Ok(p) => p,
                Err(_) => return,
            };
            (
                ETHERNET_HEADER_LEN + ip.header_len() as usize,
                ETHERNET_HEADER_LEN + ip.total_len() as usize,
            )
        };
        if let Err(e) = udp::parse(&mut self.udp, src_ip, dst_ip, remote_mac, &frame[payload_start..payload_end]) {
            self.record_error(e, "adapter::handle_udp", line!());
        }
    }

    fn handle_tcp(
        &mut self,
        frame: &[u8; MTU_STORAGE],
        frame_len: usize,
        src_ip: Ipv4Address,
        dst_ip: Ipv4Address,
        remote_mac: EthernetAddress,
    ) {
        let (payload_start, payload_end) = {
            let ip = match Ipv4Packet::new_checked(&frame[ETHERNET_HEADER_LEN..frame_len]) {
                Ok(p) => p,
                Err(_) => return,
            };
            (
                ETHERNET_HEADER_LEN + ip.header_len() as usize,
                ETHERNET_HEADER_LEN + ip.total_len() as usize,
            )
        };
        let total_len = payload_end - payload_start;
        let segment = match TcpPacket::new_checked(&frame[payload_start..payload_end]) {
            Ok(p) => p,
            Err(_) => return,
        };
        if !tcp::verify_checksum(&segment, src_ip, dst_ip, total_len) {
            self.record_error(Error::Checksum, "adapter::handle_tcp", line!());
            return;
        }
        let local_port = segment.dst_port();
        let remote_port = segment.src_port();
        let flags = segment.flags();
        let seq = segment.seq_number();
        let ack = segment.ack_number();
        let window = segment.window_len();
        let mss = segment.mss_option();
        let payload_offset = payload_start + segment.data_offset() as usize;
        let payload = &frame[payload_offset..payload_end];
        let local_mac = self.identity.mac;

        if let Some(handle) = tcp::demux_match_active(&self.tcp, &self.tcp_active, local_port, src_ip, remote_port) {
            let NetworkAdapter { tcp, driver, .. } = self;
            if let Some(ctrl) = tcp.get_mut(handle) {
                let closed = tcp::on_segment(ctrl, handle, flags, seq, ack, window, payload, local_mac, |b| {
                    send_via(driver, b)
                });
                if closed {
                    tcp::sweep(tcp);
                    tcp::rebuild_lists(tcp, &mut self.tcp_active, &mut self.tcp_listen);
                }
            }
            return;
        }

        if flags & tcp_flags::RST != 0 {
            if tcp::demux_match_listener(&self.tcp, &self.tcp_listen, local_port).is_some() {
                warn!("{}: RST against listening port {} dropped", self.name_str(), local_port);
            }
            return;
        }

        if flags & tcp_flags::SYN != 0 && flags & tcp_flags::ACK == 0 {
            if let Some(listener) = tcp::demux_match_listener(&self.tcp, &self.tcp_listen, local_port) {
                self.isn_counter = self.isn_counter.wrapping_add(7919);
                let initial_seq = self.isn_counter;
                let name = self.name;
                let NetworkAdapter { tcp, driver, tcp_active, .. } = self;
                let child = tcp::create_child(
                    tcp,
                    listener,
                    src_ip,
                    remote_port,
                    remote_mac,
                    seq,
                    mss.unwrap_or(crate::config::TCP_MSS as u16),
                    local_mac,
                    initial_seq,
                    |b| send_via(driver, b),
                );
                let name = core::str::from_utf8(&name).unwrap_or("??");
                match child {
                    Ok(handle) => {
                        let _ = tcp_active.push(handle);
                        debug!("{}: accepted child connection on port {}", name, local_port);
                    }
                    Err(e) => debug!("{}: failed to spawn child on port {}: {}", name, local_port, e),
                }
            }
        }
    }

    /// `tcp_new`: allocates a persistent controller owned by the caller.
    pub fn tcp_new(&mut self, port: u16, handler: TH) -> Result<TcpHandle> {
        tcp::new_controller(&mut self.tcp, self.identity.ip, port, &mut self.next_tcp_ephemeral, handler)
    }

    pub fn tcp_controller(&self, handle: TcpHandle) -> Option<&TcpController<TH>> {
        self.tcp.get(handle)
    }

    pub fn tcp_controller_mut(&mut self, handle: TcpHandle) -> Option<&mut TcpController<TH>> {
        self.tcp.get_mut(handle)
    }

    /// `tcp_listen`: moves a controller to `Listen` and registers it.
    pub fn tcp_listen(&mut self, handle: TcpHandle) -> Result<()> {
        let ctrl = self.tcp.get_mut(handle).ok_or(Error::Val)?;
        tcp::listen(ctrl)?;
        let _ = self.tcp_listen.push(handle);
        Ok(())
    }

    /// Broadcasts an ARP request for `target_ip`. Called whenever a
    /// cache lookup misses so the resolution the caller is waiting on
    /// actually gets started.
    fn request_arp(&mut self, target_ip: Ipv4Address) {
        let mut frame = [0u8; MTU_STORAGE];
        let total_len = ETHERNET_HEADER_LEN + ARP_HEADER_LEN;
        {
            let mut eth = EthernetFrame::new_unchecked(&mut frame[..total_len]);
            eth.set_destination(EthernetAddress::BROADCAST);
            eth.set_source(self.identity.mac);
            eth.set_ethertype(EthernetProtocol::Arp);
        }
        let repr = ArpRepr {
            operation: ArpOperation::Request,
            source_hardware_addr: self.identity.mac,
            source_protocol_addr: self.identity.ip,
            target_hardware_addr: EthernetAddress::new([0; 6]),
            target_protocol_addr: target_ip,
        };
        {
            let mut packet = ArpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..total_len]);
            repr.emit(&mut packet);
        }
        debug!("{}: arp request for {}", self.name_str(), target_ip);
        if !send_via(&mut self.driver, &frame[..total_len]) {
            self.record_error(Error::DeviceDriver, "adapter::request_arp", line!());
        }
    }

    /// Resolves `ip` through the ARP cache, broadcasting a request on a
    /// miss so the caller's next attempt has a chance of succeeding.
    fn resolve(&mut self, ip: Ipv4Address) -> Result<EthernetAddress> {
        match self.arp.lookup(ip, self.identity.netmask) {
            Ok(mac) => Ok(mac),
            Err(_) => {
                self.request_arp(ip);
                Err(Error::MacAddrUnknown)
            }
        }
    }

    /// `tcp_connect`: resolves the peer MAC via the ARP cache, emits the
    /// initial SYN, and registers the controller as active.
    pub fn tcp_connect(&mut self, handle: TcpHandle, remote_ip: Ipv4Address, remote_port: u16) -> Result<()> {
        let remote_mac = self.resolve(remote_ip);
        self.isn_counter = self.isn_counter.wrapping_add(104729);
        let initial_seq = self.isn_counter;
        let local_mac = self.identity.mac;
        let NetworkAdapter { tcp, driver, tcp_active, .. } = self;
        let ctrl = tcp.get_mut(handle).ok_or(Error::Val)?;
        tcp::begin_connect(ctrl, remote_ip, remote_port, remote_mac, local_mac, initial_seq, |b| {
            send_via(driver, b)
        })?;
        if !tcp_active.contains(&handle) {
            let _ = tcp_active.push(handle);
        }
        Ok(())
    }

    pub fn tcp_write(&mut self, handle: TcpHandle, data: &[u8]) -> Result<()> {
        let local_mac = self.identity.mac;
        let NetworkAdapter { tcp, driver, .. } = self;
        let ctrl = tcp.get_mut(handle).ok_or(Error::Val)?;
        tcp::write(ctrl, local_mac, data, |b| send_via(driver, b))
    }

    pub fn tcp_close(&mut self, handle: TcpHandle) -> Result<()> {
        let local_mac = self.identity.mac;
        let NetworkAdapter { tcp, driver, .. } = self;
        let ctrl = tcp.get_mut(handle).ok_or(Error::Val)?;
        tcp::close(ctrl, local_mac, |b| send_via(driver, b));
        Ok(())
    }

    pub fn tcp_abort(&mut self, handle: TcpHandle) -> Result<()> {
        let local_mac = self.identity.mac;
        let NetworkAdapter { tcp, driver, .. } = self;
        let ctrl = tcp.get_mut(handle).ok_or(Error::Val)?;
        tcp::abort(ctrl, handle, local_mac, |b| send_via(driver, b));
        Ok(())
    }

    pub fn tcp_ack(&mut self, handle: TcpHandle) -> Result<()> {
        let local_mac = self.identity.mac;
        let NetworkAdapter { tcp, driver, .. } = self;
        let ctrl = tcp.get_mut(handle).ok_or(Error::Val)?;
        tcp::ack(ctrl, local_mac, |b| send_via(driver, b));
        Ok(())
    }

    pub fn tcp_set_options(&mut self, handle: TcpHandle, opts: TcpOptions) -> Result<()> {
        let ctrl = self.tcp.get_mut(handle).ok_or(Error::Val)?;
        tcp::set_options(ctrl, opts);
        Ok(())
    }

    pub fn tcp_check_connection(&mut self, handle: TcpHandle, n: u32) -> Result<()> {
        let ctrl = self.tcp.get_mut(handle).ok_or(Error::Val)?;
        tcp::set_watchdog(ctrl, n);
        Ok(())
    }

    /// `tcp_delete`: frees a `Closed` controller's slot and drops it
    /// from the active/listen lists.
    pub fn tcp_delete(&mut self, handle: TcpHandle) -> Result<()> {
        tcp::delete(&mut self.tcp, handle)?;
        tcp::rebuild_lists(&self.tcp, &mut self.tcp_active, &mut self.tcp_listen);
        Ok(())
    }

    /// Drives every active controller's 500ms timer once, reaping
    /// non-persistent connections that close and rebuilding the
    /// active/listen lists if any did.
    pub fn tick(&mut self) {
        let local_mac = self.identity.mac;
        let mut any_closed = false;
        let NetworkAdapter { tcp, driver, tcp_active, .. } = self;
        for &handle in tcp_active.iter() {
            if let Some(ctrl) = tcp.get_mut(handle) {
                let outcome = tcp::on_timer_tick(ctrl, handle, local_mac, |b| send_via(driver, b));
                if outcome == tcp::TimerOutcome::Closed {
                    any_closed = true;
                }
            }
        }
        if any_closed {
            tcp::sweep(tcp);
            tcp::rebuild_lists(tcp, tcp_active, &mut self.tcp_listen);
        }
    }

    /// `udp_new`: allocates a stateless UDP controller.
    pub fn udp_new(&mut self, port: u16, point_to_point: bool, handler: UH) -> Result<UdpHandle> {
        self.udp.new_controller(self.identity.ip, port, point_to_point, handler)
    }

    pub fn udp_controller(&self, handle: UdpHandle) -> Option<&UdpController<UH>> {
        self.udp.get(handle)
    }

    pub fn udp_controller_mut(&mut self, handle: UdpHandle) -> Option<&mut UdpController<UH>> {
        self.udp.get_mut(handle)
    }

    pub fn udp_connect(&mut self, handle: UdpHandle, remote_ip: Ipv4Address, remote_port: u16) -> Result<()> {
        let remote_mac = self.resolve(remote_ip);
        let local_mac = self.identity.mac;
        let controller = self.udp.get_mut(handle).ok_or(Error::Val)?;
        udp::connect(controller, local_mac, remote_mac, remote_ip, remote_port)
    }

    pub fn udp_send(&mut self, handle: UdpHandle, payload: &[u8], reuse: bool) -> Result<()> {
        let local_mac = self.identity.mac;
        let controller = self.udp.get_mut(handle).ok_or(Error::Val)?;
        let frame = udp::send(controller, local_mac, payload, reuse)?;
        let bytes = frame.bytes;
        if !send_via(&mut self.driver, bytes) {
            self.record_error(Error::DeviceDriver, "adapter::udp_send", line!());
            return Err(Error::DeviceDriver);
        }
        Ok(())
    }

    pub fn udp_delete(&mut self, handle: UdpHandle) {
        self.udp.delete(handle);
    }

    /// `ping`: sends an ICMP echo request to `remote_ip`, resolving its
    /// MAC through the ARP cache first.
    pub fn ping(&mut self, remote_ip: Ipv4Address, payload: &[u8]) -> Result<u16> {
        let remote_mac = self.resolve(remote_ip)?;
        self.icmp_seq = self.icmp_seq.wrapping_add(1);
        let seq = self.icmp_seq;
        let mut frame = [0u8; MTU_STORAGE];
        let len = icmp::build_echo_request(
            &mut frame,
            self.identity.mac,
            remote_mac,
            self.identity.ip,
            remote_ip,
            seq,
            payload,
        )?;
        if !send_via(&mut self.driver, &frame[..len]) {
            self.record_error(Error::DeviceDriver, "adapter::ping", line!());
            return Err(Error::DeviceDriver);
        }
        Ok(seq)
    }
}

enum IcmpDecision {
    Request,
    Reply { from: Ipv4Address, seq: u16, payload_start: usize, payload_end: usize },
    Ignore,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::test_driver::LoopbackDriver;
    use crate::wire::{Ipv4Packet as Ipv4PacketT, TcpPacket, UdpPacket, UDP_HEADER_LEN};

    fn identity() -> AdapterIdentity {
        AdapterIdentity {
            mac: EthernetAddress::new([0x02, 0, 0, 0, 0, 1]),
            ip: Ipv4Address::new(10, 0, 0, 1),
            netmask: Ipv4Address::new(255, 255, 255, 0),
            gateway: Ipv4Address::UNSPECIFIED,
        }
    }

    fn new_adapter() -> NetworkAdapter<LoopbackDriver> {
        NetworkAdapter::new([b'e', b'0'], identity(), LoopbackDriver::default(), ())
    }

    fn build_arp_request(sender_mac: EthernetAddress, sender_ip: Ipv4Address, target_ip: Ipv4Address) -> [u8; MTU_STORAGE] {
        let mut frame = [0u8; MTU_STORAGE];
        let total_len = ETHERNET_HEADER_LEN + ARP_HEADER_LEN;
        {
            let mut eth = EthernetFrame::new_unchecked(&mut frame[..total_len]);
            eth.set_destination(EthernetAddress::BROADCAST);
            eth.set_source(sender_mac);
            eth.set_ethertype(EthernetProtocol::Arp);
        }
        let repr = ArpRepr {
            operation: ArpOperation::Request,
            source_hardware_addr: sender_mac,
            source_protocol_addr: sender_ip,
            target_hardware_addr: EthernetAddress::new([0; 6]),
            target_protocol_addr: target_ip,
        };
        let mut packet = ArpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..total_len]);
        repr.emit(&mut packet);
        frame
    }

    #[test]
    fn poll_answers_arp_request_for_our_ip() {
        let mut adapter = new_adapter();
        let sender_mac = EthernetAddress::new([0x02, 0, 0, 0, 0, 9]);
        let sender_ip = Ipv4Address::new(10, 0, 0, 9);
        let frame = build_arp_request(sender_mac, sender_ip, adapter.identity.ip);
        adapter.ingress.isr_push(&frame[..ETHERNET_HEADER_LEN + ARP_HEADER_LEN]);

        assert!(adapter.poll());
        let (sent, len) = adapter.driver.sent.pop_front().unwrap();
        let eth = EthernetFrame::new_checked(&sent[..len]).unwrap();
        assert_eq!(eth.destination(), sender_mac);
        let packet = ArpPacket::new_checked(&sent[ETHERNET_HEADER_LEN..len]).unwrap();
        let reply = ArpRepr::parse(&packet).unwrap();
        assert_eq!(reply.operation, ArpOperation::Reply);
        assert_eq!(reply.source_protocol_addr, adapter.identity.ip);
        assert_eq!(reply.target_hardware_addr, sender_mac);
    }

    #[test]
    fn poll_answers_icmp_echo_request() {
        let mut adapter = new_adapter();
        let remote_mac = EthernetAddress::new([0x02, 0, 0, 0, 0, 9]);
        let remote_ip = Ipv4Address::new(10, 0, 0, 9);
        let mut frame = [0u8; MTU_STORAGE];
        let len = icmp::build_echo_request(
            &mut frame,
            remote_mac,
            adapter.identity.mac,
            remote_ip,
            adapter.identity.ip,
            5,
            b"hello",
        )
        .unwrap();
        adapter.ingress.isr_push(&frame[..len]);

        assert!(adapter.poll());
        let (sent, sent_len) = adapter.driver.sent.pop_front().unwrap();
        let ip = Ipv4PacketT::new_checked(&sent[ETHERNET_HEADER_LEN..sent_len]).unwrap();
        let icmp_packet = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp_packet.msg_type(), Icmpv4Message::EchoReply);
    }

    #[test]
    fn tcp_listen_then_syn_spawns_child_and_replies_syn_ack() {
        let mut adapter: NetworkAdapter<LoopbackDriver, (), (), ()> = new_adapter();
        let h = adapter.tcp_new(80, ()).unwrap();
        adapter.tcp_listen(h).unwrap();

        let remote_mac = EthernetAddress::new([0x02, 0, 0, 0, 0, 9]);
        let remote_ip = Ipv4Address::new(10, 0, 0, 9);
        adapter.arp.insert(remote_ip, remote_mac);

        let mut frame = [0u8; MTU_STORAGE];
        let tcp_total = crate::wire::TCP_HEADER_LEN;
        let header_len = crate::wire::IPV4_HEADER_LEN;
        let full_len = ETHERNET_HEADER_LEN + header_len + tcp_total;
        {
            let mut eth = EthernetFrame::new_unchecked(&mut frame[..full_len]);
            eth.set_destination(adapter.identity.mac);
            eth.set_source(remote_mac);
            eth.set_ethertype(EthernetProtocol::Ipv4);
        }
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..full_len]);
            let repr = Ipv4Repr {
                src_addr: remote_ip,
                dst_addr: adapter.identity.ip,
                protocol: Ipv4Protocol::Tcp,
                payload_len: tcp_total as u16,
            };
            repr.emit(&mut ip, false);
            let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
            tcp.set_src_port(5000);
            tcp.set_dst_port(80);
            tcp.set_seq_number(100);
            tcp.set_ack_number(0);
            tcp.clear_options();
            tcp.set_flags(crate::wire::tcp_flags::SYN);
            tcp.set_window_len(4096);
            tcp.set_urgent_ptr(0);
            let pseudo = crate::wire::endian::pseudo_header_sum(
                remote_ip.to_bits(),
                adapter.identity.ip.to_bits(),
                tcp_total as u16,
                Ipv4Protocol::Tcp.into(),
            );
            tcp.fill_checksum(pseudo, tcp_total);
        }
        adapter.ingress.isr_push(&frame[..full_len]);

        assert!(adapter.poll());
        assert_eq!(adapter.tcp_active.len(), 1);
        let (sent, sent_len) = adapter.driver.sent.pop_front().unwrap();
        let ip = Ipv4PacketT::new_checked(&sent[ETHERNET_HEADER_LEN..sent_len]).unwrap();
        let reply = TcpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(
            reply.flags(),
            crate::wire::tcp_flags::SYN | crate::wire::tcp_flags::ACK
        );
    }

    #[test]
    fn udp_send_round_trips_through_the_driver() {
        let mut adapter = new_adapter();
        let h = adapter.udp_new(9000, true, ()).unwrap();
        let remote_mac = EthernetAddress::new([0x02, 0, 0, 0, 0, 9]);
        let remote_ip = Ipv4Address::new(10, 0, 0, 9);
        adapter.arp.insert(remote_ip, remote_mac);
        adapter.udp_connect(h, remote_ip, 9001).unwrap();
        adapter.udp_send(h, b"ping", false).unwrap();

        let (sent, sent_len) = adapter.driver.sent.pop_front().unwrap();
        let ip = Ipv4PacketT::new_checked(&sent[ETHERNET_HEADER_LEN..sent_len]).unwrap();
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.payload(), b"ping");
    }

    #[test]
    fn isr_recv_discards_off_subnet_frame() {
        let mut adapter = new_adapter();
        let remote_mac = EthernetAddress::new([0x02, 0, 0, 0, 0, 9]);
        let remote_ip = Ipv4Address::new(10, 0, 0, 9);
        let off_subnet_dst = Ipv4Address::new(172, 16, 0, 5);

        let mut frame = [0u8; MTU_STORAGE];
        let header_len = crate::wire::IPV4_HEADER_LEN;
        let udp_total = UDP_HEADER_LEN;
        let full_len = ETHERNET_HEADER_LEN + header_len + udp_total;
        {
            let mut eth = EthernetFrame::new_unchecked(&mut frame[..full_len]);
            eth.set_destination(adapter.identity.mac);
            eth.set_source(remote_mac);
            eth.set_ethertype(EthernetProtocol::Ipv4);
        }
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..full_len]);
            let repr = Ipv4Repr {
                src_addr: remote_ip,
                dst_addr: off_subnet_dst,
                protocol: Ipv4Protocol::Udp,
                payload_len: udp_total as u16,
            };
            repr.emit(&mut ip, false);
            let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
            udp.set_src_port(5000);
            udp.set_dst_port(9000);
            udp.set_length(udp_total as u16);
            udp.set_checksum(0);
        }

        adapter.driver.push_inbound(&frame[..full_len]);
        adapter.isr_recv();
        assert!(!adapter.poll());
    }

    #[test]
    fn isr_recv_discards_arp_not_targeting_us() {
        let mut adapter = new_adapter();
        let sender_mac = EthernetAddress::new([0x02, 0, 0, 0, 0, 9]);
        let sender_ip = Ipv4Address::new(10, 0, 0, 9);
        let other_ip = Ipv4Address::new(10, 0, 0, 42);
        let frame = build_arp_request(sender_mac, sender_ip, other_ip);

        adapter.driver.push_inbound(&frame[..ETHERNET_HEADER_LEN + ARP_HEADER_LEN]);
        adapter.isr_recv();
        assert!(!adapter.poll());
    }

    #[test]
    fn isr_recv_accepts_in_subnet_udp_frame() {
        let mut adapter = new_adapter();
        let h = adapter.udp_new(9000, false, ()).unwrap();
        let _ = h;
        let remote_mac = EthernetAddress::new([0x02, 0, 0, 0, 0, 9]);
        let remote_ip = Ipv4Address::new(10, 0, 0, 9);

        let mut frame = [0u8; MTU_STORAGE];
        let header_len = crate::wire::IPV4_HEADER_LEN;
        let udp_total = UDP_HEADER_LEN;
        let full_len = ETHERNET_HEADER_LEN + header_len + udp_total;
        {
            let mut eth = EthernetFrame::new_unchecked(&mut frame[..full_len]);
            eth.set_destination(adapter.identity.mac);
            eth.set_source(remote_mac);
            eth.set_ethertype(EthernetProtocol::Ipv4);
        }
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..full_len]);
            let repr = Ipv4Repr {
                src_addr: remote_ip,
                dst_addr: adapter.identity.ip,
                protocol: Ipv4Protocol::Udp,
                payload_len: udp_total as u16,
            };
            repr.emit(&mut ip, false);
            let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
            udp.set_src_port(5000);
            udp.set_dst_port(9000);
            udp.set_length(udp_total as u16);
            udp.set_checksum(0);
        }

        adapter.driver.push_inbound(&frame[..full_len]);
        adapter.isr_recv();
        assert!(adapter.poll());
    }

    #[test]
    fn tcp_connect_without_arp_entry_fails_with_mac_unknown() {
        let mut adapter = new_adapter();
        let h = adapter.tcp_new(0, ()).unwrap();
        let remote_ip = Ipv4Address::new(10, 0, 0, 50);
        let err = adapter.tcp_connect(h, remote_ip, 80).unwrap_err();
        assert_eq!(err, Error::MacAddrUnknown);

        // A miss must kick off resolution instead of leaving the caller
        // to poll forever with nothing ever hitting the wire.
        let (sent, sent_len) = adapter.driver.sent.pop_front().unwrap();
        let eth = EthernetFrame::new_checked(&sent[..sent_len]).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
        let packet = ArpPacket::new_checked(&sent[ETHERNET_HEADER_LEN..sent_len]).unwrap();
        let repr = ArpRepr::parse(&packet).unwrap();
        assert_eq!(repr.operation, ArpOperation::Request);
        assert_eq!(repr.target_protocol_addr, remote_ip);
    }
}
