//! ICMPv4 echo handling: answering incoming echo requests, and driving
//! an outgoing `ping`.

use crate::config::{ICMP_ECHO_IDENTIFIER, ICMP_ECHO_MIN_PAYLOAD, MTU_STORAGE};
use crate::error::{Error, Result};
use crate::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, Icmpv4Message, Icmpv4Packet, Ipv4Address,
    Ipv4Packet, Ipv4Protocol, Ipv4Repr, ETHERNET_HEADER_LEN, IPV4_HEADER_LEN,
};

/// Capability the application installs on the adapter's ICMP path.
/// Unlike [`crate::udp::UdpHandler`]/[`crate::tcp::TcpHandler`] there is
/// no per-connection state: one instance sees every echo reply the
/// adapter's outstanding pings receive.
pub trait IcmpHandler {
    /// An echo reply matching an outstanding `ping` arrived.
    fn on_echo_reply(&mut self, _from: Ipv4Address, _seq: u16, _payload: &[u8]) {}
}

impl IcmpHandler for () {}

/// Builds an echo reply in place of an echo request already sitting in
/// `frame[..frame_len]`: byte-swaps the Ethernet and IP addressing,
/// strips any IP options the request carried (the reply is always a
/// bare 20-byte header), and flips the ICMP type. Returns the new
/// total frame length.
pub fn build_echo_reply(
    frame: &mut [u8; MTU_STORAGE],
    frame_len: usize,
    local_mac: EthernetAddress,
) -> Result<usize> {
    let mut eth = EthernetFrame::new_checked(&mut frame[..frame_len])?;
    let remote_mac = eth.source();
    eth.set_source(local_mac);
    eth.set_destination(remote_mac);

    let ip_request = Ipv4Packet::new_checked(&frame[ETHERNET_HEADER_LEN..frame_len])?;
    let src_addr = ip_request.src_addr();
    let dst_addr = ip_request.dst_addr();
    let icmp_request = Icmpv4Packet::new_checked(ip_request.payload())?;
    if icmp_request.msg_type() != Icmpv4Message::EchoRequest {
        return Err(Error::Val);
    }
    let icmp_len = ip_request.payload().len();

    let ip_payload_len = icmp_len;
    let total_len = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + ip_payload_len;
    if total_len > frame.len() {
        return Err(Error::BufferOverrun);
    }

    // Compact the ICMP payload down to directly after a bare
    // (option-free) IPv4 header, overwriting any options the request
    // carried.
    let icmp_start = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN;
    let request_icmp_start = ETHERNET_HEADER_LEN + ip_request.header_len() as usize;
    if request_icmp_start != icmp_start {
        frame.copy_within(request_icmp_start..request_icmp_start + icmp_len, icmp_start);
    }

    {
        let mut icmp = Icmpv4Packet::new_unchecked(&mut frame[icmp_start..icmp_start + icmp_len]);
        icmp.set_msg_type(Icmpv4Message::EchoReply);
        icmp.fill_checksum();
    }

    {
        let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..total_len]);
        let repr = Ipv4Repr {
            src_addr: dst_addr,
            dst_addr: src_addr,
            protocol: Ipv4Protocol::Icmp,
            payload_len: ip_payload_len as u16,
        };
        repr.emit(&mut ip, false);
    }

    {
        let mut eth = EthernetFrame::new_unchecked(&mut frame[..total_len]);
        eth.set_ethertype(EthernetProtocol::Ipv4);
    }

    Ok(total_len)
}

/// Builds an outgoing echo request addressed to `remote_mac`/`remote_ip`
/// with the fixed identifier this stack always uses, and the supplied
/// sequence number. `payload` is padded up to
/// `ICMP_ECHO_MIN_PAYLOAD` bytes with a repeating fill pattern if
/// shorter.
pub fn build_echo_request(
    frame: &mut [u8; MTU_STORAGE],
    local_mac: EthernetAddress,
    remote_mac: EthernetAddress,
    local_ip: Ipv4Address,
    remote_ip: Ipv4Address,
    seq: u16,
    payload: &[u8],
) -> Result<usize> {
    let payload_len = payload.len().max(ICMP_ECHO_MIN_PAYLOAD);
    let icmp_len = crate::wire::ICMPV4_HEADER_LEN + payload_len;
    let total_len = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + icmp_len;
    if total_len > frame.len() {
        return Err(Error::Val);
    }

    {
        let mut eth = EthernetFrame::new_unchecked(&mut frame[..]);
        eth.set_destination(remote_mac);
        eth.set_source(local_mac);
        eth.set_ethertype(EthernetProtocol::Ipv4);
    }

    {
        let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..total_len]);
        let repr = Ipv4Repr {
            src_addr: local_ip,
            dst_addr: remote_ip,
            protocol: Ipv4Protocol::Icmp,
            payload_len: icmp_len as u16,
        };
        repr.emit(&mut ip, false);

        let mut icmp = Icmpv4Packet::new_unchecked(ip.payload_mut());
        icmp.set_msg_type(Icmpv4Message::EchoRequest);
        icmp.set_msg_code(0);
        icmp.set_echo_ident(ICMP_ECHO_IDENTIFIER);
        icmp.set_echo_seq_no(seq);
        let body = icmp.payload_mut();
        let copy_len = payload.len().min(body.len());
        body[..copy_len].copy_from_slice(&payload[..copy_len]);
        for (i, b) in body[copy_len..].iter_mut().enumerate() {
            *b = (i & 0xFF) as u8;
        }
        icmp.fill_checksum();
    }

    Ok(total_len)
}
