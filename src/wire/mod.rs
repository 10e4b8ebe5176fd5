//! Bit-exact frame codecs for the protocols this stack speaks: Ethernet
//! II, ARP, IPv4, ICMPv4, UDP and TCP.
//!
//! Every multi-byte wire codec here follows the same shape: a
//! `Packet<T: AsRef<[u8]>>` wrapper around a byte buffer, a private
//! `field` submodule of byte ranges, `new_unchecked`/`new_checked`/
//! `check_len`, and typed accessors that convert through network byte
//! order at the point of access. No field above this module is ever
//! stored in network order.

pub(crate) mod field {
    pub type Field = ::core::ops::Range<usize>;
}

pub mod endian;

mod ethernet;
pub use self::ethernet::{
    Address as EthernetAddress, EtherType as EthernetProtocol, Frame as EthernetFrame,
    HEADER_LEN as ETHERNET_HEADER_LEN,
};

mod arp;
pub use self::arp::{
    Hardware as ArpHardware, Operation as ArpOperation, Packet as ArpPacket, Repr as ArpRepr,
    HEADER_LEN as ARP_HEADER_LEN,
};

mod ipv4;
pub use self::ipv4::{
    Address as Ipv4Address, Packet as Ipv4Packet, Protocol as Ipv4Protocol, Repr as Ipv4Repr,
    HEADER_LEN as IPV4_HEADER_LEN,
};

mod icmpv4;
pub use self::icmpv4::{
    Message as Icmpv4Message, Packet as Icmpv4Packet, HEADER_LEN as ICMPV4_HEADER_LEN,
};

mod udp;
pub use self::udp::{Packet as UdpPacket, HEADER_LEN as UDP_HEADER_LEN};

mod tcp;
pub use self::tcp::{flags as tcp_flags, Packet as TcpPacket, HEADER_LEN as TCP_HEADER_LEN};
