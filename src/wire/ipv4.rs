//! IPv4 (RFC 791), header only — no options are ever emitted, and
//! incoming options are tolerated only on the ICMP echo path, which
//! strips them from the reply.

use core::fmt;

use byteorder::{ByteOrder, NetworkEndian};

use crate::error::{Error, Result};
use crate::wire::endian;

enum_with_unknown! {
    pub enum Protocol(u8) {
        Icmp = 1,
        Tcp = 6,
        Udp = 17,
    }
}

/// A four-octet IPv4 address, stored host-order internally (`u32`) so
/// that masking/comparison arithmetic reads naturally; conversion to
/// and from wire bytes happens only at the `Packet` boundary.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub u32);

impl Address {
    pub const UNSPECIFIED: Address = Address(0);
    pub const BROADCAST: Address = Address(0xFFFF_FFFF);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Address {
        Address(((a as u32) << 24) | ((b as u32) << 16) | ((c as u32) << 8) | d as u32)
    }

    pub fn from_bytes(data: &[u8]) -> Address {
        Address(NetworkEndian::read_u32(data))
    }

    pub fn as_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub const fn to_bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Address {
        Address(bits)
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == 0xFFFF_FFFF
    }

    /// Bitwise AND with a netmask, used throughout route selection and
    /// ARP subnet-broadcast detection.
    pub fn mask(&self, netmask: Address) -> Address {
        Address(self.0 & netmask.0)
    }

    /// Parses a dotted-quad string, the `inet_addr` equivalent an
    /// embedder's configuration loader is expected to call.
    pub fn parse(s: &str) -> Result<Address> {
        let mut octets = [0u8; 4];
        let mut count = 0;
        for part in s.split('.') {
            if count == 4 {
                return Err(Error::Val);
            }
            let value: u16 = part.parse().map_err(|_| Error::Val)?;
            if value > 255 {
                return Err(Error::Val);
            }
            octets[count] = value as u8;
            count += 1;
        }
        if count != 4 {
            return Err(Error::Val);
        }
        Ok(Address::new(octets[0], octets[1], octets[2], octets[3]))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.as_bytes();
        write!(f, "{}.{}.{}.{}", b[0], b[1], b[2], b[3])
    }
}

mod field {
    use crate::wire::field::Field;
    pub const VER_IHL: usize = 0;
    pub const DSCP_ECN: usize = 1;
    pub const LENGTH: Field = 2..4;
    pub const IDENT: Field = 4..6;
    pub const FLG_OFF: Field = 6..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Field = 10..12;
    pub const SRC_ADDR: Field = 12..16;
    pub const DST_ADDR: Field = 16..20;
}

pub const HEADER_LEN: usize = 20;

const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const DEFAULT_TTL: u8 = 255;

/// A read/write wrapper around an IPv4 header buffer.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error::Val);
        }
        if (self.header_len() as usize) < HEADER_LEN || (self.header_len() as usize) > len {
            return Err(Error::Val);
        }
        if (self.total_len() as usize) < self.header_len() as usize
            || (self.total_len() as usize) > len
        {
            return Err(Error::Val);
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[field::VER_IHL] >> 4
    }

    pub fn header_len(&self) -> u8 {
        (self.buffer.as_ref()[field::VER_IHL] & 0x0F) * 4
    }

    pub fn total_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::LENGTH])
    }

    pub fn ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::IDENT])
    }

    pub fn dont_fragment(&self) -> bool {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLG_OFF]) & FLAG_DONT_FRAGMENT != 0
    }

    pub fn hop_limit(&self) -> u8 {
        self.buffer.as_ref()[field::TTL]
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from(self.buffer.as_ref()[field::PROTOCOL])
    }

    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    pub fn src_addr(&self) -> Address {
        Address::from_bytes(&self.buffer.as_ref()[field::SRC_ADDR])
    }

    pub fn dst_addr(&self) -> Address {
        Address::from_bytes(&self.buffer.as_ref()[field::DST_ADDR])
    }

    /// Verifies the header checksum: folding+complementing the header
    /// bytes (checksum field included) must yield `0xFFFF`.
    pub fn verify_checksum(&self) -> bool {
        let header = &self.buffer.as_ref()[..self.header_len() as usize];
        endian::complement(endian::ip_checksum(header)) == 0xFFFF
    }

    pub fn payload(&self) -> &[u8] {
        let start = self.header_len() as usize;
        let end = self.total_len() as usize;
        &self.buffer.as_ref()[start..end]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_version_and_header_len(&mut self, version: u8, header_len: u8) {
        self.buffer.as_mut()[field::VER_IHL] = (version << 4) | (header_len / 4);
    }

    pub fn set_total_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::LENGTH], value);
    }

    pub fn set_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::IDENT], value);
    }

    pub fn set_dont_fragment(&mut self, value: bool) {
        let flags = if value { FLAG_DONT_FRAGMENT } else { 0 };
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::FLG_OFF], flags);
    }

    pub fn set_hop_limit(&mut self, value: u8) {
        self.buffer.as_mut()[field::TTL] = value;
    }

    pub fn set_protocol(&mut self, value: Protocol) {
        self.buffer.as_mut()[field::PROTOCOL] = value.into();
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value);
    }

    pub fn set_src_addr(&mut self, value: Address) {
        self.buffer.as_mut()[field::SRC_ADDR].copy_from_slice(&value.as_bytes());
    }

    pub fn set_dst_addr(&mut self, value: Address) {
        self.buffer.as_mut()[field::DST_ADDR].copy_from_slice(&value.as_bytes());
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.header_len() as usize;
        &mut self.buffer.as_mut()[start..]
    }

    /// Recomputes and writes the header checksum.
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let header_len = self.header_len() as usize;
        let sum = endian::ip_checksum(&self.buffer.as_ref()[..header_len]);
        self.set_checksum(endian::complement(sum));
    }
}

/// A high-level representation of an IPv4 header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub src_addr: Address,
    pub dst_addr: Address,
    pub protocol: Protocol,
    pub payload_len: u16,
}

impl Repr {
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>) -> Result<Repr> {
        if packet.version() != 4 {
            return Err(Error::Val);
        }
        if !packet.verify_checksum() {
            return Err(Error::Checksum);
        }
        Ok(Repr {
            src_addr: packet.src_addr(),
            dst_addr: packet.dst_addr(),
            protocol: packet.protocol(),
            payload_len: packet.total_len() - packet.header_len() as u16,
        })
    }

    pub const fn buffer_len(&self) -> usize {
        HEADER_LEN
    }

    /// Writes the immutable IP prefix (version/IHL, TOS, DF, TTL=255)
    /// the way `ip_set_constant_fields` does, leaving
    /// the length/checksum/addresses to be filled by every send.
    pub fn emit_constant_fields<T: AsRef<[u8]> + AsMut<[u8]>>(packet: &mut Packet<T>) {
        packet.set_version_and_header_len(4, HEADER_LEN as u8);
        packet.buffer.as_mut()[field::DSCP_ECN] = 0;
        packet.set_ident(0);
        packet.set_dont_fragment(true);
        packet.set_hop_limit(DEFAULT_TTL);
    }

    /// Writes the dynamic fields (length, protocol, addresses,
    /// checksum) of an `eth_build_ip_request`-style emission. `reuse`
    /// skips the constant prefix.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>, reuse: bool) {
        if !reuse {
            Self::emit_constant_fields(packet);
            packet.set_protocol(self.protocol);
            packet.set_src_addr(self.src_addr);
            packet.set_dst_addr(self.dst_addr);
        }
        packet.set_total_len(HEADER_LEN as u16 + self.payload_len);
        packet.fill_checksum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_to_the_same_bits() {
        let addr = Address::new(10, 2, 222, 222);
        assert_eq!(Address::parse("10.2.222.222").unwrap(), addr);
        assert_eq!(addr.as_bytes(), [10, 2, 222, 222]);
    }

    #[test]
    fn invalid_dotted_quad_is_rejected() {
        assert_eq!(Address::parse("10.2.222"), Err(Error::Val));
        assert_eq!(Address::parse("10.2.222.999"), Err(Error::Val));
        assert_eq!(Address::parse("not.an.ip.addr"), Err(Error::Val));
    }

    #[test]
    fn emitted_header_checksum_is_valid() {
        let mut buf = [0u8; HEADER_LEN];
        let mut packet = Packet::new_unchecked(&mut buf[..]);
        let repr = Repr {
            src_addr: Address::new(10, 0, 0, 1),
            dst_addr: Address::new(10, 0, 0, 2),
            protocol: Protocol::Tcp,
            payload_len: 40,
        };
        repr.emit(&mut packet, false);
        assert!(packet.verify_checksum());
        assert_eq!(packet.total_len(), HEADER_LEN as u16 + 40);
        assert!(packet.dont_fragment());
        assert_eq!(packet.hop_limit(), DEFAULT_TTL);
    }

    #[test]
    fn mask_computes_subnet() {
        let ip = Address::new(10, 2, 222, 50);
        let mask = Address::new(255, 255, 255, 0);
        assert_eq!(ip.mask(mask), Address::new(10, 2, 222, 0));
    }
}
