//! ICMPv4 (RFC 792), echo request/reply only — the only message types
//! this core builds or interprets.

use byteorder::{ByteOrder, NetworkEndian};

use crate::error::{Error, Result};
use crate::wire::endian;

enum_with_unknown! {
    pub enum Message(u8) {
        EchoReply = 0,
        EchoRequest = 8,
    }
}

mod field {
    use crate::wire::field::Field;
    pub const TYPE: usize = 0;
    pub const CODE: usize = 1;
    pub const CHECKSUM: Field = 2..4;
    pub const ECHO_IDENT: Field = 4..6;
    pub const ECHO_SEQNO: Field = 6..8;
    pub const ECHO_PAYLOAD_START: usize = 8;
}

pub const HEADER_LEN: usize = field::ECHO_PAYLOAD_START;

/// A read/write wrapper around an ICMPv4 echo request/reply buffer.
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
        if self.buffer.as_ref().len() < HEADER_LEN {
            Err(Error::Val)
        } else {
            Ok(())
        }
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn msg_type(&self) -> Message {
        Message::from(self.buffer.as_ref()[field::TYPE])
    }

    pub fn msg_code(&self) -> u8 {
        self.buffer.as_ref()[field::CODE]
    }

    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    pub fn echo_ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::ECHO_IDENT])
    }

    pub fn echo_seq_no(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::ECHO_SEQNO])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[field::ECHO_PAYLOAD_START..]
    }

    pub fn verify_checksum(&self) -> bool {
        endian::complement(endian::ip_checksum(self.buffer.as_ref())) == 0xFFFF
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_msg_type(&mut self, value: Message) {
        self.buffer.as_mut()[field::TYPE] = value.into();
    }

    pub fn set_msg_code(&mut self, value: u8) {
        self.buffer.as_mut()[field::CODE] = value;
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value);
    }

    pub fn set_echo_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::ECHO_IDENT], value);
    }

    pub fn set_echo_seq_no(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::ECHO_SEQNO], value);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[field::ECHO_PAYLOAD_START..]
    }

    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let sum = endian::ip_checksum(self.buffer.as_ref());
        self.set_checksum(endian::complement(sum));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_checksum_round_trips() {
        let mut buf = [0u8; HEADER_LEN + 4];
        let mut packet = Packet::new_unchecked(&mut buf[..]);
        packet.set_msg_type(Message::EchoRequest);
        packet.set_msg_code(0);
        packet.set_echo_ident(0x2222);
        packet.set_echo_seq_no(1);
        packet.payload_mut().copy_from_slice(&[1, 2, 3, 4]);
        packet.fill_checksum();
        assert!(packet.verify_checksum());
    }

    #[test]
    fn reply_is_built_by_flipping_the_type() {
        let mut buf = [0u8; HEADER_LEN];
        let mut packet = Packet::new_unchecked(&mut buf[..]);
        packet.set_msg_type(Message::EchoRequest);
        packet.fill_checksum();
        packet.set_msg_type(Message::EchoReply);
        packet.fill_checksum();
        assert_eq!(packet.msg_type(), Message::EchoReply);
        assert!(packet.verify_checksum());
    }
}
