use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

use super::checksum;
use super::{Error, Result};
use super::{IpProtocol, Ipv4Address};

/// A TCP sequence number.
///
/// Sequence numbers are compared modulo 2³²: `a < b` means "`a` was sent
/// before `b`" under the assumption that the two are within half the
/// sequence space of each other, which is what every window check in the
/// state machine relies on. The ordering is therefore partial, not total.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    pub const fn new(value: u32) -> SeqNumber {
        SeqNumber(value)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<usize> for SeqNumber {
    type Output = SeqNumber;
    fn add(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs as u32))
    }
}

impl AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        self.0 = self.0.wrapping_add(rhs as u32);
    }
}

impl Sub<usize> for SeqNumber {
    type Output = SeqNumber;
    fn sub(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs as u32))
    }
}

impl Sub<SeqNumber> for SeqNumber {
    type Output = usize;
    /// Distance from `rhs` forward to `self`. Callers only subtract a
    /// sequence number known not to be ahead of `self`.
    fn sub(self, rhs: SeqNumber) -> usize {
        self.0.wrapping_sub(rhs.0) as usize
    }
}

impl PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<core::cmp::Ordering> {
        (self.0.wrapping_sub(other.0) as i32).partial_cmp(&0)
    }
}

/// A read/write wrapper around a Transmission Control Protocol packet buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const fn OPTIONS(length: u8) -> Field {
        URGENT.end..(length as usize)
    }

    pub const FLG_FIN: u16 = 0x001;
    pub const FLG_SYN: u16 = 0x002;
    pub const FLG_RST: u16 = 0x004;
    pub const FLG_PSH: u16 = 0x008;
    pub const FLG_ACK: u16 = 0x010;
    pub const FLG_URG: u16 = 0x020;
}

pub const HEADER_LEN: usize = field::URGENT.end;

macro_rules! get_flag {
    ($name:ident, $flag:ident) => {
        pub fn $name(&self) -> bool {
            let data = self.buffer.as_ref();
            NetworkEndian::read_u16(&data[field::FLAGS]) & field::$flag != 0
        }
    };
}

macro_rules! set_flag {
    ($name:ident, $flag:ident) => {
        pub fn $name(&mut self, value: bool) {
            let data = self.buffer.as_mut();
            let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
            let raw = if value {
                raw | field::$flag
            } else {
                raw & !field::$flag
            };
            NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
        }
    };
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP packet structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is too short or the data
    /// offset points outside it.
    ///
    /// The result of this check is invalidated by calling
    /// [set_header_len].
    ///
    /// [set_header_len]: #method.set_header_len
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            Err(Error)
        } else {
            let header_len = usize::from(self.header_len());
            if header_len < HEADER_LEN || len < header_len {
                Err(Error)
            } else {
                Ok(())
            }
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC_PORT])
    }

    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST_PORT])
    }

    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::SEQ_NUM]))
    }

    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::ACK_NUM]))
    }

    get_flag!(fin, FLG_FIN);
    get_flag!(syn, FLG_SYN);
    get_flag!(rst, FLG_RST);
    get_flag!(psh, FLG_PSH);
    get_flag!(ack, FLG_ACK);
    get_flag!(urg, FLG_URG);

    /// Return the header length, in octets.
    pub fn header_len(&self) -> u8 {
        let data = self.buffer.as_ref();
        ((NetworkEndian::read_u16(&data[field::FLAGS]) >> 12) * 4) as u8
    }

    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::WIN_SIZE])
    }

    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    pub fn urgent_at(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::URGENT])
    }

    /// Return the options as a raw octet slice.
    pub fn options(&self) -> &[u8] {
        let header_len = self.header_len();
        &self.buffer.as_ref()[field::OPTIONS(header_len)]
    }

    /// Length of the segment in sequence space: payload plus one for
    /// each of SYN and FIN.
    pub fn segment_len(&self) -> usize {
        let data = self.buffer.as_ref();
        let mut len = data.len() - usize::from(self.header_len());
        if self.syn() {
            len += 1;
        }
        if self.fin() {
            len += 1;
        }
        len
    }

    /// Validate the checksum over a flat buffer.
    pub fn verify_checksum(&self, src_addr: &Ipv4Address, dst_addr: &Ipv4Address) -> bool {
        let data = self.buffer.as_ref();
        checksum::fold(
            checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Tcp, data.len() as u32)
                + u32::from(checksum::data(data)),
        ) == !0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the payload.
    pub fn payload(&self) -> &'a [u8] {
        let header_len = usize::from(self.header_len());
        &self.buffer.as_ref()[header_len..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SRC_PORT], value)
    }

    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DST_PORT], value)
    }

    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::SEQ_NUM], value.0)
    }

    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_u32(&mut self.buffer.as_mut()[field::ACK_NUM], value.0)
    }

    /// Clear the flag bits and the data offset.
    pub fn clear_flags(&mut self) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::FLAGS], 0)
    }

    set_flag!(set_fin, FLG_FIN);
    set_flag!(set_syn, FLG_SYN);
    set_flag!(set_rst, FLG_RST);
    set_flag!(set_psh, FLG_PSH);
    set_flag!(set_ack, FLG_ACK);
    set_flag!(set_urg, FLG_URG);

    /// Set the header length, in octets.
    pub fn set_header_len(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]) & 0x0fff;
        NetworkEndian::write_u16(
            &mut data[field::FLAGS],
            raw | (u16::from(value / 4) << 12),
        )
    }

    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::WIN_SIZE], value)
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value)
    }

    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::URGENT], value)
    }

    /// Return a mutable slice over the options.
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        &mut self.buffer.as_mut()[field::OPTIONS(header_len)]
    }

    /// Compute and fill in the checksum over a flat buffer.
    pub fn fill_checksum(&mut self, src_addr: &Ipv4Address, dst_addr: &Ipv4Address) {
        self.set_checksum(0);
        let checksum = {
            let data = self.buffer.as_ref();
            !checksum::fold(
                checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Tcp, data.len() as u32)
                    + u32::from(checksum::data(data)),
            )
        };
        self.set_checksum(checksum)
    }

    /// Return a mutable pointer to the payload.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = usize::from(self.header_len());
        &mut self.buffer.as_mut()[header_len..]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A representation of a single TCP option.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    SackPermitted,
    Unknown { kind: u8, data: &'a [u8] },
}

impl<'a> TcpOption<'a> {
    pub const KIND_END: u8 = 0;
    pub const KIND_NOP: u8 = 1;
    pub const KIND_MSS: u8 = 2;
    pub const KIND_SACK_PERMITTED: u8 = 4;

    /// Parse the option at the front of `buffer`, returning it and the
    /// rest of the buffer.
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.first().ok_or(Error)? {
            Self::KIND_END => {
                length = buffer.len();
                option = TcpOption::EndOfList;
            }
            Self::KIND_NOP => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                length = usize::from(*buffer.get(1).ok_or(Error)?);
                if length < 2 || length > buffer.len() {
                    return Err(Error);
                }
                let data = &buffer[2..length];
                match (kind, length) {
                    (Self::KIND_MSS, 4) => {
                        option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data))
                    }
                    (Self::KIND_MSS, _) => return Err(Error),
                    (Self::KIND_SACK_PERMITTED, 2) => option = TcpOption::SackPermitted,
                    (_, _) => option = TcpOption::Unknown { kind, data },
                }
            }
        }
        Ok((&buffer[length..], option))
    }

    pub fn buffer_len(&self) -> usize {
        match self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::SackPermitted => 2,
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    /// Emit the option at the front of `buffer`, returning the rest.
    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length;
        match self {
            TcpOption::EndOfList => {
                length = 1;
                buffer[0] = Self::KIND_END;
            }
            TcpOption::NoOperation => {
                length = 1;
                buffer[0] = Self::KIND_NOP;
            }
            TcpOption::MaxSegmentSize(value) => {
                length = 4;
                buffer[0] = Self::KIND_MSS;
                buffer[1] = length as u8;
                NetworkEndian::write_u16(&mut buffer[2..4], *value);
            }
            TcpOption::SackPermitted => {
                length = 2;
                buffer[0] = Self::KIND_SACK_PERMITTED;
                buffer[1] = length as u8;
            }
            TcpOption::Unknown { kind, data } => {
                length = 2 + data.len();
                buffer[0] = *kind;
                buffer[1] = length as u8;
                buffer[2..length].copy_from_slice(data);
            }
        }
        &mut buffer[length..]
    }
}

/// Walk the options of a segment, returning the advertised MSS if any.
pub fn parse_mss(mut options: &[u8]) -> Option<u16> {
    while !options.is_empty() {
        match TcpOption::parse(options) {
            Ok((rest, TcpOption::MaxSegmentSize(mss))) => {
                let _ = rest;
                return Some(mss);
            }
            Ok((_, TcpOption::EndOfList)) => return None,
            Ok((rest, _)) => options = rest,
            Err(_) => return None,
        }
    }
    None
}

impl<'a, T: AsRef<[u8]> + ?Sized> fmt::Display for Packet<&'a T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TCP src={} dst={} seq={} ack={} win={}",
            self.src_port(),
            self.dst_port(),
            self.seq_number(),
            self.ack_number(),
            self.window_len()
        )?;
        for (flag, set) in [
            ("syn", self.syn()),
            ("ack", self.ack()),
            ("fin", self.fin()),
            ("rst", self.rst()),
            ("psh", self.psh()),
        ] {
            if set {
                write!(f, " {flag}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
    const DST: Ipv4Address = Ipv4Address::new(10, 0, 0, 3);

    #[test]
    fn seq_number_wraps() {
        let near_max = SeqNumber(u32::MAX - 1);
        let wrapped = near_max + 3;
        assert_eq!(wrapped, SeqNumber(1));
        assert!(near_max < wrapped);
        assert!(wrapped > near_max);
        assert_eq!(wrapped - near_max, 3);
        assert_eq!(SeqNumber(100) + 5, SeqNumber(105));
        assert!(SeqNumber(100) <= SeqNumber(100));
    }

    #[test]
    fn syn_with_options_roundtrip() {
        let mut bytes = [0u8; 24];
        {
            let mut packet = Packet::new_unchecked(&mut bytes[..]);
            packet.set_src_port(49152);
            packet.set_dst_port(80);
            packet.clear_flags();
            packet.set_header_len(24);
            packet.set_seq_number(SeqNumber(32435));
            packet.set_ack_number(SeqNumber(0));
            packet.set_syn(true);
            packet.set_window_len(4096);
            packet.set_urgent_at(0);
            let rest = TcpOption::MaxSegmentSize(1460).emit(packet.options_mut());
            let rest = TcpOption::SackPermitted.emit(rest);
            TcpOption::NoOperation.emit(TcpOption::NoOperation.emit(rest));
            packet.fill_checksum(&SRC, &DST);
        }
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert!(packet.syn() && !packet.ack());
        assert_eq!(packet.header_len(), 24);
        assert_eq!(packet.seq_number(), SeqNumber(32435));
        assert_eq!(packet.segment_len(), 1);
        assert!(packet.verify_checksum(&SRC, &DST));
        assert_eq!(parse_mss(packet.options()), Some(1460));
    }

    #[test]
    fn options_parse_edge_cases() {
        assert_eq!(
            TcpOption::parse(&[1, 2, 4, 5, 0xb4]).unwrap(),
            (&[2u8, 4, 5, 0xb4][..], TcpOption::NoOperation)
        );
        assert_eq!(
            TcpOption::parse(&[2, 4, 0x05, 0xb4]).unwrap().1,
            TcpOption::MaxSegmentSize(0x05b4)
        );
        // Truncated MSS.
        assert!(TcpOption::parse(&[2, 4, 0x05]).is_err());
        // Zero length.
        assert!(TcpOption::parse(&[3, 0]).is_err());
        assert_eq!(parse_mss(&[4, 2, 1, 1, 2, 4, 2, 0]), Some(0x0200));
    }

    #[test]
    fn bad_data_offset() {
        let mut bytes = [0u8; 20];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        packet.clear_flags();
        packet.set_header_len(24);
        assert_eq!(Packet::new_checked(&bytes[..]), Err(Error));
    }
}
