/*! Low-level packet access and construction.

The `wire` module deals with packet *representation*, at two levels.

 * The `Packet` family of structures ([EthernetFrame], [Ipv4Packet],
   [TcpPacket], ...) wraps a sequence of octets and reads or writes
   individual header fields in place.
 * Where a compact high-level view pays its way, a `Repr` type
   ([ArpRepr], [Ipv4Repr]) can be parsed from and emitted into a packet.

When parsing untrusted input, use `Packet::new_checked()`; so long as the
buffer is not modified afterwards, no accessor will panic. When emitting
into a freshly sized buffer, `Packet::new_unchecked()` is correct — a
length check against stale bytes proves nothing.

[EthernetFrame]: struct.EthernetFrame.html
[Ipv4Packet]: struct.Ipv4Packet.html
[TcpPacket]: struct.TcpPacket.html
[ArpRepr]: enum.ArpRepr.html
[Ipv4Repr]: struct.Ipv4Repr.html
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

mod ethernet;
pub use self::ethernet::{
    Address as EthernetAddress, EtherType as EthernetProtocol, Frame as EthernetFrame,
    HEADER_LEN as ETHERNET_HEADER_LEN, PAYLOAD_MIN as ETHERNET_PAYLOAD_MIN,
};

mod arp;
pub use self::arp::{
    Hardware as ArpHardware, Operation as ArpOperation, Packet as ArpPacket, Repr as ArpRepr,
    PACKET_LEN as ARP_PACKET_LEN,
};

pub(crate) mod ipv4;
pub use self::ipv4::{
    Address as Ipv4Address, AddressExt as Ipv4AddressExt, Key as Ipv4FragKey,
    Packet as Ipv4Packet, Protocol as IpProtocol, Repr as Ipv4Repr, HEADER_LEN as IPV4_HEADER_LEN,
};

mod icmpv4;
pub use self::icmpv4::{
    DstUnreachable as Icmpv4DstUnreachable, Message as Icmpv4Message, Packet as Icmpv4Packet,
    HEADER_LEN as ICMPV4_HEADER_LEN,
};

mod udp;
pub use self::udp::{Packet as UdpPacket, HEADER_LEN as UDP_HEADER_LEN};

mod tcp;
pub use self::tcp::{
    parse_mss, Packet as TcpPacket, SeqNumber as TcpSeqNumber, TcpOption,
    HEADER_LEN as TCP_HEADER_LEN,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by netstack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// A transport endpoint: an IPv4 address and a port.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct IpEndpoint {
    pub addr: Ipv4Address,
    pub port: u16,
}

impl IpEndpoint {
    pub const UNSPECIFIED: IpEndpoint = IpEndpoint {
        addr: Ipv4Address::UNSPECIFIED,
        port: 0,
    };

    pub const fn new(addr: Ipv4Address, port: u16) -> IpEndpoint {
        IpEndpoint { addr, port }
    }
}

impl fmt::Display for IpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl From<::core::net::SocketAddrV4> for IpEndpoint {
    fn from(value: ::core::net::SocketAddrV4) -> IpEndpoint {
        IpEndpoint {
            addr: *value.ip(),
            port: value.port(),
        }
    }
}

pub(crate) mod checksum {
    //! RFC 1071 helpers shared by every header with an Internet checksum.

    use super::{IpProtocol, Ipv4Address};

    /// Unfolded ones-complement sum of `data`, big-endian pairing.
    pub fn data_raw(data: &[u8]) -> u32 {
        let mut sum = 0u32;
        for (i, &byte) in data.iter().enumerate() {
            if i % 2 == 0 {
                sum += u32::from(byte) << 8;
            } else {
                sum += u32::from(byte);
            }
        }
        sum
    }

    pub fn fold(mut sum: u32) -> u16 {
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    /// Folded (but not complemented) sum of `data`.
    pub fn data(data: &[u8]) -> u16 {
        fold(data_raw(data))
    }

    /// Unfolded partial sum of the UDP/TCP pseudo-header, fed to
    /// `PktBuf::checksum16` as a preload.
    pub fn pseudo_header(
        src_addr: &Ipv4Address,
        dst_addr: &Ipv4Address,
        protocol: IpProtocol,
        length: u32,
    ) -> u32 {
        let mut sum = 0u32;
        sum += data_raw(&src_addr.octets());
        sum += data_raw(&dst_addr.octets());
        sum += u32::from(u8::from(protocol));
        sum += (length >> 16) + (length & 0xffff);
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_fold_carries() {
        assert_eq!(checksum::fold(0x1_fffe), 0xffff);
        assert_eq!(checksum::fold(0x2_0001), 3);
    }

    #[test]
    fn pseudo_header_sum() {
        let src = Ipv4Address::new(10, 0, 0, 2);
        let dst = Ipv4Address::new(10, 0, 0, 3);
        let sum = checksum::pseudo_header(&src, &dst, IpProtocol::Udp, 40);
        // 0x0a00 + 0x0002 + 0x0a00 + 0x0003 + 17 + 40
        assert_eq!(sum, 0x0a00 + 0x0002 + 0x0a00 + 0x0003 + 17 + 40);
    }
}
