//! End-to-end scenarios driven through a frame-capturing driver, with
//! time advanced by hand.

use super::*;
use crate::iface::testutil::{CaptureDriver, TxCapture};
use crate::iface::{Config as IfConfig, LinkLayer};
use crate::socket::tcp::{OutState, TcpState};
use crate::socket::{SockId, SockOpt};
use crate::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    Icmpv4Message, Icmpv4Packet, IpEndpoint, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr,
    TcpPacket, TcpSeqNumber as SeqNumber, UdpPacket, ETHERNET_HEADER_LEN, IPV4_HEADER_LEN,
    TCP_HEADER_LEN,
};

const OUR_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x02]);
const PEER_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x03]);
const OUR_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
const PEER_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 3);

struct Harness {
    stack: Stack,
    tx: TxCapture,
    eth: NetifId,
    now: Instant,
}

impl Harness {
    fn new(mtu: usize) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let (driver, tx) = CaptureDriver::new();
        let mut stack = Stack::new(PktPool::new(128)).unwrap();
        let eth = stack
            .add_netif(
                IfConfig {
                    name: "eth0",
                    hardware_addr: OUR_MAC,
                    addr: OUR_IP,
                    netmask: Ipv4Address::new(255, 255, 255, 0),
                    gateway: Ipv4Address::UNSPECIFIED,
                    mtu,
                    link: LinkLayer::Ethernet,
                },
                Box::new(driver),
            )
            .unwrap();
        let now = Instant::from_millis(10_000);
        stack.poll(now);
        let mut harness = Harness { stack, tx, eth, now };
        harness.frames();
        harness
    }

    /// Teach the stack the peer's MAC so tests can skip the ARP round.
    fn arp_preload(&mut self) {
        self.stack.arp.insert(PEER_IP, PEER_MAC, self.eth, true);
    }

    fn tick(&mut self, ms: u64) {
        self.now = self.now + Duration::from_millis(ms);
        self.stack.poll(self.now);
    }

    fn inject(&mut self, frame: &[u8]) {
        let mut buf = self.stack.pool.alloc(frame.len()).unwrap();
        buf.write(frame).unwrap();
        self.stack.netif_put_in(self.eth, buf).unwrap();
        self.stack.poll(self.now);
    }

    fn frames(&mut self) -> Vec<Vec<u8>> {
        self.tx.take()
    }

    fn tcp(&self, i: usize) -> &crate::socket::tcp::Tcp {
        self.stack.tcp_ref(i).unwrap()
    }
}

fn eth_wrap(ethertype: EthernetProtocol, payload: &[u8]) -> Vec<u8> {
    let len = ETHERNET_HEADER_LEN + payload.len().max(46);
    let mut bytes = vec![0; len];
    let mut frame = EthernetFrame::new_unchecked(&mut bytes[..]);
    frame.set_dst_addr(OUR_MAC);
    frame.set_src_addr(PEER_MAC);
    frame.set_ethertype(ethertype);
    frame.payload_mut()[..payload.len()].copy_from_slice(payload);
    bytes
}

fn ip_wrap(protocol: IpProtocol, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0; IPV4_HEADER_LEN + payload.len()];
    let repr = Ipv4Repr {
        src_addr: PEER_IP,
        dst_addr: OUR_IP,
        next_header: protocol,
        payload_len: payload.len(),
        hop_limit: 64,
    };
    repr.emit(&mut Ipv4Packet::new_unchecked(&mut bytes[..]), 0x700);
    bytes[IPV4_HEADER_LEN..].copy_from_slice(payload);
    bytes
}

/// A flat TCP segment from the peer, checksummed against the test
/// addresses.
#[allow(clippy::too_many_arguments)]
fn tcp_seg(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    syn: bool,
    ack_flag: bool,
    fin: bool,
    wnd: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut bytes = vec![0; TCP_HEADER_LEN + payload.len()];
    {
        let mut packet = TcpPacket::new_unchecked(&mut bytes[..]);
        packet.set_src_port(src_port);
        packet.set_dst_port(dst_port);
        packet.clear_flags();
        packet.set_header_len(TCP_HEADER_LEN as u8);
        packet.set_seq_number(SeqNumber(seq));
        packet.set_ack_number(SeqNumber(ack));
        packet.set_syn(syn);
        packet.set_ack(ack_flag);
        packet.set_fin(fin);
        packet.set_window_len(wnd);
        packet.set_urgent_at(0);
        packet.payload_mut().copy_from_slice(payload);
        packet.fill_checksum(&PEER_IP, &OUR_IP);
    }
    eth_wrap(EthernetProtocol::Ipv4, &ip_wrap(IpProtocol::Tcp, &bytes))
}

/// Pull (ip_packet_bytes) out of a captured Ethernet frame.
fn ip_of(frame: &[u8]) -> Vec<u8> {
    let eth = EthernetFrame::new_checked(frame).unwrap();
    assert_eq!(eth.ethertype(), EthernetProtocol::Ipv4);
    let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
    eth.payload()[..usize::from(ip.total_len())].to_vec()
}

/// Drive the client handshake to ESTABLISHED with our ISS fixed at
/// 32435 and the peer's at `peer_iss`. Returns the socket index.
fn establish(harness: &mut Harness, peer_iss: u32, peer_wnd: u16) -> usize {
    harness.arp_preload();
    harness.stack.set_next_iss(32435);
    let SockId::Tcp(i) = harness.stack.tcp_create().unwrap() else {
        panic!("tcp create failed");
    };
    assert_eq!(
        harness.stack.tcp_connect(i, IpEndpoint::new(PEER_IP, 80)),
        Err(Error::NeedWait)
    );
    let local_port = harness.tcp(i).base.local.port;

    // The SYN is on the wire.
    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let syn = ip_of(&frames[0]);
    let syn = TcpPacket::new_checked(&syn[IPV4_HEADER_LEN..]).unwrap();
    assert!(syn.syn() && !syn.ack());
    assert_eq!(syn.seq_number(), SeqNumber(32435));
    assert_eq!(harness.tcp(i).state, TcpState::SynSent);

    // SYN+ACK back, and the handshake closes.
    let frame = tcp_seg(80, local_port, peer_iss, 32436, true, true, false, peer_wnd, &[]);
    harness.inject(&frame);
    assert_eq!(harness.tcp(i).state, TcpState::Established);
    assert_eq!(harness.tcp(i).snd.una, SeqNumber(32436));
    assert_eq!(harness.tcp(i).rcv.nxt, SeqNumber(peer_iss.wrapping_add(1)));
    assert_eq!(harness.tcp(i).base.conn_wait.last(), Some(Ok(())));

    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let ack = ip_of(&frames[0]);
    let ack = TcpPacket::new_checked(&ack[IPV4_HEADER_LEN..]).unwrap();
    assert!(ack.ack() && !ack.syn());
    assert_eq!(ack.seq_number(), SeqNumber(32436));
    assert_eq!(ack.ack_number(), SeqNumber(peer_iss.wrapping_add(1)));
    i
}

/// S1: ARP resolution followed by a single UDP datagram.
#[test]
fn s1_arp_resolve_then_udp() {
    let mut harness = Harness::new(1500);
    let SockId::Udp(u) = harness.stack.udp_create().unwrap() else {
        panic!()
    };
    harness
        .stack
        .udp_bind(u, IpEndpoint::new(OUR_IP, 49200))
        .unwrap();
    let sent = harness
        .stack
        .udp_sendto(u, &[0x5a; 32], IpEndpoint::new(PEER_IP, 7))
        .unwrap();
    assert_eq!(sent, 32);

    // One broadcast ARP request for the peer, nothing else.
    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let eth = EthernetFrame::new_checked(&frames[0][..]).unwrap();
    assert_eq!(eth.dst_addr(), EthernetAddress::BROADCAST);
    assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
    let arp = ArpPacket::new_checked(&eth.payload()[..28]).unwrap();
    assert_eq!(arp.operation(), ArpOperation::Request);
    assert_eq!(arp.target_protocol_addr(), PEER_IP.octets());

    // The reply releases the parked datagram.
    let reply = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: PEER_MAC,
        source_protocol_addr: PEER_IP,
        target_hardware_addr: OUR_MAC,
        target_protocol_addr: OUR_IP,
    };
    let mut payload = [0u8; 28];
    reply.emit(&mut ArpPacket::new_unchecked(&mut payload[..]));
    let frame = eth_wrap(EthernetProtocol::Arp, &payload);
    harness.inject(&frame);

    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let eth = EthernetFrame::new_checked(&frames[0][..]).unwrap();
    assert_eq!(eth.dst_addr(), PEER_MAC);
    let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
    assert_eq!(ip.total_len(), 60);
    assert!(ip.verify_checksum());
    let udp = UdpPacket::new_checked(ip.payload()).unwrap();
    assert_eq!(udp.len(), 40);
    assert_eq!(udp.dst_port(), 7);
    assert_ne!(udp.checksum(), 0);
    assert!(udp.verify_checksum(&OUR_IP, &PEER_IP));

    // Exactly one resolved mapping cached.
    assert_eq!(harness.stack.arp.len(), 1);
    let entry = harness.stack.arp.get(PEER_IP).unwrap();
    assert_eq!(entry.hardware_addr, PEER_MAC);
}

/// S2: fragmenting output at MTU 576 and reassembly of the echoes.
#[test]
fn s2_fragmentation_roundtrip() {
    let mut harness = Harness::new(576);
    harness.arp_preload();

    // A 1200-byte echo request out through a raw socket.
    let mut icmp = vec![0u8; 1200];
    {
        let mut packet = Icmpv4Packet::new_unchecked(&mut icmp[..]);
        packet.set_msg_type(Icmpv4Message::EchoRequest);
        packet.set_msg_code(0);
        packet.set_echo_ident(0x77);
        packet.set_echo_seq_no(1);
    }
    for (i, byte) in icmp[8..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    let sum = !crate::wire::checksum::data(&icmp);
    Icmpv4Packet::new_unchecked(&mut icmp[..]).set_checksum(sum);

    let SockId::Raw(r) = harness.stack.raw_create(IpProtocol::Icmp).unwrap() else {
        panic!()
    };
    harness.stack.raw_sendto(r, &icmp, PEER_IP).unwrap();

    let frames = harness.frames();
    assert_eq!(frames.len(), 3);
    let mut ident = None;
    let expect = [(552, 0, true), (552, 552, true), (96, 1104, false)];
    for (frame, (size, offset, more)) in frames.iter().zip(expect) {
        let ip_bytes = ip_of(frame);
        let ip = Ipv4Packet::new_checked(&ip_bytes[..]).unwrap();
        assert!(ip.verify_checksum());
        assert_eq!(usize::from(ip.total_len()), IPV4_HEADER_LEN + size);
        assert_eq!(usize::from(ip.frag_offset()), offset);
        assert_eq!(ip.more_frags(), more);
        match ident {
            None => ident = Some(ip.ident()),
            Some(id) => assert_eq!(ip.ident(), id),
        }
    }

    // Swap the addresses and feed the fragments back: the reassembled
    // request earns a 1200-byte echo reply (fragmented again).
    for frame in frames {
        let mut ip_bytes = ip_of(&frame);
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut ip_bytes[..]);
            ip.set_src_addr(PEER_IP);
            ip.set_dst_addr(OUR_IP);
            ip.fill_checksum();
        }
        let frame = eth_wrap(EthernetProtocol::Ipv4, &ip_bytes);
        harness.inject(&frame);
    }
    assert!(harness.stack.frags.is_empty());

    let replies = harness.frames();
    assert_eq!(replies.len(), 3);
    let first = ip_of(&replies[0]);
    let first_ip = Ipv4Packet::new_checked(&first[..]).unwrap();
    assert_eq!(first_ip.dst_addr(), PEER_IP);
    let icmp_reply = Icmpv4Packet::new_unchecked(first_ip.payload());
    assert_eq!(icmp_reply.msg_type(), Icmpv4Message::EchoReply);
    let total: usize = replies
        .iter()
        .map(|f| {
            let ip_bytes = ip_of(f);
            ip_bytes.len() - IPV4_HEADER_LEN
        })
        .sum();
    assert_eq!(total, 1200);
}

/// S3: the three-way handshake with a pinned ISS.
#[test]
fn s3_three_way_handshake() {
    let mut harness = Harness::new(1500);
    let i = establish(&mut harness, 100, 4096);
    assert_eq!(harness.tcp(i).snd.una, SeqNumber(32436));
    assert_eq!(harness.tcp(i).rcv.nxt, SeqNumber(101));
    assert_eq!(harness.tcp(i).snd.ostate, OutState::Idle);
}

/// The SYN carries the MSS and SACK-permitted options, padded out.
#[test]
fn syn_options_on_the_wire() {
    let mut harness = Harness::new(1500);
    harness.arp_preload();
    let SockId::Tcp(i) = harness.stack.tcp_create().unwrap() else {
        panic!()
    };
    let _ = harness.stack.tcp_connect(i, IpEndpoint::new(PEER_IP, 80));
    let frames = harness.frames();
    let syn = ip_of(&frames[0]);
    let syn = TcpPacket::new_checked(&syn[IPV4_HEADER_LEN..]).unwrap();
    assert_eq!(syn.header_len(), 28);
    // MTU 1500 minus both fixed headers.
    assert_eq!(crate::wire::parse_mss(syn.options()), Some(1460));
    assert!(syn
        .options()
        .iter()
        .any(|&b| b == crate::wire::TcpOption::KIND_SACK_PERMITTED));
}

/// S4: orderly close by the peer, then by us.
#[test]
fn s4_orderly_close() {
    let mut harness = Harness::new(1500);
    let i = establish(&mut harness, 499, 1000);
    let port = harness.tcp(i).base.local.port;
    assert_eq!(harness.tcp(i).rcv.nxt, SeqNumber(500));

    // Peer FIN at 500.
    let fin = tcp_seg(80, port, 500, 32436, false, true, true, 1000, &[]);
    harness.inject(&fin);
    assert_eq!(harness.tcp(i).state, TcpState::CloseWait);
    assert!(harness.tcp(i).flags.fin_in);
    assert_eq!(harness.tcp(i).rcv.nxt, SeqNumber(501));
    assert_eq!(harness.tcp(i).base.rcv_wait.last(), Some(Err(Error::Close)));

    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let ack = ip_of(&frames[0]);
    let ack = TcpPacket::new_checked(&ack[IPV4_HEADER_LEN..]).unwrap();
    assert_eq!(ack.ack_number(), SeqNumber(501));

    // Reading an empty, finished stream reports end-of-file.
    let (data, _) = harness.stack.tcp_recv(i, 64).unwrap();
    assert!(data.is_empty());

    // Our close queues a FIN and parks.
    assert_eq!(harness.stack.tcp_close(i), Err(Error::NeedWait));
    assert_eq!(harness.tcp(i).state, TcpState::LastAck);
    let frames = harness.frames();
    let fin_out = ip_of(&frames[0]);
    let fin_out = TcpPacket::new_checked(&fin_out[IPV4_HEADER_LEN..]).unwrap();
    assert!(fin_out.fin());
    assert_eq!(fin_out.seq_number(), SeqNumber(32436));

    // Peer ACKs our FIN: the connection winds down and the closer is
    // woken with CLOSE.
    let last_ack = tcp_seg(80, port, 501, 32437, false, true, false, 1000, &[]);
    harness.inject(&last_ack);
    assert_eq!(harness.tcp(i).state, TcpState::Closed);
    assert_eq!(harness.tcp(i).base.conn_wait.last(), Some(Err(Error::Close)));

    // The retried close releases the block.
    assert_eq!(harness.stack.tcp_close(i), Ok(()));
    assert!(harness.stack.tcp_socks[i].is_none());
}

/// S5, timer flavor: RTO expiry retransmits from `snd.una` and doubles
/// the timeout.
#[test]
fn s5_rto_retransmission() {
    let mut harness = Harness::new(140);
    let i = establish(&mut harness, 99, 1000);
    assert_eq!(harness.tcp(i).mss, 100);

    let sent = harness.stack.tcp_send(i, &[0xc3; 300]).unwrap();
    assert_eq!(sent, 300);
    let frames = harness.frames();
    assert_eq!(frames.len(), 3);
    for (n, frame) in frames.iter().enumerate() {
        let seg = ip_of(frame);
        let seg = TcpPacket::new_checked(&seg[IPV4_HEADER_LEN..]).unwrap();
        assert_eq!(seg.seq_number(), SeqNumber(32436 + 100 * n as u32));
        assert_eq!(seg.payload().len(), 100);
    }
    assert_eq!(harness.tcp(i).snd.nxt, SeqNumber(32736));
    assert_eq!(harness.tcp(i).snd.ostate, OutState::Sending);
    // The ring spans exactly the unacknowledged bytes.
    assert_eq!(
        harness.tcp(i).snd.buf.count(),
        harness.tcp(i).snd.nxt - harness.tcp(i).snd.una
    );

    // Let the retransmit timer fire.
    let rto = harness.tcp(i).snd.rto as u64;
    let una_before = harness.tcp(i).snd.una;
    harness.tick(rto);
    assert_eq!(harness.tcp(i).snd.ostate, OutState::Rexmit);
    assert_eq!(harness.tcp(i).snd.rto as u64, rto * 2);
    // snd.una never went backwards.
    assert_eq!(harness.tcp(i).snd.una, una_before);

    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let seg = ip_of(&frames[0]);
    let seg = TcpPacket::new_checked(&seg[IPV4_HEADER_LEN..]).unwrap();
    assert_eq!(seg.seq_number(), SeqNumber(32436));
    assert_eq!(seg.payload().len(), 100);
}

/// S5, duplicate-ACK flavor: the third duplicate triggers an immediate
/// retransmit.
#[test]
fn s5_fast_retransmit() {
    let mut harness = Harness::new(140);
    let i = establish(&mut harness, 99, 1000);
    let port = harness.tcp(i).base.local.port;

    harness.stack.tcp_send(i, &[0xc3; 300]).unwrap();
    harness.frames();

    for n in 0..3 {
        let dup = tcp_seg(80, port, 100, 32436, false, true, false, 1000, &[]);
        harness.inject(&dup);
        if n < 2 {
            assert!(harness.frames().is_empty());
            assert_eq!(harness.tcp(i).snd.ostate, OutState::Sending);
        }
    }

    assert_eq!(harness.tcp(i).snd.ostate, OutState::Rexmit);
    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let seg = ip_of(&frames[0]);
    let seg = TcpPacket::new_checked(&seg[IPV4_HEADER_LEN..]).unwrap();
    assert_eq!(seg.seq_number(), SeqNumber(32436));
}

/// S6: an unanswered ARP gives up after five requests and starts fresh
/// on the next send.
#[test]
fn s6_arp_timeout() {
    let quiet = Ipv4Address::new(10, 0, 0, 9);
    let mut harness = Harness::new(1500);
    let SockId::Udp(u) = harness.stack.udp_create().unwrap() else {
        panic!()
    };
    harness
        .stack
        .udp_sendto(u, b"anyone there", IpEndpoint::new(quiet, 7))
        .unwrap();

    let mut requests = 0;
    let count_arps = |frames: &[Vec<u8>]| {
        frames
            .iter()
            .filter(|f| {
                let eth = EthernetFrame::new_checked(&f[..]).unwrap();
                eth.ethertype() == EthernetProtocol::Arp && {
                    let arp = ArpPacket::new_checked(&eth.payload()[..28]).unwrap();
                    arp.operation() == ArpOperation::Request
                        && arp.target_protocol_addr() == quiet.octets()
                }
            })
            .count()
    };

    requests += count_arps(&harness.frames());
    for _ in 0..6 {
        harness.tick(1000);
        requests += count_arps(&harness.frames());
    }
    assert_eq!(requests, 5);
    assert!(harness.stack.arp.get(quiet).is_none());

    // A later send starts the cycle over.
    harness
        .stack
        .udp_sendto(u, b"still there", IpEndpoint::new(quiet, 7))
        .unwrap();
    assert_eq!(count_arps(&harness.frames()), 1);
    assert!(harness.stack.arp.get(quiet).is_some());
}

/// UDP datagrams for a port nobody owns earn a port-unreachable with
/// the offending datagram quoted.
#[test]
fn udp_unreachable_for_unbound_port() {
    let mut harness = Harness::new(1500);
    harness.arp_preload();

    let mut udp = vec![0u8; 8 + 5];
    {
        let mut packet = UdpPacket::new_unchecked(&mut udp[..]);
        packet.set_src_port(9000);
        packet.set_dst_port(4242);
        packet.set_len(13);
        packet.payload_mut().copy_from_slice(b"knock");
        packet.fill_checksum(&PEER_IP, &OUR_IP);
    }
    let frame = eth_wrap(EthernetProtocol::Ipv4, &ip_wrap(IpProtocol::Udp, &udp));
    harness.inject(&frame);

    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let ip_bytes = ip_of(&frames[0]);
    let ip = Ipv4Packet::new_checked(&ip_bytes[..]).unwrap();
    assert_eq!(ip.next_header(), IpProtocol::Icmp);
    assert_eq!(ip.dst_addr(), PEER_IP);
    let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
    assert_eq!(icmp.msg_type(), Icmpv4Message::DstUnreachable);
    assert_eq!(icmp.msg_code(), 3);
    // The quote leads with the offending IP header.
    let quoted = Ipv4Packet::new_checked(icmp.data()).unwrap();
    assert_eq!(quoted.src_addr(), PEER_IP);
    assert_eq!(quoted.next_header(), IpProtocol::Udp);
}

/// Window updates obey the (wl1, wl2) staleness rule.
#[test]
fn window_update_guard() {
    let mut harness = Harness::new(1500);
    let i = establish(&mut harness, 99, 1000);
    let port = harness.tcp(i).base.local.port;
    assert_eq!(harness.tcp(i).snd.win, 1000);

    // Same seq, same ack: accepted.
    let upd = tcp_seg(80, port, 100, 32436, false, true, false, 600, &[]);
    harness.inject(&upd);
    assert_eq!(harness.tcp(i).snd.win, 600);

    // Same seq, older ack: rejected as stale.
    let stale = tcp_seg(80, port, 100, 32430, false, true, false, 50, &[]);
    harness.inject(&stale);
    assert_eq!(harness.tcp(i).snd.win, 600);
}

/// The deterministic ISS generator strides by its fixed increment.
#[test]
fn iss_fixed_increment() {
    let mut harness = Harness::new(1500);
    harness.stack.set_next_iss(32435);
    assert_eq!(harness.stack.tcp_next_iss(), SeqNumber(32435));
    assert_eq!(harness.stack.tcp_next_iss(), SeqNumber(32740));
}

/// Keepalive probes an idle peer and tears the connection down when
/// nothing answers.
#[test]
fn keepalive_gives_up() {
    let mut harness = Harness::new(1500);
    let i = establish(&mut harness, 99, 1000);

    harness
        .stack
        .handle_request(crate::socket::Request::SetOpt(
            SockId::Tcp(i),
            SockOpt::KeepIdle(1),
        ));
    harness
        .stack
        .handle_request(crate::socket::Request::SetOpt(
            SockId::Tcp(i),
            SockOpt::KeepIntvl(1),
        ));
    harness
        .stack
        .handle_request(crate::socket::Request::SetOpt(
            SockId::Tcp(i),
            SockOpt::KeepCnt(2),
        ));
    harness
        .stack
        .handle_request(crate::socket::Request::SetOpt(
            SockId::Tcp(i),
            SockOpt::KeepAlive(true),
        ));

    // Two probes, one per idle interval, each one sequence number back.
    for _ in 0..2 {
        harness.tick(1000);
        let frames = harness.frames();
        assert_eq!(frames.len(), 1);
        let seg = ip_of(&frames[0]);
        let seg = TcpPacket::new_checked(&seg[IPV4_HEADER_LEN..]).unwrap();
        assert!(seg.ack());
        assert_eq!(seg.seq_number(), SeqNumber(32435));
    }

    // The budget runs out: a reset goes to the peer and the waiters
    // learn about the timeout.
    harness.tick(1000);
    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let seg = ip_of(&frames[0]);
    let seg = TcpPacket::new_checked(&seg[IPV4_HEADER_LEN..]).unwrap();
    assert!(seg.rst());
    assert_eq!(harness.tcp(i).state, TcpState::Closed);
    assert_eq!(harness.tcp(i).base.err, Some(Error::Timeout));
}

/// Passive open: listen, spawn on SYN, accept once established.
#[test]
fn listen_accept_lifecycle() {
    let mut harness = Harness::new(1500);
    harness.arp_preload();
    let SockId::Tcp(listener) = harness.stack.tcp_create().unwrap() else {
        panic!()
    };
    harness
        .stack
        .tcp_bind(listener, IpEndpoint::new(OUR_IP, 80))
        .unwrap();
    harness.stack.tcp_listen(listener, 4).unwrap();

    // Nothing to accept yet.
    assert_eq!(harness.stack.tcp_accept(listener), Err(Error::NeedWait));

    // SYN from the peer spawns an inactive child in SYN_RECVD.
    harness.stack.set_next_iss(5000);
    let syn = tcp_seg(9000, 80, 700, 0, true, false, false, 2000, &[]);
    harness.inject(&syn);

    let frames = harness.frames();
    assert_eq!(frames.len(), 1);
    let synack = ip_of(&frames[0]);
    let synack = TcpPacket::new_checked(&synack[IPV4_HEADER_LEN..]).unwrap();
    assert!(synack.syn() && synack.ack());
    assert_eq!(synack.seq_number(), SeqNumber(5000));
    assert_eq!(synack.ack_number(), SeqNumber(701));
    assert_eq!(harness.stack.tcp_backlog_count(listener), 1);
    assert_eq!(harness.stack.tcp_accept(listener), Err(Error::NeedWait));

    // The handshake ACK promotes the child and wakes the listener.
    let ticket = harness.tcp(listener).base.conn_wait.ticket();
    let ack = tcp_seg(9000, 80, 701, 5001, false, true, false, 2000, &[]);
    harness.inject(&ack);
    assert!(harness.tcp(listener).base.conn_wait.ticket() > ticket);

    let (child, peer) = harness.stack.tcp_accept(listener).unwrap();
    assert_eq!(peer, IpEndpoint::new(PEER_IP, 9000));
    assert_eq!(harness.tcp(child).state, TcpState::Established);
    assert!(!harness.tcp(child).flags.inactive);
    assert_eq!(harness.tcp(child).base.local.port, 80);
}

/// A listener's backlog bounds unaccepted children.
#[test]
fn listen_backlog_limits_children() {
    let mut harness = Harness::new(1500);
    harness.arp_preload();
    let SockId::Tcp(listener) = harness.stack.tcp_create().unwrap() else {
        panic!()
    };
    harness
        .stack
        .tcp_bind(listener, IpEndpoint::new(OUR_IP, 80))
        .unwrap();
    harness.stack.tcp_listen(listener, 2).unwrap();

    for port in [9000u16, 9001, 9002] {
        let syn = tcp_seg(port, 80, 700, 0, true, false, false, 2000, &[]);
        harness.inject(&syn);
    }
    // The third SYN was dropped on the floor.
    assert_eq!(harness.stack.tcp_backlog_count(listener), 2);
    assert_eq!(harness.frames().len(), 2);
}

/// Data flows into the receive ring in order; a hole only provokes a
/// duplicate ACK.
#[test]
fn tcp_in_order_receive_and_hole() {
    let mut harness = Harness::new(1500);
    let i = establish(&mut harness, 99, 1000);
    let port = harness.tcp(i).base.local.port;

    let data = tcp_seg(80, port, 100, 32436, false, true, false, 1000, b"hello");
    harness.inject(&data);
    assert_eq!(harness.tcp(i).rcv.nxt, SeqNumber(105));
    let frames = harness.frames();
    let ack = ip_of(&frames[0]);
    let ack = TcpPacket::new_checked(&ack[IPV4_HEADER_LEN..]).unwrap();
    assert_eq!(ack.ack_number(), SeqNumber(105));

    // A segment beyond the expected sequence leaves a hole: dropped,
    // re-ACKed at the old edge.
    let ooo = tcp_seg(80, port, 205, 32436, false, true, false, 1000, b"late");
    harness.inject(&ooo);
    assert_eq!(harness.tcp(i).rcv.nxt, SeqNumber(105));
    let frames = harness.frames();
    let ack = ip_of(&frames[0]);
    let ack = TcpPacket::new_checked(&ack[IPV4_HEADER_LEN..]).unwrap();
    assert_eq!(ack.ack_number(), SeqNumber(105));

    let (data, from) = harness.stack.tcp_recv(i, 64).unwrap();
    assert_eq!(data, b"hello");
    assert_eq!(from, IpEndpoint::new(PEER_IP, 80));
}

/// A RST from the peer tears the connection down at once.
#[test]
fn rst_aborts_connection() {
    let mut harness = Harness::new(1500);
    let i = establish(&mut harness, 99, 1000);
    let port = harness.tcp(i).base.local.port;

    let rst_frame = {
        let mut bytes = vec![0; TCP_HEADER_LEN];
        let mut packet = TcpPacket::new_unchecked(&mut bytes[..]);
        packet.set_src_port(80);
        packet.set_dst_port(port);
        packet.clear_flags();
        packet.set_header_len(TCP_HEADER_LEN as u8);
        packet.set_seq_number(SeqNumber(100));
        packet.set_ack_number(SeqNumber(32436));
        packet.set_rst(true);
        packet.set_ack(true);
        packet.set_window_len(0);
        packet.fill_checksum(&PEER_IP, &OUR_IP);
        bytes
    };
    let frame = eth_wrap(
        EthernetProtocol::Ipv4,
        &ip_wrap(IpProtocol::Tcp, &rst_frame),
    );
    harness.inject(&frame);

    assert_eq!(harness.tcp(i).state, TcpState::Closed);
    assert_eq!(harness.tcp(i).base.err, Some(Error::Reset));
    assert_eq!(harness.tcp(i).base.rcv_wait.last(), Some(Err(Error::Reset)));
}
