//! Compile-time tunables for pools, queues, caches and protocol timers.
//!
//! Durations are in milliseconds unless the name says otherwise.

/// Payload bytes carried by one pktbuf block.
pub const PKTBUF_BLK_SIZE: usize = 128;
/// Blocks available in the shared pool.
pub const PKTBUF_BLK_CNT: usize = 256;

/// Depth of a netif input or output queue.
pub const NETIF_QUEUE_SIZE: usize = 16;
/// Depth of the dispatcher work queue.
pub const WORKQ_SIZE: usize = 64;

/// ARP cache capacity.
pub const ARP_CACHE_SIZE: usize = 16;
/// Buffers parked on one unresolved ARP entry.
pub const ARP_WAIT_PKT_MAX: usize = 5;
/// Period of the ARP scan timer.
pub const ARP_TIMER_PERIOD_MS: i64 = 1_000;
/// Lifetime of a resolved entry before re-validation, in scan ticks.
pub const ARP_ENTRY_STABLE_TICKS: u32 = 300;
/// Lifetime of a pending entry between request retries, in scan ticks.
pub const ARP_ENTRY_PENDING_TICKS: u32 = 1;
/// Requests sent before an unresolved entry is dropped.
pub const ARP_ENTRY_RETRIES: u32 = 5;

/// Route table capacity.
pub const ROUTE_TABLE_SIZE: usize = 16;

/// Concurrent IPv4 reassembly contexts.
pub const IP_FRAG_MAX_NR: usize = 4;
/// Fragments accepted into one reassembly context.
pub const IP_FRAG_MAX_BUF_NR: usize = 10;
/// Period of the reassembly scan timer.
pub const IP_FRAG_TIMER_PERIOD_MS: i64 = 1_000;
/// Context lifetime, in scan ticks.
pub const IP_FRAG_TICKS: u32 = 10;

/// Bytes of the offending datagram echoed in an ICMP unreachable.
pub const ICMP_UNREACH_DATA_MAX: usize = 576;

/// Datagrams parked on one UDP or raw socket.
pub const SOCK_RECV_QUEUE_MAX: usize = 50;
/// First dynamic port, inclusive.
pub const PORT_DYN_START: u16 = 49152;
/// Last dynamic port, exclusive.
pub const PORT_DYN_END: u16 = 65535;

/// TCP send buffer capacity.
pub const TCP_SBUF_SIZE: usize = 4096;
/// TCP receive buffer capacity.
pub const TCP_RBUF_SIZE: usize = 4096;
/// Fallback MSS when the path MTU is unknown or the route is non-local.
pub const TCP_DEFAULT_MSS: usize = 536;
/// Initial retransmission timeout.
pub const TCP_RTO_INITIAL_MS: i64 = 1_000;
/// Lower RTO clamp.
pub const TCP_RTO_MIN_MS: i64 = 200;
/// Upper RTO clamp.
pub const TCP_RTO_MAX_MS: i64 = 60_000;
/// Initial timeout of a zero-window persist probe.
pub const TCP_PERSIST_TMO_MS: i64 = 1_000;
/// Timer-driven retransmissions before the connection is aborted.
pub const TCP_RESENDING_RETRIES: u32 = 10;
/// Persist probes before the writer is woken with a timeout.
pub const TCP_PERSIST_RETRIES: u32 = 10;
/// Duplicate ACKs that trigger a fast retransmit.
pub const TCP_DUPTHRESH: u32 = 3;
/// TIME-WAIT holds the socket for twice this long.
pub const TCP_MSL_MS: i64 = 60_000;
/// Idle time before the first keepalive probe, seconds.
pub const TCP_KEEPALIVE_IDLE_S: u32 = 7200;
/// Gap between keepalive probes, seconds.
pub const TCP_KEEPALIVE_INTVL_S: u32 = 75;
/// Unanswered probes before the connection is declared dead.
pub const TCP_KEEPALIVE_CNT: u32 = 9;

/// Increment of the deterministic initial-sequence generator.
pub const TCP_ISS_INCREMENT: u32 = 305;

/// UDP socket table capacity.
pub const UDP_SOCK_MAX: usize = 32;
/// Raw socket table capacity.
pub const RAW_SOCK_MAX: usize = 8;
/// TCP socket table capacity.
pub const TCP_SOCK_MAX: usize = 32;
