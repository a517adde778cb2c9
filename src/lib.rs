/*! A from-scratch user-space TCP/IP v4 stack.

`netstack` implements the link, network and transport layers — Ethernet
framing, ARP resolution, IPv4 with fragmentation and reassembly, ICMPv4,
UDP and a full RFC 793 TCP — behind a message-driven engine suitable for
hosts where one event loop owns all protocol state.

The crate is organized bottom-up:

 * [`pktbuf`] — chained, pool-backed packet buffers with a read/write
   cursor, header push/pop and streaming Internet checksum.
 * [`wire`] — zero-copy packet views and high-level representations for
   each protocol header, in the `Packet`/`Repr` style.
 * [`iface`] — network interfaces, the Ethernet link layer, the ARP
   cache/resolver and the longest-prefix route table.
 * [`net`] — the IPv4 input/output pipeline and ICMPv4.
 * [`socket`] — UDP, raw and TCP sockets plus the request/reply engine
   API that user threads talk to.
 * [`stack`] — the [`stack::Stack`] engine owning every table above, and
   the dispatcher that drives it from a unified work queue.

All protocol state is owned by whoever owns the `Stack`; the only shared
structures are the block pool and the work queue. See `Stack::poll` for
the event-loop contract.
*/

#[macro_use]
mod macros;

pub mod config;
pub mod error;
pub mod fixq;
pub mod iface;
pub mod net;
pub mod pktbuf;
pub mod socket;
pub mod stack;
pub mod time;
pub mod timer;
pub mod wire;

pub use self::error::Error;
pub use self::stack::Stack;

/// Convenience alias used by every fallible engine operation.
pub type Result<T> = core::result::Result<T, Error>;
