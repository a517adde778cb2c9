//! The engine-wide error type.

use core::fmt;

use crate::wire;

/// Anything that can go wrong inside the protocol engine.
///
/// Ingress parse failures are logged and swallowed at the layer that
/// detects them; the variants below are what operations return to their
/// caller or publish through a socket wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Pool or allocator exhausted.
    NoMem,
    /// A bounded queue refused an element.
    Full,
    /// A queue had nothing to give.
    Empty,
    /// Malformed argument from the caller.
    Param,
    /// The operation is not legal in the current socket state.
    State,
    /// A length constraint was violated.
    Size,
    /// A header failed structural validation.
    Format,
    /// A checksum did not verify.
    Checksum,
    /// No route covers the destination.
    NoRoute,
    /// The destination answered unreachable, or an ACK covered unsent data.
    Unreach,
    /// The local address/port pair is taken.
    AddrInUse,
    /// The peer refused the connection.
    Refused,
    /// The peer reset the connection.
    Reset,
    /// The peer closed, or the socket is shutting down under a waiter.
    Close,
    /// A timed wait ran out, or a retry budget was exhausted.
    Timeout,
    /// An OS primitive failed underneath us.
    Sys,
    /// The request cannot complete yet; the caller was parked on the
    /// socket's wait and should block until it is woken.
    NeedWait,
}

impl From<wire::Error> for Error {
    fn from(_: wire::Error) -> Error {
        Error::Format
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Error::NoMem => "out of memory",
            Error::Full => "queue full",
            Error::Empty => "queue empty",
            Error::Param => "bad parameter",
            Error::State => "wrong state",
            Error::Size => "size error",
            Error::Format => "format error",
            Error::Checksum => "bad checksum",
            Error::NoRoute => "no route",
            Error::Unreach => "unreachable",
            Error::AddrInUse => "address in use",
            Error::Refused => "connection refused",
            Error::Reset => "connection reset",
            Error::Close => "closed",
            Error::Timeout => "timed out",
            Error::Sys => "system error",
            Error::NeedWait => "need wait",
        };
        write!(f, "{name}")
    }
}

impl std::error::Error for Error {}
