use thiserror::Error;

use crate::packet::ResultCode;

/// Outcome taxonomy for a single request or bulk transfer.
///
/// Transport-level noise (malformed or unmatched datagrams) is recovered locally
///  and never surfaces through this type; what does surface is always a terminal
///  outcome of a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScpError {
    /// No matching response after exhausting all transmission attempts.
    #[error("no response after {attempts} transmission attempts")]
    Timeout { attempts: u32 },

    /// The network layer reported an error while sending. Terminal, no further retry.
    #[error("sending the request datagram failed: {0}")]
    TransmissionFailure(String),

    /// An inbound datagram too short to hold a valid header. Used on internal
    ///  paths only; the receive loop drops such datagrams silently.
    #[error("datagram of {len} bytes is too short for an SCP packet")]
    MalformedPacket { len: usize },

    /// The connection was closed while the request was queued or in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// SCP commands carry at most three argument words.
    #[error("{0} argument words, SCP allows at most 3")]
    TooManyArgs(usize),

    /// The outbound payload exceeds the connection's negotiated data-field length.
    #[error("payload of {len} bytes exceeds the data-field length of {max}")]
    PayloadTooLong { len: usize, max: usize },

    /// A bulk transfer would run past the end of the 32-bit remote address space.
    #[error("transfer of {len} bytes at {base:#x} exceeds the 32-bit address space")]
    AddressOverflow { base: u32, len: usize },

    /// The remote side answered with a non-Ok result code (bulk transfer chunks).
    #[error("remote endpoint answered with result code {0:?}")]
    Command(ResultCode),

    /// A read chunk's response payload did not have the requested length.
    #[error("response payload of {got} bytes where {expected} were requested")]
    UnexpectedResponseLength { expected: usize, got: usize },
}
