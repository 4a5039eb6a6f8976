//! Client-side transport engine for SCP, a command/response protocol carried over
//!  unreliable UDP datagrams and used to control a multi-core computing fabric
//!  attached over the network.
//!
//! ## Design goals
//!
//! * Issue datagram-based remote procedure calls against a single remote endpoint
//!   * one UDP socket per [connection::Connection], exclusively owned by it
//!   * a command is a single request datagram answered by a single response datagram,
//!     matched by sequence number
//! * Tolerate packet loss via bounded retry
//!   * each outstanding request owns exactly one armed timer at a time; on expiry the
//!     packet is retransmitted *with the same sequence number*, up to a configured
//!     maximum number of attempts and with no backoff
//!   * total wait per request is bounded by `timeout * (max_retries + 1)`
//! * Multiplex several concurrent in-flight requests
//!   * a fixed pool of outstanding-request slots bounds concurrency; requests in
//!     excess of the bound wait in a FIFO backlog and are admitted as slots free up
//!   * this queue is the sole flow-control mechanism - there is no blocking API
//! * Orchestrate chunked bulk memory transfers
//!   * buffers bigger than the negotiated per-packet data length are split into
//!     chunk commands that are pipelined through the same admission machinery,
//!     completing out of order but reassembling in destination order
//! * Recover transport-level noise locally
//!   * datagrams too short to carry a header, and responses whose sequence number
//!     matches no active slot (stray, duplicate or late), are dropped silently -
//!     that is expected traffic on an unreliable channel, not an error
//!
//! ## Wire format
//!
//! SCP packet - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  destination chip x coordinate (u8)
//! 1:  destination chip y coordinate (u8)
//! 2:  destination core / cpu (u8)
//! 3:  argument count (u8): number of 32-bit argument words present, 0..=3
//! 4:  command code (u16) - request only, 0 in responses
//! 6:  result code (u16) - response only, 0 in requests
//! 8:  sequence number (u16)
//! 10: argument words (u32 each, as many as the argument count says)
//! *:  payload, bounded by the connection's negotiated data-field length
//! ```
//!
//! A response is well-formed iff it is at least the fixed header's 10 bytes; the
//!  sequence number sits at a fixed offset so the receive path can demultiplex
//!  without parsing the rest of the header.
//!
//! ## Concurrency model
//!
//! All completion paths are single-fire by construction: each request's outcome
//!  travels over a `oneshot` channel to the submitting future. Slot state is a
//!  single enum rather than a set of booleans, and the encoded packet buffer is
//!  owned by the slot's driver future for as long as the network layer may
//!  reference it - a send that is still in flight defers slot release until the
//!  send future completes, including during connection teardown.

pub mod config;
pub mod connection;
pub mod error;
pub mod packet;
pub mod send_pipeline;
pub mod transfer;

mod slot;
