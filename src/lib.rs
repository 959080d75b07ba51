//! Reliable, message oriented delivery over plain UDP.
//!
//! An application binds an [end_point::EndPoint] and sends *messages* (defined-length chunks of
//!  data, from empty to several megabytes) to peers, which receive each message exactly once
//!  and byte-identical to what was sent. Messages are independent of each other: there is no
//!  ordering guarantee across messages, concurrent messages complete in whatever order they
//!  happen to complete.
//!
//! ## Design goals
//!
//! * peer-to-peer: there is no client vs. server, and no connection setup or handshake. A
//!   message starts with its first fragment, and there is no state for a peer beyond the
//!   messages in flight
//! * big messages are chunked into fragments that fit into a single UDP datagram without IP level
//!   fragmentation. The MTU is configured since discovery does not work reliably.
//! * fragments are accepted strictly in order: a fragment that does not continue exactly where
//!   the receiver is, is discarded and triggers a resend request. This trades retransmission
//!   of possibly received fragments for trivial reassembly.
//! * the sender keeps a bounded window of fragments in flight, sliding it when everything sent
//!   so far was acknowledged
//! * retransmission is purely timeout based, there is no RTT estimation or congestion control
//! * a sender gives up after a configurable time without any reaction from the receiver, and a
//!   receiver discards partial messages after a configurable time without new fragments
//! * memory is bounded under load: send, receive and in-flight queues have caps, and excess
//!   work is rejected or dropped rather than buffered
//!
//! ## Wire format
//!
//! All numbers are in network byte order (BE):
//! ```ascii
//! 0:  protocol id (u32) - 0x5544_4d31, non-matching datagrams are dropped
//! 4:  kind (u8):
//!     * 0 DATA_PART
//!     * 1 DATA_RESEND
//!     * 2 DATA_ACK
//! 5:  message id (u32)
//! 9:  position (u32) - byte offset into the message
//! ```
//!
//! DATA_PART continues with the fragment:
//! ```ascii
//! 13: flags (u8):
//!     * bit 0: is last fragment of the message
//!     * bits 1-7: reserved, must be 0
//! 14: data length (varint u32)
//! *:  data
//! ```
//!
//! DATA_RESEND ("I am stuck at `position`") and DATA_ACK ("I have `position` contiguous bytes")
//!  have no further fields. An ack for the message's full length signals completion.
//!
//! ## Message ids
//!
//! The sender picks a random u32 id for each message that is neither used by one of its active
//!  sends nor in its completed-id cache. The receiver identifies messages by id alone, and it
//!  remembers recently completed ids (and their lengths) to re-acknowledge duplicate fragments
//!  whose final ack was lost, never delivering a message twice.

pub mod completed_ids;
pub mod config;
pub mod datagram;
pub mod end_point;
pub mod error;
pub mod lookup;
pub mod receive_supervisor;
pub mod safe_converter;
pub mod send_pipeline;
pub mod send_supervisor;
pub mod util;

#[cfg(test)] mod test_util;
