//! Reliable, ordered messaging on top of unreliable datagrams.
//!
//! A [messaging::reliable_channel::ReliableChannel] stamps every message with a sequence number
//!  per (peer, delivery mode). Receivers accept only the next expected sequence number and
//!  acknowledge reliable messages; senders re-send reliable messages until they are
//!  acknowledged. On top of that, there is request / response correlation with timeouts and
//!  cancellation.
//!
//! Every datagram is an envelope (all numbers big-endian):
//!
//! ```ascii
//! 0: envelope kind (u8): 1 = MESSAGE, 2 = ACK
//! 1: CRC-32 (u32) over the envelope kind and everything after the checksum
//! 5: MESSAGE: delivery mode (u8: 0 = unreliable, 1 = reliable), sequence (u64), payload (rest)
//!    ACK:     sequence (u64)
//! ```
//!
//! A MESSAGE's payload is one of
//!
//! ```ascii
//! 0: payload kind (u8): 1 = PLAIN, 2 = REQUEST, 3 = RESPONSE
//! PLAIN:    module id (u64), module specific data (rest)
//! REQUEST:  request id (u128), module id (u64), module specific data (rest)
//! RESPONSE: request id (u128), response data (rest)
//! ```
//!
//! There is no fragmentation: every message must fit into a single datagram.

pub mod messaging;
pub mod util;
pub mod test_util;
