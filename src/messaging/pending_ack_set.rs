use std::collections::BTreeMap;
use std::net::SocketAddr;

use tokio::sync::RwLock;
use tracing::{trace, warn};

use crate::messaging::envelope::SequencedMessage;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PendingAckEntry {
    pub recipient: SocketAddr,
    pub message: SequencedMessage,
}

/// All reliable messages that were sent but not acknowledged yet. This is the single source of
///  truth for what the retransmitter needs to re-send.
///
/// Entries are keyed by (recipient, sequence) - only reliable messages are stored, and their
///  sequence numbers are unique per recipient. Iteration order is by recipient and ascending
///  sequence number, so the oldest unacknowledged message for a peer (the one it is waiting
///  for) is re-sent first.
#[derive(Default)]
pub struct PendingAckSet {
    entries: RwLock<BTreeMap<(SocketAddr, u64), SequencedMessage>>,
}

impl PendingAckSet {
    pub async fn add(&self, recipient: SocketAddr, message: SequencedMessage) {
        trace!("tracking message {:?} to {:?} pending ACK", message, recipient);

        if let Some(prev) = self.entries.write().await
            .insert((recipient, message.sequence), message)
        {
            warn!("replacing pending message {:?} to {:?} - this is a bug", prev, recipient);
        }
    }

    /// Removes the entry for a given recipient and sequence number, returning whether there was
    ///  one. Duplicate and late ACKs find no entry, which is fine.
    pub async fn remove_matching(&self, recipient: SocketAddr, sequence: u64) -> bool {
        let removed = self.entries.write().await
            .remove(&(recipient, sequence))
            .is_some();

        if removed {
            trace!("message #{} to {:?} was acknowledged", sequence, recipient);
        }
        else {
            trace!("ACK for message #{} from {:?} matches no pending message - ignoring", sequence, recipient);
        }
        removed
    }

    /// A point-in-time copy of all entries, for iterating without holding the lock while
    ///  doing I/O
    pub async fn snapshot(&self) -> Vec<PendingAckEntry> {
        self.entries.read().await
            .iter()
            .map(|(&(recipient, _), message)| PendingAckEntry {
                recipient,
                message: message.clone(),
            })
            .collect()
    }

    /// Forcibly drops all entries for a recipient, returning the number of dropped entries. This
    ///  is the only way to stop retransmission to a peer that never acknowledges.
    pub async fn drop_recipient(&self, recipient: SocketAddr) -> usize {
        let mut entries = self.entries.write().await;
        let len_before = entries.len();
        entries.retain(|(r, _), _| r != &recipient);
        len_before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
