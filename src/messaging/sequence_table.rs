use std::net::SocketAddr;

use rustc_hash::FxHashMap;

use crate::messaging::envelope::DeliveryMode;

/// The most recent sequence number per (peer, delivery mode). A channel keeps two independent
///  tables: one for the last sequence number sent, one for the last sequence number accepted,
///  so that being client and server to the same peer at the same time does not mix up the two
///  directions.
///
/// NB: There is no locking in here, callers are responsible for serializing access.
#[derive(Debug, Default)]
pub struct SequenceTable {
    last_sequences: FxHashMap<(SocketAddr, DeliveryMode), u64>,
}

impl SequenceTable {
    /// the last sequence number for the given peer and mode, or 0 if there was none yet
    pub fn get(&self, peer: SocketAddr, mode: DeliveryMode) -> u64 {
        self.last_sequences.get(&(peer, mode))
            .copied()
            .unwrap_or(0)
    }

    pub fn set(&mut self, peer: SocketAddr, mode: DeliveryMode, sequence: u64) {
        self.last_sequences.insert((peer, mode), sequence);
    }

    /// increments the sequence number and returns the new value
    pub fn next(&mut self, peer: SocketAddr, mode: DeliveryMode) -> u64 {
        let entry = self.last_sequences.entry((peer, mode)).or_insert(0);
        *entry += 1;
        *entry
    }
}
