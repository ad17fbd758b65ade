use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::messaging::envelope::Envelope;
use crate::messaging::pending_ack_set::PendingAckSet;
use crate::messaging::transport::Transport;

/// Periodically re-sends every message in the [PendingAckSet], unmodified - i.e. with its
///  original sequence number, which is what makes re-sending idempotent on the receiving side.
///
/// The loop works on a snapshot of the pending set, so sending never holds up ACK processing.
///  It is stopped cooperatively: cancellation is checked between ticks and between datagrams,
///  and [Retransmitter::shutdown] waits for the loop to exit.
pub struct Retransmitter {
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Retransmitter {
    pub fn spawn(resend_interval: Duration, pending_acks: Arc<PendingAckSet>, transport: Arc<dyn Transport>) -> Retransmitter {
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::do_loop(resend_interval, pending_acks, transport, cancel_token.clone()));

        Retransmitter {
            cancel_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops the loop and waits for it to finish. No datagrams are re-sent after this returns.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();

        let handle = self.handle.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("retransmission loop terminated abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }

    async fn do_loop(resend_interval: Duration, pending_acks: Arc<PendingAckSet>, transport: Arc<dyn Transport>, cancel_token: CancellationToken) {
        info!("starting retransmission loop with interval {:?}", resend_interval);

        let mut ticks = interval_at(Instant::now() + resend_interval, resend_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = ticks.tick() => {}
            }

            let pending = pending_acks.snapshot().await;
            if !pending.is_empty() {
                trace!("re-sending {} unacknowledged messages", pending.len());
            }

            for entry in pending {
                if cancel_token.is_cancelled() {
                    break;
                }

                let datagram = Envelope::Message(entry.message).to_bytes();
                if let Err(e) = transport.send(entry.recipient, &datagram).await {
                    debug!("error re-sending message to {:?}: {}", entry.recipient, e);
                }
            }
        }

        info!("retransmission loop terminated");
    }
}

impl Drop for Retransmitter {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::time::sleep;

    use super::*;
    use crate::messaging::envelope::{DeliveryMode, SequencedMessage};
    use crate::test_util::node::test_peer_addr;
    use crate::test_util::transport::TrackingMockTransport;

    fn msg(sequence: u64) -> SequencedMessage {
        SequencedMessage {
            sequence,
            mode: DeliveryMode::Reliable,
            payload: Bytes::from_static(b"data"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resends_pending_messages_periodically() {
        let pending_acks = Arc::new(PendingAckSet::default());
        pending_acks.add(test_peer_addr(2), msg(1)).await;
        pending_acks.add(test_peer_addr(3), msg(4)).await;

        let transport = Arc::new(TrackingMockTransport::new(test_peer_addr(1)));
        let retransmitter = Retransmitter::spawn(Duration::from_millis(64), pending_acks.clone(), transport.clone());

        sleep(Duration::from_millis(60)).await;
        assert!(transport.sent_datagrams().await.is_empty());

        sleep(Duration::from_millis(10)).await;
        let sent = transport.sent_datagrams().await;
        assert_eq!(sent, vec![
            (test_peer_addr(2), Envelope::Message(msg(1)).to_bytes().to_vec()),
            (test_peer_addr(3), Envelope::Message(msg(4)).to_bytes().to_vec()),
        ]);

        pending_acks.remove_matching(test_peer_addr(2), 1).await;
        sleep(Duration::from_millis(64)).await;
        assert_eq!(transport.sent_datagrams().await, vec![
            (test_peer_addr(3), Envelope::Message(msg(4)).to_bytes().to_vec()),
        ]);

        retransmitter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_is_sent_after_shutdown() {
        let pending_acks = Arc::new(PendingAckSet::default());
        pending_acks.add(test_peer_addr(2), msg(1)).await;

        let transport = Arc::new(TrackingMockTransport::new(test_peer_addr(1)));
        let retransmitter = Retransmitter::spawn(Duration::from_millis(64), pending_acks.clone(), transport.clone());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.sent_datagrams().await.len(), 1);

        retransmitter.shutdown().await;
        assert!(!retransmitter.is_running());

        sleep(Duration::from_secs(10)).await;
        assert!(transport.sent_datagrams().await.is_empty());
        assert_eq!(pending_acks.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_the_loop() {
        let pending_acks = Arc::new(PendingAckSet::default());
        pending_acks.add(test_peer_addr(2), msg(1)).await;

        let transport = Arc::new(TrackingMockTransport::new(test_peer_addr(1)));
        drop(Retransmitter::spawn(Duration::from_millis(64), pending_acks, transport.clone()));

        sleep(Duration::from_secs(1)).await;
        assert!(transport.sent_datagrams().await.is_empty());
    }
}
