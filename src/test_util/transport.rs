use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::messaging::envelope::Envelope;
use crate::messaging::transport::{MessageHandler, Transport};

/// A [Transport] that does not send anything but records all datagrams for later inspection.
///  Its receive loop does nothing but wait to be cancelled.
pub struct TrackingMockTransport {
    myself: SocketAddr,
    tracker: Arc<RwLock<Vec<(SocketAddr, Vec<u8>)>>>,
    is_failing: AtomicBool,
    cancel_token: CancellationToken,
}

impl TrackingMockTransport {
    pub fn new(myself: SocketAddr) -> Self {
        TrackingMockTransport {
            myself,
            tracker: Default::default(),
            is_failing: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        }
    }

    /// while failing, all sends return an error and nothing is recorded
    pub fn set_failing(&self, is_failing: bool) {
        self.is_failing.store(is_failing, Ordering::Release);
    }

    /// returns sent datagrams, clearing the internal buffer
    pub async fn sent_datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut lock = self.tracker.write().await;
        std::mem::take(&mut *lock)
    }

    /// returns sent datagrams parsed as envelopes, clearing the internal buffer
    pub async fn sent_envelopes(&self) -> Vec<(SocketAddr, Envelope)> {
        self.sent_datagrams().await
            .into_iter()
            .map(|(to, buf)| {
                let envelope = Envelope::try_deser(&buf)
                    .expect("tracked datagram should be a valid envelope");
                (to, envelope)
            })
            .collect()
    }

    pub fn is_recv_loop_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[async_trait]
impl Transport for TrackingMockTransport {
    fn local_addr(&self) -> SocketAddr {
        self.myself
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        if self.is_failing.load(Ordering::Acquire) {
            bail!("simulated send failure");
        }
        self.tracker.write().await.push((to, buf.to_vec()));
        Ok(())
    }

    async fn recv_loop(&self, _handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        self.cancel_token.cancelled().await;
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        self.cancel_token.cancel();
    }
}
