pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// The raw datagram transport underneath the reliable channel. It knows nothing about
///  sequence numbers or acknowledgements - it just moves bytes, and it is allowed to lose,
///  duplicate and reorder them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Sync + Send + 'static {
    fn local_addr(&self) -> SocketAddr;

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    /// Receives datagrams and passes them to the handler until [Transport::cancel_recv_loop] is
    ///  called or an unrecoverable error occurs.
    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);
}


/// This trait decouples the implementation of message transport (different strategies) from the
///  handling of a datagram once it is received (always the same, part of the messaging core).
///
/// It is passed around as an `Arc<dyn ...>` to minimize dependencies of [Transport] implementations.
#[async_trait]
pub trait MessageHandler: Sync + Send {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr);
}
