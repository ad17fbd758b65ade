use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::messaging::transport::{MessageHandler, Transport};

/// [Transport] implementation on top of a single tokio [UdpSocket] that is used both for
///  receiving and for sending. Using the same socket for both is what makes the source address
///  of outgoing datagrams the address that peers reply (and ACK) to.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    max_datagram_size: usize,
    cancel_token: CancellationToken,
}

impl Debug for UdpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpTransport{{local_addr:{:?}}}", &self.local_addr)
    }
}

impl UdpTransport {
    pub async fn new(self_addr: SocketAddr, max_datagram_size: usize) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(self_addr).await?;
        let local_addr = socket.local_addr()?;
        info!("bound UDP socket to {:?}", local_addr);

        Ok(UdpTransport {
            socket: Arc::new(socket),
            local_addr,
            max_datagram_size,
            cancel_token: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        // one extra byte to detect datagrams that exceed the maximum size
        let mut buf = vec![0u8; self.max_datagram_size + 1];

        info!("starting UDP receive loop on {:?}", self.local_addr);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            if len > self.max_datagram_size {
                                warn!("received a datagram from {:?} exceeding max datagram size of {} bytes - skipping", from, self.max_datagram_size);
                                continue;
                            }
                            handler.handle_message(&buf[..len], from).await;
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
            }
        }

        info!("UDP receive loop on {:?} terminated", self.local_addr);
        Ok(())
    }

    /// Stops the receive loop. Cancellation is permanent: a loop that is started afterwards
    ///  returns immediately.
    fn cancel_recv_loop(&self) {
        if self.cancel_token.is_cancelled() {
            debug!("receive loop on {:?} is already cancelled", self.local_addr);
        }
        else {
            info!("canceling receive loop on {:?}", self.local_addr);
            self.cancel_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    struct ForwardingHandler {
        sender: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    }

    #[async_trait]
    impl MessageHandler for ForwardingHandler {
        async fn handle_message(&self, buf: &[u8], sender: SocketAddr) {
            self.sender.send((buf.to_vec(), sender)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let a = Arc::new(UdpTransport::new("127.0.0.1:0".parse().unwrap(), 16).await.unwrap());
        let b = Arc::new(UdpTransport::new("127.0.0.1:0".parse().unwrap(), 16).await.unwrap());

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let handler = Arc::new(ForwardingHandler { sender });

        let b_loop = {
            let b = b.clone();
            tokio::spawn(async move { b.recv_loop(handler).await })
        };

        a.send(b.local_addr(), b"too long for the receiver").await.unwrap();
        a.send(b.local_addr(), b"hello").await.unwrap();

        let (buf, from) = tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await
            .unwrap()
            .unwrap();
        assert_eq!(buf, b"hello");
        assert_eq!(from, a.local_addr());

        b.cancel_recv_loop();
        b_loop.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_recv_loop_starts() {
        let transport = UdpTransport::new("127.0.0.1:0".parse().unwrap(), 16).await.unwrap();
        let (sender, _receiver) = mpsc::unbounded_channel();

        transport.cancel_recv_loop();

        tokio::time::timeout(Duration::from_secs(1), transport.recv_loop(Arc::new(ForwardingHandler { sender }))).await
            .expect("receive loop should return immediately after it was cancelled")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_right_after_spawning_recv_loop() {
        for _ in 0..100 {
            let transport = Arc::new(UdpTransport::new("127.0.0.1:0".parse().unwrap(), 16).await.unwrap());
            let (sender, _receiver) = mpsc::unbounded_channel();

            let recv_loop = {
                let transport = transport.clone();
                tokio::spawn(async move { transport.recv_loop(Arc::new(ForwardingHandler { sender })).await })
            };
            transport.cancel_recv_loop();

            tokio::time::timeout(Duration::from_secs(1), recv_loop).await
                .expect("receive loop should terminate when cancelled")
                .unwrap()
                .unwrap();
        }
    }
}
