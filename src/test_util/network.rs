use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::messaging::transport::{MessageHandler, Transport};
use crate::util::random::Random;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub buf: Vec<u8>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DatagramFate {
    Deliver,
    Drop,
    Duplicate,
}

type DatagramFilter = Box<dyn FnMut(&Datagram) -> DatagramFate + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// An in-memory datagram network connecting any number of nodes. Each node gets a [Transport]
///  from [TestNetwork::add_node] that delivers to the other nodes' receive loops.
///
/// A filter decides the fate of each datagram, making it possible to simulate loss and
///  duplication, deterministically or randomly. All datagrams are logged before the filter
///  is applied.
pub struct TestNetwork {
    mailboxes: Mutex<FxHashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>,
    filter: Mutex<DatagramFilter>,
    log: Mutex<Vec<Datagram>>,
}

impl TestNetwork {
    pub fn new() -> Arc<TestNetwork> {
        Arc::new(TestNetwork {
            mailboxes: Default::default(),
            filter: Mutex::new(Box::new(|_| DatagramFate::Deliver)),
            log: Default::default(),
        })
    }

    pub fn add_node(self: &Arc<Self>, addr: SocketAddr) -> Arc<TestNetworkTransport> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if lock(&self.mailboxes).insert(addr, sender).is_some() {
            debug!("replacing node {:?} in test network", addr);
        }

        Arc::new(TestNetworkTransport {
            addr,
            network: self.clone(),
            inbox: Mutex::new(Some(receiver)),
            cancel_token: CancellationToken::new(),
        })
    }

    pub fn set_filter(&self, filter: impl FnMut(&Datagram) -> DatagramFate + Send + 'static) {
        *lock(&self.filter) = Box::new(filter);
    }

    /// Drops each datagram with the given probability
    pub fn set_random_loss<R: Random + 'static>(&self, probability: f64) {
        self.set_filter(move |_| {
            if R::gen_probability() < probability {
                DatagramFate::Drop
            }
            else {
                DatagramFate::Deliver
            }
        });
    }

    /// returns all datagrams sent through the network so far (including dropped ones), clearing
    ///  the log
    pub fn take_log(&self) -> Vec<Datagram> {
        std::mem::take(&mut *lock(&self.log))
    }

    fn transmit(&self, datagram: Datagram) {
        lock(&self.log).push(datagram.clone());

        let fate = {
            let mut filter = lock(&self.filter);
            filter(&datagram)
        };
        let copies = match fate {
            DatagramFate::Deliver => 1,
            DatagramFate::Drop => 0,
            DatagramFate::Duplicate => 2,
        };
        trace!("test network: {:?} -> {:?}: {:?}", datagram.from, datagram.to, fate);

        let mailboxes = lock(&self.mailboxes);
        let Some(mailbox) = mailboxes.get(&datagram.to) else {
            debug!("test network: no node at {:?} - dropping datagram", datagram.to);
            return;
        };
        for _ in 0..copies {
            // a node whose receive loop terminated just does not receive anything anymore
            let _ = mailbox.send(datagram.clone());
        }
    }
}

pub struct TestNetworkTransport {
    addr: SocketAddr,
    network: Arc<TestNetwork>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
    cancel_token: CancellationToken,
}

#[async_trait]
impl Transport for TestNetworkTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.network.transmit(Datagram {
            from: self.addr,
            to,
            buf: buf.to_vec(),
        });
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let Some(mut inbox) = lock(&self.inbox).take() else {
            anyhow::bail!("receive loop for {:?} was started before", self.addr);
        };

        loop {
            select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                datagram = inbox.recv() => {
                    match datagram {
                        Some(datagram) => handler.handle_message(&datagram.buf, datagram.from).await,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        self.cancel_token.cancel();
    }
}
