use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::messaging::message_module::{MessageModule, MessageModuleId, RequestHandler};

/// A [MessageModule] that records every message it receives
pub struct RecordingMessageModule {
    id: MessageModuleId,
    received: RwLock<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingMessageModule {
    pub fn new(id: MessageModuleId) -> Arc<RecordingMessageModule> {
        Arc::new(RecordingMessageModule {
            id,
            received: Default::default(),
        })
    }

    /// all messages received so far, in the order they were dispatched
    pub async fn received(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.received.read().await.clone()
    }

    pub async fn received_count(&self) -> usize {
        self.received.read().await.len()
    }
}

#[async_trait]
impl MessageModule for RecordingMessageModule {
    fn id(&self) -> MessageModuleId {
        self.id
    }

    async fn on_message(&self, sender: SocketAddr, buf: &[u8]) {
        self.received.write().await.push((sender, buf.to_vec()));
    }
}


type BoxedResponseFuture = Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send>>;

/// A [RequestHandler] that delegates to a closure
pub struct FnRequestHandler {
    id: MessageModuleId,
    f: Box<dyn Fn(SocketAddr, Vec<u8>) -> BoxedResponseFuture + Send + Sync>,
}

impl FnRequestHandler {
    pub fn new<F, Fut>(id: MessageModuleId, f: F) -> Arc<FnRequestHandler>
    where
        F: Fn(SocketAddr, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
    {
        Arc::new(FnRequestHandler {
            id,
            f: Box::new(move |sender, buf| Box::pin(f(sender, buf))),
        })
    }

    /// a handler that responds with the request's bytes
    pub fn echo(id: MessageModuleId) -> Arc<FnRequestHandler> {
        Self::new(id, |_, buf| async move { Ok::<_, anyhow::Error>(buf) })
    }
}

#[async_trait]
impl RequestHandler for FnRequestHandler {
    fn id(&self) -> MessageModuleId {
        self.id
    }

    async fn on_request(&self, sender: SocketAddr, buf: &[u8]) -> anyhow::Result<Vec<u8>> {
        (self.f)(sender, buf.to_vec()).await
    }
}
