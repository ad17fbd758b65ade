use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::messaging::config::ChannelConfig;
use crate::messaging::envelope::{Ack, DeliveryMode, Envelope, SequencedMessage};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::message_module::{Message, MessageModule, MessageModuleId, RequestHandler};
use crate::messaging::payload::Payload;
use crate::messaging::pending_ack_set::PendingAckSet;
use crate::messaging::request_correlator::RequestCorrelator;
use crate::messaging::retransmitter::Retransmitter;
use crate::messaging::sequence_table::SequenceTable;
use crate::messaging::transport::{MessageHandler, Transport};


/// A reliable, ordered messaging channel on top of an unreliable datagram [Transport].
///
/// Every message is stamped with a sequence number that is counted per (peer, delivery mode).
///  A receiver accepts only the next expected sequence number for a given sender and mode, and
///  it discards everything else - duplicates as well as messages that arrive ahead of a gap.
///  There is no reordering buffer: gaps are closed by the sender re-sending every reliable
///  message until it is acknowledged.
///
/// Reliable messages are acknowledged individually by an ACK envelope. Unreliable messages are
///  sent once and never acknowledged, so a lost unreliable message causes all subsequent
///  unreliable messages from that sender to be discarded.
///
/// On top of this, the channel does request / response correlation: a request carries a random
///  id, the [RequestHandler] registered for its module id produces a response, and the channel
///  sends that response back to the requester.
pub struct ReliableChannel {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    /// held across sequence assignment and handing the datagram to the transport, so datagrams
    ///  go out in sequence order
    outgoing: Mutex<SequenceTable>,
    /// held across sequence validation, ACK and dispatch, so messages are dispatched in order
    incoming: Mutex<SequenceTable>,
    pending_acks: Arc<PendingAckSet>,
    requests: RequestCorrelator,
    message_modules: RwLock<FxHashMap<MessageModuleId, Arc<dyn MessageModule>>>,
    request_handlers: RwLock<FxHashMap<MessageModuleId, Arc<dyn RequestHandler>>>,
    retransmitter: Retransmitter,
    shutdown_token: CancellationToken,
}

impl Debug for ReliableChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReliableChannel{{local_addr:{:?}}}", self.transport.local_addr())
    }
}

impl ReliableChannel {
    /// Creates a channel and starts its retransmission loop, so this must be called from inside
    ///  a tokio runtime. Receiving is started separately by [ReliableChannel::recv_loop].
    pub fn new(config: ChannelConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Arc<ReliableChannel>> {
        config.validate()?;

        let pending_acks = Arc::new(PendingAckSet::default());
        let retransmitter = Retransmitter::spawn(config.resend_interval, pending_acks.clone(), transport.clone());

        Ok(Arc::new(ReliableChannel {
            config,
            transport,
            outgoing: Default::default(),
            incoming: Default::default(),
            pending_acks,
            requests: Default::default(),
            message_modules: Default::default(),
            request_handlers: Default::default(),
            retransmitter,
            shutdown_token: CancellationToken::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Stops all background activity: the retransmission loop is stopped (and no datagram is
    ///  re-sent after this returns, even if there are unacknowledged messages), pending requests
    ///  fail with [MessagingError::ChannelShutDown], and the transport's receive loop is
    ///  cancelled. Sending after shutdown fails, and received datagrams are ignored.
    pub async fn shutdown(&self) {
        if self.shutdown_token.is_cancelled() {
            debug!("channel on {:?} is already shut down", self.local_addr());
            return;
        }

        info!("shutting down channel on {:?}", self.local_addr());
        self.shutdown_token.cancel();

        // wait for sends that passed the shutdown check before it was cancelled
        drop(self.outgoing.lock().await);

        self.retransmitter.shutdown().await;
        self.requests.fail_all(|| MessagingError::ChannelShutDown);
        self.transport.cancel_recv_loop();

        let num_unacknowledged = self.pending_acks.len().await;
        if num_unacknowledged > 0 {
            debug!("{} messages were not acknowledged at shutdown", num_unacknowledged);
        }
    }

    pub async fn register_module(&self, message_module: Arc<dyn MessageModule>) -> anyhow::Result<()> {
        match self.message_modules.write().await
            .entry(message_module.id())
        {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second message module for module id {:?}", message_module.id()))
            }
            Entry::Vacant(e) => {
                debug!("registering message module {:?}", message_module.id());
                e.insert(message_module);
                Ok(())
            }
        }
    }

    pub async fn deregister_module(&self, id: MessageModuleId) -> anyhow::Result<()> {
        let prev = self.message_modules.write().await
            .remove(&id);
        if prev.is_none() {
            return Err(anyhow!("deregistering a module that was not previously registered: {:?}", id));
        }
        Ok(())
    }

    pub async fn register_request_handler(&self, handler: Arc<dyn RequestHandler>) -> anyhow::Result<()> {
        match self.request_handlers.write().await
            .entry(handler.id())
        {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second request handler for module id {:?}", handler.id()))
            }
            Entry::Vacant(e) => {
                debug!("registering request handler {:?}", handler.id());
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub async fn deregister_request_handler(&self, id: MessageModuleId) -> anyhow::Result<()> {
        let prev = self.request_handlers.write().await
            .remove(&id);
        if prev.is_none() {
            return Err(anyhow!("deregistering a request handler that was not previously registered: {:?}", id));
        }
        Ok(())
    }

    /// Sends a typed message to the module it belongs to
    pub async fn send_message<M: Message>(&self, to: SocketAddr, msg: &M, mode: DeliveryMode) -> MessagingResult<()> {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        self.send_to_module(to, msg.module_id(), buf.freeze(), mode).await
    }

    /// Sends raw module data to the [MessageModule] registered for `module_id` on the receiving
    ///  side. Success means that the datagram was handed to the transport - for reliable
    ///  messages, the channel keeps re-sending it until it is acknowledged.
    pub async fn send_to_module(&self, to: SocketAddr, module_id: MessageModuleId, buf: impl Into<Bytes>, mode: DeliveryMode) -> MessagingResult<()> {
        let payload = Payload::Plain {
            module_id,
            buf: buf.into(),
        };
        self.send_payload(to, &payload, mode).await
    }

    async fn send_payload(&self, to: SocketAddr, payload: &Payload, mode: DeliveryMode) -> MessagingResult<()> {
        if self.is_shut_down() {
            return Err(MessagingError::ChannelShutDown);
        }

        let payload = payload.to_bytes();
        let datagram_len = payload.len() + Envelope::MESSAGE_OVERHEAD;
        if datagram_len > self.config.max_datagram_size {
            return Err(MessagingError::MessageTooLarge {
                len: datagram_len,
                max: self.config.max_datagram_size,
            });
        }

        let mut outgoing = self.outgoing.lock().await;
        if self.is_shut_down() {
            return Err(MessagingError::ChannelShutDown);
        }

        let sequence = outgoing.next(to, mode);
        let message = SequencedMessage {
            sequence,
            mode,
            payload,
        };
        trace!(?to, "sending message {:?}", message);

        if mode == DeliveryMode::Reliable {
            self.pending_acks.add(to, message.clone()).await;
        }

        let datagram = Envelope::Message(message).to_bytes();
        if let Err(e) = self.transport.send(to, &datagram).await {
            match mode {
                DeliveryMode::Reliable => {
                    debug!("error sending message #{} to {:?}, leaving it to retransmission: {}", sequence, to, e);
                }
                DeliveryMode::Unreliable => {
                    // nobody will ever see this sequence number, so it is given back
                    outgoing.set(to, mode, sequence - 1);
                }
            }
            return Err(MessagingError::Transport(e));
        }
        Ok(())
    }

    /// Sends a request to the [RequestHandler] registered for `module_id` on the receiving side,
    ///  and waits for the response. The request fails if there is no response before the
    ///  timeout elapses or the cancellation token fires.
    ///
    /// The request itself is sent reliably, and it is re-sent until it is acknowledged - even
    ///  if the request fails on the requesting side.
    pub async fn request(&self, to: SocketAddr, module_id: MessageModuleId, buf: impl Into<Bytes>, timeout: Duration, cancel_token: &CancellationToken) -> MessagingResult<Bytes> {
        if self.is_shut_down() {
            return Err(MessagingError::ChannelShutDown);
        }

        let pending = self.requests.register();
        if self.is_shut_down() {
            // shutdown started after the first check and may have missed this request
            return Err(MessagingError::ChannelShutDown);
        }

        let payload = Payload::Request {
            request_id: pending.id(),
            module_id,
            buf: buf.into(),
        };
        debug!(?to, "sending request {} for module {:?}", pending.id(), module_id);
        self.send_payload(to, &payload, DeliveryMode::Reliable).await?;

        pending.wait(timeout, cancel_token).await
    }

    pub async fn request_with_default_timeout(&self, to: SocketAddr, module_id: MessageModuleId, buf: impl Into<Bytes>) -> MessagingResult<Bytes> {
        self.request(to, module_id, buf, self.config.default_request_timeout, &CancellationToken::new()).await
    }

    pub async fn request_message<M: Message>(&self, to: SocketAddr, msg: &M, timeout: Duration, cancel_token: &CancellationToken) -> MessagingResult<Bytes> {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        self.request(to, msg.module_id(), buf.freeze(), timeout, cancel_token).await
    }

    /// Processes a single received datagram. Errors are returned for datagrams that are not
    ///  valid envelopes, and for failures to acknowledge a message - problems with dispatching
    ///  an accepted message are logged and do not cause an error.
    pub async fn on_bytes(&self, buf: &[u8], sender: SocketAddr) -> MessagingResult<()> {
        if self.is_shut_down() {
            trace!("channel is shut down - ignoring datagram from {:?}", sender);
            return Ok(());
        }

        match Envelope::try_deser(buf)? {
            Envelope::Ack(ack) => {
                self.pending_acks.remove_matching(sender, ack.sequence).await;
                Ok(())
            }
            Envelope::Message(message) => {
                self.on_sequenced_message(sender, message).await
            }
        }
    }

    async fn on_sequenced_message(&self, sender: SocketAddr, message: SequencedMessage) -> MessagingResult<()> {
        let mut incoming = self.incoming.lock().await;

        let expected = incoming.get(sender, message.mode) + 1;
        if message.sequence != expected {
            if message.sequence < expected && message.mode == DeliveryMode::Reliable && self.config.reack_duplicates {
                debug!("received duplicate message {:?} from {:?} - acknowledging it again", message, sender);
                return self.send_ack(sender, message.sequence).await;
            }

            debug!("received message {:?} from {:?}, expected #{} - discarding", message, sender, expected);
            return Ok(());
        }

        if message.mode == DeliveryMode::Reliable {
            // no ACK means the message was not accepted - the sender will re-send it
            self.send_ack(sender, message.sequence).await?;
        }
        incoming.set(sender, message.mode, message.sequence);

        trace!("accepted message {:?} from {:?}", message, sender);
        match self.dispatch(sender, message.payload).await {
            Ok(()) => {}
            Err(e @ MessagingError::NoHandlerForPayload(_)) => warn!("message from {:?}: {}", sender, e),
            Err(e) => warn!("error dispatching message from {:?}: {}", sender, e),
        }
        Ok(())
    }

    async fn send_ack(&self, to: SocketAddr, sequence: u64) -> MessagingResult<()> {
        trace!("acknowledging message #{} from {:?}", sequence, to);

        let datagram = Envelope::Ack(Ack { sequence }).to_bytes();
        self.transport.send(to, &datagram).await
            .map_err(MessagingError::Transport)
    }

    async fn dispatch(&self, sender: SocketAddr, payload: Bytes) -> MessagingResult<()> {
        let payload = Payload::try_deser(&payload)
            .map_err(|e| MessagingError::unrecognized(format!("invalid payload: {}", e)))?;

        match payload {
            Payload::Plain { module_id, buf } => {
                let message_module = self.message_modules.read().await
                    .get(&module_id)
                    .cloned()
                    .ok_or(MessagingError::NoHandlerForPayload(module_id))?;
                message_module.on_message(sender, &buf).await;
            }
            Payload::Request { request_id, module_id, buf } => {
                let handler = self.request_handlers.read().await
                    .get(&module_id)
                    .cloned()
                    .ok_or(MessagingError::NoHandlerForPayload(module_id))?;

                match handler.on_request(sender, &buf).await {
                    Ok(response) => {
                        trace!("sending response to request {} to {:?}", request_id, sender);
                        let response = Payload::Response {
                            request_id,
                            buf: response.into(),
                        };
                        self.send_payload(sender, &response, DeliveryMode::Reliable).await?;
                    }
                    Err(e) => {
                        warn!("request handler {:?} failed on request {} from {:?} - not responding: {}", module_id, request_id, sender, e);
                    }
                }
            }
            Payload::Response { request_id, buf } => {
                self.requests.on_response(request_id, buf);
            }
        }
        Ok(())
    }

    /// The adapter that feeds datagrams received by a [Transport] into this channel
    pub fn handler(self: &Arc<Self>) -> Arc<dyn MessageHandler> {
        Arc::new(ChannelMessageHandler {
            channel: self.clone(),
        })
    }

    /// Runs the transport's receive loop for this channel until the channel is shut down
    pub async fn recv_loop(self: &Arc<Self>) -> anyhow::Result<()> {
        match self.transport.recv_loop(self.handler()).await {
            Ok(()) => {
                info!("receive loop on {:?} terminated", self.local_addr());
                Ok(())
            }
            Err(e) => {
                error!("receive loop on {:?} failed: {}", self.local_addr(), e);
                Err(e)
            }
        }
    }

    pub async fn pending_ack_count(&self) -> usize {
        self.pending_acks.len().await
    }

    pub fn pending_request_count(&self) -> usize {
        self.requests.len()
    }

    /// Stops re-sending unacknowledged messages to a given peer, returning the number of dropped
    ///  messages. This is the only way to give up on a peer that does not acknowledge.
    pub async fn drop_pending_acks(&self, peer: SocketAddr) -> usize {
        let num_dropped = self.pending_acks.drop_recipient(peer).await;
        if num_dropped > 0 {
            info!("dropped {} unacknowledged messages to {:?}", num_dropped, peer);
        }
        num_dropped
    }
}


struct ChannelMessageHandler {
    channel: Arc<ReliableChannel>,
}

#[async_trait]
impl MessageHandler for ChannelMessageHandler {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

        let result = self.channel.on_bytes(buf, sender)
            .instrument(span)
            .await;

        match result {
            Ok(()) => {}
            Err(e @ MessagingError::UnrecognizedEnvelope(_)) => {
                warn!(%correlation_id, "received a datagram from {:?} without a valid envelope - discarding: {}", sender, e);
            }
            Err(e) => {
                error!(%correlation_id, "error processing datagram from {:?}: {}", sender, e);
            }
        }
    }
}
