use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use bytes::BytesMut;


/// A [MessageModuleId] is sent as part of a message's payload to identify the module for
///  deserialization and dispatch on the receiving side.
///
/// An id is technically a u64, but it is intended to be used as a sequence of up to eight ASCII
///  characters to give it a human-readable name, both for uniqueness and for debugging at the
///  wire level.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageModuleId(pub u64);

impl MessageModuleId {
    pub const fn new(value: &[u8; 8]) -> MessageModuleId {
        Self(u64::from_be_bytes(*value))
    }
}

impl Debug for MessageModuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let used = bytes.iter()
            .position(|&b| b == 0)
            .map(|len| &bytes[..len])
            .unwrap_or(&bytes);

        let string_repr = std::str::from_utf8(used).unwrap_or("???");

        write!(f, "0x{:016X}({:?})", self.0, string_repr)
    }
}


/// An application level message that knows which module it belongs to and how to serialize
///  itself. Deserialization is the receiving module's business.
pub trait Message: Send + Sync + 'static {
    fn module_id(&self) -> MessageModuleId;

    fn ser(&self, buf: &mut BytesMut);
}


/// Messages are pluggable, and they are organized in [MessageModule]s. Each module has its own
///  (single) type of messages, it takes care of deserializing them, and of handling received
///  messages.
///
/// Messages for a given module are identified in the payload by a specific and (hopefully) unique
///  [MessageModuleId].
#[async_trait::async_trait]
pub trait MessageModule: 'static + Sync + Send {
    fn id(&self) -> MessageModuleId;

    /// called to handle a message that was received for this message module. It contains the
    ///  module specific message buffer, i.e. starting immediately *after* the module ID.
    ///
    /// This is a blocking call, holding up the channel's receive path. Non-trivial work should
    ///  probably be offloaded to some asynchronous processing, but it is up to the module
    ///  implementation to decide and do this.
    async fn on_message(&self, sender: SocketAddr, buf: &[u8]);
}


/// The request / response counterpart to [MessageModule]: a handler produces a response buffer
///  for every request it receives, and the channel takes care of sending it back to the
///  requester.
///
/// Returning an error means that no response is sent - the requester will run into its timeout.
///
/// NB: The same restriction as for [MessageModule::on_message] applies, this holds up the
///      receive path. In particular, a handler must not wait for the response to a request of
///      its own through the same channel.
#[async_trait::async_trait]
pub trait RequestHandler: 'static + Sync + Send {
    fn id(&self) -> MessageModuleId;

    async fn on_request(&self, sender: SocketAddr, buf: &[u8]) -> anyhow::Result<Vec<u8>>;
}
