use crate::messaging::message_module::MessageModuleId;

/// Failures surfaced by the reliable messaging layer to its callers.
///
/// Setup and infrastructure code (binding sockets, validating configuration, registering
///  modules) reports plain `anyhow` errors; this enum covers the conditions that callers of
///  `send`, `request` and `on_bytes` may want to match on.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("unrecognized envelope: {0}")]
    UnrecognizedEnvelope(String),
    #[error("request timed out")]
    RequestTimedOut,
    #[error("request was cancelled")]
    RequestCancelled,
    #[error("no handler registered for module {0:?}")]
    NoHandlerForPayload(MessageModuleId),
    #[error("the channel is shut down")]
    ChannelShutDown,
    #[error("datagram of {len} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

impl MessagingError {
    pub(crate) fn unrecognized(msg: impl Into<String>) -> MessagingError {
        MessagingError::UnrecognizedEnvelope(msg.into())
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;
