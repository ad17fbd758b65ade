pub mod config;
pub mod envelope;
pub mod error;
pub mod message_module;
pub mod payload;
pub mod pending_ack_set;
pub mod reliable_channel;
pub mod request_correlator;
pub mod retransmitter;
pub mod sequence_table;
pub mod transport;
