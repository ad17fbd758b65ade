//! This module contains utilities that are useful for testing code based on reliable channels.
//!  They are used for testing the channel itself, but they are also exported for application
//!  testing.
//!
//! There is an in-memory network that connects any number of channels and can drop or duplicate
//!  datagrams, a transport that just records what is sent, and some generic message modules.

pub mod node;
pub mod transport;
pub mod network;
pub mod module;

use std::future::Future;
use std::time::Duration;

/// Polls an asynchronous condition every millisecond until it holds, panicking if it does not
///  hold within ten seconds. Intended for tests running with a paused tokio clock, where waiting
///  is cheap.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..10_000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition did not become true in time");
}

