use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::payload::RequestId;

type CompletionSlot = oneshot::Sender<MessagingResult<Bytes>>;
type PendingMap = Arc<Mutex<FxHashMap<RequestId, CompletionSlot>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, FxHashMap<RequestId, CompletionSlot>> {
    // the map is consistent after every single operation, so a poisoned lock is still usable
    pending.lock().unwrap_or_else(|e| e.into_inner())
}


/// Keeps track of outstanding requests, mapping each request id to a completion slot.
///
/// Every terminal transition (response, timeout, cancellation, the waiting side going away,
///  shutdown) removes the id from the map, and it is the removal that decides which transition
///  wins: a response resolves the slot only if it finds the id still registered, and a timeout
///  or cancellation only fails the request if it still finds the id - otherwise a response
///  raced it and is already sitting in the slot.
#[derive(Default)]
pub struct RequestCorrelator {
    pending: PendingMap,
}

impl RequestCorrelator {
    /// Registers a fresh request id. This must happen *before* the request is sent, otherwise
    ///  a fast response could arrive before there is a slot for it.
    pub fn register(&self) -> PendingRequest {
        let mut pending = lock(&self.pending);
        loop {
            let id = Uuid::new_v4();
            if let Entry::Vacant(e) = pending.entry(id) {
                let (sender, receiver) = oneshot::channel();
                e.insert(sender);
                trace!("registered request {}", id);

                return PendingRequest {
                    id,
                    receiver,
                    pending: self.pending.clone(),
                };
            }
        }
    }

    /// Resolves the pending request with the given id, returning `false` if there is none. This
    ///  is the normal case for responses to requests that timed out or were cancelled, and for
    ///  duplicate responses.
    pub fn on_response(&self, id: RequestId, response: Bytes) -> bool {
        let mut pending = lock(&self.pending);
        match pending.remove(&id) {
            Some(slot) => {
                trace!("resolving request {}", id);
                // the waiting side may be gone already, which is fine
                let _ = slot.send(Ok(response));
                true
            }
            None => {
                debug!("received response for unknown request {} - ignoring", id);
                false
            }
        }
    }

    /// Fails all pending requests, e.g. on shutdown, returning the number of failed requests.
    ///
    /// The slots are resolved while the lock is held, so a concurrently expiring timeout that
    ///  finds its id removed is guaranteed to find the failure in its slot.
    pub fn fail_all(&self, error: impl Fn() -> MessagingError) -> usize {
        let mut pending = lock(&self.pending);
        let num_failed = pending.len();
        if num_failed > 0 {
            debug!("failing {} pending requests", num_failed);
        }
        for (_, slot) in pending.drain() {
            let _ = slot.send(Err(error()));
        }
        num_failed
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }
}


/// The waiting side of a registered request. Dropping it unregisters the request.
pub struct PendingRequest {
    id: RequestId,
    receiver: oneshot::Receiver<MessagingResult<Bytes>>,
    pending: PendingMap,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the response, failing if the timeout elapses or the cancellation token fires
    ///  first.
    pub async fn wait(mut self, timeout: Duration, cancel_token: &CancellationToken) -> MessagingResult<Bytes> {
        let failure = select! {
            biased;
            result = &mut self.receiver => {
                return result.unwrap_or(Err(MessagingError::ChannelShutDown));
            }
            _ = cancel_token.cancelled() => MessagingError::RequestCancelled,
            _ = sleep(timeout) => MessagingError::RequestTimedOut,
        };

        if self.try_unregister() {
            debug!("request {} failed: {}", self.id, failure);
            return Err(failure);
        }

        // the id was removed concurrently, so the slot was resolved and the response wins
        match self.receiver.try_recv() {
            Ok(result) => result,
            Err(_) => Err(failure),
        }
    }

    fn try_unregister(&self) -> bool {
        lock(&self.pending)
            .remove(&self.id)
            .is_some()
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.try_unregister() {
            trace!("unregistered abandoned request {}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_response_before_timeout() {
        let correlator = Arc::new(RequestCorrelator::default());
        let pending = correlator.register();
        let id = pending.id();

        let responder = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(10)).await;
                correlator.on_response(id, Bytes::from_static(&[42]))
            })
        };

        let result = pending.wait(Duration::from_millis(100), &CancellationToken::new()).await;
        assert_eq!(result.unwrap().as_ref(), &[42]);
        assert!(responder.await.unwrap());
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let correlator = RequestCorrelator::default();
        let pending = correlator.register();
        let id = pending.id();

        let start = Instant::now();
        let result = pending.wait(Duration::from_millis(50), &CancellationToken::new()).await;

        assert!(matches!(result, Err(MessagingError::RequestTimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(correlator.is_empty());

        // a late response is ignored
        assert!(!correlator.on_response(id, Bytes::from_static(b"late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let correlator = RequestCorrelator::default();
        let pending = correlator.register();
        let cancel_token = CancellationToken::new();

        let canceller = {
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(5)).await;
                cancel_token.cancel();
            })
        };

        let start = Instant::now();
        let result = pending.wait(Duration::from_secs(60), &cancel_token).await;

        assert!(matches!(result, Err(MessagingError::RequestCancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(correlator.is_empty());
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let correlator = RequestCorrelator::default();
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        let result = correlator.register().wait(Duration::from_secs(60), &cancel_token).await;
        assert!(matches!(result, Err(MessagingError::RequestCancelled)));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_response_already_arrived() {
        let correlator = RequestCorrelator::default();
        let pending = correlator.register();
        assert!(correlator.on_response(pending.id(), Bytes::from_static(b"fast")));

        // a response that is already there wins even against an expired timeout
        let result = pending.wait(Duration::ZERO, &CancellationToken::new()).await;
        assert_eq!(result.unwrap().as_ref(), b"fast");
    }

    #[test]
    fn test_duplicate_response_is_ignored() {
        let correlator = RequestCorrelator::default();
        let pending = correlator.register();

        assert!(correlator.on_response(pending.id(), Bytes::from_static(b"1")));
        assert!(!correlator.on_response(pending.id(), Bytes::from_static(b"2")));
    }

    #[test]
    fn test_unknown_response_is_ignored() {
        let correlator = RequestCorrelator::default();
        let _pending = correlator.register();

        assert!(!correlator.on_response(Uuid::new_v4(), Bytes::new()));
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn test_drop_unregisters() {
        let correlator = RequestCorrelator::default();
        let a = correlator.register();
        let b = correlator.register();
        assert_ne!(a.id(), b.id());
        assert_eq!(correlator.len(), 2);

        drop(a);
        assert_eq!(correlator.len(), 1);
        drop(b);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let correlator = RequestCorrelator::default();
        let pending = correlator.register();

        assert_eq!(correlator.fail_all(|| MessagingError::ChannelShutDown), 1);
        assert!(correlator.is_empty());

        let result = pending.wait(Duration::from_secs(60), &CancellationToken::new()).await;
        assert!(matches!(result, Err(MessagingError::ChannelShutDown)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fail_all_wins_against_concurrent_timeout() {
        for i in 0..200u64 {
            let correlator = RequestCorrelator::default();
            let pending = correlator.register();

            let waiter = tokio::spawn(async move {
                pending.wait(Duration::from_micros(500), &CancellationToken::new()).await
            });
            sleep(Duration::from_micros((i % 5) * 200)).await;

            let num_failed = correlator.fail_all(|| MessagingError::ChannelShutDown);
            let result = waiter.await.unwrap();

            // whoever removed the id decides the outcome
            if num_failed == 1 {
                assert!(matches!(result, Err(MessagingError::ChannelShutDown)), "iteration {}: {:?}", i, result);
            }
            else {
                assert!(matches!(result, Err(MessagingError::RequestTimedOut)), "iteration {}: {:?}", i, result);
            }
            assert!(correlator.is_empty());
        }
    }
}
