//! Client-side correlation of responses to in-flight requests.
//!
//! Every request sent by a client reserves one entry keyed by its id. The
//! entry is in exactly one of three states:
//!
//! ```text
//!                  register(Callback)                resolve / cancel / close
//!   (absent) ───────────────────────► AwaitingCallback ───────────────────► (absent, callback invoked)
//!
//!                  register(Blocking)                        resolve / cancel / close
//!   (absent) ───────────────────────► AwaitingBlockingResult ─────────────► Resolved ──await_blocking──► (absent)
//! ```
//!
//! Arrival order does not matter: lookups are by id. The first response for
//! an id wins; later ones for the same id are dropped.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::error::{KorvError, Result};
use crate::protocol::{MessageId, Response};

/// Why a pending request finished without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Abandoned {
    #[error("timed out")]
    TimedOut,
    #[error("cancelled")]
    Cancelled,
    #[error("channel closed")]
    ChannelClosed,
}

impl Abandoned {
    /// Error reported to the caller waiting on `id`.
    pub fn into_error(self, id: MessageId) -> KorvError {
        match self {
            Abandoned::TimedOut => KorvError::Timeout(id),
            Abandoned::Cancelled => KorvError::Cancelled(id),
            Abandoned::ChannelClosed => KorvError::ConnectionClosed,
        }
    }
}

/// What a pending request eventually yields.
pub type Outcome = std::result::Result<Response, Abandoned>;

/// Callback invoked exactly once with the outcome of a request.
pub type Callback = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// How the issuer of a request wants to be told about its response.
pub enum Completion {
    /// Invoke the callback from the receive path.
    Callback(Callback),
    /// A caller thread will block in [`CorrelationTable::await_blocking`].
    Blocking,
}

impl Completion {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        Completion::Callback(Box::new(f))
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Callback(_) => f.write_str("Callback(..)"),
            Completion::Blocking => f.write_str("Blocking"),
        }
    }
}

/// State of one pending entry.
pub enum Pending {
    AwaitingCallback(Callback),
    AwaitingBlockingResult,
    Resolved(Outcome),
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pending::AwaitingCallback(_) => f.write_str("AwaitingCallback(..)"),
            Pending::AwaitingBlockingResult => f.write_str("AwaitingBlockingResult"),
            Pending::Resolved(outcome) => f.debug_tuple("Resolved").field(outcome).finish(),
        }
    }
}

impl From<Completion> for Pending {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Callback(callback) => Pending::AwaitingCallback(callback),
            Completion::Blocking => Pending::AwaitingBlockingResult,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<MessageId, Pending>,
    closed: bool,
}

/// Table of in-flight requests for one channel.
///
/// `register` runs on caller threads, `resolve` on the receive path; both
/// go through the same mutex. Callbacks always run with the lock released.
#[derive(Default)]
pub struct CorrelationTable {
    inner: Mutex<Inner>,
    resolved: Condvar,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an entry for `id`.
    ///
    /// # Errors
    ///
    /// - [`KorvError::DuplicateId`] if `id` is already pending; the existing
    ///   entry is left untouched.
    /// - [`KorvError::ConnectionClosed`] once the table has been closed.
    pub fn register(&self, id: MessageId, completion: Completion) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(KorvError::ConnectionClosed);
        }
        if inner.entries.contains_key(&id) {
            return Err(KorvError::DuplicateId(id));
        }
        inner.entries.insert(id, completion.into());
        Ok(())
    }

    /// Deliver a response to whoever is waiting for it.
    ///
    /// Returns `false` when the response was dropped: unknown or abandoned
    /// id, or an id that already has a result.
    pub fn resolve(&self, response: Response) -> bool {
        let mut inner = self.inner.lock();
        let id = response.request_id.clone();

        match inner.entries.remove(&id) {
            None => {
                tracing::debug!("Dropping response for unknown request {}", id);
                false
            }
            Some(Pending::AwaitingCallback(callback)) => {
                drop(inner);
                callback(Ok(response));
                true
            }
            Some(Pending::AwaitingBlockingResult) => {
                inner.entries.insert(id, Pending::Resolved(Ok(response)));
                self.resolved.notify_all();
                true
            }
            Some(resolved @ Pending::Resolved(_)) => {
                tracing::debug!("Dropping extra response for request {}", id);
                inner.entries.insert(id, resolved);
                false
            }
        }
    }

    /// Block the calling thread until `id` is resolved, then consume the entry.
    ///
    /// With a `timeout`, an entry still unresolved at the deadline is removed
    /// and [`KorvError::Timeout`] is returned.
    ///
    /// # Errors
    ///
    /// [`KorvError::UnknownRequest`] if `id` has no blocking entry, and the
    /// error matching the abandonment reason if the request was abandoned.
    pub fn await_blocking(&self, id: &MessageId, timeout: Option<Duration>) -> Result<Response> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();

        loop {
            match inner.entries.remove(id) {
                None => return Err(KorvError::UnknownRequest(id.clone())),
                Some(Pending::Resolved(outcome)) => {
                    return outcome.map_err(|reason| reason.into_error(id.clone()));
                }
                Some(callback @ Pending::AwaitingCallback(_)) => {
                    inner.entries.insert(id.clone(), callback);
                    return Err(KorvError::UnknownRequest(id.clone()));
                }
                Some(Pending::AwaitingBlockingResult) => {
                    inner
                        .entries
                        .insert(id.clone(), Pending::AwaitingBlockingResult);
                }
            }

            match deadline {
                None => self.resolved.wait(&mut inner),
                Some(deadline) => {
                    if self.resolved.wait_until(&mut inner, deadline).timed_out()
                        && matches!(
                            inner.entries.get(id),
                            Some(Pending::AwaitingBlockingResult)
                        )
                    {
                        inner.entries.remove(id);
                        tracing::debug!("Request {} timed out", id);
                        return Err(KorvError::Timeout(id.clone()));
                    }
                }
            }
        }
    }

    /// Abandon a pending request without any cooperation from the peer.
    ///
    /// A callback entry is removed and its callback invoked with `reason`; a
    /// blocking entry becomes `Resolved(reason)` so its waiter wakes up.
    /// Returns `false` if there was nothing left to abandon.
    pub fn cancel(&self, id: &MessageId, reason: Abandoned) -> bool {
        let mut inner = self.inner.lock();

        match inner.entries.remove(id) {
            None => false,
            Some(Pending::AwaitingCallback(callback)) => {
                drop(inner);
                callback(Err(reason));
                true
            }
            Some(Pending::AwaitingBlockingResult) => {
                inner
                    .entries
                    .insert(id.clone(), Pending::Resolved(Err(reason)));
                self.resolved.notify_all();
                true
            }
            Some(resolved @ Pending::Resolved(_)) => {
                inner.entries.insert(id.clone(), resolved);
                false
            }
        }
    }

    /// Abandon everything still pending because the channel went away.
    ///
    /// Later `register` calls fail with [`KorvError::ConnectionClosed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;

        let mut callbacks = Vec::new();
        let drained: Vec<_> = inner.entries.drain().collect();
        for (id, entry) in drained {
            match entry {
                Pending::AwaitingCallback(callback) => callbacks.push(callback),
                Pending::AwaitingBlockingResult => {
                    inner
                        .entries
                        .insert(id, Pending::Resolved(Err(Abandoned::ChannelClosed)));
                }
                resolved @ Pending::Resolved(_) => {
                    inner.entries.insert(id, resolved);
                }
            }
        }
        self.resolved.notify_all();
        drop(inner);

        if !callbacks.is_empty() {
            tracing::debug!("Abandoning {} callback requests on close", callbacks.len());
        }
        for callback in callbacks {
            callback(Err(Abandoned::ChannelClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Number of entries not yet consumed.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn response_for(request_id: MessageId, msg: &str) -> Response {
        Response::new(
            MessageId::Number(900),
            request_id,
            Status::OK,
            Some(json!({ "msg": msg })),
        )
    }

    #[test]
    fn test_callback_fires_once_and_entry_removed() {
        let table = CorrelationTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        table
            .register(
                MessageId::Number(1),
                Completion::callback(move |outcome| {
                    assert_eq!(outcome.unwrap().body, Some(json!({"msg": "one"})));
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert!(table.resolve(response_for(MessageId::Number(1), "one")));
        assert!(!table.resolve(response_for(MessageId::Number(1), "again")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_unknown_response_is_dropped() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(response_for(MessageId::Number(42), "stray")));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_id_keeps_original_entry() {
        let table = CorrelationTable::new();
        let (tx, rx) = mpsc::channel();

        table
            .register(
                MessageId::Number(7),
                Completion::callback(move |outcome| tx.send(outcome).unwrap()),
            )
            .unwrap();

        let err = table.register(MessageId::Number(7), Completion::Blocking).unwrap_err();
        assert!(matches!(err, KorvError::DuplicateId(MessageId::Number(7))));
        assert_eq!(table.len(), 1);

        assert!(table.resolve(response_for(MessageId::Number(7), "original")));
        let outcome = rx.recv().unwrap().unwrap();
        assert_eq!(outcome.body, Some(json!({"msg": "original"})));
    }

    #[test]
    fn test_blocking_result_survives_until_consumed() {
        let table = CorrelationTable::new();
        table.register(MessageId::Number(3), Completion::Blocking).unwrap();

        assert!(table.resolve(response_for(MessageId::Number(3), "first")));
        // Second response for the same id loses.
        assert!(!table.resolve(response_for(MessageId::Number(3), "second")));
        assert!(table.contains(&MessageId::Number(3)));

        let response = table.await_blocking(&MessageId::Number(3), None).unwrap();
        assert_eq!(response.body, Some(json!({"msg": "first"})));
        assert!(table.is_empty());
    }

    #[test]
    fn test_blocking_waiters_get_their_own_responses_out_of_order() {
        let table = Arc::new(CorrelationTable::new());
        let ids: Vec<MessageId> = (1..=8).map(MessageId::Number).collect();
        for id in &ids {
            table.register(id.clone(), Completion::Blocking).unwrap();
        }

        let waiters: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let table = table.clone();
                thread::spawn(move || {
                    let response = table
                        .await_blocking(&id, Some(Duration::from_secs(5)))
                        .unwrap();
                    (id, response)
                })
            })
            .collect();

        // Answer in reverse order.
        for id in ids.iter().rev() {
            thread::sleep(Duration::from_millis(2));
            assert!(table.resolve(response_for(id.clone(), &id.to_string())));
        }

        for waiter in waiters {
            let (id, response) = waiter.join().unwrap();
            assert_eq!(response.request_id, id);
            assert_eq!(response.body, Some(json!({ "msg": id.to_string() })));
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_await_timeout_removes_entry() {
        let table = CorrelationTable::new();
        table.register(MessageId::Number(5), Completion::Blocking).unwrap();

        let err = table
            .await_blocking(&MessageId::Number(5), Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, KorvError::Timeout(MessageId::Number(5))));
        assert!(table.is_empty());

        // A late response is harmless.
        assert!(!table.resolve(response_for(MessageId::Number(5), "late")));
    }

    #[test]
    fn test_await_unknown_id() {
        let table = CorrelationTable::new();
        assert!(matches!(
            table.await_blocking(&MessageId::Number(9), None),
            Err(KorvError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_await_on_callback_entry_is_rejected() {
        let table = CorrelationTable::new();
        table
            .register(MessageId::Number(4), Completion::callback(|_| {}))
            .unwrap();
        assert!(matches!(
            table.await_blocking(&MessageId::Number(4), None),
            Err(KorvError::UnknownRequest(_))
        ));
        assert!(table.contains(&MessageId::Number(4)));
    }

    #[test]
    fn test_cancel_wakes_blocking_waiter() {
        let table = Arc::new(CorrelationTable::new());
        table.register(MessageId::Number(11), Completion::Blocking).unwrap();

        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.await_blocking(&MessageId::Number(11), None))
        };

        thread::sleep(Duration::from_millis(10));
        assert!(table.cancel(&MessageId::Number(11), Abandoned::Cancelled));

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, KorvError::Cancelled(MessageId::Number(11))));
        assert!(table.is_empty());
    }

    #[test]
    fn test_cancel_invokes_callback_with_reason() {
        let table = CorrelationTable::new();
        let (tx, rx) = mpsc::channel();
        table
            .register(
                MessageId::Number(12),
                Completion::callback(move |outcome| tx.send(outcome).unwrap()),
            )
            .unwrap();

        assert!(table.cancel(&MessageId::Number(12), Abandoned::TimedOut));
        assert_eq!(rx.recv().unwrap(), Err(Abandoned::TimedOut));
        assert!(!table.cancel(&MessageId::Number(12), Abandoned::TimedOut));
    }

    #[test]
    fn test_close_abandons_everything() {
        let table = Arc::new(CorrelationTable::new());
        let (tx, rx) = mpsc::channel();

        table
            .register(
                MessageId::Number(1),
                Completion::callback(move |outcome| tx.send(outcome).unwrap()),
            )
            .unwrap();
        table.register(MessageId::Number(2), Completion::Blocking).unwrap();

        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.await_blocking(&MessageId::Number(2), None))
        };

        thread::sleep(Duration::from_millis(10));
        table.close();

        assert_eq!(rx.recv().unwrap(), Err(Abandoned::ChannelClosed));
        assert!(matches!(
            waiter.join().unwrap(),
            Err(KorvError::ConnectionClosed)
        ));
        assert!(table.is_closed());
        assert!(matches!(
            table.register(MessageId::Number(3), Completion::Blocking),
            Err(KorvError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_callback_may_reenter_table() {
        let table = Arc::new(CorrelationTable::new());
        let inner = table.clone();
        table
            .register(
                MessageId::Number(1),
                Completion::callback(move |_| {
                    // Runs without the lock held.
                    inner.register(MessageId::Number(2), Completion::Blocking).unwrap();
                }),
            )
            .unwrap();

        assert!(table.resolve(response_for(MessageId::Number(1), "x")));
        assert!(table.contains(&MessageId::Number(2)));
    }
}
