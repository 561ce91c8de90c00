//! Request/response correlation
//!
//! Outgoing requests reserve a slot keyed by their id; the dispatch loop
//! completes the slot when the matching response arrives. Each slot delivers
//! at most once. The table also exposes a drain gate used before shutdown:
//! `wait_until_empty` parks callers until every in-flight request has been
//! answered or abandoned.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::jsonrpc::error::RpcError;
use crate::jsonrpc::types::JsonRpcErrorObject;

/// What a completed request resolves to: the server's result payload or its
/// error object.
pub type ResponseOutcome = Result<Value, JsonRpcErrorObject>;

/// Table of in-flight requests keyed by id.
///
/// The pending count is mirrored into a watch channel so drain waiters
/// always observe the value current at subscription time; a decrement can
/// never slip between a check and a sleep.
pub struct CorrelationTable {
    waiters: Mutex<HashMap<String, oneshot::Sender<ResponseOutcome>>>,
    pending: watch::Sender<usize>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            waiters: Mutex::new(HashMap::new()),
            pending,
        }
    }

    /// Reserve a slot for a request about to be sent.
    ///
    /// Reserving an id that is already in flight replaces the previous
    /// waiter, whose receiver then resolves with a closed-channel error.
    /// Ids are caller-chosen; with UUID ids this indicates a caller bug,
    /// so it is logged loudly rather than hidden.
    pub fn reserve(&self, id: &str) -> oneshot::Receiver<ResponseOutcome> {
        let (sender, receiver) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.insert(id.to_string(), sender).is_some() {
            warn!("Request id {id} reserved twice; replacing previous waiter");
        }
        self.pending.send_replace(waiters.len());
        receiver
    }

    /// Deliver a response outcome to the waiter for `id`.
    ///
    /// Returns `true` if a waiter existed and was still listening. Unknown
    /// ids are dropped silently apart from a debug log: late responses to
    /// abandoned requests are expected traffic.
    pub fn complete(&self, id: &str, outcome: ResponseOutcome) -> bool {
        let sender = {
            let mut waiters = self.waiters.lock().unwrap();
            let sender = waiters.remove(id);
            self.pending.send_replace(waiters.len());
            sender
        };

        match sender {
            Some(sender) => sender.send(outcome).is_ok(),
            None => {
                debug!("Dropping response for unknown request id {id}");
                false
            }
        }
    }

    /// Forget an in-flight request, e.g. after its caller timed out.
    ///
    /// A response that arrives later is then dropped as unknown.
    pub fn abandon(&self, id: &str) {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.remove(id).is_some() {
            self.pending.send_replace(waiters.len());
        }
    }

    /// Fail every in-flight request by dropping its waiter.
    ///
    /// Used when the connection is lost; pending callers observe a closed
    /// response channel.
    pub fn abort_all(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        let dropped = waiters.len();
        waiters.clear();
        self.pending.send_replace(0);
        if dropped > 0 {
            warn!("Aborted {dropped} in-flight request(s)");
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no requests are in flight.
    ///
    /// Returns immediately when the table is already empty. With a timeout,
    /// resolves to `RpcError::DrainTimeout` if requests remain when it
    /// expires.
    pub async fn wait_until_empty(&self, timeout: Option<Duration>) -> Result<(), RpcError> {
        let mut receiver = self.pending.subscribe();
        let drained = receiver.wait_for(|count| *count == 0);

        match timeout {
            Some(duration) => match tokio::time::timeout(duration, drained).await {
                Ok(Ok(_)) => Ok(()),
                // The watch sender lives in self, so it cannot be dropped here
                Ok(Err(_)) => Err(RpcError::transport("correlation table closed")),
                Err(_) => Err(RpcError::DrainTimeout {
                    pending: self.len(),
                }),
            },
            None => match drained.await {
                Ok(_) => Ok(()),
                Err(_) => Err(RpcError::transport("correlation table closed")),
            },
        }
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}
