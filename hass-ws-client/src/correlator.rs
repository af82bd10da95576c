//! Request/response correlation for one connection.
//!
//! Every request sent over the socket gets the next id from the
//! [`Correlator`] and leaves a [`Pending`] slot behind. The matching
//! `result` (or `pong`) fills the slot exactly once; closing the connection
//! cancels whatever is left.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{ClientError, ClientResult};

/// Reply channel handed in by a [`HassHandle`](crate::HassHandle) caller.
pub(crate) type ReplySender = oneshot::Sender<ClientResult<Value>>;

/// What is waiting on a request id.
#[derive(Debug)]
pub(crate) enum Pending {
    /// An external caller awaiting the reply.
    Caller(ReplySender),
    /// A `subscribe_events` issued by the session itself after auth.
    Subscription { event_type: Option<String> },
    /// A keepalive ping issued by the session itself.
    Keepalive,
}

/// What [`Correlator::complete`] did with a reply.
#[derive(Debug, PartialEq)]
pub(crate) enum Completion {
    /// Handed to a caller (who may have stopped listening).
    Delivered,
    /// Acknowledgement of an internal subscription.
    Subscription {
        event_type: Option<String>,
        accepted: bool,
    },
    /// Answer to a keepalive ping.
    Keepalive,
    /// No request with that id is pending: already answered or canceled.
    Unknown,
}

/// Per-connection id allocator and pending-slot table.
#[derive(Debug)]
pub(crate) struct Correlator {
    next_id: u64,
    pending: HashMap<u64, Pending>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate the next id and park `slot` under it.
    pub(crate) fn register(&mut self, slot: Pending) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, slot);
        id
    }

    /// Fulfil the slot for `id` with `outcome`.
    pub(crate) fn complete(&mut self, id: u64, outcome: ClientResult<Value>) -> Completion {
        match self.pending.remove(&id) {
            Some(Pending::Caller(reply)) => {
                // Receiver gone means the caller stopped waiting; nothing to do.
                let _ = reply.send(outcome);
                Completion::Delivered
            }
            Some(Pending::Subscription { event_type }) => Completion::Subscription {
                event_type,
                accepted: outcome.is_ok(),
            },
            Some(Pending::Keepalive) => Completion::Keepalive,
            None => Completion::Unknown,
        }
    }

    /// `true` while a request with `id` is still waiting.
    pub(crate) fn is_pending(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fail every caller slot with an error from `make_err` and forget all
    /// internal slots. Returns the number of caller slots canceled.
    pub(crate) fn cancel_all(&mut self, make_err: impl Fn() -> ClientError) -> usize {
        let mut canceled = 0;
        for (_, slot) in self.pending.drain() {
            if let Pending::Caller(reply) = slot {
                let _ = reply.send(Err(make_err()));
                canceled += 1;
            }
        }
        canceled
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        // Runs on every exit path, including a panic or an aborted task.
        self.cancel_all(|| ClientError::Canceled);
    }
}
