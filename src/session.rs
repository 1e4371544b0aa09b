// src/session.rs

//! Correlation of request frames with their single response frame.
//!
//! Every outbound round-trip reserves a 32-bit session id and parks its
//! caller on a one-shot rendezvous. The read loop delivers result-family
//! frames here by id; the caller wakes, consumes the response, and the entry
//! is removed.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::Message;

/// How session ids are handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionStrategy {
    /// Scan from 0 upward and reuse freed ids. Production default.
    Recycle,
    /// Monotonically increasing counter, never reused. Deterministic for
    /// tests and wire-level debugging.
    Increment,
}

/// A parked caller and/or an undelivered response.
///
/// Both halves of the rendezvous live here so that either side may arrive
/// first: `allocate` creates the pair up front, while a response racing
/// ahead of its caller creates the pair lazily and leaves the receiver for
/// `receive_and_close` to pick up.
struct Slot {
    tx: Option<oneshot::Sender<Message>>,
    rx: Option<oneshot::Receiver<Message>>,
}

impl Slot {
    fn fresh() -> Self {
        let (tx, rx) = oneshot::channel();
        Slot {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

struct Table {
    slots: HashMap<u32, Slot>,
    strategy: SessionStrategy,
    next: u32,
}

/// Allocates session ids and routes responses to parked callers.
pub(crate) struct SessionManager {
    table: Mutex<Table>,
}

impl SessionManager {
    pub(crate) fn new(strategy: SessionStrategy) -> Self {
        SessionManager {
            table: Mutex::new(Table {
                slots: HashMap::new(),
                strategy,
                next: 0,
            }),
        }
    }

    /// Reserve an id and create its rendezvous atomically.
    ///
    /// Panics when the 32-bit space is exhausted; at that point the process
    /// has four billion calls in flight and nothing sensible is left to do.
    pub(crate) fn allocate(&self) -> u32 {
        let mut table = self.table.lock();
        match table.strategy {
            SessionStrategy::Recycle => {
                for id in 0..u32::MAX {
                    if !table.slots.contains_key(&id) {
                        table.slots.insert(id, Slot::fresh());
                        return id;
                    }
                }
                panic!("session id space exhausted");
            }
            SessionStrategy::Increment => {
                let id = table.next;
                table.next = table
                    .next
                    .checked_add(1)
                    .unwrap_or_else(|| panic!("session id space exhausted"));
                table.slots.insert(id, Slot::fresh());
                id
            }
        }
    }

    /// Release an id whose round-trip never started (the request write
    /// failed before anything could answer).
    pub(crate) fn discard(&self, id: u32) {
        self.table.lock().slots.remove(&id);
    }

    /// Place a response into the rendezvous for `id`; the parked caller
    /// wakes. A response racing ahead of its caller is held until the caller
    /// arrives; a response to a session nobody waits for anymore is dropped.
    pub(crate) fn deliver(&self, id: u32, message: Message) {
        let mut table = self.table.lock();
        match table.slots.get_mut(&id) {
            Some(slot) => {
                let Some(tx) = slot.tx.take() else {
                    drop(table);
                    warn!(session = id, "duplicate response for session, dropping");
                    return;
                };
                drop(table);
                if tx.send(message).is_err() {
                    warn!(session = id, "response for a closed session, dropping");
                }
            }
            None => {
                // Either the response beat the caller to the table, or the
                // session is long gone and this entry will never be read.
                let (tx, rx) = oneshot::channel();
                table.slots.insert(
                    id,
                    Slot {
                        tx: None,
                        rx: Some(rx),
                    },
                );
                drop(table);
                let _ = tx.send(message);
                debug!(session = id, "response arrived before its caller");
            }
        }
    }

    /// Block until one message is delivered for `id`, then remove the entry
    /// and return it.
    ///
    /// With a deadline, expiry removes the entry and returns `Timeout`; a
    /// rendezvous torn down underneath the caller (endpoint shutdown) maps
    /// to `SocketClosed`.
    pub(crate) async fn receive_and_close(
        &self,
        id: u32,
        deadline: Option<Duration>,
    ) -> Result<Message> {
        let rx = {
            let mut table = self.table.lock();
            let slot = table.slots.entry(id).or_insert_with(Slot::fresh);
            match slot.rx.take() {
                Some(rx) => rx,
                None => {
                    // A second receiver on the same id is a bug in this
                    // crate, not in the peer; fail the call rather than
                    // fight over the rendezvous.
                    return Err(Error::SocketClosed);
                }
            }
        };

        let received = match deadline {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.discard(id);
                    return Err(Error::Timeout);
                }
            },
        };
        self.discard(id);
        received.map_err(|_| Error::SocketClosed)
    }

    /// Tear down every outstanding session; parked callers fail with
    /// `SocketClosed`. Called when the endpoint shuts down.
    pub(crate) fn fail_all(&self) {
        let dropped = {
            let mut table = self.table.lock();
            std::mem::take(&mut table.slots)
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "abandoning outstanding sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageType};
    use bytes::Bytes;

    fn ok(session: u32) -> Message {
        Message {
            kind: MessageType::ResultOk,
            session,
            body: Bytes::new(),
        }
    }

    #[test]
    fn recycle_reuses_the_smallest_free_id() {
        let sessions = SessionManager::new(SessionStrategy::Recycle);
        assert_eq!(sessions.allocate(), 0);
        assert_eq!(sessions.allocate(), 1);
        assert_eq!(sessions.allocate(), 2);
        sessions.discard(1);
        assert_eq!(sessions.allocate(), 1);
        assert_eq!(sessions.allocate(), 3);
    }

    #[test]
    fn increment_is_strictly_monotone() {
        let sessions = SessionManager::new(SessionStrategy::Increment);
        assert_eq!(sessions.allocate(), 0);
        assert_eq!(sessions.allocate(), 1);
        sessions.discard(0);
        sessions.discard(1);
        assert_eq!(sessions.allocate(), 2);
    }

    #[tokio::test]
    async fn deliver_wakes_a_parked_caller() {
        let sessions = std::sync::Arc::new(SessionManager::new(SessionStrategy::Increment));
        let id = sessions.allocate();

        let waiter = {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.receive_and_close(id, None).await })
        };
        tokio::task::yield_now().await;
        sessions.deliver(id, ok(id));

        let message = waiter.await.unwrap().unwrap();
        assert_eq!(message.kind, MessageType::ResultOk);
        assert_eq!(message.session, id);
    }

    #[tokio::test]
    async fn response_racing_ahead_of_the_caller_is_held() {
        let sessions = SessionManager::new(SessionStrategy::Increment);
        sessions.deliver(45, ok(45));
        let message = sessions.receive_and_close(45, None).await.unwrap();
        assert_eq!(message.session, 45);
    }

    #[tokio::test]
    async fn entry_is_removed_after_receive() {
        let sessions = SessionManager::new(SessionStrategy::Recycle);
        let id = sessions.allocate();
        sessions.deliver(id, ok(id));
        sessions.receive_and_close(id, None).await.unwrap();
        // The id is free again, so recycle hands it right back.
        assert_eq!(sessions.allocate(), id);
    }

    #[test]
    fn late_response_does_not_panic() {
        let sessions = SessionManager::new(SessionStrategy::Increment);
        // Nothing ever waited on session 7; the delivery parks an orphan
        // entry which fail_all later sweeps.
        sessions.deliver(7, ok(7));
        sessions.fail_all();
    }

    #[tokio::test]
    async fn timeout_removes_the_entry() {
        let sessions = SessionManager::new(SessionStrategy::Recycle);
        let id = sessions.allocate();
        let err = sessions
            .receive_and_close(id, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        // The slot is gone, so the id is immediately reusable.
        assert_eq!(sessions.allocate(), id);
    }

    #[tokio::test]
    async fn fail_all_wakes_parked_callers() {
        let sessions = std::sync::Arc::new(SessionManager::new(SessionStrategy::Recycle));
        let id = sessions.allocate();
        let waiter = {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.receive_and_close(id, None).await })
        };
        tokio::task::yield_now().await;
        sessions.fail_all();
        assert!(matches!(waiter.await.unwrap(), Err(Error::SocketClosed)));
    }
}
