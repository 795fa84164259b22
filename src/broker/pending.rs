//! Completion slots for writes waiting on their acknowledgement.
//!
//! One slot per [`ValueId`]. Registering a second write for the same key
//! replaces the first slot; the first caller's receiver then sees its sender
//! dropped. Every slot carries a ticket so a caller can release its own slot
//! without touching a newer one that replaced it.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use super::error::BrokerError;
use super::lock;
use crate::api::ValueId;

pub type Completion = Result<(), BrokerError>;

#[derive(Debug)]
struct Slot {
    ticket: u64,
    tx: oneshot::Sender<Completion>,
}

#[derive(Debug, Default)]
pub struct PendingWrites {
    next_ticket: u64,
    slots: HashMap<ValueId, Slot>,
}

impl PendingWrites {
    /// Registers a completion slot for `key`, superseding any previous one.
    pub fn register(&mut self, key: ValueId) -> (u64, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        self.next_ticket += 1;
        let ticket = self.next_ticket;

        if let Some(previous) = self.slots.insert(key.clone(), Slot { ticket, tx }) {
            debug!(
                "Write to {} superseded pending write (ticket {})",
                key, previous.ticket
            );
        }
        (ticket, rx)
    }

    /// Completes the slot for `key`. Returns `false` if no write was waiting.
    pub fn resolve(&mut self, key: &ValueId, result: Completion) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                if slot.tx.send(result).is_err() {
                    debug!("Waiter for {} went away before its acknowledgement", key);
                }
                true
            }
            None => false,
        }
    }

    /// Removes the slot for `key` only if it still belongs to `ticket`.
    pub fn release(&mut self, key: &ValueId, ticket: u64) -> bool {
        if self.slots.get(key).is_some_and(|slot| slot.ticket == ticket) {
            self.slots.remove(key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Releases a write's slot when the waiting call exits, however it exits.
pub(crate) struct SlotGuard<'a> {
    pending: &'a Mutex<PendingWrites>,
    key: ValueId,
    ticket: u64,
}

impl<'a> SlotGuard<'a> {
    pub(crate) fn new(pending: &'a Mutex<PendingWrites>, key: ValueId, ticket: u64) -> Self {
        Self {
            pending,
            key,
            ticket,
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if lock(self.pending).release(&self.key, self.ticket) {
            debug!("Released pending write slot for {}", self.key);
        }
    }
}
