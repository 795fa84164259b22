//! Observer registry: per-property sets of sinks that receive change
//! notifications.
//!
//! Delivery never waits on a sink. A full sink misses the update, a closed
//! sink is reported so the caller can prune it.

use std::collections::HashMap;

use chrono::{DateTime, Local};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::api::{PropertyValue, ValueId};

/// A decoded change notification as handed to watchers.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub device_id: u32,
    pub device_name: Option<String>,
    /// Property-name key (`"currentValue"`).
    pub property: String,
    /// Opaque property id (`"38-0-currentValue"`).
    pub property_id: String,
    pub value: PropertyValue,
    pub received_at: DateTime<Local>,
}

pub type Sink = mpsc::Sender<PropertyUpdate>;

#[derive(Debug)]
struct Registration {
    token: u64,
    sink: Sink,
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

#[derive(Debug, Default)]
pub struct ObserverSet {
    next_token: u64,
    sinks: HashMap<ValueId, Vec<Registration>>,
}

impl ObserverSet {
    /// Adds `sink` under `key` and returns its registration token. A sink
    /// already registered for `key` keeps its existing token.
    pub fn insert(&mut self, key: ValueId, sink: Sink) -> u64 {
        let registrations = self.sinks.entry(key).or_default();
        if let Some(existing) = registrations
            .iter()
            .find(|registration| registration.sink.same_channel(&sink))
        {
            return existing.token;
        }

        self.next_token += 1;
        registrations.push(Registration {
            token: self.next_token,
            sink,
        });
        self.next_token
    }

    pub fn remove(&mut self, key: &ValueId, token: u64) -> bool {
        let Some(registrations) = self.sinks.get_mut(key) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|registration| registration.token != token);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            self.sinks.remove(key);
        }
        removed
    }

    pub fn deliver(&self, key: &ValueId, update: &PropertyUpdate) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(registrations) = self.sinks.get(key) else {
            return delivery;
        };

        for registration in registrations {
            match registration.sink.try_send(update.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => delivery.dropped += 1,
                Err(TrySendError::Closed(_)) => delivery.closed += 1,
            }
        }
        delivery
    }

    /// Drops registrations under `key` whose receiver is gone.
    pub fn prune_closed(&mut self, key: &ValueId) -> usize {
        let Some(registrations) = self.sinks.get_mut(key) else {
            return 0;
        };
        let before = registrations.len();
        registrations.retain(|registration| !registration.sink.is_closed());
        let pruned = before - registrations.len();
        if registrations.is_empty() {
            self.sinks.remove(key);
        }
        pruned
    }

    /// Keeps only the keys for which `keep` holds. Returns the number of
    /// registrations dropped.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(&ValueId) -> bool) -> usize {
        let mut dropped = 0;
        self.sinks.retain(|key, registrations| {
            let retained = keep(key);
            if !retained {
                dropped += registrations.len();
            }
            retained
        });
        dropped
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.sinks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(node_id: u32) -> ValueId {
        ValueId {
            node_id,
            command_class: 38,
            endpoint: 0,
            property: "currentValue".to_string(),
        }
    }

    fn update(level: i64) -> PropertyUpdate {
        PropertyUpdate {
            device_id: 4,
            device_name: Some("kitchen-light".to_string()),
            property: "currentValue".to_string(),
            property_id: "38-0-currentValue".to_string(),
            value: PropertyValue::Integer(level),
            received_at: Local::now(),
        }
    }

    #[test]
    fn same_sink_registers_once() {
        let mut observers = ObserverSet::default();
        let (tx, _rx) = mpsc::channel(4);
        let first = observers.insert(key(4), tx.clone());
        let second = observers.insert(key(4), tx);
        assert_eq!(first, second);
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn full_sink_does_not_block_others() {
        let mut observers = ObserverSet::default();
        let (slow, _slow_rx) = mpsc::channel(1);
        let (fast, mut fast_rx) = mpsc::channel(8);
        observers.insert(key(4), slow);
        observers.insert(key(4), fast);

        assert_eq!(observers.deliver(&key(4), &update(1)).delivered, 2);
        let delivery = observers.deliver(&key(4), &update(2));
        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.dropped, 1);

        assert_eq!(fast_rx.try_recv().unwrap().value, PropertyValue::Integer(1));
        assert_eq!(fast_rx.try_recv().unwrap().value, PropertyValue::Integer(2));
    }

    #[test]
    fn closed_sinks_are_pruned() {
        let mut observers = ObserverSet::default();
        let (tx, rx) = mpsc::channel(1);
        observers.insert(key(4), tx);
        drop(rx);

        assert_eq!(observers.deliver(&key(4), &update(1)).closed, 1);
        assert_eq!(observers.prune_closed(&key(4)), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut observers = ObserverSet::default();
        let (tx, _rx) = mpsc::channel(1);
        let token = observers.insert(key(4), tx);
        assert!(observers.remove(&key(4), token));
        assert!(!observers.remove(&key(4), token));
        assert!(!observers.remove(&key(9), token));
    }

    #[test]
    fn retain_keys_drops_vanished_properties() {
        let mut observers = ObserverSet::default();
        let (a, _ra) = mpsc::channel(1);
        let (b, _rb) = mpsc::channel(1);
        observers.insert(key(4), a);
        observers.insert(key(5), b);

        assert_eq!(observers.retain_keys(|k| k.node_id == 4), 1);
        assert_eq!(observers.len(), 1);
        assert_eq!(observers.deliver(&key(5), &update(1)), Delivery::default());
    }
}
