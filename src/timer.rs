//! The timeout wheel.
//!
//! Every active connection owns exactly one entry here. Entries are keyed by
//! (deadline, serial) so two connections due at the same instant stay
//! distinct, and the connection records its key so the entry can be unlinked
//! synchronously when the connection is destroyed or rearmed. The wheel
//! stores slab indices rather than pointers or closures, so an expired entry
//! can never dangle.

use std::collections::BTreeMap;

use crate::timestamp::Timestamp;

/// Identifies one scheduled entry. Held by the connection that scheduled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    due: Timestamp,
    serial: u64,
}

#[derive(Debug, Default)]
pub struct TimerWheel {
    entries: BTreeMap<TimerKey, u32>,
    serial: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `slot` to fire at `due` and returns the key that cancels it.
    pub fn schedule(&mut self, due: Timestamp, slot: u32) -> TimerKey {
        let key = TimerKey {
            due,
            serial: self.serial,
        };
        self.serial += 1;
        self.entries.insert(key, slot);
        key
    }

    /// Unlinks a previously scheduled entry. Returns false if the entry had
    /// already fired.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Pops the next entry that is due at or before `now`, earliest first.
    pub fn next_expired(&mut self, now: Timestamp) -> Option<(TimerKey, u32)> {
        let (&key, &slot) = self.entries.first_key_value()?;
        if key.due > now {
            return None;
        }
        self.entries.remove(&key);
        Some((key, slot))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
