// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashSet;
use std::fmt;
use std::time::SystemTime;

/// Identifies a timer or a task within one [`Timeline`][crate::Timeline].
///
/// Identifiers are handed out sequentially by the timeline, so the same scenario always
/// produces the same identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// "This handler, at this instant."
///
/// The key compares by value, so the same firing requested twice from different
/// nesting levels is recognized as the same firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ScheduleKey {
    handler: HandlerId,
    at: SystemTime,
}

impl ScheduleKey {
    pub const fn new(handler: HandlerId, at: SystemTime) -> Self {
        Self { handler, at }
    }

    pub const fn handler(&self) -> HandlerId {
        self.handler
    }

    /// The logical instant the handler runs at.
    pub const fn at(&self) -> SystemTime {
        self.at
    }
}

/// The set of firings that already happened on one timeline.
///
/// Entries are never removed; that is what guarantees each firing runs at most once, even
/// when a reentrant advance requests it again.
#[derive(Debug, Default)]
pub(crate) struct ScheduleLedger {
    fired: HashSet<ScheduleKey>,
}

impl ScheduleLedger {
    /// Records the firing. Returns `false` if it was already recorded and must not run again.
    pub fn insert(&mut self, key: ScheduleKey) -> bool {
        self.fired.insert(key)
    }

    #[cfg(test)]
    pub fn contains(&self, key: &ScheduleKey) -> bool {
        self.fired.contains(key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.fired.len()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn same_handler_same_instant_fires_once() {
        let mut ledger = ScheduleLedger::default();
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(3);
        let key = ScheduleKey::new(HandlerId::new(1), at);

        assert!(ledger.insert(key));
        assert!(!ledger.insert(ScheduleKey::new(HandlerId::new(1), at)));
        assert!(ledger.contains(&key));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn handlers_and_instants_are_independent() {
        let mut ledger = ScheduleLedger::default();
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(5);

        assert!(ledger.insert(ScheduleKey::new(HandlerId::new(1), at)));
        assert!(ledger.insert(ScheduleKey::new(HandlerId::new(2), at)));
        assert!(ledger.insert(ScheduleKey::new(HandlerId::new(1), at + Duration::from_secs(5))));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn key_accessors() {
        let at = SystemTime::UNIX_EPOCH;
        let key = ScheduleKey::new(HandlerId::new(9), at);

        assert_eq!(key.handler(), HandlerId::new(9));
        assert_eq!(key.at(), at);
    }

    #[test]
    fn handler_id_display() {
        let id = HandlerId::new(42);

        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "#42");
    }
}
