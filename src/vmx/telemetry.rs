// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::sync::atomic::{AtomicU64, Ordering};

/// Basic exit reasons with their own histogram bucket; larger ones share one bucket.
const TRACKED_REASONS: usize = 80;

/// Monotonic VM entry and exit counters.
///
/// Written by the dispatcher of each core and readable from anywhere. Counters only move
/// forward unless [`Telemetry::reset`] is called.
pub struct Telemetry {
    entries: AtomicU64,
    exits: AtomicU64,
    failed_entries: AtomicU64,
    last_entry: AtomicU64,
    last_exit: AtomicU64,
    guest_cycles: AtomicU64,
    reasons: [AtomicU64; TRACKED_REASONS],
    other_reasons: AtomicU64,
}

/// A point-in-time copy of the scalar counters of a [`Telemetry`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub entries: u64,
    pub exits: u64,
    pub failed_entries: u64,
    /// Timestamp of the latest successful VM entry.
    pub last_entry: u64,
    /// Timestamp of the latest VM exit.
    pub last_exit: u64,
    /// Timestamp ticks spent between entries and their exits.
    pub guest_cycles: u64,
}

impl Telemetry {
    pub const fn new() -> Self {
        Self {
            entries: AtomicU64::new(0),
            exits: AtomicU64::new(0),
            failed_entries: AtomicU64::new(0),
            last_entry: AtomicU64::new(0),
            last_exit: AtomicU64::new(0),
            guest_cycles: AtomicU64::new(0),
            reasons: [const { AtomicU64::new(0) }; TRACKED_REASONS],
            other_reasons: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_entry(&self, timestamp: u64) {
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.last_entry.store(timestamp, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_entry(&self) {
        self.failed_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exit(&self, reason: u16, entered_at: u64, timestamp: u64) {
        self.exits.fetch_add(1, Ordering::Relaxed);
        self.last_exit.store(timestamp, Ordering::Relaxed);
        self.guest_cycles
            .fetch_add(timestamp.saturating_sub(entered_at), Ordering::Relaxed);
        self.bucket(reason).fetch_add(1, Ordering::Relaxed);
    }

    fn bucket(&self, reason: u16) -> &AtomicU64 {
        self.reasons
            .get(reason as usize)
            .unwrap_or(&self.other_reasons)
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn exits(&self) -> u64 {
        self.exits.load(Ordering::Relaxed)
    }

    /// Entry attempts that failed, either by instruction failure or by a VM-entry failure
    /// exit.
    pub fn failed_entries(&self) -> u64 {
        self.failed_entries.load(Ordering::Relaxed)
    }

    /// Exits with basic reason `reason`.
    ///
    /// Reasons above the tracked range share one bucket.
    pub fn exits_for(&self, reason: u16) -> u64 {
        self.bucket(reason).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            entries: self.entries.load(Ordering::Relaxed),
            exits: self.exits.load(Ordering::Relaxed),
            failed_entries: self.failed_entries.load(Ordering::Relaxed),
            last_entry: self.last_entry.load(Ordering::Relaxed),
            last_exit: self.last_exit.load(Ordering::Relaxed),
            guest_cycles: self.guest_cycles.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.entries,
            &self.exits,
            &self.failed_entries,
            &self.last_entry,
            &self.last_exit,
            &self.guest_cycles,
            &self.other_reasons,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &self.reasons {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self.snapshot(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static GLOBAL: Telemetry = Telemetry::new();

    #[test]
    fn test_counters() {
        let t = Telemetry::new();
        t.record_entry(100);
        t.record_exit(12, 100, 250);
        t.record_entry(300);
        t.record_exit(10, 300, 320);
        t.record_failed_entry();
        assert_eq!(
            t.snapshot(),
            TelemetrySnapshot {
                entries: 2,
                exits: 2,
                failed_entries: 1,
                last_entry: 300,
                last_exit: 320,
                guest_cycles: 170,
            }
        );
        assert_eq!(t.exits_for(12), 1);
        assert_eq!(t.exits_for(10), 1);
        assert_eq!(t.exits_for(48), 0);
    }

    #[test]
    fn test_untracked_reasons_share_a_bucket() {
        let t = Telemetry::new();
        t.record_exit(200, 0, 1);
        t.record_exit(u16::MAX, 0, 1);
        assert_eq!(t.exits_for(300), 2);
        assert_eq!(t.exits_for(79), 0);
    }

    #[test]
    fn test_reset() {
        GLOBAL.record_entry(5);
        GLOBAL.record_exit(1, 5, 9);
        GLOBAL.reset();
        assert_eq!(GLOBAL.snapshot(), TelemetrySnapshot::default());
        assert_eq!(GLOBAL.exits_for(1), 0);
    }
}
