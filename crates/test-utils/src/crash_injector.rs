//! Crash injection for testing the commit protocol.
//!
//! A [`CrashInjector`] counts backend calls during a commit and reports when a
//! configured [`CrashPoint`] is reached. A test backend wrapper consults it
//! before each call and fails the call (and everything after it) once it fires.
//!
//! ```text
//! append pages → write secondary slot → sync → write flipped god byte → sync
//!      ↑                                  ↑              ↑                ↑
//! DuringPageAppend              BeforeFirstSync   AfterFirstSync   DuringGodByteFlip
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Points in the commit protocol where a crash can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Fail the first sync, after the secondary slot was written.
    ///
    /// The god byte still selects the old slot; recovery sees the previous revision.
    BeforeFirstSync,
    /// Fail the header write that flips the god byte.
    ///
    /// The new slot is durable but inactive; recovery sees the previous revision.
    AfterFirstSync,
    /// Fail the second sync, after the god byte was flipped.
    ///
    /// Both slots are valid; recovery may see either revision.
    DuringGodByteFlip,
    /// Fail a page append once `threshold` appends have succeeded.
    ///
    /// The header is never touched; recovery sees the previous revision.
    DuringPageAppend,
}

/// Tracks backend calls and decides when to simulate a crash.
#[derive(Debug)]
pub struct CrashInjector {
    crash_point: CrashPoint,
    sync_count: AtomicU32,
    header_write_count: AtomicU32,
    append_count: AtomicU32,
    crashed: AtomicBool,
    armed: AtomicBool,
}

impl CrashInjector {
    /// Creates a disarmed injector for `crash_point`.
    pub fn new(crash_point: CrashPoint) -> Arc<Self> {
        Arc::new(Self {
            crash_point,
            sync_count: AtomicU32::new(0),
            header_write_count: AtomicU32::new(0),
            append_count: AtomicU32::new(0),
            crashed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    /// Resets all counters and starts watching.
    pub fn arm(&self) {
        self.sync_count.store(0, Ordering::SeqCst);
        self.header_write_count.store(0, Ordering::SeqCst);
        self.append_count.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Stops watching.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Whether the crash fired. Every backend call after it should fail.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// The configured crash point.
    pub fn crash_point(&self) -> CrashPoint {
        self.crash_point
    }

    fn watching(&self) -> bool {
        self.armed.load(Ordering::SeqCst) && !self.crashed.load(Ordering::SeqCst)
    }

    fn fire(&self, should_crash: bool) -> bool {
        if should_crash {
            self.crashed.store(true, Ordering::SeqCst);
        }
        should_crash
    }

    /// Called before a sync. Returns `true` if the sync must fail.
    pub fn on_sync(&self) -> bool {
        if !self.watching() {
            return false;
        }
        let count = self.sync_count.fetch_add(1, Ordering::SeqCst);
        self.fire(match self.crash_point {
            CrashPoint::BeforeFirstSync => count == 0,
            CrashPoint::DuringGodByteFlip => count == 1,
            CrashPoint::AfterFirstSync | CrashPoint::DuringPageAppend => false,
        })
    }

    /// Called before a header write. Returns `true` if the write must fail.
    pub fn on_header_write(&self) -> bool {
        if !self.watching() {
            return false;
        }
        let count = self.header_write_count.fetch_add(1, Ordering::SeqCst);
        // The first write is the secondary slot, the second flips the god byte.
        self.fire(self.crash_point == CrashPoint::AfterFirstSync && count == 1)
    }

    /// Called before a page append. Returns `true` if the append must fail.
    pub fn on_append(&self, threshold: u32) -> bool {
        if !self.watching() {
            return false;
        }
        let count = self.append_count.fetch_add(1, Ordering::SeqCst);
        self.fire(self.crash_point == CrashPoint::DuringPageAppend && count >= threshold)
    }

    /// Syncs observed since arming.
    pub fn sync_count(&self) -> u32 {
        self.sync_count.load(Ordering::SeqCst)
    }

    /// Header writes observed since arming.
    pub fn header_write_count(&self) -> u32 {
        self.header_write_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_injector_starts_disarmed() {
        let injector = CrashInjector::new(CrashPoint::BeforeFirstSync);
        assert!(!injector.on_sync());
        assert!(!injector.has_crashed());
    }

    #[test]
    fn test_crash_before_first_sync() {
        let injector = CrashInjector::new(CrashPoint::BeforeFirstSync);
        injector.arm();
        assert!(!injector.on_header_write());
        assert!(injector.on_sync());
        assert!(injector.has_crashed());
        // Fires once.
        assert!(!injector.on_sync());
    }

    #[test]
    fn test_crash_after_first_sync() {
        let injector = CrashInjector::new(CrashPoint::AfterFirstSync);
        injector.arm();
        assert!(!injector.on_header_write());
        assert!(!injector.on_sync());
        assert!(injector.on_header_write());
        assert!(injector.has_crashed());
    }

    #[test]
    fn test_crash_during_god_byte_flip() {
        let injector = CrashInjector::new(CrashPoint::DuringGodByteFlip);
        injector.arm();
        assert!(!injector.on_sync());
        assert!(!injector.on_header_write());
        assert!(injector.on_sync());
        assert_eq!(injector.sync_count(), 2);
    }

    #[test]
    fn test_crash_during_page_append() {
        let injector = CrashInjector::new(CrashPoint::DuringPageAppend);
        injector.arm();
        assert!(!injector.on_append(2));
        assert!(!injector.on_append(2));
        assert!(injector.on_append(2));
        assert!(injector.has_crashed());
    }

    #[test]
    fn test_arm_resets_state() {
        let injector = CrashInjector::new(CrashPoint::BeforeFirstSync);
        injector.arm();
        assert!(injector.on_sync());
        injector.arm();
        assert!(!injector.has_crashed());
        assert_eq!(injector.sync_count(), 0);
        assert_eq!(injector.header_write_count(), 0);
    }

    #[test]
    fn test_disarm_prevents_crash() {
        let injector = CrashInjector::new(CrashPoint::BeforeFirstSync);
        injector.arm();
        injector.disarm();
        assert!(!injector.on_sync());
        assert!(!injector.has_crashed());
    }
}
