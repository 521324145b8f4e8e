//! Load progress shared between the decode worker and whoever polls it.
//!
//! Only atomics are shared; results travel through the loader's channel.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Set in the counter while events are being correlated rather than read.
pub const INITIALIZING_BIT: u32 = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadState {
    Idle = 0,
    Loading = 1,
    CancelRequested = 2,
    Error = 3,
}

impl LoadState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LoadState::Loading,
            2 => LoadState::CancelRequested,
            3 => LoadState::Error,
            _ => LoadState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Raw records read so far.
    Loading(u32),
    /// Events correlated so far.
    Initializing(u32),
    /// Finished; holds the final event count.
    Loaded(u32),
    Error,
}

#[derive(Debug, Default)]
pub struct LoadProgress {
    counter: AtomicU32,
    state: AtomicU8,
}

impl LoadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a load as started. A cancel requested before the worker got
    /// here stays pending.
    pub fn begin(&self) {
        self.counter.store(0, Ordering::SeqCst);
        let _ = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
            (state != LoadState::CancelRequested as u8).then_some(LoadState::Loading as u8)
        });
    }

    pub fn record_event(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn begin_initializing(&self) {
        self.counter.store(INITIALIZING_BIT, Ordering::SeqCst);
    }

    pub fn finish(&self, events: usize) {
        self.counter.store(events as u32 & !INITIALIZING_BIT, Ordering::SeqCst);
        self.state.store(LoadState::Idle as u8, Ordering::SeqCst);
    }

    pub fn fail(&self) {
        self.state.store(LoadState::Error as u8, Ordering::SeqCst);
    }

    /// Asks a running load to stop at the next record boundary.
    /// Returns false when nothing is loading.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                LoadState::Loading as u8,
                LoadState::CancelRequested as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state() == LoadState::CancelRequested
    }

    pub fn state(&self) -> LoadState {
        LoadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn count(&self) -> u32 {
        self.counter.load(Ordering::Relaxed) & !INITIALIZING_BIT
    }

    pub fn status(&self) -> LoadStatus {
        let counter = self.counter.load(Ordering::Relaxed);
        let count = counter & !INITIALIZING_BIT;
        match self.state() {
            LoadState::Error => LoadStatus::Error,
            LoadState::Idle => LoadStatus::Loaded(count),
            LoadState::Loading | LoadState::CancelRequested => {
                if counter & INITIALIZING_BIT != 0 {
                    LoadStatus::Initializing(count)
                } else {
                    LoadStatus::Loading(count)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let progress = LoadProgress::new();
        assert!(!progress.cancel());

        progress.begin();
        progress.record_event();
        progress.record_event();
        assert_eq!(progress.status(), LoadStatus::Loading(2));

        progress.begin_initializing();
        progress.record_event();
        assert_eq!(progress.status(), LoadStatus::Initializing(1));

        progress.finish(2);
        assert_eq!(progress.status(), LoadStatus::Loaded(2));
    }

    #[test]
    fn test_cancel_only_while_loading() {
        let progress = LoadProgress::new();
        progress.begin();
        assert!(progress.cancel());
        assert!(progress.is_cancel_requested());
        assert!(!progress.cancel());

        progress.fail();
        assert_eq!(progress.status(), LoadStatus::Error);
    }

    #[test]
    fn test_begin_keeps_pending_cancel() {
        let progress = LoadProgress::new();
        progress.begin();
        assert!(progress.cancel());

        progress.begin();
        assert!(progress.is_cancel_requested());

        progress.finish(0);
        progress.begin();
        assert_eq!(progress.state(), LoadState::Loading);
    }
}
