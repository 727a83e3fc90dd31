//! Single in-flight sync run guard.
//!
//! An account runs at most one sync at a time. [`SyncSlot`] records the
//! running run's scope and a handle to its outcome, and tells a new caller
//! what to do:
//!
//! | running            | requested        | decision          |
//! |--------------------|------------------|-------------------|
//! | nothing            | any              | `Start`           |
//! | `Everything`       | any              | `Join`            |
//! | `OnlyDatawallet`   | `OnlyDatawallet` | `Join`            |
//! | `OnlyDatawallet`   | `Everything`     | `WaitThenRetry`   |
//!
//! The handle type is left to the caller (sync-client stores a shared
//! future), which keeps this module free of async code.

use tether_sync_types::SyncScope;

/// State of the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState<H> {
    /// No run in flight.
    Idle,
    /// A run is in flight.
    Running {
        /// Scope of the running run
        scope: SyncScope,
        /// Identifies the run, so a finished run never clears its successor
        generation: u64,
        /// Handle to the run's outcome
        handle: H,
    },
}

/// What a caller of `sync` should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotDecision<H> {
    /// Nothing covers the request: start a new run.
    Start,
    /// The running run covers the request: await its outcome.
    Join(H),
    /// The running run is narrower: await it, then ask again.
    WaitThenRetry(H),
}

/// Guard allowing one sync run at a time.
#[derive(Debug)]
pub struct SyncSlot<H> {
    state: SlotState<H>,
    next_generation: u64,
}

impl<H: Clone> SyncSlot<H> {
    /// An idle slot.
    pub fn new() -> Self {
        Self {
            state: SlotState::Idle,
            next_generation: 1,
        }
    }

    /// Current state.
    pub fn state(&self) -> &SlotState<H> {
        &self.state
    }

    /// Scope of the running run, if any.
    pub fn running_scope(&self) -> Option<SyncScope> {
        match &self.state {
            SlotState::Idle => None,
            SlotState::Running { scope, .. } => Some(*scope),
        }
    }

    /// Decide how to serve a request for `scope`.
    pub fn request(&self, scope: SyncScope) -> SlotDecision<H> {
        match &self.state {
            SlotState::Idle => SlotDecision::Start,
            SlotState::Running {
                scope: running,
                handle,
                ..
            } => {
                if running.covers(scope) {
                    SlotDecision::Join(handle.clone())
                } else {
                    SlotDecision::WaitThenRetry(handle.clone())
                }
            }
        }
    }

    /// Mark a run as in flight.
    ///
    /// `make_handle` receives the run's generation, which the run passes to
    /// [`finish`](Self::finish) when it completes. Returns the stored handle.
    pub fn begin(&mut self, scope: SyncScope, make_handle: impl FnOnce(u64) -> H) -> H {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let handle = make_handle(generation);
        self.state = SlotState::Running {
            scope,
            generation,
            handle: handle.clone(),
        };
        handle
    }

    /// Clear the slot if run `generation` still occupies it.
    ///
    /// Returns whether the slot was cleared.
    pub fn finish(&mut self, generation: u64) -> bool {
        match &self.state {
            SlotState::Running {
                generation: running,
                ..
            } if *running == generation => {
                self.state = SlotState::Idle;
                true
            }
            _ => false,
        }
    }
}

impl<H: Clone> Default for SyncSlot<H> {
    fn default() -> Self {
        Self::new()
    }
}
