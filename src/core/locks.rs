// src/core/locks.rs - Shared-model access arbitration for Gambit v0.3

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use colored::*;
use serde::Serialize;

/// Last-known access mode per component, kept for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AccessMode {
    #[default]
    Idle,
    Read,
    Write,
    Training,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: Option<String>,
    waiting_writers: usize,
    trainer: Option<String>,
    modes: HashMap<String, AccessMode>,
}

impl LockState {
    fn blocked_by_training(&self, component: &str) -> bool {
        match &self.trainer {
            Some(owner) => owner != component,
            None => false,
        }
    }

    fn set_mode(&mut self, component: &str, mode: AccessMode) {
        self.modes.insert(component.to_string(), mode);
    }
}

/// Arbitrates access to the shared trainable model.
///
/// Two layers guard the same resource: a blocking readers-writer lock for
/// short-lived inference/update critical sections, and a fail-fast training
/// gate for sessions measured in minutes. A training session is
/// write-equivalent: it only begins while the lock is entirely free, and
/// while it runs every other component's read or write blocks until the
/// owner ends the session.
pub struct ModelLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl ModelLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Blocks until no writer or foreign trainer holds the model, then joins
    /// the reader pool. Waiting writers gate new readers so a writer is never
    /// starved by a steady stream of reads.
    pub fn acquire_read(&self, component: &str) {
        let mut state = self.lock_state();
        while state.writer.is_some()
            || state.waiting_writers > 0
            || state.blocked_by_training(component)
        {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
        state.readers += 1;
        state.set_mode(component, AccessMode::Read);
    }

    /// Timed variant of [`ModelLock::acquire_read`] for callers that must
    /// stay responsive, such as the orchestrator loop. Returns false on
    /// timeout with no state left behind.
    pub fn acquire_read_timeout(&self, component: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        while state.writer.is_some()
            || state.waiting_writers > 0
            || state.blocked_by_training(component)
        {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, remaining)
                .unwrap_or_else(|p| p.into_inner());
            state = guard;
        }
        state.readers += 1;
        state.set_mode(component, AccessMode::Read);
        true
    }

    pub fn release_read(&self, component: &str) {
        let mut state = self.lock_state();
        state.readers = state.readers.saturating_sub(1);
        state.set_mode(component, AccessMode::Idle);
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    /// Attempts exclusive access, waiting up to `timeout`. Returns false on
    /// timeout with no state left behind.
    pub fn acquire_write(&self, component: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        state.waiting_writers += 1;

        loop {
            let busy = state.readers > 0
                || state.writer.is_some()
                || state.blocked_by_training(component);
            if !busy {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.waiting_writers -= 1;
                // Readers we were gating can move again.
                self.cond.notify_all();
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, remaining)
                .unwrap_or_else(|p| p.into_inner());
            state = guard;
        }

        state.waiting_writers -= 1;
        state.writer = Some(component.to_string());
        state.set_mode(component, AccessMode::Write);
        true
    }

    pub fn release_write(&self, component: &str) {
        let mut state = self.lock_state();
        match &state.writer {
            Some(owner) if owner == component => {
                state.writer = None;
                state.set_mode(component, AccessMode::Idle);
                self.cond.notify_all();
            }
            _ => {
                eprintln!(
                    "{} {} released a write lock it does not hold",
                    "⚠️".yellow(),
                    component
                );
            }
        }
    }

    /// Fail-fast claim of a long-lived training window. Succeeds only while
    /// the lock is entirely free and no other session is active; callers that
    /// get `false` should reschedule rather than block.
    pub fn begin_training_session(&self, component: &str) -> bool {
        let mut state = self.lock_state();
        if let Some(owner) = &state.trainer {
            println!(
                "{} training denied for {}: {} already owns the session",
                "🔒".yellow(),
                component,
                owner
            );
            return false;
        }
        if state.readers > 0 || state.writer.is_some() || state.waiting_writers > 0 {
            return false;
        }
        state.trainer = Some(component.to_string());
        state.set_mode(component, AccessMode::Training);
        true
    }

    /// Only the owning component may end its session; anything else is an
    /// idempotent no-op returning false.
    pub fn end_training_session(&self, component: &str) -> bool {
        let mut state = self.lock_state();
        match &state.trainer {
            Some(owner) if owner == component => {
                state.trainer = None;
                state.set_mode(component, AccessMode::Idle);
                self.cond.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Advisory check: true when no training session is active or the caller
    /// owns the active one.
    pub fn can_access_resource(&self, component: &str) -> bool {
        !self.lock_state().blocked_by_training(component)
    }

    pub fn component_mode(&self, component: &str) -> AccessMode {
        self.lock_state()
            .modes
            .get(component)
            .copied()
            .unwrap_or_default()
    }
}

impl Default for ModelLock {
    fn default() -> Self {
        Self::new()
    }
}
