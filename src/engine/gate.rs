//! Single-flight gate serializing launch cycles.
//!
//! Admission is one compare-exchange on an atomic; the current state is also
//! published on a `watch` channel so presentation layers can enable or disable
//! their launch controls. Holding a [`RunPermit`] is the only way to move the
//! state away from `Idle`, and dropping it always puts the state back.

use crate::model::RunState;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

struct Inner {
    state: AtomicU8,
    signal: watch::Sender<RunState>,
}

#[derive(Clone)]
pub struct RunStateController {
    inner: Arc<Inner>,
}

impl Default for RunStateController {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateController {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(RunState::Idle);
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(RunState::Idle.as_u8()),
                signal,
            }),
        }
    }

    /// Admit a new launch cycle if none is in flight.
    ///
    /// On success the state is `SwappingIn` and the returned permit must be
    /// held for the whole cycle.
    pub fn try_acquire(&self) -> Option<RunPermit> {
        self.inner
            .state
            .compare_exchange(
                RunState::Idle.as_u8(),
                RunState::SwappingIn.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        self.inner.signal.send_replace(RunState::SwappingIn);
        tracing::debug!("run gate acquired");
        Some(RunPermit {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_idle(&self) -> bool {
        self.state() == RunState::Idle
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.inner.signal.subscribe()
    }
}

/// Scoped ownership of the gate. Dropping it releases the gate.
pub struct RunPermit {
    inner: Arc<Inner>,
}

impl RunPermit {
    /// Move the in-flight cycle to another non-idle state.
    pub fn advance(&self, next: RunState) {
        debug_assert!(next != RunState::Idle, "use release() to return to idle");
        self.inner.state.store(next.as_u8(), Ordering::Release);
        self.inner.signal.send_replace(next);
    }

    /// Return the gate to `Idle`. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.inner
            .state
            .store(RunState::Idle.as_u8(), Ordering::Release);
        self.inner.signal.send_replace(RunState::Idle);
        tracing::debug!("run gate released");
    }
}
