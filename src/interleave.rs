//! # Interleaving Harness
//!
//! Two execution units, each with its own session, started together and
//! paced with whole-tick pauses. The harness awaits both before handing
//! back their results, so assertions always see the final state.
//!
//! ```text
//!   tick:   0          1          2          3
//!   t1:     read ─────────────────────────── read ── commit
//!   t2:     ────────── update ── commit
//! ```
//!
//! Every unit follows the same lifecycle: connect, run its body, commit if
//! the body returned `Ok`, otherwise roll back and return the body's error.
//! A failed commit becomes the unit's error. Nothing is retried and nothing
//! is cancelled.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::backend::{Backend, Session};
use crate::Result;

// ============================================================================
// Pace
// ============================================================================

/// Delay source for a unit, in whole ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pace {
    tick: Duration,
}

impl Pace {
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub async fn pause(&self, ticks: u32) {
        tokio::time::sleep(self.tick * ticks).await;
    }
}

// ============================================================================
// Unit
// ============================================================================

/// One execution unit: a named session and its pace. Derefs to the session,
/// so statements are issued directly on the unit.
pub struct Unit<S> {
    name: String,
    session: S,
    pace: Pace,
}

impl<S: Session> Unit<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sleep for `ticks` ticks without touching the session.
    pub async fn pause(&self, ticks: u32) {
        self.pace.pause(ticks).await;
    }
}

impl<S> Deref for Unit<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S> DerefMut for Unit<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

/// Connect, run `body`, then commit or roll back.
pub(crate) async fn run_unit<B, T, F>(backend: &B, name: &str, pace: Pace, body: F) -> Result<T>
where
    B: Backend,
    F: AsyncFnOnce(&mut Unit<B::Session>) -> Result<T>,
{
    let session = backend.connect().await?;
    let mut unit = Unit { name: name.to_owned(), session, pace };
    match body(&mut unit).await {
        Ok(value) => {
            unit.session.commit().await?;
            tracing::debug!(unit = name, backend = backend.name(), "committed");
            Ok(value)
        }
        Err(err) => {
            tracing::debug!(unit = name, backend = backend.name(), error = %err, "rolling back");
            if let Err(rollback_err) = unit.session.rollback().await {
                tracing::warn!(unit = name, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

// ============================================================================
// Interleaving
// ============================================================================

/// A pair of units about to run concurrently.
pub struct Interleaving<'l, B: Backend> {
    backend: &'l B,
    pace: Pace,
}

impl<'l, B: Backend> Interleaving<'l, B> {
    pub fn new(backend: &'l B, pace: Pace) -> Self {
        Self { backend, pace }
    }

    /// Start `first` (as `t1`) and `second` (as `t2`) together and await
    /// both. Each result is that unit's body result, or its commit error.
    pub async fn run<T1, T2, F1, F2>(self, first: F1, second: F2) -> (Result<T1>, Result<T2>)
    where
        F1: AsyncFnOnce(&mut Unit<B::Session>) -> Result<T1>,
        F2: AsyncFnOnce(&mut Unit<B::Session>) -> Result<T2>,
    {
        tokio::join!(
            run_unit(self.backend, "t1", self.pace, first),
            run_unit(self.backend, "t2", self.pace, second),
        )
    }
}
