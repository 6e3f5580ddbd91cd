//! In-process countdown backend driven by tokio timers.
//!
//! Behaves like the external primitive: handles move between idle, active
//! and paused, and every transition is published on the event feed. The
//! fault-injection hooks let callers model a hub that lost handles, refuses
//! a start, or still has countdowns running from before a restart.

use crate::backend::{CountdownBackend, CountdownEvent, CountdownState, CountdownStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use timekeeper_core::types::end_time;
use timekeeper_core::{Result, TimekeeperError};
use tokio::sync::broadcast;
use tokio::time::Instant;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
struct SimHandle {
    state: CountdownState,
    deadline: Option<Instant>,
    /// Frozen remainder while paused.
    remaining: Duration,
    /// Bumped on every re-arm so stale sleepers know to stand down.
    generation: u64,
}

impl SimHandle {
    fn idle() -> Self {
        Self {
            state: CountdownState::Idle,
            deadline: None,
            remaining: Duration::ZERO,
            generation: 0,
        }
    }

    fn remaining(&self) -> Duration {
        match self.state {
            // No deadline means it lies past what `Instant` can hold.
            CountdownState::Active => self
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(self.remaining),
            CountdownState::Paused => self.remaining,
            CountdownState::Idle => Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    handles: HashMap<String, SimHandle>,
    failing_starts: usize,
}

#[derive(Clone)]
pub struct SimulatedCountdowns {
    inner: Arc<Mutex<SimState>>,
    events: broadcast::Sender<CountdownEvent>,
}

impl SimulatedCountdowns {
    pub fn new<I, S>(handles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handles = handles
            .into_iter()
            .map(|h| (h.into(), SimHandle::idle()))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(SimState {
                handles,
                failing_starts: 0,
            })),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delete a handle, as if someone removed the helper entity from the hub.
    pub fn remove_handle(&self, handle: &str) -> bool {
        self.lock().handles.remove(handle).is_some()
    }

    /// Make the next start call fail.
    pub fn fail_next_start(&self) {
        self.lock().failing_starts += 1;
    }

    /// Put `handle` into the active state without emitting an event, as if it
    /// had been running before this process started.
    pub fn preload_active(&self, handle: &str, duration: Duration) {
        let mut state = self.lock();
        let entry = state
            .handles
            .entry(handle.to_string())
            .or_insert_with(SimHandle::idle);
        entry.state = CountdownState::Active;
        let generation = self.arm(entry, duration);
        drop(state);
        self.spawn_expiry(handle.to_string(), generation, duration);
    }

    /// Current state of a handle, `None` if it does not exist.
    pub fn state_of(&self, handle: &str) -> Option<CountdownState> {
        self.lock().handles.get(handle).map(|h| h.state)
    }

    fn arm(&self, entry: &mut SimHandle, duration: Duration) -> u64 {
        entry.generation += 1;
        entry.deadline = Instant::now().checked_add(duration);
        entry.remaining = duration;
        entry.generation
    }

    fn spawn_expiry(&self, handle: String, generation: u64, after: Duration) {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = state.handles.get_mut(&handle) else {
                return;
            };
            if entry.generation != generation || entry.state != CountdownState::Active {
                return;
            }
            entry.state = CountdownState::Idle;
            entry.deadline = None;
            entry.remaining = Duration::ZERO;
            drop(state);
            let _ = events.send(CountdownEvent::new(
                handle,
                CountdownState::Active,
                CountdownState::Idle,
            ));
        });
    }

    fn emit(&self, handle: &str, from: CountdownState, to: CountdownState) {
        if from != to {
            let _ = self.events.send(CountdownEvent::new(handle, from, to));
        }
    }
}

fn unknown(handle: &str) -> TimekeeperError {
    TimekeeperError::ExternalCall(format!("unknown countdown handle '{handle}'"))
}

#[async_trait]
impl CountdownBackend for SimulatedCountdowns {
    async fn start(&self, handle: &str, duration: Duration) -> Result<()> {
        let mut state = self.lock();
        if state.failing_starts > 0 {
            state.failing_starts -= 1;
            return Err(TimekeeperError::ExternalCall(format!(
                "start refused for '{handle}'"
            )));
        }
        let entry = state.handles.get_mut(handle).ok_or_else(|| unknown(handle))?;
        let from = entry.state;
        let run_for = if from == CountdownState::Paused {
            entry.remaining
        } else {
            duration
        };
        entry.state = CountdownState::Active;
        let generation = self.arm(entry, run_for);
        drop(state);

        self.spawn_expiry(handle.to_string(), generation, run_for);
        self.emit(handle, from, CountdownState::Active);
        Ok(())
    }

    async fn cancel(&self, handle: &str) -> Result<()> {
        let mut state = self.lock();
        let entry = state.handles.get_mut(handle).ok_or_else(|| unknown(handle))?;
        let from = entry.state;
        entry.state = CountdownState::Idle;
        entry.deadline = None;
        entry.remaining = Duration::ZERO;
        entry.generation += 1;
        drop(state);

        self.emit(handle, from, CountdownState::Idle);
        Ok(())
    }

    async fn pause(&self, handle: &str) -> Result<()> {
        let mut state = self.lock();
        let entry = state.handles.get_mut(handle).ok_or_else(|| unknown(handle))?;
        if entry.state != CountdownState::Active {
            return Ok(());
        }
        entry.remaining = entry.remaining();
        entry.state = CountdownState::Paused;
        entry.deadline = None;
        entry.generation += 1;
        drop(state);

        self.emit(handle, CountdownState::Active, CountdownState::Paused);
        Ok(())
    }

    async fn resume(&self, handle: &str) -> Result<()> {
        let mut state = self.lock();
        let entry = state.handles.get_mut(handle).ok_or_else(|| unknown(handle))?;
        if entry.state != CountdownState::Paused {
            return Ok(());
        }
        let run_for = entry.remaining;
        entry.state = CountdownState::Active;
        let generation = self.arm(entry, run_for);
        drop(state);

        self.spawn_expiry(handle.to_string(), generation, run_for);
        self.emit(handle, CountdownState::Paused, CountdownState::Active);
        Ok(())
    }

    async fn extend(&self, handle: &str, extra: Duration) -> Result<()> {
        let mut state = self.lock();
        let entry = state.handles.get_mut(handle).ok_or_else(|| unknown(handle))?;
        match entry.state {
            CountdownState::Idle => Err(TimekeeperError::ExternalCall(format!(
                "cannot extend idle countdown '{handle}'"
            ))),
            CountdownState::Paused => {
                entry.remaining = entry.remaining.saturating_add(extra);
                Ok(())
            }
            CountdownState::Active => {
                let run_for = entry.remaining().saturating_add(extra);
                let generation = self.arm(entry, run_for);
                drop(state);
                self.spawn_expiry(handle.to_string(), generation, run_for);
                Ok(())
            }
        }
    }

    async fn state(&self, handle: &str) -> Result<Option<CountdownStatus>> {
        let state = self.lock();
        Ok(state.handles.get(handle).map(|h| {
            let remaining = h.remaining();
            CountdownStatus {
                state: h.state,
                remaining,
                finishes_at: match h.state {
                    CountdownState::Active => end_time(Utc::now(), remaining),
                    _ => None,
                },
            }
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<CountdownEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
