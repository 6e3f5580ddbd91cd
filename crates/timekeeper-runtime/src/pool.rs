//! Timer resource pool: binds logical timers to a fixed set of external
//! countdown handles.
//!
//! All allocation state sits behind one mutex. The lock is never held across
//! an `.await`; external calls happen between short critical sections.

use crate::backend::{CountdownBackend, CountdownEvent, CountdownState};
use crate::events::{publish, EventSender, TimerEvent};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use timekeeper_core::config::{EscalationConfig, PoolConfig};
use timekeeper_core::duration::format_duration;
use timekeeper_core::types::{
    end_time, new_id, Action, ActiveTimer, EscalationState, Provenance, SequenceRef, TimerKind,
};
use timekeeper_core::{Result, TimekeeperError};
use tokio::sync::{broadcast, mpsc};

// ---------------------------------------------------------------------------
// TimerPool
// ---------------------------------------------------------------------------

/// The allocation table.
///
/// `available` and `in_use` never overlap, `in_use` is a bijection between
/// handles and timer ids, and their sizes always add up to `capacity`.
#[derive(Debug, Clone, Serialize)]
pub struct TimerPool {
    available: VecDeque<String>,
    in_use: BTreeMap<String, String>,
    capacity: usize,
}

impl TimerPool {
    pub fn new(handles: &[String]) -> Self {
        let mut available = VecDeque::with_capacity(handles.len());
        for h in handles {
            if !available.contains(h) {
                available.push_back(h.clone());
            }
        }
        let capacity = available.len();
        Self {
            available,
            in_use: BTreeMap::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> impl Iterator<Item = &str> {
        self.available.iter().map(String::as_str)
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn in_use(&self) -> &BTreeMap<String, String> {
        &self.in_use
    }

    pub fn owner(&self, handle: &str) -> Option<&str> {
        self.in_use.get(handle).map(String::as_str)
    }

    fn allocate(&mut self, timer_id: &str) -> Option<String> {
        let handle = self.available.pop_front()?;
        self.in_use.insert(handle.clone(), timer_id.to_string());
        Some(handle)
    }

    /// Return `handle` to the pool if it is still bound to `timer_id`.
    fn release(&mut self, handle: &str, timer_id: &str) -> bool {
        if self.owner(handle) != Some(timer_id) {
            return false;
        }
        self.in_use.remove(handle);
        self.available.push_back(handle.to_string());
        true
    }

    /// Drop a handle that does not exist externally. Shrinks capacity.
    fn retire(&mut self, handle: &str) -> bool {
        let before = self.available.len();
        self.available.retain(|h| h != handle);
        if self.available.len() < before {
            self.capacity -= 1;
            true
        } else {
            false
        }
    }

    pub fn is_consistent(&self) -> bool {
        let disjoint = self.available.iter().all(|h| !self.in_use.contains_key(h));
        let ids: HashSet<&String> = self.in_use.values().collect();
        disjoint
            && ids.len() == self.in_use.len()
            && self.available.len() + self.in_use.len() == self.capacity
    }
}

// ---------------------------------------------------------------------------
// TimerRequest
// ---------------------------------------------------------------------------

/// What to start. Built with chained setters:
///
/// ```rust,ignore
/// TimerRequest::new(TimerKind::Alarm, Duration::from_secs(900))
///     .label("pizza")
///     .escalation(EscalationConfig::default())
/// ```
#[derive(Debug, Clone)]
pub struct TimerRequest {
    pub kind: TimerKind,
    pub duration: Duration,
    pub label: Option<String>,
    pub on_complete: Option<Action>,
    pub sequence: Option<SequenceRef>,
    pub escalation: Option<EscalationConfig>,
    pub provenance: Provenance,
}

impl TimerRequest {
    pub fn new(kind: TimerKind, duration: Duration) -> Self {
        Self {
            kind,
            duration,
            label: None,
            on_complete: None,
            sequence: None,
            escalation: None,
            provenance: Provenance::new(None, None),
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn on_complete(mut self, action: Action) -> Self {
        self.on_complete = Some(action);
        self
    }

    pub fn sequence(mut self, sequence_id: impl Into<String>, step: usize) -> Self {
        self.sequence = Some(SequenceRef {
            sequence_id: sequence_id.into(),
            step,
        });
        self
    }

    pub fn escalation(mut self, config: EscalationConfig) -> Self {
        self.escalation = Some(config);
        self
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

// ---------------------------------------------------------------------------
// PoolManager
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Serialize)]
pub struct InitReport {
    /// Configured handles the backend does not know about.
    pub missing: Vec<String>,
    /// Handles found running with no owner here, now cancelled.
    pub reclaimed: Vec<String>,
}

/// A handle held for a timer that has not started yet. Dropping it
/// unused gives the handle back.
pub struct Reservation {
    pool: Weak<PoolManager>,
    timer_id: String,
    handle: String,
    claimed: bool,
}

impl Reservation {
    pub fn handle(&self) -> &str {
        &self.handle
    }

    fn claim(&mut self) -> (String, String) {
        self.claimed = true;
        (self.timer_id.clone(), self.handle.clone())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.unreserve(&self.timer_id, &self.handle);
        }
    }
}

struct PoolInner {
    pool: TimerPool,
    timers: HashMap<String, ActiveTimer>,
    /// Ids holding a handle through a [`Reservation`], with no countdown yet.
    reserved: HashSet<String>,
    /// Handles whose next `active → idle` comes from our own cancel call.
    /// Cleared by the next transition into `active`, since the feed is
    /// ordered and the cancel's transition must have come before it.
    suppressed: HashSet<String>,
}

pub struct PoolManager {
    backend: Arc<dyn CountdownBackend>,
    inner: Mutex<PoolInner>,
    max_timer: Duration,
    finished_tx: mpsc::UnboundedSender<ActiveTimer>,
    events: EventSender,
}

impl PoolManager {
    /// Build the pool over the configured handles. The receiver yields every
    /// timer whose countdown finished; hand it to the dispatcher.
    pub fn new(
        backend: Arc<dyn CountdownBackend>,
        config: &PoolConfig,
        events: EventSender,
    ) -> (Self, mpsc::UnboundedReceiver<ActiveTimer>) {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let manager = Self {
            backend,
            inner: Mutex::new(PoolInner {
                pool: TimerPool::new(&config.handles),
                timers: HashMap::new(),
                reserved: HashSet::new(),
                suppressed: HashSet::new(),
            }),
            max_timer: config.max_timer(),
            finished_tx,
            events,
        };
        (manager, finished_rx)
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the backend feed and reconcile configured handles with
    /// what the backend actually has.
    ///
    /// Missing handles are retired from the pool. Handles already running
    /// are cancelled rather than adopted: nothing in this process knows what
    /// they were for.
    pub async fn initialize(self: &Arc<Self>) -> InitReport {
        self.spawn_subscriber();

        let handles: Vec<String> = self.lock().pool.available().map(str::to_string).collect();
        let mut report = InitReport::default();

        for handle in handles {
            match self.backend.state(&handle).await {
                Ok(Some(status)) if status.state == CountdownState::Idle => {}
                Ok(Some(status)) => {
                    tracing::warn!(
                        handle = %handle,
                        state = %status.state,
                        "cancelling countdown left over from a previous run"
                    );
                    if let Err(e) = self.backend.cancel(&handle).await {
                        tracing::warn!(handle = %handle, error = %e, "cancel of leftover countdown failed");
                    }
                    report.reclaimed.push(handle);
                }
                Ok(None) => {
                    tracing::warn!(handle = %handle, "countdown handle missing: capacity shortfall");
                    self.lock().pool.retire(&handle);
                    report.missing.push(handle);
                }
                Err(e) => {
                    tracing::warn!(handle = %handle, error = %e, "countdown handle unreadable: capacity shortfall");
                    self.lock().pool.retire(&handle);
                    report.missing.push(handle);
                }
            }
        }

        let capacity = self.lock().pool.capacity();
        if capacity == 0 {
            tracing::error!("no usable countdown handles: every timer request will be refused");
        } else {
            tracing::info!(capacity, "timer pool ready");
        }
        report
    }

    fn spawn_subscriber(self: &Arc<Self>) {
        let mut rx = self.backend.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match weak.upgrade() {
                        Some(pool) => pool.on_countdown_event(event),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "countdown event feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Handle one backend transition. Never awaits: finished timers are
    /// handed off over a channel so the feed keeps draining.
    pub(crate) fn on_countdown_event(&self, event: CountdownEvent) {
        if !event.is_finish() {
            tracing::debug!(handle = %event.handle, from = %event.from, to = %event.to, "countdown transition");
            if event.to == CountdownState::Active && self.lock().suppressed.remove(&event.handle) {
                tracing::debug!(handle = %event.handle, "dropping stale cancel suppression");
            }
            return;
        }

        let finished = {
            let mut inner = self.lock();
            if inner.suppressed.remove(&event.handle) {
                tracing::debug!(handle = %event.handle, "ignoring finish from cancelled countdown");
                return;
            }
            let Some(timer_id) = inner.pool.owner(&event.handle).map(str::to_string) else {
                tracing::debug!(handle = %event.handle, "ignoring finish for unowned handle");
                return;
            };
            if inner.reserved.contains(&timer_id) {
                tracing::debug!(handle = %event.handle, "ignoring finish for reserved handle");
                return;
            }
            let Some(timer) = inner.timers.remove(&timer_id) else {
                tracing::error!(
                    handle = %event.handle,
                    timer_id = %timer_id,
                    "handle bound to a timer that no longer exists"
                );
                inner.pool.release(&event.handle, &timer_id);
                return;
            };
            inner.pool.release(&event.handle, &timer_id);
            timer
        };

        tracing::info!(timer_id = %finished.id, handle = %finished.handle, kind = %finished.kind, "timer finished");
        publish(
            &self.events,
            TimerEvent::TimerFinished {
                timer_id: finished.id.clone(),
                kind: finished.kind,
                label: finished.label.clone(),
            },
        );
        if self.finished_tx.send(finished).is_err() {
            tracing::warn!(handle = %event.handle, "no dispatcher listening for finished timers");
        }
    }

    fn check_duration(&self, duration: Duration) -> Result<()> {
        if duration > self.max_timer {
            return Err(TimekeeperError::InvalidDuration(format!(
                "{} is longer than the {} limit",
                format_duration(duration),
                format_duration(self.max_timer)
            )));
        }
        Ok(())
    }

    /// Allocate a handle and start its countdown. Fails closed with
    /// `PoolExhausted`; a failed start returns the handle before erroring.
    pub async fn create(&self, request: TimerRequest) -> Result<ActiveTimer> {
        self.check_duration(request.duration)?;
        let id = new_id("tmr");
        let Some(handle) = self.lock().pool.allocate(&id) else {
            tracing::info!(kind = %request.kind, "timer pool exhausted");
            return Err(TimekeeperError::PoolExhausted);
        };
        self.arm(id, handle, request).await
    }

    /// Hold a handle without starting anything, for a caller that has work
    /// to do before it knows it can get a countdown.
    pub fn reserve(self: &Arc<Self>) -> Result<Reservation> {
        let mut inner = self.lock();
        let id = new_id("tmr");
        let Some(handle) = inner.pool.allocate(&id) else {
            tracing::info!("timer pool exhausted");
            return Err(TimekeeperError::PoolExhausted);
        };
        inner.reserved.insert(id.clone());
        tracing::debug!(timer_id = %id, handle = %handle, "handle reserved");
        Ok(Reservation {
            pool: Arc::downgrade(self),
            timer_id: id,
            handle,
            claimed: false,
        })
    }

    /// Start a countdown on a reserved handle. On error the handle is
    /// returned to the pool.
    pub async fn create_reserved(
        &self,
        mut reservation: Reservation,
        request: TimerRequest,
    ) -> Result<ActiveTimer> {
        let (id, handle) = reservation.claim();
        if let Err(e) = self.check_duration(request.duration) {
            self.unreserve(&id, &handle);
            return Err(e);
        }
        self.lock().reserved.remove(&id);
        self.arm(id, handle, request).await
    }

    fn unreserve(&self, timer_id: &str, handle: &str) {
        let mut inner = self.lock();
        if inner.reserved.remove(timer_id) {
            inner.pool.release(handle, timer_id);
            tracing::debug!(timer_id, handle, "reservation released");
        }
    }

    async fn arm(&self, id: String, handle: String, request: TimerRequest) -> Result<ActiveTimer> {
        let Some(ends_at) = end_time(Utc::now(), request.duration) else {
            self.lock().pool.release(&handle, &id);
            return Err(TimekeeperError::InvalidDuration(format!(
                "{} does not fit on the calendar",
                format_duration(request.duration)
            )));
        };
        let escalates = request.kind == TimerKind::Alarm
            && request.escalation.as_ref().is_some_and(|c| c.enabled);
        let timer = ActiveTimer {
            escalation_state: escalates.then(|| EscalationState::new(&id)),
            id,
            handle,
            kind: request.kind,
            label: request.label,
            duration: request.duration,
            ends_at,
            paused_remaining: None,
            on_complete: request.on_complete,
            sequence: request.sequence,
            escalation: request.escalation,
            provenance: request.provenance,
        };
        self.lock().timers.insert(timer.id.clone(), timer.clone());

        if let Err(e) = self.backend.start(&timer.handle, timer.duration).await {
            tracing::warn!(timer_id = %timer.id, handle = %timer.handle, error = %e, "countdown start failed, rolling back");
            let mut inner = self.lock();
            inner.timers.remove(&timer.id);
            inner.pool.release(&timer.handle, &timer.id);
            return Err(match e {
                TimekeeperError::ExternalCall(msg) => TimekeeperError::ExternalCall(msg),
                other => TimekeeperError::ExternalCall(other.to_string()),
            });
        }

        tracing::info!(
            timer_id = %timer.id,
            handle = %timer.handle,
            kind = %timer.kind,
            secs = timer.duration.as_secs(),
            "timer started"
        );
        publish(
            &self.events,
            TimerEvent::TimerStarted {
                timer_id: timer.id.clone(),
                handle: timer.handle.clone(),
                kind: timer.kind,
                label: timer.label.clone(),
                duration: timer.duration,
            },
        );
        Ok(timer)
    }

    /// Cancel a timer. The record is gone before this returns; a finish that
    /// races the cancel is swallowed rather than dispatched.
    pub async fn cancel(&self, timer_id: &str) -> bool {
        let timer = {
            let mut inner = self.lock();
            let Some(timer) = inner.timers.remove(timer_id) else {
                return false;
            };
            // Local pause state can lag the backend, so always expect a
            // transition; a stale entry is cleared when the handle restarts.
            inner.suppressed.insert(timer.handle.clone());
            timer
        };

        let cancelled = self.backend.cancel(&timer.handle).await;
        let mut inner = self.lock();
        if let Err(e) = cancelled {
            tracing::warn!(timer_id = %timer.id, handle = %timer.handle, error = %e, "countdown cancel failed");
            // No transition is coming, so nothing to swallow.
            inner.suppressed.remove(&timer.handle);
        }
        inner.pool.release(&timer.handle, &timer.id);
        drop(inner);

        tracing::info!(timer_id = %timer.id, handle = %timer.handle, "timer cancelled");
        publish(
            &self.events,
            TimerEvent::TimerCancelled {
                timer_id: timer.id,
            },
        );
        true
    }

    pub async fn pause(&self, timer_id: &str) -> bool {
        let handle = match self.lock().timers.get(timer_id) {
            Some(t) if !t.is_paused() => t.handle.clone(),
            _ => return false,
        };
        if let Err(e) = self.backend.pause(&handle).await {
            tracing::warn!(timer_id, handle = %handle, error = %e, "countdown pause failed");
            return false;
        }
        let remaining = {
            let mut inner = self.lock();
            let Some(timer) = inner.timers.get_mut(timer_id) else {
                return false;
            };
            timer.pause_at(Utc::now());
            timer.remaining()
        };
        tracing::info!(timer_id, remaining_secs = remaining.as_secs(), "timer paused");
        publish(
            &self.events,
            TimerEvent::TimerPaused {
                timer_id: timer_id.to_string(),
                remaining,
            },
        );
        true
    }

    pub async fn resume(&self, timer_id: &str) -> bool {
        let handle = match self.lock().timers.get(timer_id) {
            Some(t) if t.is_paused() => t.handle.clone(),
            _ => return false,
        };
        if let Err(e) = self.backend.resume(&handle).await {
            tracing::warn!(timer_id, handle = %handle, error = %e, "countdown resume failed");
            return false;
        }
        {
            let mut inner = self.lock();
            let Some(timer) = inner.timers.get_mut(timer_id) else {
                return false;
            };
            timer.resume_at(Utc::now());
        }
        tracing::info!(timer_id, "timer resumed");
        publish(
            &self.events,
            TimerEvent::TimerResumed {
                timer_id: timer_id.to_string(),
            },
        );
        true
    }

    /// Add `extra` to a timer. `Ok(false)` if there is no such timer;
    /// `InvalidDuration` if the countdown would run past the pool's limit.
    pub async fn extend(&self, timer_id: &str, extra: Duration) -> Result<bool> {
        let Some((handle, remaining)) = self
            .lock()
            .timers
            .get(timer_id)
            .map(|t| (t.handle.clone(), t.remaining()))
        else {
            return Ok(false);
        };
        let total = remaining
            .checked_add(extra)
            .ok_or_else(|| TimekeeperError::InvalidDuration("extension overflows".to_string()))?;
        self.check_duration(total)?;
        if end_time(Utc::now(), total).is_none() {
            return Err(TimekeeperError::InvalidDuration(
                "extension does not fit on the calendar".to_string(),
            ));
        }

        if let Err(e) = self.backend.extend(&handle, extra).await {
            tracing::warn!(timer_id, handle = %handle, error = %e, "countdown extend failed");
            return Ok(false);
        }
        {
            let mut inner = self.lock();
            let Some(timer) = inner.timers.get_mut(timer_id) else {
                return Ok(false);
            };
            if !timer.extend_by(extra) {
                tracing::warn!(timer_id, "local end time could not be moved");
            }
        }
        tracing::info!(timer_id, extra_secs = extra.as_secs(), "timer extended");
        publish(
            &self.events,
            TimerEvent::TimerExtended {
                timer_id: timer_id.to_string(),
                by: extra,
            },
        );
        Ok(true)
    }

    pub fn get(&self, timer_id: &str) -> Option<ActiveTimer> {
        self.lock().timers.get(timer_id).cloned()
    }

    /// All live timers, soonest to finish first.
    pub fn list_active(&self) -> Vec<ActiveTimer> {
        let now = Utc::now();
        let mut timers: Vec<ActiveTimer> = self.lock().timers.values().cloned().collect();
        timers.sort_by_key(|t| (t.remaining_at(now), t.id.clone()));
        timers
    }

    /// Ids of timers whose label matches, ignoring case.
    pub fn find_by_label(&self, label: &str) -> Vec<String> {
        let label = label.trim().to_lowercase();
        self.lock()
            .timers
            .values()
            .filter(|t| t.label.as_deref().map(str::to_lowercase).as_deref() == Some(label.as_str()))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Ids of timers tagged with `sequence_id`.
    pub fn timers_for_sequence(&self, sequence_id: &str) -> Vec<String> {
        self.lock()
            .timers
            .values()
            .filter(|t| {
                t.sequence
                    .as_ref()
                    .is_some_and(|s| s.sequence_id == sequence_id)
            })
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn available_count(&self) -> usize {
        self.lock().pool.available_count()
    }

    pub fn snapshot(&self) -> TimerPool {
        self.lock().pool.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::simulated::SimulatedCountdowns;

    fn handles(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("timer.t{i}")).collect()
    }

    fn config(n: usize) -> PoolConfig {
        PoolConfig {
            handles: handles(n),
            max_timer_secs: 24 * 3600,
        }
    }

    async fn setup(n: usize) -> (Arc<PoolManager>, SimulatedCountdowns, mpsc::UnboundedReceiver<ActiveTimer>) {
        let sim = SimulatedCountdowns::new(handles(n));
        let (pool, rx) = PoolManager::new(Arc::new(sim.clone()), &config(n), events::channel());
        let pool = Arc::new(pool);
        pool.initialize().await;
        (pool, sim, rx)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn pool_table_invariants() {
        let mut pool = TimerPool::new(&handles(3));
        assert!(pool.is_consistent());
        let a = pool.allocate("tmr-a").unwrap();
        let b = pool.allocate("tmr-b").unwrap();
        assert!(pool.is_consistent());
        assert_ne!(a, b);
        assert!(!pool.release(&a, "tmr-b"), "release by the wrong owner");
        assert!(pool.release(&a, "tmr-a"));
        assert!(!pool.release(&a, "tmr-a"), "double release");
        assert!(pool.is_consistent());
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn duplicate_configured_handles_count_once() {
        let pool = TimerPool::new(&["timer.a".to_string(), "timer.a".to_string()]);
        assert_eq!(pool.capacity(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_until_exhausted() {
        let (pool, _sim, _rx) = setup(2).await;
        for _ in 0..2 {
            pool.create(TimerRequest::new(TimerKind::Alarm, secs(60)))
                .await
                .unwrap();
            assert!(pool.snapshot().is_consistent());
        }
        let err = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, TimekeeperError::PoolExhausted));
        assert_eq!(pool.list_active().len(), 2);
        assert!(pool.snapshot().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_rolls_back() {
        let (pool, sim, _rx) = setup(1).await;
        sim.fail_next_start();
        let err = pool
            .create(TimerRequest::new(TimerKind::DelayedAction, secs(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, TimekeeperError::ExternalCall(_)));
        assert_eq!(pool.available_count(), 1);
        assert!(pool.list_active().is_empty());
        assert!(pool.snapshot().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn finish_releases_handle_and_dispatches() {
        let (pool, _sim, mut rx) = setup(1).await;
        let timer = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(30)).label("tea"))
            .await
            .unwrap();

        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.id, timer.id);
        assert_eq!(finished.label.as_deref(), Some("tea"));
        assert!(pool.get(&timer.id).is_none());
        assert_eq!(pool.available_count(), 1);
        assert!(pool.snapshot().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_dispatches() {
        let (pool, _sim, mut rx) = setup(1).await;
        let timer = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(30)))
            .await
            .unwrap();
        assert!(pool.cancel(&timer.id).await);
        assert!(!pool.cancel(&timer.id).await);
        assert!(pool.get(&timer.id).is_none());
        assert_eq!(pool.available_count(), 1);

        // The handle is reused by a new timer; the old cancel must not finish it.
        let next = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(60)))
            .await
            .unwrap();
        tokio::time::sleep(secs(45)).await;
        assert!(rx.try_recv().is_err());
        assert!(pool.get(&next.id).is_some());

        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.id, next.id);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_remaining_and_blocks_finish() {
        let (pool, _sim, mut rx) = setup(1).await;
        let timer = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(60)))
            .await
            .unwrap();
        assert!(pool.pause(&timer.id).await);
        assert!(!pool.pause(&timer.id).await);
        let frozen = pool.get(&timer.id).unwrap().remaining();

        tokio::time::sleep(secs(600)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(pool.get(&timer.id).unwrap().remaining(), frozen);

        assert!(pool.resume(&timer.id).await);
        assert!(!pool.get(&timer.id).unwrap().is_paused());
        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.id, timer.id);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_delays_the_finish() {
        let (pool, _sim, mut rx) = setup(1).await;
        let timer = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(60)))
            .await
            .unwrap();
        assert!(pool.extend(&timer.id, secs(120)).await.unwrap());
        assert_eq!(pool.get(&timer.id).unwrap().duration, secs(180));

        tokio::time::sleep(secs(90)).await;
        assert!(rx.try_recv().is_err());
        assert!(rx.recv().await.is_some());
        assert!(!pool.extend("tmr-missing", secs(5)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_create_is_refused_without_taking_a_handle() {
        let (pool, _sim, _rx) = setup(1).await;
        let err = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(u64::MAX)))
            .await
            .unwrap_err();
        assert!(matches!(err, TimekeeperError::InvalidDuration(_)));
        let err = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(24 * 3600 + 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, TimekeeperError::InvalidDuration(_)));
        assert_eq!(pool.available_count(), 1);
        assert!(pool.snapshot().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_extend_leaves_the_timer_alone() {
        let (pool, _sim, mut rx) = setup(1).await;
        let timer = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(60)))
            .await
            .unwrap();
        let err = pool.extend(&timer.id, secs(u64::MAX)).await.unwrap_err();
        assert!(matches!(err, TimekeeperError::InvalidDuration(_)));
        let err = pool.extend(&timer.id, secs(24 * 3600)).await.unwrap_err();
        assert!(matches!(err, TimekeeperError::InvalidDuration(_)));

        let kept = pool.get(&timer.id).unwrap();
        assert_eq!(kept.duration, secs(60));
        assert_eq!(kept.ends_at, timer.ends_at);
        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.id, timer.id);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_suppression_does_not_swallow_the_next_finish() {
        let (pool, sim, mut rx) = setup(1).await;
        let first = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(60)))
            .await
            .unwrap();
        // The backend is paused before the local record knows it, so the
        // cancel below produces paused -> idle rather than a finish.
        sim.pause(&first.handle).await.unwrap();
        assert!(pool.cancel(&first.id).await);

        let next = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(30)))
            .await
            .unwrap();
        assert_eq!(next.handle, first.handle);
        let finished = tokio::time::timeout(secs(120), rx.recv())
            .await
            .expect("finish of the re-bound handle was swallowed")
            .unwrap();
        assert_eq!(finished.id, next.id);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_holds_a_handle_until_claimed_or_dropped() {
        let (pool, _sim, mut rx) = setup(1).await;
        let held = pool.reserve().unwrap();
        assert_eq!(pool.available_count(), 0);
        assert!(matches!(pool.reserve(), Err(TimekeeperError::PoolExhausted)));
        assert!(pool.snapshot().is_consistent());
        drop(held);
        assert_eq!(pool.available_count(), 1);

        let held = pool.reserve().unwrap();
        let timer = pool
            .create_reserved(held, TimerRequest::new(TimerKind::SequenceStep, secs(10)))
            .await
            .unwrap();
        assert_eq!(pool.available_count(), 0);
        assert_eq!(rx.recv().await.unwrap().id, timer.id);
        assert_eq!(pool.available_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_on_a_reservation_returns_the_handle() {
        let (pool, sim, _rx) = setup(1).await;
        let held = pool.reserve().unwrap();
        sim.fail_next_start();
        let err = pool
            .create_reserved(held, TimerRequest::new(TimerKind::SequenceStep, secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, TimekeeperError::ExternalCall(_)));
        assert_eq!(pool.available_count(), 1);
        assert!(pool.snapshot().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn armed_alarm_carries_escalation_state() {
        let (pool, _sim, _rx) = setup(2).await;
        let alarm = pool
            .create(
                TimerRequest::new(TimerKind::Alarm, secs(60)).escalation(EscalationConfig::default()),
            )
            .await
            .unwrap();
        let state = pool.get(&alarm.id).unwrap().escalation_state.unwrap();
        assert_eq!(state.timer_id, alarm.id);
        assert_eq!(state.stage, timekeeper_core::types::EscalationStage::NotStarted);

        let plain = pool
            .create(TimerRequest::new(TimerKind::DelayedAction, secs(60)))
            .await
            .unwrap();
        assert!(plain.escalation_state.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_retires_missing_and_cancels_leftovers() {
        let sim = SimulatedCountdowns::new(handles(3));
        sim.remove_handle("timer.t2");
        sim.preload_active("timer.t3", secs(300));

        let (pool, mut rx) = PoolManager::new(Arc::new(sim.clone()), &config(3), events::channel());
        let pool = Arc::new(pool);
        let report = pool.initialize().await;

        assert_eq!(report.missing, vec!["timer.t2"]);
        assert_eq!(report.reclaimed, vec!["timer.t3"]);
        assert_eq!(sim.state_of("timer.t3"), Some(CountdownState::Idle));

        let snap = pool.snapshot();
        assert_eq!(snap.capacity(), 2);
        assert!(snap.is_consistent());

        // The leftover's cancellation is not treated as a finish.
        tokio::time::sleep(secs(400)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn label_and_sequence_lookup() {
        let (pool, _sim, _rx) = setup(3).await;
        let pizza = pool
            .create(TimerRequest::new(TimerKind::Alarm, secs(60)).label("Pizza"))
            .await
            .unwrap();
        let step = pool
            .create(TimerRequest::new(TimerKind::SequenceStep, secs(60)).sequence("seq-1", 1))
            .await
            .unwrap();

        assert_eq!(pool.find_by_label("pizza"), vec![pizza.id]);
        assert_eq!(pool.timers_for_sequence("seq-1"), vec![step.id]);
        assert!(pool.timers_for_sequence("seq-2").is_empty());
    }
}
