//! Alarm escalation: room, then common areas, then phones.
//!
//! Each run is its own task. Between tiers it races the acknowledgment
//! signal against the tier's delay; an acknowledgment from any source ends
//! the run wherever it is. The registry entry is removed by a drop guard, so
//! a run that returns early or panics still releases its waiter.

use crate::events::{publish, EventSender, TimerEvent};
use crate::notify::NotificationChannel;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use timekeeper_core::config::EscalationConfig;
use timekeeper_core::types::{
    Action, ActiveTimer, EscalationResolution, EscalationStage, EscalationState, Priority,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const STAGES: [EscalationStage; 3] = [
    EscalationStage::Room,
    EscalationStage::CommonAreas,
    EscalationStage::Phones,
];

/// Acknowledgment payload: who (or what) silenced the alarm.
type Ack = Option<Option<String>>;

struct Run {
    state: EscalationState,
    label: Option<String>,
    ack: watch::Sender<Ack>,
}

type Registry = Arc<Mutex<HashMap<String, Run>>>;

fn lock(runs: &Registry) -> MutexGuard<'_, HashMap<String, Run>> {
    runs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of one live run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationInfo {
    #[serde(flatten)]
    pub state: EscalationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

pub struct EscalationEngine {
    notifier: Arc<dyn NotificationChannel>,
    runs: Registry,
    events: EventSender,
}

impl EscalationEngine {
    pub fn new(notifier: Arc<dyn NotificationChannel>, events: EventSender) -> Self {
        Self {
            notifier,
            runs: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Launch a run for a finished alarm. `None` if one is already running
    /// for this timer.
    pub fn start(
        &self,
        timer: &ActiveTimer,
        config: &EscalationConfig,
    ) -> Option<JoinHandle<EscalationResolution>> {
        let (tx, rx) = watch::channel(None);
        {
            let mut runs = lock(&self.runs);
            if runs.contains_key(&timer.id) {
                tracing::warn!(timer_id = %timer.id, "escalation already running");
                return None;
            }
            runs.insert(
                timer.id.clone(),
                Run {
                    state: timer
                        .escalation_state
                        .clone()
                        .unwrap_or_else(|| EscalationState::new(&timer.id)),
                    label: timer.label.clone(),
                    ack: tx,
                },
            );
        }

        let ctx = RunContext {
            timer_id: timer.id.clone(),
            message: alarm_message(timer),
            title: match &timer.label {
                Some(l) => format!("{} timer", capitalize(l)),
                None => "Timer".to_string(),
            },
            origin: timer.provenance.room.clone(),
            config: config.clone(),
            notifier: Arc::clone(&self.notifier),
            runs: Arc::clone(&self.runs),
            events: self.events.clone(),
        };
        Some(tokio::spawn(ctx.run(rx)))
    }

    /// Silence one alarm. Idempotent: acknowledging a run that has already
    /// completed but not yet cleaned up still returns true.
    pub fn acknowledge(&self, timer_id: &str, source: Option<&str>) -> bool {
        let mut runs = lock(&self.runs);
        let Some(run) = runs.get_mut(timer_id) else {
            return false;
        };
        if run.state.acknowledge(source.map(str::to_string)) {
            tracing::info!(timer_id, by = source.unwrap_or("unknown"), "alarm acknowledged");
            publish(
                &self.events,
                TimerEvent::EscalationAcknowledged {
                    timer_id: timer_id.to_string(),
                    by: source.map(str::to_string),
                },
            );
        }
        run.ack.send_replace(Some(source.map(str::to_string)));
        true
    }

    pub fn acknowledge_all(&self, source: Option<&str>) -> usize {
        let ids: Vec<String> = lock(&self.runs)
            .iter()
            .filter(|(_, r)| !r.state.is_completed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter(|id| self.acknowledge(id, source))
            .count()
    }

    /// Runs still escalating, oldest first.
    pub fn list_active(&self) -> Vec<EscalationInfo> {
        let mut out: Vec<EscalationInfo> = lock(&self.runs)
            .values()
            .filter(|r| !r.state.is_completed())
            .map(|r| EscalationInfo {
                state: r.state.clone(),
                label: r.label.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.state.stage_started_at.cmp(&b.state.stage_started_at));
        out
    }

    pub fn get(&self, timer_id: &str) -> Option<EscalationState> {
        lock(&self.runs).get(timer_id).map(|r| r.state.clone())
    }

    /// Timer ids of live runs whose label matches, ignoring case.
    pub fn find_by_label(&self, label: &str) -> Vec<String> {
        let label = label.trim().to_lowercase();
        lock(&self.runs)
            .iter()
            .filter(|(_, r)| !r.state.is_completed())
            .filter(|(_, r)| r.label.as_deref().is_some_and(|l| l.to_lowercase() == label))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn alarm_message(timer: &ActiveTimer) -> String {
    match &timer.on_complete {
        Some(Action::Announce { message, .. }) => message.clone(),
        _ => format!("Your {} is done", timer.display_name()),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

struct RunContext {
    timer_id: String,
    message: String,
    title: String,
    origin: Option<String>,
    config: EscalationConfig,
    notifier: Arc<dyn NotificationChannel>,
    runs: Registry,
    events: EventSender,
}

/// Removes the registry entry however the run ends.
struct RunGuard {
    runs: Registry,
    timer_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let removed = lock(&self.runs).remove(&self.timer_id);
        if let Some(run) = removed.filter(|r| !r.state.is_completed()) {
            tracing::error!(timer_id = %self.timer_id, stage = %run.state.stage, "escalation run ended without resolution");
        }
    }
}

enum Wait {
    Acknowledged(Option<String>),
    Elapsed,
}

impl RunContext {
    async fn run(self, mut ack: watch::Receiver<Ack>) -> EscalationResolution {
        let _guard = RunGuard {
            runs: Arc::clone(&self.runs),
            timer_id: self.timer_id.clone(),
        };

        for stage in STAGES {
            if !self.enter(stage) {
                return self.resolution();
            }
            self.notify_stage(stage, &ack).await;

            let Some(tier) = stage.tier() else {
                continue;
            };
            let mut wait = self.config.stage_delay(tier);
            if stage == EscalationStage::Phones {
                wait = wait.min(self.config.max_duration());
            }
            match wait_for_ack(&mut ack, wait).await {
                Wait::Acknowledged(by) => {
                    tracing::debug!(timer_id = %self.timer_id, stage = %stage, by = by.as_deref().unwrap_or("unknown"), "escalation stopped");
                    return self.resolution();
                }
                Wait::Elapsed => {}
            }
        }

        let timed_out = {
            let mut runs = lock(&self.runs);
            match runs.get_mut(&self.timer_id) {
                Some(run) if !run.state.is_completed() => {
                    run.state.time_out();
                    true
                }
                _ => false,
            }
        };
        if timed_out {
            tracing::warn!(timer_id = %self.timer_id, "alarm never acknowledged");
            publish(
                &self.events,
                TimerEvent::EscalationTimedOut {
                    timer_id: self.timer_id.clone(),
                },
            );
        }
        self.resolution()
    }

    /// Move the run to `stage`. False once it has been acknowledged.
    fn enter(&self, stage: EscalationStage) -> bool {
        {
            let mut runs = lock(&self.runs);
            let Some(run) = runs.get_mut(&self.timer_id) else {
                return false;
            };
            if !run.state.advance_to(stage) {
                return false;
            }
        }
        tracing::info!(timer_id = %self.timer_id, stage = %stage, "escalation stage");
        publish(
            &self.events,
            TimerEvent::EscalationStage {
                timer_id: self.timer_id.clone(),
                stage,
            },
        );
        true
    }

    fn resolution(&self) -> EscalationResolution {
        lock(&self.runs)
            .get(&self.timer_id)
            .map(|r| r.state.resolution.clone())
            .unwrap_or(EscalationResolution::Pending)
    }

    async fn notify_stage(&self, stage: EscalationStage, ack: &watch::Receiver<Ack>) {
        let cfg = &self.config;
        let origin = self.origin.as_deref();
        match stage {
            EscalationStage::Room | EscalationStage::CommonAreas => {
                let rooms = if stage == EscalationStage::Room {
                    cfg.resolved_room_targets(origin)
                } else {
                    cfg.resolved_common_area_targets(origin)
                };
                if rooms.is_empty() {
                    tracing::warn!(timer_id = %self.timer_id, stage = %stage, "no rooms to announce in");
                }
                for room in &rooms {
                    if acknowledged(ack) {
                        return;
                    }
                    if let Err(e) = self.notifier.play_chime(&cfg.chime_sound, Some(room)).await {
                        tracing::warn!(timer_id = %self.timer_id, room = %room, error = %e, "chime failed");
                    }
                    if acknowledged(ack) {
                        return;
                    }
                    if let Err(e) = self
                        .notifier
                        .announce(&self.message, Some(room), cfg.announce_repeat.max(1))
                        .await
                    {
                        tracing::warn!(timer_id = %self.timer_id, room = %room, error = %e, "announce failed");
                    }
                }
            }
            EscalationStage::Phones => {
                for target in &cfg.phone_targets {
                    if acknowledged(ack) {
                        return;
                    }
                    if let Err(e) = self
                        .notifier
                        .send_push(Some(target), &self.title, &self.message, Priority::Critical)
                        .await
                    {
                        tracing::warn!(timer_id = %self.timer_id, recipient = %target, error = %e, "push failed");
                    }
                }
            }
            EscalationStage::NotStarted | EscalationStage::Completed => {}
        }
    }
}

fn acknowledged(ack: &watch::Receiver<Ack>) -> bool {
    ack.borrow().is_some()
}

async fn wait_for_ack(ack: &mut watch::Receiver<Ack>, timeout: Duration) -> Wait {
    let outcome = tokio::time::timeout(timeout, ack.wait_for(Option::is_some))
        .await
        .map(|r| r.map(|v| (*v).clone().flatten()));
    match outcome {
        Ok(Ok(by)) => Wait::Acknowledged(by),
        // Sender gone: the registry entry was removed out from under us.
        Ok(Err(_)) => Wait::Acknowledged(None),
        Err(_) => Wait::Elapsed,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
