use crate::config::EscalationConfig;
use crate::error::TimekeeperError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Short random id with a readable prefix, e.g. `tmr-3f9a1c2e`.
pub fn new_id(prefix: &str) -> String {
    let raw = Uuid::new_v4().simple().to_string();
    let short: String = raw.chars().take(8).collect();
    format!("{prefix}-{short}")
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Push priority. `Critical` must bypass silent / do-not-disturb on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = TimekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(TimekeeperError::InvalidConfig(format!(
                "unknown priority '{s}': must be low, normal, high, or critical"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// Where a service call lands: a resolved area, or a concrete entity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ServiceTarget {
    Area(String),
    Entity(String),
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceTarget::Area(id) => write!(f, "area {id}"),
            ServiceTarget::Entity(id) => f.write_str(id),
        }
    }
}

/// The side effect a step performs once its delay has elapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// External service call, e.g. `light.turn_off` on the porch.
    CallService {
        domain: String,
        service: String,
        target: ServiceTarget,
    },
    /// Spoken announcement. `room: None` means the originating room.
    Announce {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },
    Notify {
        title: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        priority: Priority,
    },
    Chime {
        sound: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },
}

impl Action {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Action::CallService { .. } => "call_service",
            Action::Announce { .. } => "announce",
            Action::Notify { .. } => "notify",
            Action::Chime { .. } => "chime",
        }
    }

    /// Short human description used in responses and logs.
    pub fn describe(&self) -> String {
        match self {
            Action::CallService {
                service, target, ..
            } => format!("{} {}", service.replace('_', " "), target),
            Action::Announce { message, .. } => format!("announce \"{message}\""),
            Action::Notify { message, .. } => format!("notify \"{message}\""),
            Action::Chime { sound, .. } => format!("play {sound} chime"),
        }
    }
    /// The service call that undoes this one, when there is an obvious
    /// opposite. Announcements and pushes cannot be taken back.
    pub fn inverse(&self) -> Option<Action> {
        let Action::CallService {
            domain,
            service,
            target,
        } = self
        else {
            return None;
        };
        let opposite = match service.as_str() {
            "turn_on" => "turn_off",
            "turn_off" => "turn_on",
            "open_cover" => "close_cover",
            "close_cover" => "open_cover",
            "lock" => "unlock",
            "unlock" => "lock",
            _ => return None,
        };
        Some(Action::CallService {
            domain: domain.clone(),
            service: opposite.to_string(),
            target: target.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// TimedAction
// ---------------------------------------------------------------------------

/// One step: wait `delay` after the previous step, then perform `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedAction {
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    pub action: Action,
}

impl TimedAction {
    pub fn new(delay: Duration, action: Action) -> Self {
        Self { delay, action }
    }

    pub fn immediate(action: Action) -> Self {
        Self::new(Duration::ZERO, action)
    }

    pub fn is_immediate(&self) -> bool {
        self.delay.is_zero()
    }
}

// ---------------------------------------------------------------------------
// ActionSequence
// ---------------------------------------------------------------------------

/// Which parser stage produced a sequence. Drives how the entry point runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceShape {
    Alarm,
    DeviceDuration,
    MultiStep,
    DelayedAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Provenance {
    pub fn new(speaker: Option<&str>, room: Option<&str>) -> Self {
        Self {
            speaker: speaker.map(str::to_string),
            room: room.map(str::to_string),
            created_at: Utc::now(),
        }
    }
}

/// An ordered plan of timed actions with a progress cursor.
///
/// The cursor only moves forward and never passes `actions.len()`; the
/// sequence is complete exactly when the two are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSequence {
    pub id: String,
    pub actions: Vec<TimedAction>,
    cursor: usize,
    pub shape: SequenceShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub provenance: Provenance,
}

impl ActionSequence {
    pub fn new(actions: Vec<TimedAction>, shape: SequenceShape, provenance: Provenance) -> Self {
        Self {
            id: new_id("seq"),
            actions,
            cursor: 0,
            shape,
            label: None,
            provenance,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn current(&self) -> Option<&TimedAction> {
        self.actions.get(self.cursor)
    }

    /// Move past the current step. Returns false if already complete.
    pub fn advance(&mut self) -> bool {
        if self.cursor < self.actions.len() {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cursor == self.actions.len()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.actions.iter().map(|a| a.delay).collect()
    }

    /// Sum of all step delays.
    pub fn total_delay(&self) -> Duration {
        self.actions.iter().map(|a| a.delay).sum()
    }

    pub fn needs_timer(&self) -> bool {
        self.actions[self.cursor..].iter().any(|a| !a.is_immediate())
    }
}

// ---------------------------------------------------------------------------
// ActiveTimer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Alarm,
    DeviceDuration,
    DelayedAction,
    SequenceStep,
}

impl TimerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TimerKind::Alarm => "alarm",
            TimerKind::DeviceDuration => "device_duration",
            TimerKind::DelayedAction => "delayed_action",
            TimerKind::SequenceStep => "sequence_step",
        }
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Back-link from a pooled timer to the sequence step it is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRef {
    pub sequence_id: String,
    pub step: usize,
}

/// The orchestrator's record of one in-flight countdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTimer {
    pub id: String,
    /// External countdown handle this timer is bound to.
    pub handle: String,
    pub kind: TimerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub ends_at: DateTime<Utc>,
    /// Set while paused: the frozen remaining time.
    #[serde(default, with = "duration_secs_opt", skip_serializing_if = "Option::is_none")]
    pub paused_remaining: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceRef>,
    /// Present on alarm timers that escalate when they finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationConfig>,
    /// Escalation progress, `not_started` until the alarm goes off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_state: Option<EscalationState>,
    pub provenance: Provenance,
}

impl ActiveTimer {
    pub fn is_paused(&self) -> bool {
        self.paused_remaining.is_some()
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        if let Some(frozen) = self.paused_remaining {
            return frozen;
        }
        (self.ends_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn remaining(&self) -> Duration {
        self.remaining_at(Utc::now())
    }

    /// Freeze the end time. Returns false if already paused.
    pub fn pause_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_paused() {
            return false;
        }
        self.paused_remaining = Some(self.remaining_at(now));
        true
    }

    /// Unfreeze, re-deriving the end time from the frozen remainder.
    pub fn resume_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.paused_remaining.take() {
            Some(frozen) => {
                if let Some(end) = end_time(now, frozen) {
                    self.ends_at = end;
                }
                true
            }
            None => false,
        }
    }

    /// Push the finish out by `extra`. Leaves the timer untouched and
    /// returns false if the new end does not fit.
    pub fn extend_by(&mut self, extra: Duration) -> bool {
        let Some(duration) = self.duration.checked_add(extra) else {
            return false;
        };
        match self.paused_remaining {
            Some(frozen) => match frozen.checked_add(extra) {
                Some(frozen) => self.paused_remaining = Some(frozen),
                None => return false,
            },
            None => match end_time(self.ends_at, extra) {
                Some(end) => self.ends_at = end,
                None => return false,
            },
        }
        self.duration = duration;
        true
    }

    /// Name used in user-facing text: the label if set, otherwise the kind.
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => format!("{label} timer"),
            None => match self.kind {
                TimerKind::Alarm => "timer".to_string(),
                TimerKind::DeviceDuration => "device timer".to_string(),
                TimerKind::DelayedAction => "delayed action".to_string(),
                TimerKind::SequenceStep => "sequence step".to_string(),
            },
        }
    }
}

/// `start + d`, or `None` when that is past what `DateTime` can hold.
pub fn end_time(start: DateTime<Utc>, d: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
}

// ---------------------------------------------------------------------------
// EscalationState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStage {
    NotStarted,
    Room,
    CommonAreas,
    Phones,
    Completed,
}

impl EscalationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationStage::NotStarted => "not_started",
            EscalationStage::Room => "room",
            EscalationStage::CommonAreas => "common_areas",
            EscalationStage::Phones => "phones",
            EscalationStage::Completed => "completed",
        }
    }

    /// Zero-based index into the per-stage delay table, for the three active tiers.
    pub fn tier(self) -> Option<usize> {
        match self {
            EscalationStage::Room => Some(0),
            EscalationStage::CommonAreas => Some(1),
            EscalationStage::Phones => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for EscalationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationResolution {
    Pending,
    Acknowledged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<String>,
    },
    TimedOut,
}

/// Per-alarm escalation progress.
///
/// The stage only moves forward; acknowledgment jumps straight to
/// `Completed` from wherever the run is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationState {
    pub timer_id: String,
    pub stage: EscalationStage,
    pub stage_started_at: DateTime<Utc>,
    pub resolution: EscalationResolution,
}

impl EscalationState {
    pub fn new(timer_id: impl Into<String>) -> Self {
        Self {
            timer_id: timer_id.into(),
            stage: EscalationStage::NotStarted,
            stage_started_at: Utc::now(),
            resolution: EscalationResolution::Pending,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.stage == EscalationStage::Completed
    }

    /// Enter `next` if it lies ahead of the current stage.
    pub fn advance_to(&mut self, next: EscalationStage) -> bool {
        if next <= self.stage || self.is_completed() {
            return false;
        }
        self.stage = next;
        self.stage_started_at = Utc::now();
        true
    }

    /// Returns false if the run had already completed.
    pub fn acknowledge(&mut self, by: Option<String>) -> bool {
        if self.is_completed() {
            return false;
        }
        self.stage = EscalationStage::Completed;
        self.stage_started_at = Utc::now();
        self.resolution = EscalationResolution::Acknowledged { by };
        true
    }

    pub fn time_out(&mut self) {
        if self.is_completed() {
            return;
        }
        self.stage = EscalationStage::Completed;
        self.stage_started_at = Utc::now();
        self.resolution = EscalationResolution::TimedOut;
    }
}

// ---------------------------------------------------------------------------
// Serde helpers for Duration (serialized as whole seconds)
// ---------------------------------------------------------------------------

pub mod duration_secs {
    use super::*;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

pub mod duration_secs_opt {
    use super::*;

    pub fn serialize<S>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match d {
            Some(dur) => s.serialize_some(&dur.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<u64> = Option::deserialize(d)?;
        Ok(opt.map(Duration::from_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
