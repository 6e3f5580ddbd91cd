use serde::Serialize;
use std::time::Duration;
use timekeeper_core::types::{duration_secs, EscalationStage, TimerKind};
use tokio::sync::broadcast;

/// Lifecycle notifications published by the pool, the executor and the
/// escalation engine. Receivers that fall behind lose the oldest events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerEvent {
    TimerStarted {
        timer_id: String,
        handle: String,
        kind: TimerKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(with = "duration_secs")]
        duration: Duration,
    },
    TimerFinished {
        timer_id: String,
        kind: TimerKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    TimerCancelled {
        timer_id: String,
    },
    TimerPaused {
        timer_id: String,
        #[serde(with = "duration_secs")]
        remaining: Duration,
    },
    TimerResumed {
        timer_id: String,
    },
    TimerExtended {
        timer_id: String,
        #[serde(with = "duration_secs")]
        by: Duration,
    },
    SequenceStarted {
        sequence_id: String,
        steps: usize,
    },
    StepExecuted {
        sequence_id: String,
        step: usize,
        action: String,
    },
    SequenceCompleted {
        sequence_id: String,
    },
    SequenceCancelled {
        sequence_id: String,
        reason: String,
    },
    EscalationStage {
        timer_id: String,
        stage: EscalationStage,
    },
    EscalationAcknowledged {
        timer_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        by: Option<String>,
    },
    EscalationTimedOut {
        timer_id: String,
    },
}

impl TimerEvent {
    /// The serialized `type` tag, used as the SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            TimerEvent::TimerStarted { .. } => "timer_started",
            TimerEvent::TimerFinished { .. } => "timer_finished",
            TimerEvent::TimerCancelled { .. } => "timer_cancelled",
            TimerEvent::TimerPaused { .. } => "timer_paused",
            TimerEvent::TimerResumed { .. } => "timer_resumed",
            TimerEvent::TimerExtended { .. } => "timer_extended",
            TimerEvent::SequenceStarted { .. } => "sequence_started",
            TimerEvent::StepExecuted { .. } => "step_executed",
            TimerEvent::SequenceCompleted { .. } => "sequence_completed",
            TimerEvent::SequenceCancelled { .. } => "sequence_cancelled",
            TimerEvent::EscalationStage { .. } => "escalation_stage",
            TimerEvent::EscalationAcknowledged { .. } => "escalation_acknowledged",
            TimerEvent::EscalationTimedOut { .. } => "escalation_timed_out",
        }
    }
}

pub type EventSender = broadcast::Sender<TimerEvent>;

pub const EVENT_CAPACITY: usize = 256;

pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CAPACITY).0
}

/// Publish without caring whether anyone is listening.
pub(crate) fn publish(tx: &EventSender, event: TimerEvent) {
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = TimerEvent::TimerStarted {
            timer_id: "tmr-1".into(),
            handle: "timer.a".into(),
            kind: TimerKind::Alarm,
            label: Some("pizza".into()),
            duration: Duration::from_secs(900),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "timer_started");
        assert_eq!(json["duration"], 900);
        assert_eq!(json["label"], "pizza");

        let ev = TimerEvent::EscalationStage {
            timer_id: "tmr-1".into(),
            stage: EscalationStage::CommonAreas,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["stage"], "common_areas");
    }

    #[test]
    fn name_matches_type_tag() {
        let events = [
            TimerEvent::TimerCancelled {
                timer_id: "tmr-1".into(),
            },
            TimerEvent::SequenceCancelled {
                sequence_id: "seq-1".into(),
                reason: "cancelled".into(),
            },
            TimerEvent::EscalationTimedOut {
                timer_id: "tmr-1".into(),
            },
        ];
        for ev in events {
            let json = serde_json::to_value(&ev).unwrap();
            assert_eq!(json["type"], ev.name());
        }
    }
}
