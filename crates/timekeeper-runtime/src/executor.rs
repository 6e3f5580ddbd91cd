//! Sequence executor: runs an [`ActionSequence`] one step at a time.
//!
//! Immediate steps run inline. A delayed step borrows a pooled timer tagged
//! with the sequence id and step index, and the sequence goes dormant until
//! that timer's finish comes back through the dispatcher. Step N+1 is never
//! requested before step N's action has been invoked.
//!
//! A plan's first countdown handle is reserved before anything runs. If the
//! countdown still fails to start, the immediate steps that led up to it are
//! backed out where they have an inverse.

use crate::actions::ActionRunner;
use crate::events::{publish, EventSender, TimerEvent};
use crate::pool::{PoolManager, Reservation, TimerRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use timekeeper_core::types::{
    Action, ActionSequence, ActiveTimer, Provenance, SequenceShape, TimedAction, TimerKind,
};
use timekeeper_core::{Result, TimekeeperError};

/// Where a sequence stands after a call into the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Progress {
    /// Dormant until `timer_id` finishes.
    Waiting { timer_id: String, step: usize },
    Completed,
    /// Cancelled while the call was in flight.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SequenceInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub shape: SequenceShape,
    pub step: usize,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer_id: Option<String>,
    pub provenance: Provenance,
}

struct Run {
    sequence: ActionSequence,
    timer_id: Option<String>,
}

pub struct SequenceExecutor {
    pool: Arc<PoolManager>,
    actions: ActionRunner,
    runs: Mutex<HashMap<String, Run>>,
    events: EventSender,
}

impl SequenceExecutor {
    pub fn new(pool: Arc<PoolManager>, actions: ActionRunner, events: EventSender) -> Self {
        Self {
            pool,
            actions,
            runs: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Run>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register and start a sequence.
    ///
    /// Rejected with `PoolExhausted` when its first delayed step cannot get a
    /// handle, before any step runs. A countdown that then fails to start
    /// surfaces as `ExternalCall` with the leading steps backed out.
    pub async fn execute(&self, sequence: ActionSequence) -> Result<Progress> {
        if sequence.is_complete() {
            return Ok(Progress::Completed);
        }
        let reservation = if sequence.needs_timer() {
            match self.pool.reserve() {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::info!(sequence_id = %sequence.id, error = %e, "sequence rejected");
                    return Err(e);
                }
            }
        } else {
            None
        };

        let id = sequence.id.clone();
        let steps = sequence.len();
        self.lock().insert(
            id.clone(),
            Run {
                sequence,
                timer_id: None,
            },
        );
        tracing::info!(sequence_id = %id, steps, "sequence started");
        publish(
            &self.events,
            TimerEvent::SequenceStarted {
                sequence_id: id.clone(),
                steps,
            },
        );
        self.advance(&id, reservation).await
    }

    /// Called by the dispatcher when a step timer finishes.
    pub async fn on_step_finished(&self, timer: ActiveTimer) -> Result<Progress> {
        let Some(seq_ref) = timer.sequence.as_ref() else {
            return Err(TimekeeperError::Invariant(format!(
                "timer {} has no sequence link",
                timer.id
            )));
        };
        let sequence_id = seq_ref.sequence_id.as_str();

        let (step, provenance) = {
            let mut runs = self.lock();
            let Some(run) = runs.get_mut(sequence_id) else {
                tracing::debug!(sequence_id, timer_id = %timer.id, "finish for a sequence that is gone");
                return Ok(Progress::Cancelled);
            };
            if run.sequence.cursor() != seq_ref.step || run.timer_id.as_deref() != Some(timer.id.as_str()) {
                tracing::error!(
                    sequence_id,
                    timer_id = %timer.id,
                    step = seq_ref.step,
                    cursor = run.sequence.cursor(),
                    "step timer does not match the sequence cursor"
                );
                return Err(TimekeeperError::Invariant(format!(
                    "sequence {sequence_id} is at step {} but timer {} is for step {}",
                    run.sequence.cursor(),
                    timer.id,
                    seq_ref.step
                )));
            }
            run.timer_id = None;
            let Some(step) = run.sequence.current().cloned() else {
                return Err(TimekeeperError::Invariant(format!(
                    "sequence {sequence_id} has no step {}",
                    seq_ref.step
                )));
            };
            (step, run.sequence.provenance.clone())
        };

        self.run_step(sequence_id, seq_ref.step, &step, &provenance)
            .await;
        if !self.step_done(sequence_id) {
            return Ok(Progress::Cancelled);
        }
        self.advance(sequence_id, None).await
    }

    /// Run immediate steps until the sequence completes or reaches a delayed
    /// step, for which a pooled timer is requested (on `reservation` if one
    /// is held).
    async fn advance(
        &self,
        sequence_id: &str,
        mut reservation: Option<Reservation>,
    ) -> Result<Progress> {
        let mut applied: Vec<Action> = Vec::new();
        loop {
            let (cursor, step, provenance, kind, label) = {
                let mut runs = self.lock();
                let Some(run) = runs.get(sequence_id) else {
                    return Ok(Progress::Cancelled);
                };
                let cursor = run.sequence.cursor();
                let kind = match run.sequence.shape {
                    SequenceShape::DeviceDuration => TimerKind::DeviceDuration,
                    _ => TimerKind::SequenceStep,
                };
                match run.sequence.current().cloned() {
                    Some(step) => (
                        cursor,
                        step,
                        run.sequence.provenance.clone(),
                        kind,
                        run.sequence.label.clone(),
                    ),
                    None => {
                        runs.remove(sequence_id);
                        drop(runs);
                        tracing::info!(sequence_id, "sequence completed");
                        publish(
                            &self.events,
                            TimerEvent::SequenceCompleted {
                                sequence_id: sequence_id.to_string(),
                            },
                        );
                        return Ok(Progress::Completed);
                    }
                }
            };

            if step.is_immediate() {
                self.run_step(sequence_id, cursor, &step, &provenance).await;
                if !self.step_done(sequence_id) {
                    return Ok(Progress::Cancelled);
                }
                applied.push(step.action);
                continue;
            }

            let mut request = TimerRequest::new(kind, step.delay)
                .on_complete(step.action.clone())
                .sequence(sequence_id, cursor)
                .provenance(provenance.clone());
            if let Some(label) = label {
                request = request.label(label);
            }
            let created = match reservation.take() {
                Some(held) => self.pool.create_reserved(held, request).await,
                None => self.pool.create(request).await,
            };
            let timer = match created {
                Ok(timer) => timer,
                Err(e) => {
                    self.lock().remove(sequence_id);
                    tracing::warn!(sequence_id, step = cursor, error = %e, "sequence aborted: no countdown for step");
                    self.back_out(sequence_id, &applied, &provenance).await;
                    publish(
                        &self.events,
                        TimerEvent::SequenceCancelled {
                            sequence_id: sequence_id.to_string(),
                            reason: e.to_string(),
                        },
                    );
                    return Err(e);
                }
            };

            let still_running = match self.lock().get_mut(sequence_id) {
                Some(run) => {
                    run.timer_id = Some(timer.id.clone());
                    true
                }
                None => false,
            };
            if !still_running {
                // Cancelled while the countdown was being started.
                self.pool.cancel(&timer.id).await;
                return Ok(Progress::Cancelled);
            }
            tracing::debug!(sequence_id, step = cursor, timer_id = %timer.id, "waiting on step timer");
            return Ok(Progress::Waiting {
                timer_id: timer.id,
                step: cursor,
            });
        }
    }

    /// Undo, newest first, the immediate steps run on the way to a countdown
    /// that never started.
    async fn back_out(&self, sequence_id: &str, applied: &[Action], provenance: &Provenance) {
        for action in applied.iter().rev() {
            let Some(undo) = action.inverse() else {
                continue;
            };
            tracing::info!(sequence_id, action = %undo.describe(), "backing out step");
            self.actions.perform_logged(&undo, provenance).await;
        }
    }

    async fn run_step(
        &self,
        sequence_id: &str,
        cursor: usize,
        step: &TimedAction,
        provenance: &Provenance,
    ) {
        tracing::info!(sequence_id, step = cursor, action = step.action.kind_str(), "running step");
        self.actions.perform_logged(&step.action, provenance).await;
        publish(
            &self.events,
            TimerEvent::StepExecuted {
                sequence_id: sequence_id.to_string(),
                step: cursor,
                action: step.action.describe(),
            },
        );
    }

    /// Move the cursor past the step just run. False if the sequence was
    /// cancelled meanwhile.
    fn step_done(&self, sequence_id: &str) -> bool {
        match self.lock().get_mut(sequence_id) {
            Some(run) => {
                run.sequence.advance();
                true
            }
            None => false,
        }
    }

    /// Cancel a sequence and every pooled timer tagged with it. Steps already
    /// run are not undone.
    pub async fn cancel(&self, sequence_id: &str) -> bool {
        if self.lock().remove(sequence_id).is_none() {
            return false;
        }
        for timer_id in self.pool.timers_for_sequence(sequence_id) {
            self.pool.cancel(&timer_id).await;
        }
        tracing::info!(sequence_id, "sequence cancelled");
        publish(
            &self.events,
            TimerEvent::SequenceCancelled {
                sequence_id: sequence_id.to_string(),
                reason: "cancelled".to_string(),
            },
        );
        true
    }

    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        let mut count = 0;
        for id in ids {
            if self.cancel(&id).await {
                count += 1;
            }
        }
        count
    }

    pub fn get(&self, sequence_id: &str) -> Option<SequenceInfo> {
        self.lock().get(sequence_id).map(|r| info(sequence_id, r))
    }

    pub fn list_active(&self) -> Vec<SequenceInfo> {
        let mut out: Vec<SequenceInfo> = self
            .lock()
            .iter()
            .map(|(id, r)| info(id, r))
            .collect();
        out.sort_by(|a, b| a.provenance.created_at.cmp(&b.provenance.created_at));
        out
    }

    /// Ids of live sequences whose label matches, ignoring case.
    pub fn find_by_label(&self, label: &str) -> Vec<String> {
        let label = label.trim().to_lowercase();
        self.lock()
            .iter()
            .filter(|(_, r)| {
                r.sequence
                    .label
                    .as_deref()
                    .is_some_and(|l| l.to_lowercase() == label)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn info(id: &str, run: &Run) -> SequenceInfo {
    SequenceInfo {
        id: id.to_string(),
        label: run.sequence.label.clone(),
        shape: run.sequence.shape,
        step: run.sequence.cursor(),
        steps: run.sequence.len(),
        timer_id: run.timer_id.clone(),
        provenance: run.sequence.provenance.clone(),
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
    use crate::testing::{Delivery, RecordingChannel};
    use std::time::Duration;
    use timekeeper_core::config::PoolConfig;
    use timekeeper_core::types::{Priority, ServiceTarget};
    use tokio::sync::mpsc;

    fn mins(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    fn say(msg: &str) -> Action {
        Action::Announce {
            message: msg.to_string(),
            room: Some("kitchen".to_string()),
        }
    }

    struct Fixture {
        exec: Arc<SequenceExecutor>,
        pool: Arc<PoolManager>,
        sim: SimulatedCountdowns,
        rec: RecordingChannel,
        finished: mpsc::UnboundedReceiver<ActiveTimer>,
    }

    async fn fixture(handles: usize) -> Fixture {
        let names: Vec<String> = (1..=handles).map(|i| format!("timer.t{i}")).collect();
        let sim = SimulatedCountdowns::new(names.clone());
        let tx = events::channel();
        let config = PoolConfig {
            handles: names,
            ..Default::default()
        };
        let (pool, finished) = PoolManager::new(Arc::new(sim.clone()), &config, tx.clone());
        let pool = Arc::new(pool);
        pool.initialize().await;
        let rec = RecordingChannel::default();
        let actions = ActionRunner::new(Arc::new(rec.clone()), Arc::new(rec.clone()), None);
        let exec = Arc::new(SequenceExecutor::new(Arc::clone(&pool), actions, tx));
        Fixture {
            exec,
            pool,
            sim,
            rec,
            finished,
        }
    }

    /// Feed the next finished timer back into the executor, as the
    /// dispatcher would.
    async fn pump(f: &mut Fixture) -> Progress {
        let timer = f.finished.recv().await.unwrap();
        f.exec.on_step_finished(timer).await.unwrap()
    }

    fn messages(rec: &RecordingChannel) -> Vec<String> {
        rec.deliveries()
            .into_iter()
            .map(|d| match d {
                Delivery::Announce(a) => a.message,
                Delivery::Push(p) => p.message,
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn steps_run_in_order_around_a_delay() {
        let mut f = fixture(2).await;
        let seq = ActionSequence::new(
            vec![
                TimedAction::immediate(say("one")),
                TimedAction::new(
                    mins(5),
                    Action::Notify {
                        title: "Reminder".into(),
                        message: "two".into(),
                        target: None,
                        priority: Priority::Normal,
                    },
                ),
                TimedAction::immediate(say("three")),
            ],
            SequenceShape::MultiStep,
            Provenance::new(None, None),
        );
        let id = seq.id.clone();

        let progress = f.exec.execute(seq).await.unwrap();
        assert!(matches!(progress, Progress::Waiting { step: 1, .. }));
        assert_eq!(messages(&f.rec), vec!["one"]);
        assert_eq!(f.exec.get(&id).unwrap().step, 1);

        tokio::time::sleep(mins(4)).await;
        assert_eq!(messages(&f.rec), vec!["one"], "step 3 must wait for step 2");

        assert_eq!(pump(&mut f).await, Progress::Completed);
        assert_eq!(messages(&f.rec), vec!["one", "two", "three"]);
        assert!(f.exec.get(&id).is_none());
        assert_eq!(f.pool.available_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_delays_chain_one_timer_at_a_time() {
        let mut f = fixture(1).await;
        let seq = ActionSequence::new(
            vec![
                TimedAction::new(mins(1), say("a")),
                TimedAction::new(mins(1), say("b")),
            ],
            SequenceShape::MultiStep,
            Provenance::new(None, None),
        );
        f.exec.execute(seq).await.unwrap();
        assert_eq!(f.pool.available_count(), 0);

        assert!(matches!(pump(&mut f).await, Progress::Waiting { step: 1, .. }));
        assert_eq!(pump(&mut f).await, Progress::Completed);
        assert_eq!(messages(&f.rec), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_tagged_handles_and_drops_stale_finish() {
        let mut f = fixture(2).await;
        let seq = ActionSequence::new(
            vec![
                TimedAction::immediate(say("start")),
                TimedAction::new(mins(10), say("never")),
            ],
            SequenceShape::DeviceDuration,
            Provenance::new(None, None),
        );
        let id = seq.id.clone();
        f.exec.execute(seq).await.unwrap();
        assert_eq!(f.pool.available_count(), 1);

        assert!(f.exec.cancel(&id).await);
        assert!(!f.exec.cancel(&id).await);
        assert!(f.exec.list_active().is_empty());
        assert!(f.pool.timers_for_sequence(&id).is_empty());
        assert_eq!(f.pool.available_count(), 2);

        tokio::time::sleep(mins(30)).await;
        assert!(f.finished.try_recv().is_err());
        assert_eq!(messages(&f.rec), vec!["start"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_when_pool_is_empty() {
        let f = fixture(1).await;
        f.pool
            .create(TimerRequest::new(TimerKind::Alarm, mins(5)))
            .await
            .unwrap();

        let seq = ActionSequence::new(
            vec![
                TimedAction::immediate(say("on")),
                TimedAction::new(mins(5), say("off")),
            ],
            SequenceShape::DeviceDuration,
            Provenance::new(None, None),
        );
        let id = seq.id.clone();
        let err = f.exec.execute(seq).await.unwrap_err();
        assert!(matches!(err, TimekeeperError::PoolExhausted));
        assert!(f.exec.get(&id).is_none());
        assert!(f.rec.deliveries().is_empty(), "nothing runs for a rejected sequence");
    }

    fn fan(service: &str) -> Action {
        Action::CallService {
            domain: "fan".into(),
            service: service.into(),
            target: ServiceTarget::Entity("fan.fan".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_countdown_start_backs_out_leading_steps() {
        let f = fixture(1).await;
        f.sim.fail_next_start();
        let seq = ActionSequence::new(
            vec![
                TimedAction::immediate(say("starting")),
                TimedAction::immediate(fan("turn_on")),
                TimedAction::new(mins(10), fan("turn_off")),
            ],
            SequenceShape::DeviceDuration,
            Provenance::new(None, None),
        );
        let id = seq.id.clone();
        let err = f.exec.execute(seq).await.unwrap_err();
        assert!(matches!(err, TimekeeperError::ExternalCall(_)));
        assert_eq!(f.rec.service_calls(), vec!["fan.turn_on", "fan.turn_off"]);
        assert!(f.exec.get(&id).is_none());
        assert_eq!(f.pool.available_count(), 1);
        assert!(f.pool.snapshot().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_is_held_while_leading_steps_run() {
        let f = fixture(1).await;
        let seq = ActionSequence::new(
            vec![
                TimedAction::immediate(fan("turn_on")),
                TimedAction::new(mins(10), fan("turn_off")),
            ],
            SequenceShape::DeviceDuration,
            Provenance::new(None, None),
        );
        let progress = f.exec.execute(seq).await.unwrap();
        assert!(matches!(progress, Progress::Waiting { step: 1, .. }));
        assert_eq!(f.pool.available_count(), 0);

        // With the only handle taken, the next plan is refused before it runs anything.
        let rejected = ActionSequence::new(
            vec![
                TimedAction::immediate(say("on")),
                TimedAction::new(mins(5), say("off")),
            ],
            SequenceShape::MultiStep,
            Provenance::new(None, None),
        );
        let err = f.exec.execute(rejected).await.unwrap_err();
        assert!(matches!(err, TimekeeperError::PoolExhausted));
        assert_eq!(f.rec.service_calls(), vec!["fan.turn_on"]);
        assert!(f.rec.announcements().is_empty());
    }

    #[tokio::test]
    async fn all_immediate_sequence_completes_inline() {
        let f = fixture(1).await;
        let seq = ActionSequence::new(
            vec![TimedAction::immediate(say("x")), TimedAction::immediate(say("y"))],
            SequenceShape::MultiStep,
            Provenance::new(None, None),
        );
        assert_eq!(f.exec.execute(seq).await.unwrap(), Progress::Completed);
        assert_eq!(messages(&f.rec), vec!["x", "y"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_action_does_not_stop_the_plan() {
        let mut f = fixture(1).await;
        f.rec.fail_service_calls(true);
        let seq = ActionSequence::new(
            vec![
                TimedAction::immediate(Action::CallService {
                    domain: "light".into(),
                    service: "turn_on".into(),
                    target: ServiceTarget::Entity("light.porch".into()),
                }),
                TimedAction::new(mins(1), say("after")),
            ],
            SequenceShape::MultiStep,
            Provenance::new(None, None),
        );
        f.exec.execute(seq).await.unwrap();
        assert_eq!(pump(&mut f).await, Progress::Completed);
        assert_eq!(messages(&f.rec), vec!["after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_step_is_an_invariant_error() {
        let mut f = fixture(1).await;
        let seq = ActionSequence::new(
            vec![TimedAction::new(mins(1), say("a"))],
            SequenceShape::DelayedAction,
            Provenance::new(None, None),
        );
        f.exec.execute(seq).await.unwrap();
        let mut timer = f.finished.recv().await.unwrap();
        if let Some(r) = timer.sequence.as_mut() {
            r.step = 7;
        }
        let err = f.exec.on_step_finished(timer).await.unwrap_err();
        assert!(matches!(err, TimekeeperError::Invariant(_)));
    }
}
