//! The subsystem entry point used by the intent router, the HTTP server and
//! the CLI console.

use crate::actions::ActionRunner;
use crate::backend::CountdownBackend;
use crate::dispatch::Dispatcher;
use crate::escalation::{EscalationEngine, EscalationInfo};
use crate::events::{self, EventSender, TimerEvent};
use crate::executor::{Progress, SequenceExecutor, SequenceInfo};
use crate::notify::{LogChannel, NotificationChannel, ServiceCaller};
use crate::pool::{InitReport, PoolManager, TimerPool, TimerRequest};
use crate::simulated::SimulatedCountdowns;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use timekeeper_core::config::{Config, EscalationConfig};
use timekeeper_core::control::{recognize_control, ControlCommand};
use timekeeper_core::duration::format_duration;
use timekeeper_core::parser::CommandParser;
use timekeeper_core::phrase::{NoTopology, Topology};
use timekeeper_core::types::{ActionSequence, ActiveTimer, SequenceShape, TimerKind};
use timekeeper_core::{Result, TimekeeperError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub response_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer: Option<ActiveTimer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<ActionSequence>,
}

impl CommandResponse {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            response_text: text.into(),
            timer: None,
            sequence: None,
        }
    }

    fn fail(text: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(text)
        }
    }

    fn with_timer(mut self, timer: Option<ActiveTimer>) -> Self {
        self.timer = timer;
        self
    }

    fn with_sequence(mut self, sequence: ActionSequence) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Everything in flight, for status screens.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOverview {
    pub timers: Vec<ActiveTimer>,
    pub sequences: Vec<SequenceInfo>,
    pub escalations: Vec<EscalationInfo>,
}

impl ActiveOverview {
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty() && self.sequences.is_empty() && self.escalations.is_empty()
    }
}

/// "pizza timer: 4 minutes and 5 seconds left", with " (paused)" when frozen.
pub fn format_status(timer: &ActiveTimer) -> String {
    let remaining = timer.remaining();
    // Round up so a fresh 15 minute timer reads "15 minutes", not "14 minutes and 59 seconds".
    let whole = Duration::from_secs(remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0));
    let mut line = format!("{}: {} left", timer.display_name(), format_duration(whole));
    if timer.is_paused() {
        line.push_str(" (paused)");
    }
    line
}

fn refusal(e: &TimekeeperError, max_timer: Duration) -> CommandResponse {
    match e {
        TimekeeperError::PoolExhausted => {
            CommandResponse::fail("Sorry, all timer slots are in use right now.")
        }
        TimekeeperError::ExternalCall(_) => {
            CommandResponse::fail("Sorry, I couldn't start the timer.")
        }
        TimekeeperError::InvalidDuration(_) => CommandResponse::fail(format!(
            "Sorry, I can only run a timer for up to {}.",
            format_duration(max_timer)
        )),
        other => CommandResponse::fail(format!("Sorry, something went wrong: {other}")),
    }
}

/// Things a spoken reference ("pizza", a timer id, a sequence id) resolved to.
#[derive(Debug, Default)]
struct Targets {
    timers: Vec<String>,
    sequences: Vec<String>,
    escalations: Vec<String>,
}

impl Targets {
    fn is_empty(&self) -> bool {
        self.timers.is_empty() && self.sequences.is_empty() && self.escalations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct TimerServiceBuilder {
    config: Config,
    backend: Option<Arc<dyn CountdownBackend>>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    services: Option<Arc<dyn ServiceCaller>>,
    topology: Option<Arc<dyn Topology>>,
}

impl TimerServiceBuilder {
    pub fn backend(mut self, backend: Arc<dyn CountdownBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn services(mut self, services: Arc<dyn ServiceCaller>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Unset collaborators fall back to the in-process simulation: simulated
    /// countdowns over the configured handles, a logging channel, no topology.
    pub fn build(self) -> TimerService {
        let config = self.config;
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(SimulatedCountdowns::new(config.pool.handles.clone())));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogChannel));
        let services = self.services.unwrap_or_else(|| Arc::new(LogChannel));
        let topology = self.topology.unwrap_or_else(|| Arc::new(NoTopology));

        let events = events::channel();
        let (pool, finished) = PoolManager::new(backend, &config.pool, events.clone());
        let pool = Arc::new(pool);
        let actions = ActionRunner::new(
            Arc::clone(&notifier),
            services,
            config.default_room.clone(),
        );
        let executor = Arc::new(SequenceExecutor::new(
            Arc::clone(&pool),
            actions.clone(),
            events.clone(),
        ));
        let escalation = Arc::new(EscalationEngine::new(notifier, events.clone()));
        let parser = CommandParser::new(topology).with_domains(config.domains.clone());

        TimerService {
            config,
            parser,
            pool,
            executor,
            escalation,
            actions,
            events,
            finished: Mutex::new(Some(finished)),
            dispatcher: Mutex::new(None),
        }
    }
}

// ---------------------------------------------------------------------------
// TimerService
// ---------------------------------------------------------------------------

pub struct TimerService {
    config: Config,
    parser: CommandParser,
    pool: Arc<PoolManager>,
    executor: Arc<SequenceExecutor>,
    escalation: Arc<EscalationEngine>,
    actions: ActionRunner,
    events: EventSender,
    finished: Mutex<Option<mpsc::UnboundedReceiver<ActiveTimer>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn builder(config: Config) -> TimerServiceBuilder {
        TimerServiceBuilder {
            config,
            backend: None,
            notifier: None,
            services: None,
            topology: None,
        }
    }

    /// Reconcile the pool with the backend and start dispatching finishes.
    /// Call once, from inside the tokio runtime.
    pub async fn start(&self) -> InitReport {
        let Some(finished) = self
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            tracing::warn!("timer service already started");
            return InitReport::default();
        };

        let report = self.pool.initialize().await;
        let dispatcher = Dispatcher {
            executor: Arc::clone(&self.executor),
            escalation: Arc::clone(&self.escalation),
            actions: self.actions.clone(),
        }
        .spawn(finished);
        *self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);
        report
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn parser(&self) -> &CommandParser {
        &self.parser
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.events.subscribe()
    }

    /// Should the intent router hand `text` to this subsystem?
    ///
    /// Bare acknowledgments ("stop", "okay") only count while an alarm is
    /// actually going off.
    pub fn is_timer_command(&self, text: &str) -> bool {
        match recognize_control(text).map(|c| self.settle(c)) {
            Some(ControlCommand::Acknowledge { .. }) => self.alarm_ringing(),
            Some(_) => true,
            None => self.parser.parse(text, None, None).is_some(),
        }
    }

    fn alarm_ringing(&self) -> bool {
        !self.escalation.list_active().is_empty()
    }

    /// "stop the timer" silences a ringing alarm, and otherwise cancels.
    fn settle(&self, command: ControlCommand) -> ControlCommand {
        match command {
            ControlCommand::Acknowledge { stops_timer: true } if !self.alarm_ringing() => {
                ControlCommand::Cancel { target: None }
            }
            other => other,
        }
    }

    pub async fn process_command(
        &self,
        text: &str,
        speaker: Option<&str>,
        room: Option<&str>,
    ) -> CommandResponse {
        self.process_command_with(text, speaker, room, None).await
    }

    /// As [`process_command`](Self::process_command), with an escalation
    /// config that replaces the configured one for any alarm created.
    pub async fn process_command_with(
        &self,
        text: &str,
        speaker: Option<&str>,
        room: Option<&str>,
        escalation: Option<EscalationConfig>,
    ) -> CommandResponse {
        let room = room.or(self.config.default_room.as_deref());

        if let Some(command) = recognize_control(text).map(|c| self.settle(c)) {
            tracing::debug!(?command, "control phrase");
            return self.handle_control(command, speaker).await;
        }

        let Some(sequence) = self.parser.parse(text, speaker, room) else {
            return CommandResponse::fail("Sorry, I didn't catch a timer in that.");
        };
        tracing::debug!(sequence_id = %sequence.id, shape = ?sequence.shape, steps = sequence.len(), "parsed timer command");

        match sequence.shape {
            SequenceShape::Alarm => self.start_alarm(sequence, escalation).await,
            SequenceShape::DelayedAction => self.start_delayed(sequence).await,
            SequenceShape::DeviceDuration | SequenceShape::MultiStep => {
                self.start_sequence(sequence).await
            }
        }
    }

    async fn start_alarm(
        &self,
        sequence: ActionSequence,
        escalation: Option<EscalationConfig>,
    ) -> CommandResponse {
        let Some(step) = sequence.current().cloned() else {
            return CommandResponse::fail("Sorry, I didn't catch a timer in that.");
        };
        let mut request = TimerRequest::new(TimerKind::Alarm, step.delay)
            .on_complete(step.action)
            .escalation(escalation.unwrap_or_else(|| self.config.escalation.clone()))
            .provenance(sequence.provenance.clone());
        if let Some(label) = &sequence.label {
            request = request.label(label.clone());
        }

        match self.pool.create(request).await {
            Ok(timer) => CommandResponse::ok(format!(
                "Okay, {} set for {}.",
                timer.display_name(),
                format_duration(timer.duration)
            ))
            .with_timer(Some(timer))
            .with_sequence(sequence),
            Err(e) => refusal(&e, self.config.pool.max_timer()),
        }
    }

    async fn start_delayed(&self, sequence: ActionSequence) -> CommandResponse {
        let Some(step) = sequence.current().cloned() else {
            return CommandResponse::fail("Sorry, I didn't catch a timer in that.");
        };
        let text = format!(
            "Okay, in {} I'll {}.",
            format_duration(step.delay),
            step.action.describe()
        );
        let request = TimerRequest::new(TimerKind::DelayedAction, step.delay)
            .on_complete(step.action)
            .provenance(sequence.provenance.clone());

        match self.pool.create(request).await {
            Ok(timer) => CommandResponse::ok(text)
                .with_timer(Some(timer))
                .with_sequence(sequence),
            Err(e) => refusal(&e, self.config.pool.max_timer()),
        }
    }

    async fn start_sequence(&self, sequence: ActionSequence) -> CommandResponse {
        let text = match sequence.shape {
            SequenceShape::DeviceDuration if sequence.len() == 2 => format!(
                "Okay, I'll {} now and {} in {}.",
                sequence.actions[0].action.describe(),
                sequence.actions[1].action.describe(),
                format_duration(sequence.actions[1].delay)
            ),
            _ => format!(
                "Okay, running {} steps over {}.",
                sequence.len(),
                format_duration(sequence.total_delay())
            ),
        };

        match self.executor.execute(sequence.clone()).await {
            Ok(Progress::Waiting { timer_id, .. }) => CommandResponse::ok(text)
                .with_timer(self.pool.get(&timer_id))
                .with_sequence(sequence),
            Ok(_) => CommandResponse::ok(text).with_sequence(sequence),
            Err(e) => refusal(&e, self.config.pool.max_timer()),
        }
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    async fn handle_control(
        &self,
        command: ControlCommand,
        speaker: Option<&str>,
    ) -> CommandResponse {
        match command {
            ControlCommand::CancelAll => match self.cancel_all().await {
                0 => CommandResponse::fail("You don't have any timers running."),
                1 => CommandResponse::ok("Cancelled your timer."),
                n => CommandResponse::ok(format!("Cancelled all {n} timers.")),
            },
            ControlCommand::Cancel { target } => {
                let key = match self.implicit_target(target.as_deref(), "cancel") {
                    Ok(key) => key,
                    Err(msg) => return CommandResponse::fail(msg),
                };
                if self.cancel(&key).await {
                    CommandResponse::ok(format!("Cancelled the {}.", self.spoken(target.as_deref())))
                } else {
                    self.not_found(target.as_deref())
                }
            }
            ControlCommand::Pause { target } => {
                let key = match self.implicit_target(target.as_deref(), "pause") {
                    Ok(key) => key,
                    Err(msg) => return CommandResponse::fail(msg),
                };
                if self.pause(&key).await {
                    CommandResponse::ok(format!("Paused the {}.", self.spoken(target.as_deref())))
                } else {
                    self.not_found(target.as_deref())
                }
            }
            ControlCommand::Resume { target } => {
                let key = match self.implicit_target(target.as_deref(), "resume") {
                    Ok(key) => key,
                    Err(msg) => return CommandResponse::fail(msg),
                };
                if self.resume(&key).await {
                    CommandResponse::ok(format!("Resumed the {}.", self.spoken(target.as_deref())))
                } else {
                    self.not_found(target.as_deref())
                }
            }
            ControlCommand::Extend { target, by } => {
                let key = match self.implicit_target(target.as_deref(), "extend") {
                    Ok(key) => key,
                    Err(msg) => return CommandResponse::fail(msg),
                };
                match self.extend(&key, by).await {
                    Ok(true) => CommandResponse::ok(format!(
                        "Added {} to the {}.",
                        format_duration(by),
                        self.spoken(target.as_deref())
                    )),
                    Ok(false) => self.not_found(target.as_deref()),
                    Err(e) => refusal(&e, self.config.pool.max_timer()),
                }
            }
            ControlCommand::Status { target } => {
                let timers: Vec<ActiveTimer> = match target.as_deref() {
                    Some(label) => {
                        let ids = self.resolve(label).timers;
                        self.pool
                            .list_active()
                            .into_iter()
                            .filter(|t| ids.contains(&t.id))
                            .collect()
                    }
                    None => self.pool.list_active(),
                };
                if timers.is_empty() {
                    return match target.as_deref() {
                        Some(label) => self.not_found(Some(label)),
                        None => CommandResponse::ok("You don't have any timers running."),
                    };
                }
                let lines: Vec<String> = timers.iter().map(format_status).collect();
                CommandResponse::ok(lines.join("; "))
            }
            ControlCommand::Acknowledge { .. } => match self.acknowledge(None, speaker) {
                0 => CommandResponse::fail("There's no alarm going off."),
                _ => CommandResponse::ok("Okay, alarm dismissed."),
            },
        }
    }

    /// "cancel the timer" with no label works only when there is exactly
    /// one thing it could mean.
    fn implicit_target(&self, target: Option<&str>, verb: &str) -> std::result::Result<String, String> {
        if let Some(t) = target {
            return Ok(t.to_string());
        }
        let timers: Vec<ActiveTimer> = self
            .pool
            .list_active()
            .into_iter()
            .filter(|t| t.sequence.is_none())
            .collect();
        let sequences = self.executor.list_active();
        match (timers.len(), sequences.len()) {
            (0, 0) => Err("You don't have any timers running.".to_string()),
            (1, 0) => Ok(timers[0].id.clone()),
            (0, 1) => Ok(sequences[0].id.clone()),
            (t, s) => Err(format!(
                "You have {} running. Which one should I {verb}?",
                plural(t + s, "timer")
            )),
        }
    }

    fn spoken(&self, target: Option<&str>) -> String {
        match target {
            Some(label) => format!("{label} timer"),
            None => "timer".to_string(),
        }
    }

    fn not_found(&self, target: Option<&str>) -> CommandResponse {
        match target {
            Some(label) => CommandResponse::fail(format!("I couldn't find a {label} timer.")),
            None => CommandResponse::fail("I couldn't find that timer."),
        }
    }

    /// Resolve a timer id, sequence id, or label.
    fn resolve(&self, key: &str) -> Targets {
        let mut targets = Targets::default();

        if let Some(timer) = self.pool.get(key) {
            match timer.sequence {
                Some(r) => targets.sequences.push(r.sequence_id),
                None => targets.timers.push(timer.id),
            }
            return targets;
        }
        if self.executor.get(key).is_some() {
            targets.sequences.push(key.to_string());
            return targets;
        }
        if self.escalation.get(key).is_some() {
            targets.escalations.push(key.to_string());
            return targets;
        }

        for id in self.pool.find_by_label(key) {
            match self.pool.get(&id).and_then(|t| t.sequence) {
                Some(r) if !targets.sequences.contains(&r.sequence_id) => {
                    targets.sequences.push(r.sequence_id)
                }
                Some(_) => {}
                None => targets.timers.push(id),
            }
        }
        for id in self.executor.find_by_label(key) {
            if !targets.sequences.contains(&id) {
                targets.sequences.push(id);
            }
        }
        targets.escalations = self.escalation.find_by_label(key);
        targets
    }

    /// Pooled timers behind a set of targets, including each sequence's
    /// current step timer.
    fn timer_ids(&self, targets: &Targets) -> Vec<String> {
        let mut ids = targets.timers.clone();
        for seq in &targets.sequences {
            ids.extend(self.pool.timers_for_sequence(seq));
        }
        ids
    }

    // -----------------------------------------------------------------------
    // Direct operations
    // -----------------------------------------------------------------------

    /// Cancel by timer id, sequence id, or label. A ringing alarm with that
    /// label is silenced too.
    pub async fn cancel(&self, key: &str) -> bool {
        let targets = self.resolve(key);
        if targets.is_empty() {
            return false;
        }
        let mut any = false;
        for seq in &targets.sequences {
            any |= self.executor.cancel(seq).await;
        }
        for id in &targets.timers {
            any |= self.pool.cancel(id).await;
        }
        for id in &targets.escalations {
            any |= self.escalation.acknowledge(id, Some("cancel"));
        }
        any
    }

    /// Cancel every sequence and timer, and silence every alarm.
    pub async fn cancel_all(&self) -> usize {
        let mut count = self.executor.cancel_all().await;
        for timer in self.pool.list_active() {
            if self.pool.cancel(&timer.id).await {
                count += 1;
            }
        }
        count + self.escalation.acknowledge_all(Some("cancel"))
    }

    pub async fn pause(&self, key: &str) -> bool {
        let mut any = false;
        for id in self.timer_ids(&self.resolve(key)) {
            any |= self.pool.pause(&id).await;
        }
        any
    }

    pub async fn resume(&self, key: &str) -> bool {
        let mut any = false;
        for id in self.timer_ids(&self.resolve(key)) {
            any |= self.pool.resume(&id).await;
        }
        any
    }

    /// Add time to everything `key` resolves to. `InvalidDuration` if the
    /// result would run past the pool's limit.
    pub async fn extend(&self, key: &str, extra: Duration) -> Result<bool> {
        let mut any = false;
        for id in self.timer_ids(&self.resolve(key)) {
            any |= self.pool.extend(&id, extra).await?;
        }
        Ok(any)
    }

    /// Silence one alarm (by timer id or label) or, with `None`, all of them.
    /// Returns how many were silenced.
    pub fn acknowledge(&self, key: Option<&str>, source: Option<&str>) -> usize {
        match key {
            None => self.escalation.acknowledge_all(source),
            Some(key) if self.escalation.acknowledge(key, source) => 1,
            Some(key) => self
                .escalation
                .find_by_label(key)
                .iter()
                .filter(|id| self.escalation.acknowledge(id, source))
                .count(),
        }
    }

    pub fn get_timer(&self, timer_id: &str) -> Option<ActiveTimer> {
        self.pool.get(timer_id)
    }

    pub fn list_active(&self) -> ActiveOverview {
        ActiveOverview {
            timers: self.pool.list_active(),
            sequences: self.executor.list_active(),
            escalations: self.escalation.list_active(),
        }
    }

    pub fn format_status(&self, timer: &ActiveTimer) -> String {
        format_status(timer)
    }

    pub fn pool_snapshot(&self) -> TimerPool {
        self.pool.snapshot()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if let Some(handle) = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
