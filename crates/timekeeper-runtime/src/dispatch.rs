//! Fans finished timers out to whoever owns their completion.
//!
//! The pool's feed subscriber only pushes onto a channel; this task drains
//! it and gives every finished timer its own handler task, so a slow
//! announcement never holds up the next finish.

use crate::actions::ActionRunner;
use crate::escalation::EscalationEngine;
use crate::executor::SequenceExecutor;
use std::sync::Arc;
use timekeeper_core::types::{ActiveTimer, TimerKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub(crate) struct Dispatcher {
    pub executor: Arc<SequenceExecutor>,
    pub escalation: Arc<EscalationEngine>,
    pub actions: ActionRunner,
}

impl Dispatcher {
    pub fn spawn(self, mut finished: mpsc::UnboundedReceiver<ActiveTimer>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(timer) = finished.recv().await {
                let this = self.clone();
                tokio::spawn(async move { this.handle(timer).await });
            }
            tracing::debug!("finished-timer channel closed");
        })
    }

    async fn handle(&self, timer: ActiveTimer) {
        if timer.sequence.is_some() {
            if let Err(e) = self.executor.on_step_finished(timer).await {
                tracing::warn!(error = %e, "sequence step could not continue");
            }
            return;
        }

        if timer.kind == TimerKind::Alarm {
            if let Some(config) = timer.escalation.as_ref().filter(|c| c.enabled) {
                self.escalation.start(&timer, config);
                return;
            }
        }

        match &timer.on_complete {
            Some(action) => {
                self.actions.perform_logged(action, &timer.provenance).await;
            }
            None => {
                tracing::debug!(timer_id = %timer.id, "timer finished with nothing to do");
            }
        }
    }
}
