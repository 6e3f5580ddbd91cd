//! The countdown primitive the pool allocates from.
//!
//! Handles are owned by an external system (a home automation hub, or
//! [`SimulatedCountdowns`](crate::simulated::SimulatedCountdowns) in-process).
//! Only the `active → idle` transition on the event feed means "finished".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use timekeeper_core::types::duration_secs;
use timekeeper_core::Result;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountdownState {
    Idle,
    Active,
    Paused,
}

impl CountdownState {
    pub fn as_str(self) -> &'static str {
        match self {
            CountdownState::Idle => "idle",
            CountdownState::Active => "active",
            CountdownState::Paused => "paused",
        }
    }
}

impl std::fmt::Display for CountdownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountdownStatus {
    pub state: CountdownState,
    #[serde(with = "duration_secs")]
    pub remaining: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finishes_at: Option<DateTime<Utc>>,
}

/// One state transition on a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountdownEvent {
    pub handle: String,
    pub from: CountdownState,
    pub to: CountdownState,
}

impl CountdownEvent {
    pub fn new(handle: impl Into<String>, from: CountdownState, to: CountdownState) -> Self {
        Self {
            handle: handle.into(),
            from,
            to,
        }
    }

    /// Exactly `active → idle`. Pausing, resuming and cancelling a paused
    /// countdown are not completions.
    pub fn is_finish(&self) -> bool {
        self.from == CountdownState::Active && self.to == CountdownState::Idle
    }
}

#[async_trait]
pub trait CountdownBackend: Send + Sync {
    /// Start `handle` counting down from `duration`. Starting a paused handle
    /// resumes it.
    async fn start(&self, handle: &str, duration: Duration) -> Result<()>;
    async fn cancel(&self, handle: &str) -> Result<()>;
    async fn pause(&self, handle: &str) -> Result<()>;
    async fn resume(&self, handle: &str) -> Result<()>;
    async fn extend(&self, handle: &str, extra: Duration) -> Result<()>;
    /// `Ok(None)` means the handle does not exist on the external system.
    async fn state(&self, handle: &str) -> Result<Option<CountdownStatus>>;
    fn subscribe(&self) -> broadcast::Receiver<CountdownEvent>;
}
