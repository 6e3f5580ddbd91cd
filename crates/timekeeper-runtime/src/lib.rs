//! Async runtime for spoken timers: a fixed pool of countdown handles, the
//! sequence executor that chains them, and alarm escalation.
//!
//! [`TimerService`] is the entry point. Everything outside the process
//! (countdowns, speakers, phones, devices) sits behind the traits in
//! [`backend`] and [`notify`].

pub mod actions;
pub mod backend;
mod dispatch;
pub mod escalation;
pub mod events;
pub mod executor;
pub mod notify;
pub mod pool;
pub mod service;
pub mod simulated;

#[cfg(test)]
mod testing;

pub use backend::{CountdownBackend, CountdownEvent, CountdownState, CountdownStatus};
pub use events::TimerEvent;
pub use notify::{LogChannel, NotificationChannel, ServiceCaller};
pub use service::{format_status, ActiveOverview, CommandResponse, TimerService, TimerServiceBuilder};
pub use simulated::SimulatedCountdowns;
