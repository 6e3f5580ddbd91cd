//! Test doubles shared by the runtime's unit tests.

use crate::notify::{NotificationChannel, ServiceCaller};
use crate::service::TimerService;
use crate::simulated::SimulatedCountdowns;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use timekeeper_core::config::Config;
use timekeeper_core::phrase::NoTopology;
use timekeeper_core::types::{Priority, ServiceTarget};
use timekeeper_core::{Result, TimekeeperError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub message: String,
    pub room: Option<String>,
    pub repeat: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub target: Option<String>,
    pub title: String,
    pub message: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Announce(Announcement),
    Push(Push),
    Chime {
        sound: String,
        room: Option<String>,
    },
    Service {
        domain: String,
        service: String,
        target: ServiceTarget,
    },
}

/// Records every side effect in order. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingChannel {
    log: Arc<Mutex<Vec<Delivery>>>,
    fail_services: Arc<Mutex<bool>>,
}

impl RecordingChannel {
    fn record(&self, d: Delivery) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(d);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn announcements(&self) -> Vec<Announcement> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Announce(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    pub fn pushes(&self) -> Vec<Push> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Push(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// `domain.service` strings of every service call, in order.
    pub fn service_calls(&self) -> Vec<String> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Service {
                    domain, service, ..
                } => Some(format!("{domain}.{service}")),
                _ => None,
            })
            .collect()
    }

    pub fn fail_service_calls(&self, fail: bool) {
        *self
            .fail_services
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = fail;
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn announce(&self, message: &str, room: Option<&str>, repeat: u32) -> Result<()> {
        self.record(Delivery::Announce(Announcement {
            message: message.to_string(),
            room: room.map(str::to_string),
            repeat,
        }));
        Ok(())
    }

    async fn send_push(
        &self,
        target: Option<&str>,
        title: &str,
        message: &str,
        priority: Priority,
    ) -> Result<()> {
        self.record(Delivery::Push(Push {
            target: target.map(str::to_string),
            title: title.to_string(),
            message: message.to_string(),
            priority,
        }));
        Ok(())
    }

    async fn play_chime(&self, sound: &str, room: Option<&str>) -> Result<()> {
        self.record(Delivery::Chime {
            sound: sound.to_string(),
            room: room.map(str::to_string),
        });
        Ok(())
    }
}

#[async_trait]
impl ServiceCaller for RecordingChannel {
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        target: &ServiceTarget,
    ) -> Result<()> {
        if *self
            .fail_services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(TimekeeperError::ExternalCall(format!(
                "{domain}.{service} unavailable"
            )));
        }
        self.record(Delivery::Service {
            domain: domain.to_string(),
            service: service.to_string(),
            target: target.clone(),
        });
        Ok(())
    }
}

/// Everything a service-level test needs, wired to the simulated backend.
pub struct Harness {
    pub service: Arc<TimerService>,
    pub countdowns: SimulatedCountdowns,
    pub channel: RecordingChannel,
}

/// A started service over `handles` countdown handles.
pub async fn harness(handles: usize, config: Option<Config>) -> Harness {
    let mut config = config.unwrap_or_default();
    config.pool.handles = (1..=handles).map(|i| format!("timer.t{i}")).collect();
    let countdowns = SimulatedCountdowns::new(config.pool.handles.clone());
    let channel = RecordingChannel::default();
    let service = TimerService::builder(config)
        .backend(Arc::new(countdowns.clone()))
        .notifier(Arc::new(channel.clone()))
        .services(Arc::new(channel.clone()))
        .topology(Arc::new(NoTopology))
        .build();
    let service = Arc::new(service);
    service.start().await;
    Harness {
        service,
        countdowns,
        channel,
    }
}
