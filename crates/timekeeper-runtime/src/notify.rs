//! Outbound side effects: announcements, push notifications, chimes and
//! service calls.

use async_trait::async_trait;
use timekeeper_core::types::{Priority, ServiceTarget};
use timekeeper_core::Result;

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Speak `message` in `room` (or the house default when `None`), `repeat` times.
    async fn announce(&self, message: &str, room: Option<&str>, repeat: u32) -> Result<()>;

    /// `Priority::Critical` must bypass silent / do-not-disturb on the device.
    async fn send_push(
        &self,
        target: Option<&str>,
        title: &str,
        message: &str,
        priority: Priority,
    ) -> Result<()>;

    async fn play_chime(&self, sound: &str, room: Option<&str>) -> Result<()>;
}

#[async_trait]
pub trait ServiceCaller: Send + Sync {
    async fn call_service(&self, domain: &str, service: &str, target: &ServiceTarget)
        -> Result<()>;
}

/// Writes every side effect to the log instead of performing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn announce(&self, message: &str, room: Option<&str>, repeat: u32) -> Result<()> {
        tracing::info!(room = room.unwrap_or("default"), repeat, "announce: {message}");
        Ok(())
    }

    async fn send_push(
        &self,
        target: Option<&str>,
        title: &str,
        message: &str,
        priority: Priority,
    ) -> Result<()> {
        tracing::info!(
            recipient = target.unwrap_or("all"),
            priority = %priority,
            "push: {title}: {message}"
        );
        Ok(())
    }

    async fn play_chime(&self, sound: &str, room: Option<&str>) -> Result<()> {
        tracing::info!(room = room.unwrap_or("default"), "chime: {sound}");
        Ok(())
    }
}

#[async_trait]
impl ServiceCaller for LogChannel {
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        target: &ServiceTarget,
    ) -> Result<()> {
        tracing::info!(entity = %target, "service: {domain}.{service}");
        Ok(())
    }
}
