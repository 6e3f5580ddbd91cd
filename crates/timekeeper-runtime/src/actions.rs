use crate::notify::{NotificationChannel, ServiceCaller};
use std::sync::Arc;
use timekeeper_core::types::{Action, Provenance};
use timekeeper_core::Result;

/// Performs a single [`Action`] against the outbound collaborators.
#[derive(Clone)]
pub struct ActionRunner {
    notifier: Arc<dyn NotificationChannel>,
    services: Arc<dyn ServiceCaller>,
    default_room: Option<String>,
}

impl ActionRunner {
    pub fn new(
        notifier: Arc<dyn NotificationChannel>,
        services: Arc<dyn ServiceCaller>,
        default_room: Option<String>,
    ) -> Self {
        Self {
            notifier,
            services,
            default_room,
        }
    }

    pub fn notifier(&self) -> &Arc<dyn NotificationChannel> {
        &self.notifier
    }

    /// Room for an action that did not name one: where the command was
    /// spoken, else the configured default.
    fn room<'a>(&'a self, explicit: Option<&'a str>, provenance: &'a Provenance) -> Option<&'a str> {
        explicit
            .or(provenance.room.as_deref())
            .or(self.default_room.as_deref())
    }

    pub async fn perform(&self, action: &Action, provenance: &Provenance) -> Result<()> {
        match action {
            Action::CallService {
                domain,
                service,
                target,
            } => self.services.call_service(domain, service, target).await,
            Action::Announce { message, room } => {
                let room = self.room(room.as_deref(), provenance);
                self.notifier.announce(message, room, 1).await
            }
            Action::Notify {
                title,
                message,
                target,
                priority,
            } => {
                self.notifier
                    .send_push(target.as_deref(), title, message, *priority)
                    .await
            }
            Action::Chime { sound, room } => {
                let room = self.room(room.as_deref(), provenance);
                self.notifier.play_chime(sound, room).await
            }
        }
    }

    /// Like [`perform`](Self::perform) but logs failures instead of returning
    /// them. Already-executed steps are never rolled back, so a failed action
    /// does not stop the plan it belongs to.
    pub async fn perform_logged(&self, action: &Action, provenance: &Provenance) -> bool {
        match self.perform(action, provenance).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(action = action.kind_str(), error = %e, "action failed");
                false
            }
        }
    }
}
