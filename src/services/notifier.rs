//! Owner notifications.
//!
//! The core never talks to a chat front-end directly; it appends messages to
//! a per-owner outbox that the front-end drains over HTTP.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

/// Maximum queued messages per owner; the oldest are dropped first.
const MAX_PENDING_PER_OWNER: usize = 200;

pub trait Notifier: Send + Sync {
    fn notify(&self, owner_id: &str, message: String);
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct Outbox {
    pending: DashMap<String, Vec<Notification>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued message for `owner_id`, oldest first.
    pub fn drain(&self, owner_id: &str) -> Vec<Notification> {
        self.pending
            .remove(owner_id)
            .map(|(_, messages)| messages)
            .unwrap_or_default()
    }

    pub fn pending_count(&self, owner_id: &str) -> usize {
        self.pending.get(owner_id).map(|m| m.len()).unwrap_or(0)
    }
}

impl Notifier for Outbox {
    fn notify(&self, owner_id: &str, message: String) {
        info!("📨 [{}] {}", owner_id, message.lines().next().unwrap_or_default());
        let mut queue = self.pending.entry(owner_id.to_string()).or_default();
        if queue.len() >= MAX_PENDING_PER_OWNER {
            queue.remove(0);
        }
        queue.push(Notification { message, created_at: Utc::now() });
    }
}
