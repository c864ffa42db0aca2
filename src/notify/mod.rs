pub mod channels;
pub mod render;

pub use render::{render, RenderedMessage};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::db::models::DomainEvent;
use crate::db::Database;

/// A way of reaching the user.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Lower goes first.
    fn priority(&self) -> u32;

    async fn is_available(&self) -> bool;

    async fn send(&self, message: &RenderedMessage) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub attempts_per_channel: u32,
    pub retry_delay: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        DispatchPolicy {
            attempts_per_channel: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered { channel: String, attempts: u32 },
    /// Suppressed: this event already went out through `channel`.
    Duplicate { channel: String },
    /// Every available channel failed (or none was available).
    Undelivered { tried: Vec<String> },
}

struct ChannelSlot {
    channel: Arc<dyn NotificationChannel>,
    permit: Semaphore,
}

/// Which events went out, and where. Backed by the database when present so
/// a restart does not resend.
struct DeliveryLog {
    /// dedup key → (channel, delivered at)
    seen: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    db: Option<Database>,
}

impl DeliveryLog {
    fn delivered_via(&self, key: &str) -> Option<String> {
        if let Some((channel, _)) = self.seen.lock().get(key) {
            return Some(channel.clone());
        }
        let db = self.db.as_ref()?;
        match db.delivered_via(key) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(key = %key, "Delivery log lookup failed: {:#}", e);
                None
            }
        }
    }

    fn record(&self, key: &str, channel: &str) {
        let now = Utc::now();
        self.seen
            .lock()
            .insert(key.to_string(), (channel.to_string(), now));
        if let Some(db) = &self.db {
            if let Err(e) = db.record_delivery(key, channel, now) {
                warn!(key = %key, channel = %channel, "Failed to persist delivery: {:#}", e);
            }
        }
    }

    fn prune(&self, before: DateTime<Utc>) -> usize {
        let mut seen = self.seen.lock();
        let held = seen.len();
        seen.retain(|_, (_, at)| *at >= before);
        let mut pruned = held - seen.len();
        drop(seen);
        if let Some(db) = &self.db {
            match db.prune_deliveries(before) {
                Ok(n) => pruned = pruned.max(n),
                Err(e) => warn!("Failed to prune delivery log: {:#}", e),
            }
        }
        pruned
    }
}

/// Delivers each event through the first channel that accepts it.
pub struct Dispatcher {
    channels: Vec<ChannelSlot>,
    policy: DispatchPolicy,
    log: DeliveryLog,
}

impl Dispatcher {
    pub fn new(
        mut channels: Vec<Arc<dyn NotificationChannel>>,
        policy: DispatchPolicy,
        db: Option<Database>,
    ) -> Self {
        channels.sort_by_key(|c| c.priority());
        Dispatcher {
            channels: channels
                .into_iter()
                .map(|channel| ChannelSlot {
                    channel,
                    permit: Semaphore::new(1),
                })
                .collect(),
            policy,
            log: DeliveryLog {
                seen: Mutex::new(HashMap::new()),
                db,
            },
        }
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|s| s.channel.name()).collect()
    }

    /// Forget deliveries made before `before`. Returns how many were dropped.
    pub fn prune(&self, before: DateTime<Utc>) -> usize {
        let pruned = self.log.prune(before);
        if pruned > 0 {
            info!(pruned, before = %before, "Pruned delivery log");
        }
        pruned
    }

    pub async fn dispatch(&self, event: &DomainEvent) -> DeliveryResult {
        if let Some(channel) = self.log.delivered_via(&event.dedup_key) {
            debug!(key = %event.dedup_key, channel = %channel, "Already delivered, skipping");
            return DeliveryResult::Duplicate { channel };
        }

        let message = render(event);
        let mut tried = Vec::new();
        for slot in &self.channels {
            let name = slot.channel.name();
            if !slot.channel.is_available().await {
                debug!(channel = %name, "Channel unavailable, skipping");
                continue;
            }
            tried.push(name.to_string());

            let Ok(_permit) = slot.permit.acquire().await else {
                continue;
            };
            for attempt in 1..=self.policy.attempts_per_channel {
                match slot.channel.send(&message).await {
                    Ok(()) => {
                        info!(
                            channel = %name,
                            attempt,
                            kind = %event.kind,
                            key = %event.dedup_key,
                            "Notification delivered"
                        );
                        self.log.record(&event.dedup_key, name);
                        return DeliveryResult::Delivered {
                            channel: name.to_string(),
                            attempts: attempt,
                        };
                    }
                    Err(e) => {
                        warn!(
                            channel = %name,
                            attempt,
                            max_attempts = self.policy.attempts_per_channel,
                            "Delivery attempt failed: {:#}", e
                        );
                        if attempt < self.policy.attempts_per_channel {
                            tokio::time::sleep(self.policy.retry_delay).await;
                        }
                    }
                }
            }
        }

        error!(
            kind = %event.kind,
            key = %event.dedup_key,
            tried = ?tried,
            "Notification undelivered on every channel: {}", message.subject
        );
        DeliveryResult::Undelivered { tried }
    }
}
