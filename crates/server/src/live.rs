use anyhow::{Context, Result};
use async_trait::async_trait;
use pipeline::{JobChange, TriggerContext, WriteTrigger};
use shared::{domain::UserId, protocol::ServerEvent};
use storage::Storage;
use tokio::sync::broadcast;
use tracing::debug;

/// Pushes job writes and the owner's refreshed counters to connected
/// sockets. Registered after the aggregator so the counters include the write.
pub struct LiveQuery {
    storage: Storage,
    events: broadcast::Sender<ServerEvent>,
}

impl LiveQuery {
    pub fn new(storage: Storage, events: broadcast::Sender<ServerEvent>) -> Self {
        Self { storage, events }
    }
}

#[async_trait]
impl WriteTrigger for LiveQuery {
    fn name(&self) -> &str {
        "live_query"
    }

    async fn on_write(&self, change: &JobChange, _ctx: &TriggerContext) -> Result<()> {
        let Some(owner) = change.owner().cloned() else {
            return Ok(());
        };
        if self.events.receiver_count() == 0 {
            debug!(job_id = %change.job_id, "no live subscribers");
            return Ok(());
        }

        let counts = self
            .storage
            .status_counts(&owner)
            .await
            .with_context(|| format!("failed to load counters for {owner}"))?;
        let _ = self.events.send(ServerEvent::JobChanged {
            owner: owner.clone(),
            job_id: change.job_id.clone(),
            job: change.after.clone(),
        });
        let _ = self.events.send(ServerEvent::StatsUpdated { owner, counts });
        Ok(())
    }
}

/// Sockets only see events about their own user's records.
pub fn visible_to(event: &ServerEvent, user: &UserId) -> bool {
    event.owner() == user
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
