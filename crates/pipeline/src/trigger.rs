use std::{collections::BTreeMap, fmt, future::Future, str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::change::JobChange;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Document path pattern such as `jobs/{jobId}`. Braced segments capture the
/// matching segment of a concrete path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in pattern.split('/') {
            if segment.is_empty() {
                bail!("path pattern '{pattern}' contains an empty segment");
            }
            if let Some(name) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                if name.is_empty() || name.contains(['{', '}']) {
                    bail!("path pattern '{pattern}' has a malformed parameter '{segment}'");
                }
                segments.push(Segment::Param(name.to_string()));
            } else if segment.contains(['{', '}']) {
                bail!("path pattern '{pattern}' has a malformed parameter '{segment}'");
            } else {
                segments.push(Segment::Literal(segment.to_string()));
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = BTreeMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

impl FromStr for PathPattern {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub params: BTreeMap<String, String>,
    /// 1 on first delivery, incremented on every retry.
    pub attempt: u32,
}

impl TriggerContext {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Callback invoked with the before/after snapshots of a job write. Delivery
/// is at-least-once: a trigger may see the same change again after a failure.
#[async_trait]
pub trait WriteTrigger: Send + Sync {
    fn name(&self) -> &str;

    async fn on_write(&self, change: &JobChange, ctx: &TriggerContext) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }
}

struct Registration {
    pattern: PathPattern,
    trigger: Arc<dyn WriteTrigger>,
}

pub type ChangeReceiver = mpsc::UnboundedReceiver<JobChange>;

/// Publishing side of the job change channel, handed to whatever performs
/// job writes.
#[derive(Clone, Debug)]
pub struct ChangeFeed {
    tx: mpsc::UnboundedSender<JobChange>,
    order: Arc<Mutex<()>>,
}

impl ChangeFeed {
    pub fn channel() -> (Self, ChangeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Self {
            tx,
            order: Arc::new(Mutex::new(())),
        };
        (feed, rx)
    }

    /// Runs `write` and publishes the change it commits while holding the
    /// feed's write lock. Changes reach the receiver in commit order.
    pub async fn publish_committed<Fut, E>(&self, write: Fut) -> Result<Option<JobChange>, E>
    where
        Fut: Future<Output = Result<Option<JobChange>, E>>,
    {
        let _order = self.order.lock().await;
        let change = write.await?;
        if let Some(change) = &change {
            self.publish(change.clone());
        }
        Ok(change)
    }

    pub fn publish(&self, change: JobChange) {
        let path = change.path();
        if self.tx.send(change).is_err() {
            warn!(%path, "change feed has no runtime attached; dropping job change");
        }
    }
}

#[derive(Default)]
pub struct TriggerRuntime {
    registrations: Vec<Registration>,
    retry: RetryPolicy,
}

impl TriggerRuntime {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            registrations: Vec::new(),
            retry,
        }
    }

    pub fn register(&mut self, pattern: &str, trigger: Arc<dyn WriteTrigger>) -> Result<()> {
        let pattern = PathPattern::parse(pattern)?;
        debug!(%pattern, trigger = trigger.name(), "registered write trigger");
        self.registrations.push(Registration { pattern, trigger });
        Ok(())
    }

    /// Delivers one change to every trigger whose pattern matches its path,
    /// in registration order. A trigger that keeps failing does not stop the
    /// ones after it; the first exhausted failure is returned.
    pub async fn dispatch(&self, change: &JobChange) -> Result<()> {
        let path = change.path();
        let mut first_failure = None;

        for registration in &self.registrations {
            let Some(params) = registration.pattern.matches(&path) else {
                continue;
            };
            if let Err(err) = self.invoke(registration, change, params).await {
                error!(
                    %path,
                    trigger = registration.trigger.name(),
                    error = %err,
                    "write trigger gave up"
                );
                first_failure.get_or_insert(err);
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn invoke(
        &self,
        registration: &Registration,
        change: &JobChange,
        params: BTreeMap<String, String>,
    ) -> Result<()> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut ctx = TriggerContext { params, attempt: 0 };

        loop {
            ctx.attempt += 1;
            match registration.trigger.on_write(change, &ctx).await {
                Ok(()) => return Ok(()),
                Err(err) if ctx.attempt < max_attempts => {
                    let backoff = self.retry.backoff_for(ctx.attempt);
                    warn!(
                        trigger = registration.trigger.name(),
                        attempt = ctx.attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "write trigger failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    return Err(anyhow!(
                        "trigger '{}' failed after {} attempts: {err:#}",
                        registration.trigger.name(),
                        ctx.attempt
                    ));
                }
            }
        }
    }

    /// Drains the change feed until every `ChangeFeed` handle is dropped.
    pub async fn run(self: Arc<Self>, mut changes: ChangeReceiver) {
        while let Some(change) = changes.recv().await {
            if let Err(err) = self.dispatch(&change).await {
                debug!(path = %change.path(), error = %err, "change left unprocessed");
            }
        }
        debug!("change feed closed; trigger runtime stopping");
    }
}

#[cfg(test)]
#[path = "tests/trigger_tests.rs"]
mod tests;
