//! Lifecycle and progress events
//!
//! Mutations write their event into the store's outbox in the same logical
//! operation; the [`OutboxRelay`] publishes strictly post-commit. Sequence
//! numbers are per-campaign serials, so subscribers observe a campaign's
//! events in order; across campaigns no ordering is guaranteed. Delivery is
//! best-effort: the broadcast channel drops the oldest events for laggards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Phase, PhaseStatus};
use crate::store::EngineStore;

/// Typed engine event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CampaignCreated {
        name: String,
        owner_id: String,
    },
    CampaignUpdated {
        phase: Phase,
        status: PhaseStatus,
    },
    CampaignDeleted,
    PhaseConfigured {
        phase: Phase,
    },
    PhaseStarted {
        phase: Phase,
    },
    PhaseProgress {
        phase: Phase,
        processed: u64,
        total: u64,
    },
    PhaseCompleted {
        phase: Phase,
    },
    PhaseFailed {
        phase: Phase,
        error_kind: String,
    },
}

/// An event with its campaign scope and serial position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub campaign_id: Uuid,
    /// Per-campaign serial, starting at 1
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// A persisted, not-yet-published event
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Global append order
    pub id: i64,
    pub envelope: EventEnvelope,
}

/// Destination for published events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// In-process fan-out over a lossy broadcast channel
///
/// Subscribers that fall behind lose the oldest events, which is the
/// documented delivery contract.
pub struct BroadcastSink {
    sender: broadcast::Sender<EventEnvelope>,
}

impl BroadcastSink {
    /// Channel capacity bounds how far a subscriber may lag
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        // A send error only means there are no receivers right now.
        let _ = self.sender.send(envelope.clone());
        Ok(())
    }
}

/// NATS-backed sink publishing JSON payloads per campaign subject
#[cfg(feature = "events")]
pub struct NatsSink {
    client: async_nats::Client,
    subject_prefix: String,
}

#[cfg(feature = "events")]
impl NatsSink {
    /// Sink publishing to `{prefix}.{campaign_id}.events`
    pub fn new(client: async_nats::Client, subject_prefix: impl Into<String>) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.into(),
        }
    }

    /// Connect to NATS with retry and exponential backoff
    pub async fn connect(settings: &crate::config::NatsSettings) -> Result<Self> {
        let base_delay = Duration::from_secs(settings.retry_delay_secs);
        let mut attempt = 0;

        loop {
            let mut opts = async_nats::ConnectOptions::new();
            if let Some(name) = &settings.name {
                opts = opts.name(name);
            }
            match opts.connect(&settings.url).await {
                Ok(client) => {
                    if attempt > 0 {
                        tracing::info!(
                            "NATS connection established after {} attempt(s)",
                            attempt + 1
                        );
                    } else {
                        tracing::info!("NATS client connected to {}", settings.url);
                    }
                    return Ok(Self::new(client, "prospector.campaign"));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > settings.max_retries {
                        tracing::error!(
                            "Failed to connect to NATS after {} attempts: {}",
                            settings.max_retries + 1,
                            e
                        );
                        return Err(crate::error::Error::Internal(format!(
                            "failed to connect to NATS at '{}': {e}",
                            settings.url
                        )));
                    }
                    let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                    tracing::warn!(
                        "NATS connection attempt {} failed: {}. Retrying in {:?}...",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(feature = "events")]
#[async_trait]
impl EventSink for NatsSink {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        let subject = format!("{}.{}.events", self.subject_prefix, envelope.campaign_id);
        let payload = serde_json::to_vec(envelope)?;
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| {
                crate::error::Error::Internal(format!("failed to publish to {subject}: {e}"))
            })?;
        Ok(())
    }
}

/// Background task draining the outbox into the configured sinks
///
/// Entries are fetched in append order. When a publish fails, the remaining
/// entries of that campaign are held back for the next tick so per-campaign
/// ordering survives sink outages.
pub struct OutboxRelay {
    store: Arc<dyn EngineStore>,
    sinks: Vec<Arc<dyn EventSink>>,
    poll_interval: Duration,
    batch: usize,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn EngineStore>, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            store,
            sinks,
            poll_interval: Duration::from_millis(100),
            batch: 256,
        }
    }

    /// Override the drain poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Drain until the token is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Outbox relay started");
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    // Final sweep so events from the shutdown path still go out.
                    if let Err(e) = self.drain_once().await {
                        tracing::warn!(error = %e, "Outbox drain failed during shutdown");
                    }
                    break;
                }
                () = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.drain_once().await {
                        tracing::warn!(error = %e, "Outbox drain failed");
                    }
                }
            }
        }
        tracing::info!("Outbox relay stopped");
    }

    /// Publish one batch of unpublished entries
    pub async fn drain_once(&self) -> Result<u64> {
        let entries = self.store.outbox_unpublished(self.batch).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut published = Vec::new();
        let mut held_back: std::collections::HashSet<Uuid> = std::collections::HashSet::new();

        for entry in &entries {
            let campaign_id = entry.envelope.campaign_id;
            if held_back.contains(&campaign_id) {
                continue;
            }
            let mut delivered = true;
            for sink in &self.sinks {
                if let Err(e) = sink.publish(&entry.envelope).await {
                    tracing::warn!(
                        campaign_id = %campaign_id,
                        seq = entry.envelope.seq,
                        error = %e,
                        "Event publish failed; holding campaign back"
                    );
                    delivered = false;
                    break;
                }
            }
            if delivered {
                published.push(entry.id);
            } else {
                held_back.insert(campaign_id);
            }
        }

        if !published.is_empty() {
            self.store.outbox_mark_published(&published).await?;
        }
        Ok(published.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let envelope = EventEnvelope {
            campaign_id: Uuid::nil(),
            seq: 3,
            at: Utc::now(),
            event: EngineEvent::PhaseProgress {
                phase: Phase::DnsValidation,
                processed: 10,
                total: 40,
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "phase_progress");
        assert_eq!(value["phase"], "dns_validation");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["processed"], 10);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastSink::new(16);
        let mut receiver = sink.subscribe();
        let envelope = EventEnvelope {
            campaign_id: Uuid::new_v4(),
            seq: 1,
            at: Utc::now(),
            event: EngineEvent::CampaignDeleted,
        };
        sink.publish(&envelope).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_broadcast_sink_without_receivers_is_ok() {
        let sink = BroadcastSink::new(4);
        let envelope = EventEnvelope {
            campaign_id: Uuid::new_v4(),
            seq: 1,
            at: Utc::now(),
            event: EngineEvent::CampaignDeleted,
        };
        assert!(sink.publish(&envelope).await.is_ok());
    }

    #[tokio::test]
    async fn test_laggard_receivers_drop_oldest() {
        let sink = BroadcastSink::new(2);
        let mut receiver = sink.subscribe();
        for seq in 1..=5 {
            let envelope = EventEnvelope {
                campaign_id: Uuid::nil(),
                seq,
                at: Utc::now(),
                event: EngineEvent::CampaignDeleted,
            };
            sink.publish(&envelope).await.unwrap();
        }
        // The first read reports the overflow, then the newest events arrive.
        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(receiver.recv().await.unwrap().seq, 4);
        assert_eq!(receiver.recv().await.unwrap().seq, 5);
    }
}
