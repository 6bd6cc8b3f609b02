//! Durable work queue with claim/ack/retry semantics
//!
//! Jobs are at-least-once: a claim grants a lease, the reaper returns expired
//! claims to the ready set, and result writes are idempotent upserts so a
//! re-delivered batch converges instead of duplicating. Ready items drain in
//! `(priority desc, visible_at asc, id asc)` order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::error::{Error, Result};
use crate::model::{Job, NewJob, Phase};

/// Exponential backoff with full jitter
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Policy from queue settings
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.backoff_base_ms),
            cap: Duration::from_millis(settings.backoff_cap_ms),
            max_attempts: settings.max_attempts,
        }
    }

    /// Delay before the next delivery of a job that has failed `attempts` times
    ///
    /// Full jitter: uniform in `[0, min(cap, base * 2^(attempts-1))]`.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let ceiling = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap);
        let millis = rand::rng().random_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// Outcome of a negative acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Re-enqueued; visible again at the given time
    Requeued { visible_at: DateTime<Utc> },
    /// Retry budget exhausted; parked in the dead-letter set
    DeadLettered,
}

/// Persistent queue of phase work items
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a batch; fails with `Overloaded` past the watermark after a bounded wait
    async fn enqueue(&self, jobs: Vec<NewJob>) -> Result<()>;

    /// Claim one ready item for a phase, granting a lease and bumping its attempt count
    async fn claim(&self, worker_id: &str, phase: Phase, lease: Duration) -> Result<Option<Job>>;

    /// Remove a completed item
    async fn ack(&self, job_id: Uuid) -> Result<()>;

    /// Record a failure; re-enqueues with backoff or dead-letters
    async fn nack(&self, job_id: Uuid, error: &str) -> Result<NackOutcome>;

    /// Return a claimed item without consuming a retry attempt
    ///
    /// Used when a worker declines work it cannot run right now, e.g. the
    /// campaign is paused.
    async fn release(&self, job_id: Uuid, delay: Duration) -> Result<()>;

    /// Return items with expired leases to the ready set
    async fn reap_expired(&self) -> Result<u64>;

    /// Ready plus claimed items for a campaign (dead letters excluded)
    async fn pending_for_campaign(&self, campaign_id: Uuid) -> Result<u64>;

    /// Dead-lettered items for a campaign
    async fn dead_letter_count(&self, campaign_id: Uuid) -> Result<u64>;

    /// Drop every item (live and dead) belonging to a campaign
    async fn purge_campaign(&self, campaign_id: Uuid) -> Result<u64>;
}

/// Periodically sweep expired claims back into the ready set
pub fn spawn_reaper(
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_ms = interval.as_millis() as u64, "Queue reaper started");
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    match queue.reap_expired().await {
                        Ok(0) => {}
                        Ok(reaped) => {
                            tracing::info!(reaped, "Returned expired claims to the ready set");
                        }
                        Err(e) => tracing::warn!(error = %e, "Claim reaping failed"),
                    }
                }
            }
        }
        tracing::info!("Queue reaper stopped");
    })
}

#[derive(Default)]
struct QueueInner {
    live: HashMap<Uuid, Job>,
    dead: HashMap<Uuid, Job>,
}

/// In-memory queue backend
///
/// Auto-commit semantics; correctness under re-delivery comes from the
/// store's idempotent result upserts, matching the durable backends.
pub struct MemoryJobQueue {
    inner: Mutex<QueueInner>,
    policy: BackoffPolicy,
    watermark: usize,
    enqueue_wait: Duration,
}

impl MemoryJobQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            policy: BackoffPolicy::from_settings(settings),
            watermark: settings.watermark,
            enqueue_wait: Duration::from_millis(settings.enqueue_wait_ms),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue lock poisoned")
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, jobs: Vec<NewJob>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.enqueue_wait;
        loop {
            {
                let mut inner = self.lock();
                if inner.live.len() + jobs.len() <= self.watermark {
                    let now = Utc::now();
                    for new in jobs {
                        // v7 ids are time-ordered, which is what the fair
                        // drain order ties on.
                        let job = Job {
                            id: Uuid::now_v7(),
                            campaign_id: new.campaign_id,
                            phase: new.phase,
                            payload: new.payload,
                            priority: new.priority,
                            visible_at: now,
                            claimed_by: None,
                            claim_expires_at: None,
                            attempts: 0,
                            last_error: None,
                        };
                        inner.live.insert(job.id, job);
                    }
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Overloaded(format!(
                    "queue above watermark of {} items",
                    self.watermark
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn claim(&self, worker_id: &str, phase: Phase, lease: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut inner = self.lock();
        let candidate = inner
            .live
            .values()
            .filter(|job| job.phase == phase && job.claimed_by.is_none() && job.visible_at <= now)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.visible_at.cmp(&b.visible_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = inner.live.get_mut(&id).expect("candidate exists");
        job.claimed_by = Some(worker_id.to_string());
        job.claim_expires_at =
            Some(now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60)));
        job.attempts += 1;
        Ok(Some(job.clone()))
    }

    async fn ack(&self, job_id: Uuid) -> Result<()> {
        self.lock().live.remove(&job_id);
        Ok(())
    }

    async fn nack(&self, job_id: Uuid, error: &str) -> Result<NackOutcome> {
        let mut inner = self.lock();
        let Some(mut job) = inner.live.remove(&job_id) else {
            return Err(Error::not_found(format_args!("job {job_id}")));
        };
        job.claimed_by = None;
        job.claim_expires_at = None;
        job.last_error = Some(error.to_string());

        if job.attempts >= self.policy.max_attempts {
            tracing::warn!(job_id = %job_id, attempts = job.attempts, "Job dead-lettered");
            inner.dead.insert(job.id, job);
            return Ok(NackOutcome::DeadLettered);
        }

        let visible_at = Utc::now()
            + chrono::Duration::from_std(self.policy.delay(job.attempts))
                .unwrap_or(chrono::Duration::seconds(2));
        job.visible_at = visible_at;
        inner.live.insert(job.id, job);
        Ok(NackOutcome::Requeued { visible_at })
    }

    async fn release(&self, job_id: Uuid, delay: Duration) -> Result<()> {
        let mut inner = self.lock();
        let Some(job) = inner.live.get_mut(&job_id) else {
            return Err(Error::not_found(format_args!("job {job_id}")));
        };
        job.claimed_by = None;
        job.claim_expires_at = None;
        job.attempts = job.attempts.saturating_sub(1);
        job.visible_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Ok(())
    }

    async fn reap_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut reaped = 0;
        for job in self.lock().live.values_mut() {
            if let Some(expires) = job.claim_expires_at {
                if expires < now {
                    job.claimed_by = None;
                    job.claim_expires_at = None;
                    reaped += 1;
                }
            }
        }
        Ok(reaped)
    }

    async fn pending_for_campaign(&self, campaign_id: Uuid) -> Result<u64> {
        Ok(self
            .lock()
            .live
            .values()
            .filter(|job| job.campaign_id == campaign_id)
            .count() as u64)
    }

    async fn dead_letter_count(&self, campaign_id: Uuid) -> Result<u64> {
        Ok(self
            .lock()
            .dead
            .values()
            .filter(|job| job.campaign_id == campaign_id)
            .count() as u64)
    }

    async fn purge_campaign(&self, campaign_id: Uuid) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.live.len() + inner.dead.len();
        inner.live.retain(|_, job| job.campaign_id != campaign_id);
        inner.dead.retain(|_, job| job.campaign_id != campaign_id);
        Ok((before - inner.live.len() - inner.dead.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobPayload, Phase};

    fn settings() -> QueueSettings {
        QueueSettings {
            watermark: 100,
            enqueue_wait_ms: 100,
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_cap_ms: 100,
            ..QueueSettings::default()
        }
    }

    fn new_job(campaign_id: Uuid, priority: i32) -> NewJob {
        NewJob {
            campaign_id,
            phase: Phase::DnsValidation,
            payload: JobPayload::OffsetRange { start: 0, end: 10 },
            priority,
        }
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_id() {
        let queue = MemoryJobQueue::new(&settings());
        let campaign = Uuid::new_v4();
        queue.enqueue(vec![new_job(campaign, 0)]).await.unwrap();
        queue.enqueue(vec![new_job(campaign, 5)]).await.unwrap();
        queue.enqueue(vec![new_job(campaign, 0)]).await.unwrap();

        let first = queue
            .claim("w1", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.priority, 5);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.claimed_by.as_deref(), Some("w1"));

        // Remaining equal-priority jobs drain with stable id tie-breaks.
        let second = queue
            .claim("w1", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let third = queue
            .claim("w1", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.priority, 0);
        assert_eq!(third.priority, 0);
        assert_ne!(second.id, third.id);
        assert!(queue
            .claim("w1", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_claimed_jobs_are_not_redelivered() {
        let queue = MemoryJobQueue::new(&settings());
        queue.enqueue(vec![new_job(Uuid::new_v4(), 0)]).await.unwrap();
        let job = queue
            .claim("w1", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(queue
            .claim("w2", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        queue.ack(job.id).await.unwrap();
        assert!(queue
            .claim("w2", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_claims_are_reaped_and_redelivered() {
        let queue = MemoryJobQueue::new(&settings());
        let campaign = Uuid::new_v4();
        queue.enqueue(vec![new_job(campaign, 0)]).await.unwrap();

        let job = queue
            .claim("w1", Phase::DnsValidation, Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.reap_expired().await.unwrap(), 1);

        let again = queue
            .claim("w2", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_nack_requeues_with_backoff_then_dead_letters() {
        let queue = MemoryJobQueue::new(&settings());
        let campaign = Uuid::new_v4();
        queue.enqueue(vec![new_job(campaign, 0)]).await.unwrap();

        // Attempts 1 and 2 requeue with a future visible_at.
        for _ in 0..2 {
            let job = queue
                .claim("w1", Phase::DnsValidation, Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            match queue.nack(job.id, "resolver unreachable").await.unwrap() {
                NackOutcome::Requeued { visible_at } => assert!(visible_at >= Utc::now() - chrono::Duration::seconds(1)),
                NackOutcome::DeadLettered => panic!("dead-lettered too early"),
            }
            // Make the job visible again immediately for the next round.
            let id = job.id;
            queue.lock().live.get_mut(&id).unwrap().visible_at = Utc::now();
        }

        // Attempt 3 exhausts the budget.
        let job = queue
            .claim("w1", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.attempts, 3);
        assert_eq!(
            queue.nack(job.id, "still failing").await.unwrap(),
            NackOutcome::DeadLettered
        );
        assert_eq!(queue.dead_letter_count(campaign).await.unwrap(), 1);
        assert_eq!(queue.pending_for_campaign(campaign).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_does_not_burn_an_attempt() {
        let queue = MemoryJobQueue::new(&settings());
        queue.enqueue(vec![new_job(Uuid::new_v4(), 0)]).await.unwrap();
        let job = queue
            .claim("w1", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.attempts, 1);
        queue.release(job.id, Duration::ZERO).await.unwrap();

        let again = queue
            .claim("w1", Phase::DnsValidation, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_watermark_rejects_with_overloaded() {
        let mut s = settings();
        s.watermark = 2;
        s.enqueue_wait_ms = 50;
        let queue = MemoryJobQueue::new(&s);
        let campaign = Uuid::new_v4();
        queue
            .enqueue(vec![new_job(campaign, 0), new_job(campaign, 0)])
            .await
            .unwrap();
        let err = queue.enqueue(vec![new_job(campaign, 0)]).await.unwrap_err();
        assert!(matches!(err, Error::Overloaded(_)));
    }

    #[tokio::test]
    async fn test_purge_campaign_clears_live_and_dead() {
        let queue = MemoryJobQueue::new(&settings());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.enqueue(vec![new_job(a, 0), new_job(b, 0)]).await.unwrap();
        assert_eq!(queue.purge_campaign(a).await.unwrap(), 1);
        assert_eq!(queue.pending_for_campaign(a).await.unwrap(), 0);
        assert_eq!(queue.pending_for_campaign(b).await.unwrap(), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
            max_attempts: 5,
        };
        for attempts in 1..=10 {
            let delay = policy.delay(attempts);
            let ceiling = Duration::from_secs(2 * 2u64.pow(attempts.saturating_sub(1).min(16)))
                .min(Duration::from_secs(300));
            assert!(delay <= ceiling, "attempt {attempts}: {delay:?} > {ceiling:?}");
        }
    }
}
