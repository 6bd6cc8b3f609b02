//! DNS validation phase processor
//!
//! Resolves a batch of generated domains through the configured DNS personas.
//! Per-domain retries follow the persona's retry profile and apply only to
//! the retriable failure kinds; everything else records a terminal result
//! row. A worker fans out its batch up to a bounded in-flight count.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clients::{DnsClient, DnsProbeError};
use crate::control::CampaignControl;
use crate::error::Error;
use crate::model::{
    Campaign, CounterDelta, DnsPersonaConfig, DnsPhaseConfig, DnsResult, Job, JobPayload, Persona,
    PersonaConfig, Phase, ProbeStatus,
};
use crate::rotation::RotationState;
use crate::store::EngineStore;

use super::{JobProcessor, ProcessError};

pub struct DnsProcessor {
    store: Arc<dyn EngineStore>,
    client: Arc<dyn DnsClient>,
    fanout: usize,
    selectors: DashMap<Uuid, Arc<RotationState>>,
}

impl DnsProcessor {
    pub fn new(store: Arc<dyn EngineStore>, client: Arc<dyn DnsClient>, fanout: usize) -> Self {
        Self {
            store,
            client,
            fanout: fanout.max(1),
            selectors: DashMap::new(),
        }
    }

    async fn load_personas(
        &self,
        config: &DnsPhaseConfig,
    ) -> std::result::Result<Vec<Persona>, ProcessError> {
        if config.persona_ids.is_empty() {
            return Err(ProcessError::Fatal(Error::validation(
                "dns_validation requires at least one persona",
            )));
        }
        let mut personas = Vec::with_capacity(config.persona_ids.len());
        for id in &config.persona_ids {
            let persona = self
                .store
                .get_persona(*id)
                .await
                .map_err(store_error)?
                .ok_or_else(|| {
                    ProcessError::Fatal(Error::not_found(format_args!("persona {id}")))
                })?;
            if !matches!(persona.config, PersonaConfig::Dns(_)) {
                return Err(ProcessError::Fatal(Error::Validation(format!(
                    "persona {id} is not a DNS persona"
                ))));
            }
            personas.push(persona);
        }
        Ok(personas)
    }
}

fn store_error(e: Error) -> ProcessError {
    if e.is_retriable() {
        ProcessError::Transient(e)
    } else {
        ProcessError::Fatal(e)
    }
}

enum ResolveOutcome {
    Resolved(Vec<std::net::IpAddr>),
    Failed(DnsProbeError),
    Cancelled,
}

/// Resolve with the persona's retry profile applied to retriable kinds
async fn resolve_with_retry(
    client: &dyn DnsClient,
    domain: &str,
    persona: &DnsPersonaConfig,
    cancel: &CancellationToken,
) -> ResolveOutcome {
    let attempts = persona.retry.max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return ResolveOutcome::Cancelled;
        }
        match client.resolve(domain, persona, cancel).await {
            Ok(addresses) => return ResolveOutcome::Resolved(addresses),
            Err(e) if e.kind.is_retriable() && attempt < attempts => {
                tracing::debug!(domain, attempt, kind = ?e.kind, "Retrying resolve");
                tokio::time::sleep(std::time::Duration::from_millis(persona.retry.delay_ms)).await;
                last_error = Some(e);
            }
            Err(e) => return ResolveOutcome::Failed(e),
        }
    }
    ResolveOutcome::Failed(last_error.unwrap_or_else(|| {
        DnsProbeError::new(crate::model::DnsErrorKind::Other, "retry budget exhausted")
    }))
}

#[async_trait]
impl JobProcessor for DnsProcessor {
    fn phase(&self) -> Phase {
        Phase::DnsValidation
    }

    fn pool_name(&self) -> &'static str {
        "dns"
    }

    fn rate_limit(&self, campaign: &Campaign) -> Option<u32> {
        campaign
            .phase_config::<DnsPhaseConfig>(Phase::DnsValidation)
            .ok()
            .flatten()
            .and_then(|cfg| cfg.processing_speed_per_minute)
    }

    async fn process(
        &self,
        job: &Job,
        campaign: &Campaign,
        control: &CampaignControl,
    ) -> std::result::Result<(), ProcessError> {
        let config: DnsPhaseConfig = campaign
            .phase_config(Phase::DnsValidation)
            .map_err(ProcessError::Fatal)?
            .ok_or_else(|| {
                ProcessError::Fatal(Error::validation("dns_validation is not configured"))
            })?;
        let personas = self.load_personas(&config).await?;
        let selector = self
            .selectors
            .entry(campaign.id)
            .or_insert_with(|| Arc::new(RotationState::new(config.rotation, None)))
            .clone();

        let names: Vec<String> = match &job.payload {
            JobPayload::OffsetRange { start, end } => self
                .store
                .generated_in_range(campaign.id, *start, *end)
                .await
                .map_err(store_error)?
                .into_iter()
                .map(|row| row.domain_name)
                .collect(),
            JobPayload::Domains { names } => names.clone(),
        };

        let rows: Vec<DnsResult> = stream::iter(names)
            .map(|name| {
                let selector = selector.clone();
                let personas = &personas;
                let client = self.client.as_ref();
                let campaign_id = campaign.id;
                async move {
                    if control.is_cancelled() {
                        return None;
                    }
                    control.throttle().await;

                    let persona = selector.select(personas, &name, 0)?;
                    let PersonaConfig::Dns(dns_config) = &persona.config else {
                        return None;
                    };
                    match resolve_with_retry(client, &name, dns_config, control.cancel_token())
                        .await
                    {
                        ResolveOutcome::Cancelled => None,
                        ResolveOutcome::Resolved(addresses) => Some(DnsResult {
                            campaign_id,
                            domain_name: name,
                            persona_id: persona.id,
                            status: ProbeStatus::Ok,
                            resolved_addresses: addresses,
                            error_kind: None,
                            attempts: 0,
                            last_checked_at: Utc::now(),
                        }),
                        ResolveOutcome::Failed(error) => Some(DnsResult {
                            campaign_id,
                            domain_name: name,
                            persona_id: persona.id,
                            status: ProbeStatus::Failed,
                            resolved_addresses: Vec::new(),
                            error_kind: Some(error.kind),
                            attempts: 0,
                            last_checked_at: Utc::now(),
                        }),
                    }
                }
            })
            .buffer_unordered(self.fanout)
            .filter_map(|row| async move { row })
            .collect()
            .await;

        for row in rows {
            let succeeded = row.status == ProbeStatus::Ok;
            self.store
                .upsert_dns_result(row)
                .await
                .map_err(store_error)?;
            self.store
                .bump_counters(
                    campaign.id,
                    Phase::DnsValidation,
                    CounterDelta::one(succeeded),
                )
                .await
                .map_err(store_error)?;
        }

        self.store
            .reconcile_counters(campaign.id, Phase::DnsValidation)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::DnsProbeError;
    use crate::model::{DnsErrorKind, IpPreference, NewCampaign, RetryProfile};
    use crate::pattern::PatternType;
    use crate::pattern::PatternSpec;
    use crate::store::memory::MemoryStore;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted resolver: fails `failures` times, then succeeds
    struct FlakyDns {
        failures: AtomicU32,
        kind: DnsErrorKind,
    }

    #[async_trait]
    impl DnsClient for FlakyDns {
        async fn resolve(
            &self,
            _domain: &str,
            _persona: &DnsPersonaConfig,
            _cancel: &CancellationToken,
        ) -> std::result::Result<Vec<IpAddr>, DnsProbeError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(DnsProbeError::new(self.kind, "scripted failure"))
            } else {
                Ok(vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))])
            }
        }
    }

    fn persona_config(max_attempts: u32) -> DnsPersonaConfig {
        DnsPersonaConfig {
            resolvers: vec![],
            timeout_ms: 100,
            retry: RetryProfile {
                max_attempts,
                delay_ms: 1,
            },
            ip_preference: IpPreference::Both,
        }
    }

    #[tokio::test]
    async fn test_retriable_kind_is_retried_to_success() {
        let client = FlakyDns {
            failures: AtomicU32::new(1),
            kind: DnsErrorKind::Timeout,
        };
        let cancel = CancellationToken::new();
        match resolve_with_retry(&client, "a.com", &persona_config(3), &cancel).await {
            ResolveOutcome::Resolved(addrs) => assert_eq!(addrs.len(), 1),
            _ => panic!("expected success after retry"),
        }
    }

    #[tokio::test]
    async fn test_terminal_kind_is_not_retried() {
        let client = FlakyDns {
            failures: AtomicU32::new(5),
            kind: DnsErrorKind::Nxdomain,
        };
        let cancel = CancellationToken::new();
        match resolve_with_retry(&client, "a.com", &persona_config(3), &cancel).await {
            ResolveOutcome::Failed(e) => {
                assert_eq!(e.kind, DnsErrorKind::Nxdomain);
                assert_eq!(client.failures.load(Ordering::SeqCst), 4);
            }
            _ => panic!("expected terminal failure"),
        }
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_keeps_last_error() {
        let client = FlakyDns {
            failures: AtomicU32::new(10),
            kind: DnsErrorKind::Servfail,
        };
        let cancel = CancellationToken::new();
        match resolve_with_retry(&client, "a.com", &persona_config(2), &cancel).await {
            ResolveOutcome::Failed(e) => assert_eq!(e.kind, DnsErrorKind::Servfail),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_batch_records_results_and_counters() {
        let store = Arc::new(MemoryStore::new());
        let campaign = store
            .create_campaign(NewCampaign {
                name: "dns".to_string(),
                owner_id: "user-a".to_string(),
                pattern: PatternSpec {
                    pattern_type: PatternType::Prefix,
                    variable_length: 3,
                    character_set: "ab".to_string(),
                    constant_string: "x".to_string(),
                    tld: "com".to_string(),
                },
                requested_count: 2,
            })
            .await
            .unwrap();

        let persona = Persona {
            id: Uuid::new_v4(),
            name: "resolver-a".to_string(),
            config: PersonaConfig::Dns(persona_config(1)),
            created_at: Utc::now(),
        };
        store.upsert_persona(persona.clone()).await.unwrap();

        let config = DnsPhaseConfig {
            persona_ids: vec![persona.id],
            rotation: Default::default(),
            processing_speed_per_minute: None,
            phase_timeout_secs: None,
        };
        let campaign = store
            .update_campaign(
                campaign.id,
                campaign.version,
                crate::model::CampaignPatch {
                    metadata: vec![(
                        "dns_validation_config".to_string(),
                        serde_json::to_value(&config).unwrap(),
                    )],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store
            .insert_generated(vec![
                crate::model::GeneratedDomain {
                    campaign_id: campaign.id,
                    global_offset: 0,
                    domain_name: "aaax.com".to_string(),
                    created_at: Utc::now(),
                },
                crate::model::GeneratedDomain {
                    campaign_id: campaign.id,
                    global_offset: 1,
                    domain_name: "baax.com".to_string(),
                    created_at: Utc::now(),
                },
            ])
            .await
            .unwrap();

        let client = Arc::new(FlakyDns {
            failures: AtomicU32::new(0),
            kind: DnsErrorKind::Timeout,
        });
        let processor = DnsProcessor::new(store.clone(), client, 4);
        let registry = crate::control::ControlRegistry::new(CancellationToken::new());
        let control = registry.control(campaign.id);

        let job = Job {
            id: Uuid::now_v7(),
            campaign_id: campaign.id,
            phase: Phase::DnsValidation,
            payload: JobPayload::OffsetRange { start: 0, end: 2 },
            priority: 0,
            visible_at: Utc::now(),
            claimed_by: None,
            claim_expires_at: None,
            attempts: 1,
            last_error: None,
        };
        processor.process(&job, &campaign, &control).await.unwrap();

        assert_eq!(store.count_dns_results(campaign.id, None).await.unwrap(), 2);
        assert_eq!(
            store
                .count_dns_results(campaign.id, Some(ProbeStatus::Ok))
                .await
                .unwrap(),
            2
        );
        let refreshed = store.get_campaign(campaign.id).await.unwrap().unwrap();
        let counters = refreshed.phase_counters(Phase::DnsValidation);
        assert_eq!(counters.processed, 2);
        assert_eq!(counters.succeeded, 2);
    }
}
