//! HTTP keyword validation phase processor
//!
//! Fetches `scheme://domain[:port]/` for each batch domain through a
//! (proxy, persona) pair from the rotation, then runs the campaign's keyword
//! rules over the decoded body. Non-2xx responses still get keyword
//! extraction when a body came back. When the phase config routes through
//! proxies, an empty eligible set records a `proxy_error` row per domain;
//! otherwise requests go direct.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::clients::{FetchRequest, HttpClient, ProxyRegistry};
use crate::config::HttpSettings;
use crate::control::CampaignControl;
use crate::error::Error;
use crate::keywords::{compile_rules, extract_matches, CompiledRule};
use crate::model::{
    Campaign, CounterDelta, HttpErrorKind, HttpPhaseConfig, HttpResult, Job, JobPayload,
    KeywordMatch, Persona, PersonaConfig, Phase, ProbeStatus, Proxy, RotationStrategy,
};
use crate::rotation::RotationState;
use crate::store::EngineStore;

use super::{JobProcessor, ProcessError};

struct CampaignSelectors {
    proxies: Arc<RotationState>,
    personas: Arc<RotationState>,
}

pub struct HttpProcessor {
    store: Arc<dyn EngineStore>,
    client: Arc<dyn HttpClient>,
    proxies: Arc<dyn ProxyRegistry>,
    settings: HttpSettings,
    selectors: DashMap<Uuid, Arc<CampaignSelectors>>,
    rules: DashMap<Uuid, Arc<Vec<CompiledRule>>>,
}

impl HttpProcessor {
    pub fn new(
        store: Arc<dyn EngineStore>,
        client: Arc<dyn HttpClient>,
        proxies: Arc<dyn ProxyRegistry>,
        settings: HttpSettings,
    ) -> Self {
        Self {
            store,
            client,
            proxies,
            settings,
            selectors: DashMap::new(),
            rules: DashMap::new(),
        }
    }

    async fn load_personas(
        &self,
        config: &HttpPhaseConfig,
    ) -> std::result::Result<Vec<Persona>, ProcessError> {
        if config.persona_ids.is_empty() {
            return Err(ProcessError::Fatal(Error::validation(
                "http_keyword_validation requires at least one persona",
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
            if !matches!(persona.config, PersonaConfig::Http(_)) {
                return Err(ProcessError::Fatal(Error::Validation(format!(
                    "persona {id} is not an HTTP persona"
                ))));
            }
            personas.push(persona);
        }
        Ok(personas)
    }

    /// Rules compiled once per campaign run and cached
    async fn compiled_rules(
        &self,
        campaign_id: Uuid,
        keyword_set_id: Uuid,
    ) -> std::result::Result<Arc<Vec<CompiledRule>>, ProcessError> {
        if let Some(rules) = self.rules.get(&campaign_id) {
            return Ok(rules.clone());
        }
        let set = self
            .store
            .get_keyword_set(keyword_set_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| {
                ProcessError::Fatal(Error::not_found(format_args!(
                    "keyword set {keyword_set_id}"
                )))
            })?;
        let compiled = Arc::new(compile_rules(&set.rules).map_err(ProcessError::Fatal)?);
        self.rules.insert(campaign_id, compiled.clone());
        Ok(compiled)
    }

    fn campaign_selectors(&self, campaign_id: Uuid, config: &HttpPhaseConfig) -> Arc<CampaignSelectors> {
        self.selectors
            .entry(campaign_id)
            .or_insert_with(|| {
                Arc::new(CampaignSelectors {
                    proxies: Arc::new(RotationState::new(
                        config.proxy_rotation,
                        config.proxy_rotation_interval_secs.map(Duration::from_secs),
                    )),
                    personas: Arc::new(RotationState::new(RotationStrategy::RoundRobin, None)),
                })
            })
            .clone()
    }
}

fn store_error(e: Error) -> ProcessError {
    if e.is_retriable() {
        ProcessError::Transient(e)
    } else {
        ProcessError::Fatal(e)
    }
}

fn probe_url(domain: &str, config: &HttpPhaseConfig) -> String {
    let scheme = if config.use_plain_http { "http" } else { "https" };
    match config.port {
        Some(port) => format!("{scheme}://{domain}:{port}/"),
        None => format!("{scheme}://{domain}/"),
    }
}

#[async_trait]
impl JobProcessor for HttpProcessor {
    fn phase(&self) -> Phase {
        Phase::HttpKeywordValidation
    }

    fn pool_name(&self) -> &'static str {
        "http"
    }

    fn rate_limit(&self, campaign: &Campaign) -> Option<u32> {
        campaign
            .phase_config::<HttpPhaseConfig>(Phase::HttpKeywordValidation)
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
        let config: HttpPhaseConfig = campaign
            .phase_config(Phase::HttpKeywordValidation)
            .map_err(ProcessError::Fatal)?
            .ok_or_else(|| {
                ProcessError::Fatal(Error::validation(
                    "http_keyword_validation is not configured",
                ))
            })?;
        let JobPayload::Domains { names } = &job.payload else {
            return Err(ProcessError::Fatal(Error::Internal(
                "http job carries an offset-range payload".to_string(),
            )));
        };

        let personas = self.load_personas(&config).await?;
        let rules = self
            .compiled_rules(campaign.id, config.keyword_set_id)
            .await?;
        let selectors = self.campaign_selectors(campaign.id, &config);

        // Health changes land on the next batch.
        let eligible: Vec<Proxy> = if config.use_proxies {
            self.proxies.list_healthy().await.map_err(store_error)?
        } else {
            Vec::new()
        };

        for name in names {
            if control.is_cancelled() {
                break;
            }
            control.throttle().await;

            let persona = selectors
                .personas
                .select(&personas, name, 0)
                .expect("personas verified non-empty");
            let PersonaConfig::Http(http_persona) = &persona.config else {
                continue;
            };

            let proxy = if !config.use_proxies {
                None
            } else {
                match selectors.proxies.select(&eligible, name, 0) {
                    Some(proxy) => Some(proxy),
                    None => {
                        // Proxy routing is on but nothing is eligible right now.
                        let row = HttpResult {
                            campaign_id: campaign.id,
                            domain_name: name.clone(),
                            persona_id: persona.id,
                            proxy_id: None,
                            status: ProbeStatus::Failed,
                            http_status: None,
                            final_url: None,
                            matched_keywords: Vec::new(),
                            body_truncated: false,
                            error_kind: Some(HttpErrorKind::ProxyError),
                            attempts: 0,
                            last_checked_at: Utc::now(),
                        };
                        self.store.upsert_http_result(row).await.map_err(store_error)?;
                        self.store
                            .bump_counters(
                                campaign.id,
                                Phase::HttpKeywordValidation,
                                CounterDelta::one(false),
                            )
                            .await
                            .map_err(store_error)?;
                        continue;
                    }
                }
            };

            let url = probe_url(name, &config);
            let outcome = self
                .client
                .fetch(FetchRequest {
                    url: &url,
                    persona: http_persona,
                    proxy,
                    body_cap: self.settings.body_cap_bytes,
                    cancel: control.cancel_token(),
                })
                .await;

            if control.is_cancelled() {
                break;
            }

            let row = match outcome {
                Ok(fetched) => {
                    let (matched, error_kind): (Vec<KeywordMatch>, Option<HttpErrorKind>) =
                        match std::str::from_utf8(&fetched.body) {
                            Ok(text) => {
                                let matched =
                                    extract_matches(&rules, text, self.settings.match_cap);
                                let error_kind =
                                    fetched.truncated.then_some(HttpErrorKind::BodyTooLarge);
                                (matched, error_kind)
                            }
                            Err(_) => (Vec::new(), Some(HttpErrorKind::DecodeError)),
                        };
                    HttpResult {
                        campaign_id: campaign.id,
                        domain_name: name.clone(),
                        persona_id: persona.id,
                        proxy_id: proxy.map(|p| p.id),
                        status: ProbeStatus::Ok,
                        http_status: Some(fetched.status),
                        final_url: Some(fetched.final_url),
                        matched_keywords: matched,
                        body_truncated: fetched.truncated,
                        error_kind,
                        attempts: 0,
                        last_checked_at: Utc::now(),
                    }
                }
                Err(probe_error) => HttpResult {
                    campaign_id: campaign.id,
                    domain_name: name.clone(),
                    persona_id: persona.id,
                    proxy_id: proxy.map(|p| p.id),
                    status: ProbeStatus::Failed,
                    http_status: None,
                    final_url: None,
                    matched_keywords: Vec::new(),
                    body_truncated: false,
                    error_kind: Some(probe_error.kind),
                    attempts: 0,
                    last_checked_at: Utc::now(),
                },
            };

            let succeeded = row.status == ProbeStatus::Ok;
            self.store.upsert_http_result(row).await.map_err(store_error)?;
            self.store
                .bump_counters(
                    campaign.id,
                    Phase::HttpKeywordValidation,
                    CounterDelta::one(succeeded),
                )
                .await
                .map_err(store_error)?;
        }

        self.store
            .reconcile_counters(campaign.id, Phase::HttpKeywordValidation)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
