//! Core entity types persisted and exchanged by the engine

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pattern::PatternSpec;

/// Pipeline phase a campaign is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Generation,
    DnsValidation,
    HttpKeywordValidation,
    Analysis,
}

impl Phase {
    /// All phases in pipeline order
    pub const ALL: [Phase; 4] = [
        Phase::Generation,
        Phase::DnsValidation,
        Phase::HttpKeywordValidation,
        Phase::Analysis,
    ];

    /// The phase that follows this one, if any
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Generation => Some(Phase::DnsValidation),
            Phase::DnsValidation => Some(Phase::HttpKeywordValidation),
            Phase::HttpKeywordValidation => Some(Phase::Analysis),
            Phase::Analysis => None,
        }
    }

    /// Snake-case name used in metadata keys and event payloads
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Generation => "generation",
            Phase::DnsValidation => "dns_validation",
            Phase::HttpKeywordValidation => "http_keyword_validation",
            Phase::Analysis => "analysis",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Ready,
    Configured,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PhaseStatus {
    /// Terminal statuses admit no further transitions except `retry` on `failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Snake-case name used in event payloads
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Ready => "ready",
            Self::Configured => "configured",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-phase progress counters
///
/// Reconciled against row counts after each batch commit; at quiescence they
/// equal the cardinalities they describe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounters {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Atomic increment applied to [`PhaseCounters`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterDelta {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl CounterDelta {
    /// Delta recording one processed item with the given outcome
    pub fn one(succeeded: bool) -> Self {
        Self {
            processed: 1,
            succeeded: u64::from(succeeded),
            failed: u64::from(!succeeded),
        }
    }
}

/// Bulk aggregate summary stored once a phase completes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseAggregate {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Optional result payload pointers, one per pipeline phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<PhaseAggregate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<PhaseAggregate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<PhaseAggregate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<PhaseAggregate>,
}

impl CampaignResults {
    /// Mutable slot for the given phase
    pub fn slot_mut(&mut self, phase: Phase) -> &mut Option<PhaseAggregate> {
        match phase {
            Phase::Generation => &mut self.generated,
            Phase::DnsValidation => &mut self.dns,
            Phase::HttpKeywordValidation => &mut self.http,
            Phase::Analysis => &mut self.analysis,
        }
    }
}

/// One operator-initiated run of the full pipeline over one pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,

    /// Owning user; ownership never changes
    pub owner_id: String,

    /// Display name
    pub name: String,

    pub current_phase: Phase,
    pub phase_status: PhaseStatus,

    /// Optimistic-concurrency version, bumped on every state mutation
    pub version: i64,

    /// Pattern the campaign enumerates
    pub pattern: PatternSpec,

    /// Fingerprint of `pattern`, identifying the shared offset state
    pub fingerprint: String,

    /// Number of domains the operator asked to generate
    pub requested_count: u64,

    /// Per-phase progress counters
    #[serde(default)]
    pub counters: BTreeMap<Phase, PhaseCounters>,

    /// Bulk aggregates for completed phases
    #[serde(default)]
    pub results: CampaignResults,

    /// Free-form metadata; phase configs live under `{phase}_config` keys
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Most recent fatal error for the current phase, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Counters for the given phase, zero if never started
    pub fn phase_counters(&self, phase: Phase) -> PhaseCounters {
        self.counters.get(&phase).copied().unwrap_or_default()
    }

    /// Typed phase config stored in metadata, if present
    pub fn phase_config<T: serde::de::DeserializeOwned>(
        &self,
        phase: Phase,
    ) -> crate::error::Result<Option<T>> {
        let key = format!("{phase}_config");
        match self.metadata.get(&key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// Inputs for creating a campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub owner_id: String,
    pub pattern: PatternSpec,
    pub requested_count: u64,
}

/// Field-wise patch applied under an optimistic version check
#[derive(Debug, Clone, Default)]
pub struct CampaignPatch {
    pub current_phase: Option<Phase>,
    pub phase_status: Option<PhaseStatus>,
    /// Metadata keys to insert or replace
    pub metadata: Vec<(String, serde_json::Value)>,
    /// `Some(None)` clears the error, `Some(Some(_))` sets it
    pub last_error: Option<Option<String>>,
    pub results: Option<CampaignResults>,
}

/// A domain produced by the generator; immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedDomain {
    pub campaign_id: Uuid,

    /// Position in the pattern's global enumeration
    pub global_offset: u64,

    pub domain_name: String,

    pub created_at: DateTime<Utc>,
}

/// Success/failure marker on a recorded probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Ok,
    Failed,
}

/// Recorded outcome of resolving one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsResult {
    pub campaign_id: Uuid,
    pub domain_name: String,
    pub persona_id: Uuid,
    pub status: ProbeStatus,
    #[serde(default)]
    pub resolved_addresses: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<DnsErrorKind>,
    /// Write attempts for this key; bumped by the idempotent upsert
    #[serde(default)]
    pub attempts: u32,
    pub last_checked_at: DateTime<Utc>,
}

/// Failure taxonomy for DNS probes
///
/// Only `timeout`, `refused`, `servfail`, and `transport` are retried through
/// the persona retry profile; the rest are terminal results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsErrorKind {
    Nxdomain,
    Noanswer,
    Timeout,
    Refused,
    Servfail,
    Transport,
    Other,
}

impl DnsErrorKind {
    /// Whether the persona retry profile applies
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Refused | Self::Servfail | Self::Transport
        )
    }
}

/// Recorded outcome of fetching one domain over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResult {
    pub campaign_id: Uuid,
    pub domain_name: String,
    pub persona_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<Uuid>,
    pub status: ProbeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(default)]
    pub matched_keywords: Vec<KeywordMatch>,
    /// Body exceeded the size cap and was truncated before matching
    #[serde(default)]
    pub body_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<HttpErrorKind>,
    #[serde(default)]
    pub attempts: u32,
    pub last_checked_at: DateTime<Utc>,
}

/// Failure taxonomy for HTTP probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpErrorKind {
    Timeout,
    Refused,
    Transport,
    TlsError,
    ProxyError,
    BodyTooLarge,
    DecodeError,
    Other,
}

/// One keyword rule hit recorded on an [`HttpResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordMatch {
    /// The rule pattern that matched
    pub pattern: String,
    /// The exact text that matched
    pub matched_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Context windows around each occurrence
    #[serde(default)]
    pub contexts: Vec<String>,
}

/// A lead extracted by the analysis phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub campaign_id: Uuid,
    pub domain_name: String,
    /// Distinct rule categories that matched on the domain
    pub categories: Vec<String>,
    /// Number of distinct rules that matched
    pub score: u32,
    pub created_at: DateTime<Utc>,
}

/// Whether a persona drives DNS or HTTP probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaKind {
    Dns,
    Http,
}

/// Address family preference for resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpPreference {
    #[default]
    Both,
    Ipv4Only,
    Ipv6Only,
}

/// Per-domain retry profile applied inside a probe attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryProfile {
    /// Attempts including the first; at least 1
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    250
}

impl Default for RetryProfile {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

/// How a DNS persona performs resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsPersonaConfig {
    /// Resolver addresses, tried in order
    pub resolvers: Vec<std::net::SocketAddr>,
    #[serde(default = "default_dns_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryProfile,
    #[serde(default)]
    pub ip_preference: IpPreference,
}

fn default_dns_timeout_ms() -> u64 {
    3_000
}

/// How an HTTP persona performs requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpPersonaConfig {
    pub user_agent: String,
    /// Extra request headers in send order
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_http_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
}

fn default_http_timeout_ms() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

fn default_max_redirects() -> u32 {
    5
}

/// Persona-specific configuration payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersonaConfig {
    Dns(DnsPersonaConfig),
    Http(HttpPersonaConfig),
}

/// Named profile for how DNS or HTTP probing is performed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: Uuid,
    pub name: String,
    pub config: PersonaConfig,
    pub created_at: DateTime<Utc>,
}

impl Persona {
    /// Probe kind this persona drives
    pub fn kind(&self) -> PersonaKind {
        match self.config {
            PersonaConfig::Dns(_) => PersonaKind::Dns,
            PersonaConfig::Http(_) => PersonaKind::Http,
        }
    }
}

/// Proxy transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    /// URL scheme used when building the proxy URL
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
        }
    }
}

/// Optional proxy credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

/// An upstream proxy; health is maintained by an external checker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: Uuid,
    pub protocol: ProxyProtocol,
    /// `host:port`
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ProxyCredentials>,
    pub enabled: bool,
    pub healthy: bool,
}

impl Proxy {
    /// Eligible for selection
    pub fn is_eligible(&self) -> bool {
        self.enabled && self.healthy
    }

    /// Full proxy URL including credentials when present
    pub fn url(&self) -> String {
        match &self.credentials {
            Some(c) => format!(
                "{}://{}:{}@{}",
                self.protocol.scheme(),
                c.username,
                c.password,
                self.address
            ),
            None => format!("{}://{}", self.protocol.scheme(), self.address),
        }
    }
}

/// Matching mode of a keyword rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    String,
    Regex,
}

/// One rule in a keyword set; applied in declared order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub pattern: String,
    pub kind: RuleKind,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Characters of context captured around each match
    #[serde(default)]
    pub context_chars: u32,
}

/// Ordered collection of keyword rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSet {
    pub id: Uuid,
    pub name: String,
    pub rules: Vec<KeywordRule>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record of an operator or engine action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub action: String,
    pub entity_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    #[serde(default)]
    pub details: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Work item payload carried by a queued job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Half-open offset range into the campaign's enumeration
    OffsetRange { start: u64, end: u64 },
    /// Explicit batch of domain names
    Domains { names: Vec<String> },
}

impl JobPayload {
    /// Number of items the payload covers
    pub fn len(&self) -> usize {
        match self {
            Self::OffsetRange { start, end } => (end - start) as usize,
            Self::Domains { names } => names.len(),
        }
    }

    /// Whether the payload covers no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A queued unit of phase work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub phase: Phase,
    pub payload: JobPayload,
    pub priority: i32,
    pub visible_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Inputs for enqueueing a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub campaign_id: Uuid,
    pub phase: Phase,
    pub payload: JobPayload,
    pub priority: i32,
}

/// Selection strategy for proxies and personas
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastRecentlyUsed,
    StickyByDomainHash,
}

/// Operator configuration for the generation phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Hard throttle on offsets consumed per minute; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_speed_per_minute: Option<u32>,
    /// Fail the phase after this long in progress; no default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_timeout_secs: Option<u64>,
}

/// Operator configuration for the DNS validation phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsPhaseConfig {
    /// DNS personas to rotate through; must be non-empty
    pub persona_ids: Vec<Uuid>,
    #[serde(default)]
    pub rotation: RotationStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_speed_per_minute: Option<u32>,
    /// Fail the phase after this long in progress; no default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_timeout_secs: Option<u64>,
}

/// Operator configuration for the HTTP keyword validation phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpPhaseConfig {
    /// HTTP personas to rotate through; must be non-empty
    pub persona_ids: Vec<Uuid>,
    /// Keyword set evaluated against response bodies
    pub keyword_set_id: Uuid,
    /// Route requests through the proxy pool; off means direct probing
    #[serde(default)]
    pub use_proxies: bool,
    #[serde(default)]
    pub proxy_rotation: RotationStrategy,
    /// Pin one proxy per worker for this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_rotation_interval_secs: Option<u64>,
    /// Probe plain HTTP instead of HTTPS
    #[serde(default)]
    pub use_plain_http: bool,
    /// Non-default port, when probing off 80/443
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_speed_per_minute: Option<u32>,
    /// Fail the phase after this long in progress; no default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_timeout_secs: Option<u64>,
}

/// Operator configuration for the analysis phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisPhaseConfig {
    /// Keep only leads with at least this many distinct rule matches
    #[serde(default = "default_min_score")]
    pub min_score: u32,
    /// Fail the phase after this long in progress; no default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_timeout_secs: Option<u64>,
}

impl Default for AnalysisPhaseConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            phase_timeout_secs: None,
        }
    }
}

fn default_min_score() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        assert_eq!(Phase::Generation.next(), Some(Phase::DnsValidation));
        assert_eq!(Phase::DnsValidation.next(), Some(Phase::HttpKeywordValidation));
        assert_eq!(Phase::HttpKeywordValidation.next(), Some(Phase::Analysis));
        assert_eq!(Phase::Analysis.next(), None);
    }

    #[test]
    fn test_phase_serde_names() {
        assert_eq!(
            serde_json::to_string(&Phase::HttpKeywordValidation).unwrap(),
            "\"http_keyword_validation\""
        );
        assert_eq!(
            serde_json::from_str::<PhaseStatus>("\"in_progress\"").unwrap(),
            PhaseStatus::InProgress
        );
    }

    #[test]
    fn test_dns_error_retriability() {
        assert!(DnsErrorKind::Timeout.is_retriable());
        assert!(DnsErrorKind::Refused.is_retriable());
        assert!(DnsErrorKind::Servfail.is_retriable());
        assert!(DnsErrorKind::Transport.is_retriable());
        assert!(!DnsErrorKind::Nxdomain.is_retriable());
        assert!(!DnsErrorKind::Noanswer.is_retriable());
        assert!(!DnsErrorKind::Other.is_retriable());
    }

    #[test]
    fn test_proxy_url() {
        let mut proxy = Proxy {
            id: Uuid::new_v4(),
            protocol: ProxyProtocol::Socks5,
            address: "10.0.0.9:1080".to_string(),
            credentials: None,
            enabled: true,
            healthy: true,
        };
        assert_eq!(proxy.url(), "socks5://10.0.0.9:1080");

        proxy.credentials = Some(ProxyCredentials {
            username: "u".into(),
            password: "p".into(),
        });
        assert_eq!(proxy.url(), "socks5://u:p@10.0.0.9:1080");
    }

    #[test]
    fn test_proxy_eligibility() {
        let mut proxy = Proxy {
            id: Uuid::new_v4(),
            protocol: ProxyProtocol::Http,
            address: "h:1".into(),
            credentials: None,
            enabled: true,
            healthy: true,
        };
        assert!(proxy.is_eligible());
        proxy.healthy = false;
        assert!(!proxy.is_eligible());
        proxy.healthy = true;
        proxy.enabled = false;
        assert!(!proxy.is_eligible());
    }

    #[test]
    fn test_job_payload_len() {
        let range = JobPayload::OffsetRange { start: 10, end: 25 };
        assert_eq!(range.len(), 15);
        let names = JobPayload::Domains {
            names: vec!["a.com".into(), "b.com".into()],
        };
        assert_eq!(names.len(), 2);
        assert!(!names.is_empty());
    }

    #[test]
    fn test_counter_delta_one() {
        let ok = CounterDelta::one(true);
        assert_eq!((ok.processed, ok.succeeded, ok.failed), (1, 1, 0));
        let bad = CounterDelta::one(false);
        assert_eq!((bad.processed, bad.succeeded, bad.failed), (1, 0, 1));
    }

    #[test]
    fn test_phase_config_round_trip() {
        let cfg = DnsPhaseConfig {
            persona_ids: vec![Uuid::new_v4()],
            rotation: RotationStrategy::StickyByDomainHash,
            processing_speed_per_minute: Some(600),
            phase_timeout_secs: None,
        };
        let value = serde_json::to_value(&cfg).unwrap();
        let back: DnsPhaseConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, cfg);
    }
}
