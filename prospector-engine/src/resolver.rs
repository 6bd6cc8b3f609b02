//! DNS probe adapter backed by hickory-resolver
//!
//! Builds a resolver per persona so each campaign phase can point at its own
//! resolver set with its own timeout and address family preference.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;
use tokio_util::sync::CancellationToken;

use crate::clients::{DnsClient, DnsProbeError};
use crate::model::{DnsErrorKind, DnsPersonaConfig, IpPreference};

/// Production [`DnsClient`] using hickory-resolver
#[derive(Debug, Default, Clone)]
pub struct HickoryDnsClient;

impl HickoryDnsClient {
    pub fn new() -> Self {
        Self
    }

    fn build_resolver(persona: &DnsPersonaConfig) -> TokioAsyncResolver {
        let config = if persona.resolvers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut config = ResolverConfig::new();
            for addr in &persona.resolvers {
                config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
            }
            config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_millis(persona.timeout_ms);
        // The persona retry profile owns retries; one transport attempt each.
        opts.attempts = 1;
        opts.ip_strategy = ip_strategy(persona.ip_preference);

        TokioAsyncResolver::tokio(config, opts)
    }
}

fn ip_strategy(preference: IpPreference) -> LookupIpStrategy {
    match preference {
        IpPreference::Both => LookupIpStrategy::Ipv4AndIpv6,
        IpPreference::Ipv4Only => LookupIpStrategy::Ipv4Only,
        IpPreference::Ipv6Only => LookupIpStrategy::Ipv6Only,
    }
}

fn classify_resolve_error(err: &ResolveError) -> DnsProbeError {
    let message = err.to_string();
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => match response_code {
            ResponseCode::NXDomain => DnsProbeError::new(DnsErrorKind::Nxdomain, message),
            ResponseCode::ServFail => DnsProbeError::new(DnsErrorKind::Servfail, message),
            ResponseCode::Refused => DnsProbeError::new(DnsErrorKind::Refused, message),
            ResponseCode::NoError => DnsProbeError::new(DnsErrorKind::Noanswer, message),
            _ => DnsProbeError::new(DnsErrorKind::Other, message),
        },
        ResolveErrorKind::Timeout => DnsProbeError::new(DnsErrorKind::Timeout, message),
        ResolveErrorKind::Io(_) | ResolveErrorKind::Proto(_) => {
            DnsProbeError::new(DnsErrorKind::Transport, message)
        }
        _ => DnsProbeError::new(DnsErrorKind::Other, message),
    }
}

#[async_trait]
impl DnsClient for HickoryDnsClient {
    async fn resolve(
        &self,
        domain: &str,
        persona: &DnsPersonaConfig,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<IpAddr>, DnsProbeError> {
        let resolver = Self::build_resolver(persona);

        let lookup = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                return Err(DnsProbeError::new(DnsErrorKind::Other, "resolve cancelled"));
            }
            outcome = resolver.lookup_ip(domain) => {
                outcome.map_err(|e| classify_resolve_error(&e))?
            }
        };

        let addresses: Vec<IpAddr> = lookup.iter().collect();
        if addresses.is_empty() {
            return Err(DnsProbeError::new(DnsErrorKind::Noanswer, "empty answer"));
        }
        Ok(addresses)
    }
}
