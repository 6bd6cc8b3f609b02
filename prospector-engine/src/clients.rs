//! Injected transport collaborators
//!
//! The engine performs no network I/O of its own. DNS and HTTP probes go
//! through these traits, which production wires to the adapters in
//! [`crate::resolver`] and [`crate::fetch`] and tests wire to mocks.
//! Per-domain failures are *data*, not command errors: they come back as
//! probe error kinds and end up recorded on result rows.

use std::net::IpAddr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{
    DnsErrorKind, DnsPersonaConfig, HttpErrorKind, HttpPersonaConfig, IpPreference, Proxy,
};

/// A DNS probe failure destined for a result row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsProbeError {
    pub kind: DnsErrorKind,
    pub message: String,
}

impl DnsProbeError {
    pub fn new(kind: DnsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// An HTTP probe failure destined for a result row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProbeError {
    pub kind: HttpErrorKind,
    pub message: String,
}

impl HttpProbeError {
    pub fn new(kind: HttpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Successful HTTP fetch outcome
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub status: u16,
    /// URL after redirects
    pub final_url: String,
    /// Body bytes, truncated at the request's cap
    pub body: Vec<u8>,
    /// Whether the body exceeded the cap
    pub truncated: bool,
}

/// One HTTP probe request
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub persona: &'a HttpPersonaConfig,
    pub proxy: Option<&'a Proxy>,
    /// Bytes of body to retain before truncating
    pub body_cap: usize,
    /// Aborts the in-flight request when cancelled
    pub cancel: &'a CancellationToken,
}

/// Resolves domains under a DNS persona
#[async_trait]
pub trait DnsClient: Send + Sync {
    /// Resolve a single domain; one attempt, no internal retries
    async fn resolve(
        &self,
        domain: &str,
        persona: &DnsPersonaConfig,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<IpAddr>, DnsProbeError>;
}

/// Fetches URLs under an HTTP persona, optionally through a proxy
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform a single fetch honoring the persona's redirect policy and timeout
    async fn fetch(&self, request: FetchRequest<'_>)
        -> std::result::Result<HttpOutcome, HttpProbeError>;
}

/// Source of proxies eligible for selection
///
/// Health is maintained by an external checker; the engine only reads it.
#[async_trait]
pub trait ProxyRegistry: Send + Sync {
    /// Proxies with `enabled && healthy`
    async fn list_healthy(&self) -> Result<Vec<Proxy>>;
}

/// [`ProxyRegistry`] over the engine store's proxy table
pub struct StoreProxyRegistry {
    store: std::sync::Arc<dyn crate::store::EngineStore>,
}

impl StoreProxyRegistry {
    pub fn new(store: std::sync::Arc<dyn crate::store::EngineStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProxyRegistry for StoreProxyRegistry {
    async fn list_healthy(&self) -> Result<Vec<Proxy>> {
        Ok(self
            .store
            .list_proxies()
            .await?
            .into_iter()
            .filter(Proxy::is_eligible)
            .collect())
    }
}

/// Filter resolved addresses by the persona's address family preference
pub fn apply_ip_preference(addresses: Vec<IpAddr>, preference: IpPreference) -> Vec<IpAddr> {
    match preference {
        IpPreference::Both => addresses,
        IpPreference::Ipv4Only => addresses.into_iter().filter(IpAddr::is_ipv4).collect(),
        IpPreference::Ipv6Only => addresses.into_iter().filter(IpAddr::is_ipv6).collect(),
    }
}

/// DNS adapter backed by the operating system resolver
///
/// Ignores the persona's resolver list (the system resolver cannot be
/// redirected per lookup); honors its timeout and address family preference.
/// Used as the default when the `resolver` feature is off.
#[derive(Debug, Default, Clone)]
pub struct SystemDnsClient;

#[async_trait]
impl DnsClient for SystemDnsClient {
    async fn resolve(
        &self,
        domain: &str,
        persona: &DnsPersonaConfig,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<IpAddr>, DnsProbeError> {
        let timeout = std::time::Duration::from_millis(persona.timeout_ms);
        let lookup = tokio::net::lookup_host((domain.to_string(), 0u16));

        let resolved = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                return Err(DnsProbeError::new(DnsErrorKind::Other, "resolve cancelled"));
            }
            outcome = tokio::time::timeout(timeout, lookup) => match outcome {
                Err(_) => return Err(DnsProbeError::new(DnsErrorKind::Timeout, "resolve timed out")),
                Ok(Err(e)) => return Err(classify_lookup_error(&e)),
                Ok(Ok(addrs)) => addrs,
            },
        };

        let addresses: Vec<IpAddr> = resolved.map(|sa| sa.ip()).collect();
        let addresses = apply_ip_preference(addresses, persona.ip_preference);
        if addresses.is_empty() {
            return Err(DnsProbeError::new(
                DnsErrorKind::Noanswer,
                "no addresses for preferred family",
            ));
        }
        Ok(addresses)
    }
}

fn classify_lookup_error(err: &std::io::Error) -> DnsProbeError {
    let message = err.to_string();
    if err.kind() == std::io::ErrorKind::TimedOut {
        return DnsProbeError::new(DnsErrorKind::Timeout, message);
    }
    // getaddrinfo reports NXDOMAIN as a lookup failure message rather than a
    // dedicated error kind.
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("name or service not known")
        || lowered.contains("no such host")
        || lowered.contains("nodename nor servname")
    {
        DnsProbeError::new(DnsErrorKind::Nxdomain, message)
    } else {
        DnsProbeError::new(DnsErrorKind::Transport, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_ip_preference_filters() {
        let addrs = vec![
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ];
        assert_eq!(apply_ip_preference(addrs.clone(), IpPreference::Both).len(), 2);
        let v4 = apply_ip_preference(addrs.clone(), IpPreference::Ipv4Only);
        assert_eq!(v4, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        let v6 = apply_ip_preference(addrs, IpPreference::Ipv6Only);
        assert_eq!(v6, vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]);
    }

    #[test]
    fn test_classify_lookup_error() {
        let nx = std::io::Error::other("failed to lookup address information: Name or service not known");
        assert_eq!(classify_lookup_error(&nx).kind, DnsErrorKind::Nxdomain);

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert_eq!(classify_lookup_error(&timeout).kind, DnsErrorKind::Timeout);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify_lookup_error(&refused).kind, DnsErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_system_client_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let persona = DnsPersonaConfig {
            resolvers: vec![],
            timeout_ms: 1_000,
            retry: Default::default(),
            ip_preference: IpPreference::Both,
        };
        let err = SystemDnsClient
            .resolve("example.invalid", &persona, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, DnsErrorKind::Other);
    }
}
