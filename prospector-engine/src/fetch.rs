//! HTTP probe adapter backed by reqwest
//!
//! Builds one client per fetch because the proxy and redirect policy are part
//! of the (persona, proxy) pair and change per attempt. Bodies are streamed
//! through the caller's size cap so an adversarial endpoint cannot balloon
//! memory; over-cap bodies are truncated and flagged, not failed.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

use crate::clients::{FetchRequest, HttpClient, HttpOutcome, HttpProbeError};
use crate::model::HttpErrorKind;

/// Production [`HttpClient`] using reqwest with rustls
#[derive(Debug, Default, Clone)]
pub struct ReqwestHttpClient;

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self
    }

    fn build_client(
        &self,
        request: &FetchRequest<'_>,
    ) -> std::result::Result<reqwest::Client, HttpProbeError> {
        let persona = request.persona;
        let redirect = if persona.follow_redirects {
            reqwest::redirect::Policy::limited(persona.max_redirects as usize)
        } else {
            reqwest::redirect::Policy::none()
        };

        let mut builder = reqwest::Client::builder()
            .user_agent(persona.user_agent.clone())
            .redirect(redirect)
            .timeout(Duration::from_millis(persona.request_timeout_ms));

        if let Some(proxy) = request.proxy {
            let proxy = reqwest::Proxy::all(proxy.url()).map_err(|e| {
                HttpProbeError::new(HttpErrorKind::ProxyError, format!("invalid proxy: {e}"))
            })?;
            builder = builder.proxy(proxy);
        }

        builder.build().map_err(|e| {
            HttpProbeError::new(HttpErrorKind::Other, format!("client build failed: {e}"))
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn fetch(
        &self,
        request: FetchRequest<'_>,
    ) -> std::result::Result<HttpOutcome, HttpProbeError> {
        let client = self.build_client(&request)?;
        let behind_proxy = request.proxy.is_some();

        let mut req = client.get(request.url);
        for (name, value) in &request.persona.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let response = tokio::select! {
            biased;

            () = request.cancel.cancelled() => {
                return Err(HttpProbeError::new(HttpErrorKind::Other, "fetch cancelled"));
            }
            outcome = req.send() => {
                outcome.map_err(|e| classify_reqwest_error(&e, behind_proxy))?
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut body = Vec::new();
        let mut truncated = false;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;

                () = request.cancel.cancelled() => {
                    return Err(HttpProbeError::new(HttpErrorKind::Other, "fetch cancelled"));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| classify_reqwest_error(&e, behind_proxy))?;
            let remaining = request.body_cap.saturating_sub(body.len());
            if chunk.len() > remaining {
                body.extend_from_slice(&chunk[..remaining]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpOutcome {
            status,
            final_url,
            body,
            truncated,
        })
    }
}

fn classify_reqwest_error(err: &reqwest::Error, behind_proxy: bool) -> HttpProbeError {
    let message = err.to_string();

    if err.is_timeout() {
        return HttpProbeError::new(HttpErrorKind::Timeout, message);
    }

    // Walk the source chain for TLS and refused-connection signals; reqwest
    // folds both into opaque connect errors.
    let mut tls = false;
    let mut refused = false;
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(inner) = source {
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("handshake") {
            tls = true;
        }
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                refused = true;
            }
        }
        source = inner.source();
    }

    if tls {
        return HttpProbeError::new(HttpErrorKind::TlsError, message);
    }
    if err.is_connect() {
        if behind_proxy {
            return HttpProbeError::new(HttpErrorKind::ProxyError, message);
        }
        if refused {
            return HttpProbeError::new(HttpErrorKind::Refused, message);
        }
        return HttpProbeError::new(HttpErrorKind::Transport, message);
    }
    if err.is_body() || err.is_decode() {
        return HttpProbeError::new(HttpErrorKind::Transport, message);
    }
    HttpProbeError::new(HttpErrorKind::Other, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HttpPersonaConfig;
    use tokio_util::sync::CancellationToken;

    fn persona() -> HttpPersonaConfig {
        HttpPersonaConfig {
            user_agent: "prospector-test/1.0".to_string(),
            headers: vec![("accept".to_string(), "text/html".to_string())],
            request_timeout_ms: 2_000,
            follow_redirects: true,
            max_redirects: 3,
        }
    }

    #[tokio::test]
    async fn test_client_builds_without_proxy() {
        let persona = persona();
        let cancel = CancellationToken::new();
        let request = FetchRequest {
            url: "https://example.com/",
            persona: &persona,
            proxy: None,
            body_cap: 1024,
            cancel: &cancel,
        };
        assert!(ReqwestHttpClient::new().build_client(&request).is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_short_circuits() {
        let persona = persona();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = FetchRequest {
            url: "https://example.invalid/",
            persona: &persona,
            proxy: None,
            body_cap: 1024,
            cancel: &cancel,
        };
        let err = ReqwestHttpClient::new().fetch(request).await.unwrap_err();
        assert_eq!(err.kind, HttpErrorKind::Other);
        assert!(err.message.contains("cancelled"));
    }
}
