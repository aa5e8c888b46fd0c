use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::proxy::ProxyConfig;

/// What a single reachability check concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Wall-clock from request start to response headers.
    Success { elapsed: Duration },
    Timeout,
    Failed { reason: String },
    Cancelled,
}

/// Drives one canonical request through the child's local inbound.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(
        &self,
        cfg: &ProxyConfig,
        local_port: u16,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeOutcome;
}

/// Fetches the reachability URL through the loopback proxy endpoint.
pub struct HttpProbe {
    target_url: String,
}

impl HttpProbe {
    pub fn new(target_url: impl Into<String>) -> Self {
        HttpProbe {
            target_url: target_url.into(),
        }
    }

    fn client_for(&self, cfg: &ProxyConfig, local_port: u16) -> Result<reqwest::Client, String> {
        let proxy_url = format!(
            "{}://127.0.0.1:{}",
            cfg.protocol.inbound_scheme(),
            local_port
        );
        let proxy = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| format!("bad proxy endpoint {proxy_url}: {e}"))?;
        reqwest::Client::builder()
            .proxy(proxy)
            .build()
            .map_err(|e| format!("client build failed: {e}"))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(
        &self,
        cfg: &ProxyConfig,
        local_port: u16,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        let client = match self.client_for(cfg, local_port) {
            Ok(client) => client,
            Err(reason) => return ProbeOutcome::Failed { reason },
        };

        trace!(node = %cfg.display_name(), port = local_port, "probing");
        let start = Instant::now();
        let request = client.get(&self.target_url).send();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => ProbeOutcome::Cancelled,
            result = tokio::time::timeout(timeout, request) => match result {
                Err(_) => ProbeOutcome::Timeout,
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() || status.is_redirection() {
                        ProbeOutcome::Success {
                            elapsed: start.elapsed(),
                        }
                    } else {
                        ProbeOutcome::Failed {
                            reason: format!("unexpected status {status}"),
                        }
                    }
                }
                Ok(Err(e)) if e.is_timeout() => ProbeOutcome::Timeout,
                Ok(Err(e)) => ProbeOutcome::Failed {
                    reason: format!("request failed: {e}"),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Protocol;

    fn socks_config() -> ProxyConfig {
        ProxyConfig {
            protocol: Protocol::Vmess,
            server: "example.com".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_zero_timeout_classifies_as_timeout() {
        let probe = HttpProbe::new("http://www.gstatic.com/generate_204");
        let cancel = CancellationToken::new();
        let outcome = probe
            .probe(&socks_config(), 18999, Duration::ZERO, &cancel)
            .await;
        assert_eq!(outcome, ProbeOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_dead_endpoint_is_probe_failure() {
        // Nothing listens on the port, so SOCKS negotiation cannot start.
        let probe = HttpProbe::new("http://www.gstatic.com/generate_204");
        let cancel = CancellationToken::new();
        let outcome = probe
            .probe(&socks_config(), 18998, Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(outcome, ProbeOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_wins() {
        let probe = HttpProbe::new("http://www.gstatic.com/generate_204");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = probe
            .probe(&socks_config(), 18997, Duration::from_secs(5), &cancel)
            .await;
        assert_eq!(outcome, ProbeOutcome::Cancelled);
    }
}
