use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbound protocol of a candidate node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Socks,
    Http,
}

impl Protocol {
    /// Scheme of the local inbound the probe connects through.
    pub fn inbound_scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            _ => "socks5",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Socks => "socks",
            Protocol::Http => "http",
        }
    }
}

/// Normalized description of one proxy endpoint to be tested.
///
/// Subscription sources are sloppy about numeric fields, so `port` and
/// `alterId` accept either a number or a string and are read through
/// the accessor methods.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub tag: String,
    #[serde(default, rename = "type")]
    pub protocol: Protocol,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub port: serde_json::Value,
    #[serde(default)]
    pub uuid: String,
    #[serde(default, rename = "alterId")]
    pub alter_id: serde_json::Value,
    #[serde(default)]
    pub cipher: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub tls: String,
    #[serde(default)]
    pub sni: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub flow: String,
    /// Loopback port leased for this test run. Filled in by the tester
    /// right before launch; never taken from input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

impl ProxyConfig {
    /// Get the remote port as u16
    pub fn get_port(&self) -> u16 {
        match &self.port {
            serde_json::Value::Number(n) => n.as_u64().unwrap_or(443) as u16,
            serde_json::Value::String(s) => s.parse().unwrap_or(443),
            _ => 443,
        }
    }

    /// Get the alterId as u32
    pub fn get_alter_id(&self) -> u32 {
        match &self.alter_id {
            serde_json::Value::Number(n) => n.as_u64().unwrap_or(0) as u32,
            serde_json::Value::String(s) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Encryption method for shadowsocks, whichever field the source used.
    pub fn get_method(&self) -> &str {
        if !self.method.is_empty() {
            &self.method
        } else {
            &self.cipher
        }
    }

    /// Display name (tag or server:port if tag is empty)
    pub fn display_name(&self) -> String {
        if self.tag.is_empty() {
            format!("{}:{}", self.server, self.get_port())
        } else {
            self.tag.clone()
        }
    }
}

/// Classified outcome of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Success,
    Failure,
    Timeout,
    PortConflict,
    ResourceExhausted,
    LaunchFailed,
    ProbeFailed,
    Cancelled,
}

impl TestResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TestResult::Success)
    }
}

/// One record of the per-batch result array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResultData {
    pub config: ProxyConfig,
    pub result: TestResult,
    #[serde(default)]
    pub message: String,
    /// Seconds from probe start to the first response bytes. Zero for
    /// every non-success outcome.
    pub response_time: f64,
    pub batch_id: u64,
    pub started_at: DateTime<Utc>,
}

impl TestResultData {
    pub fn new(
        config: ProxyConfig,
        batch_id: u64,
        started_at: DateTime<Utc>,
        result: TestResult,
        message: impl Into<String>,
    ) -> Self {
        Self {
            config,
            result,
            message: message.into(),
            response_time: 0.0,
            batch_id,
            started_at,
        }
    }

    pub fn success(
        config: ProxyConfig,
        batch_id: u64,
        started_at: DateTime<Utc>,
        response_time: f64,
    ) -> Self {
        Self {
            config,
            result: TestResult::Success,
            message: String::new(),
            response_time,
            batch_id,
            started_at,
        }
    }

    /// Rewrite this record as a cancellation, keeping the config.
    pub fn into_cancelled(mut self, message: &str) -> Self {
        self.result = TestResult::Cancelled;
        self.message = message.to_string();
        self.response_time = 0.0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_with_string_port() {
        let json = r#"{"tag":"Node A","type":"vmess","server":"a.example.com","port":"443","uuid":"uuid-1","alterId":"0","network":"ws","tls":"tls","path":"/ws"}"#;
        let cfg: ProxyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.protocol, Protocol::Vmess);
        assert_eq!(cfg.get_port(), 443);
        assert_eq!(cfg.get_alter_id(), 0);
        assert_eq!(cfg.display_name(), "Node A");
    }

    #[test]
    fn test_parse_record_with_numeric_port() {
        let json = r#"{"type":"trojan","server":"t.example.com","port":8443,"password":"pw"}"#;
        let cfg: ProxyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.protocol, Protocol::Trojan);
        assert_eq!(cfg.get_port(), 8443);
        assert_eq!(cfg.display_name(), "t.example.com:8443");
    }

    #[test]
    fn test_protocol_round_trip() {
        let json = serde_json::to_string(&Protocol::Shadowsocks).unwrap();
        assert_eq!(json, "\"shadowsocks\"");
        let back: Protocol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Protocol::Shadowsocks);
    }

    #[test]
    fn test_result_serializes_snake_case() {
        let json = serde_json::to_string(&TestResult::PortConflict).unwrap();
        assert_eq!(json, "\"port_conflict\"");
        let json = serde_json::to_string(&TestResult::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource_exhausted\"");
    }

    #[test]
    fn test_local_port_omitted_until_set() {
        let cfg = ProxyConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("local_port"));

        let mut cfg = cfg;
        cfg.local_port = Some(12000);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"local_port\":12000"));
    }

    #[test]
    fn test_method_falls_back_to_cipher() {
        let cfg = ProxyConfig {
            cipher: "aes-256-gcm".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.get_method(), "aes-256-gcm");
    }
}
