use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::Metrics;
use crate::proxy::{Protocol, ProxyConfig};

/// Readiness polling: 20 x 100ms before the launch is written off.
const READY_ATTEMPTS: u32 = 20;
const READY_POLL: Duration = Duration::from_millis(100);
/// How long a child gets between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_millis(500);
/// Retained child output, newest bytes win.
const OUTPUT_TAIL_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to write core config {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to spawn {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },
    #[error("core never accepted connections on 127.0.0.1:{port}{detail}")]
    NotReady { port: u16, detail: String },
    #[error("launch interrupted by shutdown")]
    Interrupted,
}

/// A supervised proxy-core child owned by exactly one test task.
#[async_trait]
pub trait CoreProcess: Send {
    fn pid(&self) -> Option<u32>;
    /// Newest chunk of the child's combined stdout/stderr.
    fn output_tail(&self) -> String;
    /// Terminate and clean up. Safe to call twice.
    async fn stop(&mut self);
}

/// Launches one proxy-core process per candidate config.
#[async_trait]
pub trait CoreLauncher: Send + Sync {
    async fn launch(
        &self,
        cfg: &ProxyConfig,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn CoreProcess>, LaunchError>;
}

/// Generate the xray config for testing one node through a local inbound
pub fn generate_config(cfg: &ProxyConfig, local_port: u16) -> serde_json::Value {
    let inbound_protocol = match cfg.protocol {
        Protocol::Http => "http",
        _ => "socks",
    };

    // Build stream settings based on network type
    let network = if cfg.network.is_empty() {
        "tcp"
    } else {
        &cfg.network
    };
    let mut stream_settings = json!({ "network": network });

    if network == "ws" {
        let mut ws_settings = json!({});
        if !cfg.path.is_empty() {
            ws_settings["path"] = json!(cfg.path);
        }
        if !cfg.host.is_empty() {
            ws_settings["headers"] = json!({ "Host": cfg.host });
        }
        stream_settings["wsSettings"] = ws_settings;
    }

    if network == "grpc" && !cfg.path.is_empty() {
        stream_settings["grpcSettings"] = json!({ "serviceName": cfg.path });
    }

    if cfg.tls == "tls" || cfg.tls == "reality" {
        stream_settings["security"] = json!(cfg.tls);
        let mut tls_settings = json!({});
        if !cfg.sni.is_empty() {
            tls_settings["serverName"] = json!(cfg.sni);
        } else if !cfg.host.is_empty() {
            tls_settings["serverName"] = json!(cfg.host);
        }
        stream_settings["tlsSettings"] = tls_settings;
    }

    let outbound = outbound_settings(cfg);

    json!({
        "log": {
            "loglevel": "warning"
        },
        "inbounds": [
            {
                "port": local_port,
                "listen": "127.0.0.1",
                "protocol": inbound_protocol,
                "settings": {
                    "udp": true
                }
            }
        ],
        "outbounds": [
            {
                "protocol": cfg.protocol.as_str(),
                "settings": outbound,
                "streamSettings": stream_settings
            }
        ]
    })
}

fn outbound_settings(cfg: &ProxyConfig) -> serde_json::Value {
    let port = cfg.get_port();
    match cfg.protocol {
        Protocol::Vmess => json!({
            "vnext": [{
                "address": cfg.server,
                "port": port,
                "users": [{
                    "id": cfg.uuid,
                    "alterId": cfg.get_alter_id(),
                    "security": "auto"
                }]
            }]
        }),
        Protocol::Vless => {
            let mut user = json!({
                "id": cfg.uuid,
                "encryption": "none"
            });
            if !cfg.flow.is_empty() {
                user["flow"] = json!(cfg.flow);
            }
            json!({
                "vnext": [{
                    "address": cfg.server,
                    "port": port,
                    "users": [user]
                }]
            })
        }
        Protocol::Trojan => json!({
            "servers": [{
                "address": cfg.server,
                "port": port,
                "password": cfg.password
            }]
        }),
        Protocol::Shadowsocks => json!({
            "servers": [{
                "address": cfg.server,
                "port": port,
                "method": cfg.get_method(),
                "password": cfg.password
            }]
        }),
        Protocol::Socks | Protocol::Http => {
            let mut server = json!({
                "address": cfg.server,
                "port": port
            });
            if !cfg.username.is_empty() {
                server["users"] = json!([{
                    "user": cfg.username,
                    "pass": cfg.password
                }]);
            }
            json!({ "servers": [server] })
        }
    }
}

/// Write the generated config for one test to the given path
pub fn write_config(cfg: &ProxyConfig, path: &Path, local_port: u16) -> Result<(), LaunchError> {
    let config = generate_config(cfg, local_port);
    let content = serde_json::to_string_pretty(&config).map_err(|e| LaunchError::ConfigWrite {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    std::fs::write(path, content).map_err(|source| LaunchError::ConfigWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Spawns `<xray> run -c <config>` per test and supervises the child.
pub struct XrayLauncher {
    xray_path: PathBuf,
    config_dir: PathBuf,
    metrics: Arc<Metrics>,
}

impl XrayLauncher {
    pub fn new(xray_path: PathBuf, config_dir: PathBuf, metrics: Arc<Metrics>) -> Self {
        XrayLauncher {
            xray_path,
            config_dir,
            metrics,
        }
    }
}

#[async_trait]
impl CoreLauncher for XrayLauncher {
    async fn launch(
        &self,
        cfg: &ProxyConfig,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn CoreProcess>, LaunchError> {
        let config_path = self.config_dir.join(format!("probe_{port}.json"));
        write_config(cfg, &config_path, port)?;

        let spawned = Command::new(&self.xray_path)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let _ = std::fs::remove_file(&config_path);
                return Err(LaunchError::Spawn {
                    binary: self.xray_path.clone(),
                    source,
                });
            }
        };

        self.metrics.process_started();

        let tail = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_tail_reader(stdout, tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_tail_reader(stderr, tail.clone()));
        }

        let mut process = XrayProcess {
            child: Some(child),
            pid: None,
            config_path,
            tail,
            readers,
            metrics: Arc::clone(&self.metrics),
        };
        process.pid = process.child.as_ref().and_then(|c| c.id());

        match wait_for_port(port, cancel).await {
            Ok(()) => Ok(Box::new(process)),
            Err(err) => {
                let detail = process.output_tail();
                process.stop().await;
                Err(match err {
                    LaunchError::NotReady { port, .. } => LaunchError::NotReady {
                        port,
                        detail: if detail.is_empty() {
                            String::new()
                        } else {
                            format!(": {}", snippet(&detail))
                        },
                    },
                    other => other,
                })
            }
        }
    }
}

/// Wait for the child's inbound port to accept TCP
async fn wait_for_port(port: u16, cancel: &CancellationToken) -> Result<(), LaunchError> {
    for _ in 0..READY_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(LaunchError::Interrupted);
        }
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(READY_POLL) => {}
            _ = cancel.cancelled() => return Err(LaunchError::Interrupted),
        }
    }
    Err(LaunchError::NotReady {
        port,
        detail: String::new(),
    })
}

fn spawn_tail_reader<R>(mut stream: R, tail: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut tail = tail.lock().unwrap();
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > OUTPUT_TAIL_BYTES {
                        let cut = tail.len() - OUTPUT_TAIL_BYTES;
                        tail.drain(..cut);
                    }
                }
            }
        }
    })
}

/// Trim captured output down to something that fits in a result message.
pub fn snippet(text: &str) -> String {
    const MAX: usize = 480;
    let text = text.trim();
    if text.len() <= MAX {
        return text.to_string();
    }
    let start = text.len() - MAX;
    // Cut on a char boundary.
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(start);
    format!("...{}", &text[start..])
}

struct XrayProcess {
    child: Option<Child>,
    pid: Option<u32>,
    config_path: PathBuf,
    tail: Arc<Mutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl CoreProcess for XrayProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn output_tail(&self) -> String {
        String::from_utf8_lossy(&self.tail.lock().unwrap()).into_owned()
    }

    async fn stop(&mut self) {
        let Some(child) = self.child.take() else {
            return;
        };
        shutdown_child(child).await;
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        let _ = std::fs::remove_file(&self.config_path);
        self.metrics.process_stopped();
        debug!(pid = ?self.pid, "core process stopped");
    }
}

impl Drop for XrayProcess {
    fn drop(&mut self) {
        // Normally stop() ran already. If the owning task unwound,
        // kill_on_drop reaps the child and the accounting still balances.
        if self.child.take().is_some() {
            let _ = std::fs::remove_file(&self.config_path);
            self.metrics.process_stopped();
        }
    }
}

/// SIGTERM first, SIGKILL after the grace window.
async fn shutdown_child(mut child: Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(result) = tokio::time::timeout(STOP_GRACE, child.wait()).await {
                        let _ = result;
                        return;
                    }
                }
                Err(nix::errno::Errno::ESRCH) => {
                    let _ = child.wait().await;
                    return;
                }
                Err(e) => debug!("SIGTERM failed: {e}"),
            }
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vmess_config() -> ProxyConfig {
        ProxyConfig {
            tag: "Test".to_string(),
            protocol: Protocol::Vmess,
            server: "test.com".to_string(),
            port: serde_json::json!(443),
            uuid: "test-uuid".to_string(),
            alter_id: serde_json::json!(0),
            network: "ws".to_string(),
            host: "cdn.test.com".to_string(),
            path: "/ws".to_string(),
            tls: "tls".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_config() {
        let config = generate_config(&vmess_config(), 10800);
        assert_eq!(config["inbounds"][0]["port"], 10800);
        assert_eq!(config["inbounds"][0]["protocol"], "socks");
        assert_eq!(config["outbounds"][0]["protocol"], "vmess");
        assert_eq!(
            config["outbounds"][0]["streamSettings"]["wsSettings"]["headers"]["Host"],
            "cdn.test.com"
        );
        assert_eq!(
            config["outbounds"][0]["streamSettings"]["tlsSettings"]["serverName"],
            "cdn.test.com"
        );
    }

    #[test]
    fn test_generate_config_trojan() {
        let cfg = ProxyConfig {
            protocol: Protocol::Trojan,
            server: "t.example.com".to_string(),
            port: serde_json::json!(8443),
            password: "pw".to_string(),
            sni: "sni.example.com".to_string(),
            tls: "tls".to_string(),
            ..Default::default()
        };
        let config = generate_config(&cfg, 10801);
        assert_eq!(config["outbounds"][0]["protocol"], "trojan");
        assert_eq!(config["outbounds"][0]["settings"]["servers"][0]["password"], "pw");
        assert_eq!(
            config["outbounds"][0]["streamSettings"]["tlsSettings"]["serverName"],
            "sni.example.com"
        );
    }

    #[test]
    fn test_generate_config_http_inbound() {
        let cfg = ProxyConfig {
            protocol: Protocol::Http,
            server: "h.example.com".to_string(),
            port: serde_json::json!(3128),
            username: "u".to_string(),
            password: "p".to_string(),
            ..Default::default()
        };
        let config = generate_config(&cfg, 10802);
        assert_eq!(config["inbounds"][0]["protocol"], "http");
        assert_eq!(
            config["outbounds"][0]["settings"]["servers"][0]["users"][0]["user"],
            "u"
        );
    }

    #[test]
    fn test_write_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe_10800.json");
        write_config(&vmess_config(), &path, 10800).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["inbounds"][0]["port"], 10800);
    }

    #[test]
    fn test_snippet_keeps_tail() {
        let long = "x".repeat(1000) + " end";
        let cut = snippet(&long);
        assert!(cut.len() <= 484);
        assert!(cut.ends_with(" end"));
        assert!(cut.starts_with("..."));
    }

    #[tokio::test]
    async fn test_launch_failed_for_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let launcher = XrayLauncher::new(
            PathBuf::from("/definitely/not/here/xray"),
            dir.path().to_path_buf(),
            metrics.clone(),
        );
        let cancel = CancellationToken::new();
        let err = launcher
            .launch(&vmess_config(), 23000, &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(metrics.active_processes(), 0);
        // The temp config must not linger after a failed spawn.
        assert!(!dir.path().join("probe_23000.json").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_not_ready_when_child_never_binds() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        // `sleep` exec's fine but never listens, so readiness must lapse.
        let launcher = XrayLauncher::new(
            PathBuf::from("/bin/sleep"),
            dir.path().to_path_buf(),
            metrics.clone(),
        );
        let cancel = CancellationToken::new();
        let err = launcher
            .launch(&vmess_config(), 23001, &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LaunchError::NotReady { port: 23001, .. }));
        assert_eq!(metrics.active_processes(), 0);
        assert!(!dir.path().join("probe_23001.json").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_twice_releases_once() {
        let metrics = Arc::new(Metrics::new());
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("probe_x.json");
        std::fs::write(&config_path, "{}").unwrap();

        let child = Command::new("/bin/sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        metrics.process_started();
        let mut process = XrayProcess {
            pid: child.id(),
            child: Some(child),
            config_path,
            tail: Arc::new(Mutex::new(Vec::new())),
            readers: Vec::new(),
            metrics: metrics.clone(),
        };

        process.stop().await;
        assert_eq!(metrics.active_processes(), 0);
        process.stop().await;
        assert_eq!(metrics.active_processes(), 0);
    }
}
