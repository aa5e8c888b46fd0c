use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine};
use serde::Deserialize;
use tracing::warn;

use crate::proxy::{Protocol, ProxyConfig};

/// Parse whatever the input file contains into proxy configs.
///
/// Accepted shapes, tried in order: a JSON array of records, JSON
/// lines, share links one per line, and a base64 wrapped link list
/// the way subscription services serve them.
pub fn parse_input(content: &str) -> Result<Vec<ProxyConfig>> {
    let content = content.trim();
    if content.is_empty() {
        return Err(anyhow!("input is empty"));
    }

    if content.starts_with('[') {
        let configs: Vec<ProxyConfig> =
            serde_json::from_str(content).map_err(|e| anyhow!("JSON parse error: {e}"))?;
        return Ok(configs);
    }

    if content.starts_with('{') {
        let mut configs = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let cfg: ProxyConfig =
                serde_json::from_str(line).map_err(|e| anyhow!("JSON parse error: {e}"))?;
            configs.push(cfg);
        }
        return Ok(configs);
    }

    if content.contains("://") {
        return parse_link_lines(content);
    }

    // Try to decode as base64
    let decoded = general_purpose::STANDARD
        .decode(content)
        .or_else(|_| general_purpose::URL_SAFE.decode(content))
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(content))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(content))
        .map_err(|e| anyhow!("Base64 decode error: {e}"))?;
    let decoded_str =
        String::from_utf8(decoded).map_err(|e| anyhow!("UTF-8 decode error: {e}"))?;
    parse_link_lines(&decoded_str)
}

fn parse_link_lines(content: &str) -> Result<Vec<ProxyConfig>> {
    let mut configs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || !line.contains("://") {
            continue;
        }
        match parse_link(line) {
            Ok(cfg) => configs.push(cfg),
            Err(e) => {
                // Skip broken entries, the rest of the list is still useful.
                warn!("failed to parse link: {e}");
            }
        }
    }
    if configs.is_empty() {
        return Err(anyhow!("no valid proxy configs found in input"));
    }
    Ok(configs)
}

/// Parse one share link into a config.
pub fn parse_link(link: &str) -> Result<ProxyConfig> {
    let link = link.trim();
    let (scheme, rest) = link
        .split_once("://")
        .ok_or_else(|| anyhow!("not a share link: {link}"))?;
    match scheme {
        "vmess" => parse_vmess(rest),
        "vless" => parse_uri(rest, Protocol::Vless),
        "trojan" => parse_uri(rest, Protocol::Trojan),
        "ss" => parse_shadowsocks(rest),
        "socks" | "socks5" => parse_uri(rest, Protocol::Socks),
        "http" => parse_uri(rest, Protocol::Http),
        other => Err(anyhow!("unsupported link scheme: {other}")),
    }
}

/// Body of a vmess:// link, the fields the share format defines.
#[derive(Debug, Deserialize)]
struct VmessLink {
    #[serde(default)]
    ps: String,
    #[serde(default)]
    add: String,
    #[serde(default)]
    port: serde_json::Value,
    #[serde(default)]
    id: String,
    #[serde(default)]
    aid: serde_json::Value,
    #[serde(default)]
    net: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    tls: String,
    #[serde(default)]
    sni: String,
}

fn parse_vmess(encoded: &str) -> Result<ProxyConfig> {
    // Try standard base64 first, then URL-safe
    let decoded = general_purpose::STANDARD
        .decode(encoded)
        .or_else(|_| general_purpose::URL_SAFE.decode(encoded))
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(encoded))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(encoded))
        .map_err(|e| anyhow!("Base64 decode error: {e}"))?;
    let json_str = String::from_utf8(decoded).map_err(|e| anyhow!("UTF-8 decode error: {e}"))?;
    let body: VmessLink =
        serde_json::from_str(&json_str).map_err(|e| anyhow!("JSON parse error: {e}"))?;

    Ok(ProxyConfig {
        tag: body.ps,
        protocol: Protocol::Vmess,
        server: body.add,
        port: body.port,
        uuid: body.id,
        alter_id: body.aid,
        network: body.net,
        host: body.host,
        path: body.path,
        tls: body.tls,
        sni: body.sni,
        ..Default::default()
    })
}

fn parse_shadowsocks(rest: &str) -> Result<ProxyConfig> {
    let (body, tag) = split_fragment(rest);
    let (userinfo, address) = match body.split_once('@') {
        Some((userinfo, address)) => (decode_userinfo(userinfo)?, address.to_string()),
        None => {
            // Legacy form: the whole body is base64("method:password@host:port").
            let decoded = general_purpose::STANDARD
                .decode(&body)
                .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(&body))
                .map_err(|e| anyhow!("Base64 decode error: {e}"))?;
            let decoded =
                String::from_utf8(decoded).map_err(|e| anyhow!("UTF-8 decode error: {e}"))?;
            let (userinfo, address) = decoded
                .split_once('@')
                .ok_or_else(|| anyhow!("malformed ss link"))?;
            (userinfo.to_string(), address.to_string())
        }
    };
    let (method, password) = userinfo
        .split_once(':')
        .ok_or_else(|| anyhow!("ss link missing method:password"))?;
    let (server, port) = split_host_port(&address)?;

    Ok(ProxyConfig {
        tag,
        protocol: Protocol::Shadowsocks,
        server,
        port: serde_json::json!(port),
        method: method.to_string(),
        password: password.to_string(),
        ..Default::default()
    })
}

fn decode_userinfo(userinfo: &str) -> Result<String> {
    // SIP002 allows the userinfo to be base64 as well as plain text.
    if userinfo.contains(':') {
        return Ok(percent_decode(userinfo));
    }
    let decoded = general_purpose::URL_SAFE_NO_PAD
        .decode(userinfo)
        .or_else(|_| general_purpose::STANDARD.decode(userinfo))
        .map_err(|e| anyhow!("Base64 decode error: {e}"))?;
    String::from_utf8(decoded).map_err(|e| anyhow!("UTF-8 decode error: {e}"))
}

fn parse_uri(rest: &str, protocol: Protocol) -> Result<ProxyConfig> {
    let (body, tag) = split_fragment(rest);
    let (body, query) = match body.split_once('?') {
        Some((body, query)) => (body.to_string(), query.to_string()),
        None => (body, String::new()),
    };

    let (userinfo, address) = match body.split_once('@') {
        Some((userinfo, address)) => (percent_decode(userinfo), address.to_string()),
        None => (String::new(), body),
    };
    let (server, port) = split_host_port(&address)?;

    let mut cfg = ProxyConfig {
        tag,
        protocol,
        server,
        port: serde_json::json!(port),
        ..Default::default()
    };

    match protocol {
        Protocol::Vless => cfg.uuid = userinfo,
        Protocol::Trojan => cfg.password = userinfo,
        Protocol::Socks | Protocol::Http => match userinfo.split_once(':') {
            Some((user, pass)) => {
                cfg.username = user.to_string();
                cfg.password = pass.to_string();
            }
            None => cfg.username = userinfo,
        },
        _ => {}
    }

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, percent_decode(value)),
            None => (pair, String::new()),
        };
        match key {
            "sni" => cfg.sni = value,
            "host" => cfg.host = value,
            "path" | "serviceName" => cfg.path = value,
            "type" | "network" => cfg.network = value,
            "security" => cfg.tls = value,
            "flow" => cfg.flow = value,
            _ => {}
        }
    }

    Ok(cfg)
}

fn split_fragment(rest: &str) -> (String, String) {
    match rest.split_once('#') {
        Some((body, fragment)) => (body.to_string(), percent_decode(fragment)),
        None => (rest.to_string(), String::new()),
    }
}

fn split_host_port(address: &str) -> Result<(String, u16)> {
    let address = address.trim_end_matches('/');
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("address missing port: {address}"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("bad port in address: {address}"))?;
    if host.is_empty() {
        return Err(anyhow!("address missing host: {address}"));
    }
    Ok((host.to_string(), port))
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vmess_link() {
        let json = r#"{"v":"2","ps":"Test Node","add":"example.com","port":"443","id":"uuid-here","aid":"0","net":"ws","type":"none","host":"cdn.example.com","path":"/path","tls":"tls"}"#;
        let link = format!("vmess://{}", general_purpose::STANDARD.encode(json));

        let cfg = parse_link(&link).unwrap();
        assert_eq!(cfg.protocol, Protocol::Vmess);
        assert_eq!(cfg.tag, "Test Node");
        assert_eq!(cfg.server, "example.com");
        assert_eq!(cfg.get_port(), 443);
        assert_eq!(cfg.network, "ws");
        assert_eq!(cfg.path, "/path");
    }

    #[test]
    fn test_parse_trojan_link() {
        let cfg = parse_link(
            "trojan://secret@t.example.com:8443?sni=sni.example.com&type=ws&path=%2Fws#My%20Node",
        )
        .unwrap();
        assert_eq!(cfg.protocol, Protocol::Trojan);
        assert_eq!(cfg.password, "secret");
        assert_eq!(cfg.server, "t.example.com");
        assert_eq!(cfg.get_port(), 8443);
        assert_eq!(cfg.sni, "sni.example.com");
        assert_eq!(cfg.network, "ws");
        assert_eq!(cfg.path, "/ws");
        assert_eq!(cfg.tag, "My Node");
    }

    #[test]
    fn test_parse_vless_link() {
        let cfg = parse_link(
            "vless://uuid-1@v.example.com:443?security=tls&sni=v.example.com&flow=xtls-rprx-vision#vl",
        )
        .unwrap();
        assert_eq!(cfg.protocol, Protocol::Vless);
        assert_eq!(cfg.uuid, "uuid-1");
        assert_eq!(cfg.tls, "tls");
        assert_eq!(cfg.flow, "xtls-rprx-vision");
    }

    #[test]
    fn test_parse_ss_link_sip002() {
        let userinfo = general_purpose::URL_SAFE_NO_PAD.encode("aes-256-gcm:pass123");
        let cfg = parse_link(&format!("ss://{userinfo}@s.example.com:8388#SS")).unwrap();
        assert_eq!(cfg.protocol, Protocol::Shadowsocks);
        assert_eq!(cfg.get_method(), "aes-256-gcm");
        assert_eq!(cfg.password, "pass123");
        assert_eq!(cfg.server, "s.example.com");
        assert_eq!(cfg.get_port(), 8388);
    }

    #[test]
    fn test_parse_input_json_array() {
        let content = r#"[{"type":"trojan","server":"a","port":1},{"type":"socks","server":"b","port":2}]"#;
        let configs = parse_input(content).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].protocol, Protocol::Socks);
    }

    #[test]
    fn test_parse_input_base64_subscription() {
        let json = r#"{"ps":"Node1","add":"n1.example.com","port":443,"id":"uuid1","aid":0,"net":"tcp","tls":"tls"}"#;
        let link1 = format!("vmess://{}", general_purpose::STANDARD.encode(json));
        let link2 = "trojan://pw@n2.example.com:443#Node2";
        let subscription = general_purpose::STANDARD.encode(format!("{link1}\n{link2}\n"));

        let configs = parse_input(&subscription).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].tag, "Node1");
        assert_eq!(configs[1].tag, "Node2");
    }

    #[test]
    fn test_broken_lines_are_skipped() {
        let content = "trojan://pw@ok.example.com:443#ok\nnot-a-link://???\n";
        let configs = parse_input(content).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].server, "ok.example.com");
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(parse_input("").is_err());
        assert!(parse_input("   \n  ").is_err());
    }
}
