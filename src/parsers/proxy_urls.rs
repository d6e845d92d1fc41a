use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;

use crate::models::RawNode;
use crate::utils::{decode_base64_text, percent_decode, split_host_port};

/// Shadowsocks ciphers the downstream runtimes accept.
pub const SS_CIPHERS: &[&str] = &[
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "chacha20-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
    "aes-128-cfb",
    "aes-192-cfb",
    "aes-256-cfb",
    "aes-128-ctr",
    "aes-192-ctr",
    "aes-256-ctr",
    "rc4-md5",
    "chacha20-ietf",
    "xchacha20",
];

pub fn is_supported_cipher(cipher: &str) -> bool {
    let cipher = cipher.trim().to_lowercase();
    SS_CIPHERS.contains(&cipher.as_str())
}

/// Dispatches one share link on its scheme. `None` means the line was
/// malformed or deliberately excluded.
pub fn parse_share_link(line: &str) -> Option<RawNode> {
    let (scheme, _) = line.split_once("://")?;
    match scheme.to_lowercase().as_str() {
        "vmess" => parse_vmess(line),
        "ss" => parse_ss(line),
        "trojan" => parse_trojan(line),
        "vless" => parse_vless(line),
        _ => None,
    }
}

// vmess://base64(json)
pub fn parse_vmess(link: &str) -> Option<RawNode> {
    let payload = strip_scheme(link, "vmess://")?;
    let payload = payload.split('#').next()?;
    let json_str = decode_base64_text(payload)?;
    let config: JsonValue = serde_json::from_str(&json_str).ok()?;

    let host = json_text(&config, "add")?;
    let port = json_int(&config, "port")?;
    let alter_id = json_int(&config, "aid").unwrap_or(0);

    let node = RawNode::new()
        .set("type", "vmess")
        .set("server", host)
        .set("port", port)
        .set("alterId", alter_id)
        .set_opt("name", json_text(&config, "ps"))
        .set_opt("uuid", json_text(&config, "id"))
        .set_opt("cipher", json_text(&config, "scy"));

    let tls = json_text(&config, "tls").is_some_and(|t| t.eq_ignore_ascii_case("tls"));
    let sni = json_text(&config, "sni");
    let node = apply_tls(node, "servername", tls, sni, false);

    let net = json_text(&config, "net");
    Some(apply_network(
        node,
        net.as_deref(),
        NetworkHints {
            path: json_text(&config, "path"),
            host: json_text(&config, "host"),
            service_name: json_text(&config, "path"),
        },
    ))
}

// ss://base64(cipher:password)@host:port#name
// ss://base64(cipher:password@host:port)#name
pub fn parse_ss(link: &str) -> Option<RawNode> {
    let rest = strip_scheme(link, "ss://")?;
    let (rest, name) = split_fragment(rest);
    let (body, query) = split_query(rest);
    let plugin = query_params(query).remove("plugin");

    let (cipher, password, host, port) = parse_ss_userinfo(body).or_else(|| parse_ss_whole(body))?;
    if !is_supported_cipher(&cipher) {
        return None;
    }

    Some(
        RawNode::new()
            .set("type", "ss")
            .set("server", host)
            .set("port", port)
            .set("cipher", cipher.to_lowercase())
            .set("password", password)
            .set_opt("name", name)
            .set_opt("plugin", plugin),
    )
}

fn parse_ss_userinfo(body: &str) -> Option<(String, String, String, i64)> {
    let (userinfo, server) = body.rsplit_once('@')?;
    let decoded = decode_base64_text(userinfo)
        .filter(|d| d.contains(':'))
        .unwrap_or_else(|| percent_decode(userinfo));
    let (cipher, password) = decoded.split_once(':')?;
    let (host, port) = split_host_port(server)?;
    Some((cipher.to_string(), password.to_string(), host, port))
}

fn parse_ss_whole(body: &str) -> Option<(String, String, String, i64)> {
    let decoded = decode_base64_text(body)?;
    let (userinfo, server) = decoded.rsplit_once('@')?;
    let (cipher, password) = userinfo.split_once(':')?;
    let (host, port) = split_host_port(server)?;
    Some((cipher.to_string(), password.to_string(), host, port))
}

// trojan://password@host:port?sni=..&type=ws#name
pub fn parse_trojan(link: &str) -> Option<RawNode> {
    let rest = strip_scheme(link, "trojan://")?;
    let (rest, name) = split_fragment(rest);
    let (rest, query) = split_query(rest);
    let (password, server) = rest.rsplit_once('@')?;
    if password.is_empty() {
        return None;
    }
    let (host, port) = split_host_port(server)?;
    let params = query_params(query);

    let node = RawNode::new()
        .set("type", "trojan")
        .set("server", host)
        .set("port", port)
        .set("password", percent_decode(password))
        .set("udp", true)
        .set_opt("name", name);

    let sni = params.get("sni").or_else(|| params.get("peer")).cloned();
    let insecure = params.get("allowInsecure").is_some_and(|v| v == "1" || v == "true");
    let node = apply_tls(node, "sni", true, sni, insecure);

    Some(apply_network(node, params.get("type").map(String::as_str), NetworkHints::from_query(&params)))
}

// vless://uuid@host:port?security=tls&sni=..&type=ws#name
pub fn parse_vless(link: &str) -> Option<RawNode> {
    let rest = strip_scheme(link, "vless://")?;
    let (rest, name) = split_fragment(rest);
    let (rest, query) = split_query(rest);
    let (uuid, server) = rest.rsplit_once('@')?;
    let (host, port) = split_host_port(server)?;
    let params = query_params(query);

    let security = params.get("security").map(|s| s.to_lowercase()).unwrap_or_default();
    if security == "reality" || params.contains_key("pbk") {
        return None;
    }

    let node = RawNode::new()
        .set("type", "vless")
        .set("server", host)
        .set("port", port)
        .set("uuid", percent_decode(uuid))
        .set("udp", true)
        .set_opt("name", name)
        .set_opt("flow", params.get("flow").cloned())
        .set_opt("client-fingerprint", params.get("fp").cloned());

    let insecure = params.get("allowInsecure").is_some_and(|v| v == "1" || v == "true");
    let node = apply_tls(node, "servername", security == "tls", params.get("sni").cloned(), insecure);

    Some(apply_network(node, params.get("type").map(String::as_str), NetworkHints::from_query(&params)))
}

fn strip_scheme<'a>(link: &'a str, scheme: &str) -> Option<&'a str> {
    let head = link.get(..scheme.len())?;
    if head.eq_ignore_ascii_case(scheme) {
        link.get(scheme.len()..)
    } else {
        None
    }
}

fn split_fragment(rest: &str) -> (&str, Option<String>) {
    match rest.split_once('#') {
        Some((body, fragment)) => (body, Some(percent_decode(fragment))),
        None => (rest, None),
    }
}

fn split_query(rest: &str) -> (&str, &str) {
    rest.split_once('?').unwrap_or((rest, ""))
}

fn query_params(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

fn json_text(config: &JsonValue, key: &str) -> Option<String> {
    let text = match config.get(key)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() { None } else { Some(text) }
}

fn json_int(config: &JsonValue, key: &str) -> Option<i64> {
    match config.get(key)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Transport options shared by the share-link and outbound translators.
#[derive(Debug, Default)]
pub(crate) struct NetworkHints {
    pub path: Option<String>,
    pub host: Option<String>,
    pub service_name: Option<String>,
}

impl NetworkHints {
    fn from_query(params: &HashMap<String, String>) -> Self {
        Self {
            path: params.get("path").cloned(),
            host: params.get("host").cloned(),
            service_name: params.get("serviceName").cloned(),
        }
    }
}

pub(crate) fn apply_tls(node: RawNode, sni_key: &str, tls: bool, sni: Option<String>, insecure: bool) -> RawNode {
    let node = if tls { node.set("tls", true) } else { node };
    let node = node.set_opt(sni_key, sni);
    if insecure { node.set("skip-cert-verify", true) } else { node }
}

pub(crate) fn apply_network(node: RawNode, net: Option<&str>, hints: NetworkHints) -> RawNode {
    let net = net.map(|n| n.trim().to_lowercase()).unwrap_or_default();
    match net.as_str() {
        "" | "tcp" | "none" => node,
        "ws" => {
            let mut opts = Mapping::new();
            if let Some(path) = hints.path.filter(|p| !p.is_empty()) {
                opts.insert(Value::from("path"), Value::from(path));
            }
            if let Some(host) = hints.host.filter(|h| !h.is_empty()) {
                let mut headers = Mapping::new();
                headers.insert(Value::from("Host"), Value::from(host));
                opts.insert(Value::from("headers"), Value::Mapping(headers));
            }
            node.set("network", "ws").set("ws-opts", Value::Mapping(opts))
        }
        "grpc" => {
            let mut opts = Mapping::new();
            if let Some(name) = hints.service_name.filter(|s| !s.is_empty()) {
                opts.insert(Value::from("grpc-service-name"), Value::from(name));
            }
            node.set("network", "grpc").set("grpc-opts", Value::Mapping(opts))
        }
        "h2" | "http" => {
            let mut opts = Mapping::new();
            if let Some(path) = hints.path.filter(|p| !p.is_empty()) {
                opts.insert(Value::from("path"), Value::from(path));
            }
            if let Some(host) = hints.host.filter(|h| !h.is_empty()) {
                opts.insert(Value::from("host"), Value::Sequence(vec![Value::from(host)]));
            }
            node.set("network", "h2").set("h2-opts", Value::Mapping(opts))
        }
        // Left for the validator to reject.
        other => node.set("network", other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    fn encode(text: &str) -> String {
        STANDARD.encode(text)
    }

    #[test]
    fn test_ss_userinfo_form() {
        let link = format!("ss://{}@1.2.3.4:8388#My%20SS", encode("aes-256-gcm:password123"));
        let node = parse_ss(&link).unwrap();
        assert_eq!(node.text("server").as_deref(), Some("1.2.3.4"));
        assert_eq!(node.text("port").as_deref(), Some("8388"));
        assert_eq!(node.text("cipher").as_deref(), Some("aes-256-gcm"));
        assert_eq!(node.text("password").as_deref(), Some("password123"));
        assert_eq!(node.text("name").as_deref(), Some("My SS"));
    }

    #[test]
    fn test_ss_round_trip_without_padding() {
        let cases = [
            ("chacha20-ietf-poly1305", "p@ss:word", "example.com", 443),
            ("aes-128-gcm", "x", "10.1.2.3", 1),
            ("2022-blake3-aes-256-gcm", "c2VjcmV0", "[2001:db8::1]", 65535),
        ];
        for (cipher, password, host, port) in cases {
            let userinfo = encode(&format!("{cipher}:{password}"));
            let link = format!("ss://{}@{host}:{port}#n", userinfo.trim_end_matches('='));
            let node = parse_ss(&link).unwrap();
            assert_eq!(node.text("cipher").as_deref(), Some(cipher));
            assert_eq!(node.text("password").as_deref(), Some(password));
            assert_eq!(node.text("server").as_deref(), Some(host.trim_matches(|c| c == '[' || c == ']')));
            assert_eq!(node.text("port"), Some(port.to_string()));
        }
    }

    #[test]
    fn test_ss_whole_form() {
        let link = format!("ss://{}#legacy", encode("aes-128-gcm:pw@example.org:8443"));
        let node = parse_ss(&link).unwrap();
        assert_eq!(node.text("server").as_deref(), Some("example.org"));
        assert_eq!(node.text("port").as_deref(), Some("8443"));
        assert_eq!(node.text("name").as_deref(), Some("legacy"));
    }

    #[test]
    fn test_ss_unknown_cipher_is_discarded() {
        let link = format!("ss://{}@1.2.3.4:8388", encode("table:pw"));
        assert!(parse_ss(&link).is_none());
    }

    #[test]
    fn test_ss_plain_userinfo_with_plugin_query() {
        let link = "ss://aes-256-gcm:pw@1.2.3.4:8388/?plugin=obfs-local#n";
        let node = parse_ss(link).unwrap();
        assert_eq!(node.text("port").as_deref(), Some("8388"));
        assert_eq!(node.text("plugin").as_deref(), Some("obfs-local"));
    }

    #[test]
    fn test_vmess_fields() {
        let json = serde_json::json!({
            "v": "2", "ps": "test-vmess", "add": "example.com", "port": "443",
            "id": "550e8400-e29b-41d4-a716-446655440000", "aid": "0",
            "net": "ws", "tls": "tls", "host": "cdn.example.com", "path": "/ray"
        });
        let node = parse_vmess(&format!("vmess://{}", encode(&json.to_string()))).unwrap();
        assert_eq!(node.text("name").as_deref(), Some("test-vmess"));
        assert_eq!(node.text("port").as_deref(), Some("443"));
        assert!(node.flag("tls"));
        assert_eq!(node.text("network").as_deref(), Some("ws"));
        let host = node
            .get("ws-opts")
            .and_then(|o| o.get("headers"))
            .and_then(|h| h.get("Host"))
            .and_then(Value::as_str);
        assert_eq!(host, Some("cdn.example.com"));
    }

    #[test]
    fn test_vmess_malformed_payload() {
        assert!(parse_vmess("vmess://this is not base64!").is_none());
        assert!(parse_vmess(&format!("vmess://{}", encode("{not json"))).is_none());
    }

    #[test]
    fn test_trojan_with_and_without_query() {
        let node = parse_trojan("trojan://secret@example.com:443?sni=sni.example.com&type=ws&path=%2Fws#Tokyo%201").unwrap();
        assert_eq!(node.text("password").as_deref(), Some("secret"));
        assert_eq!(node.text("sni").as_deref(), Some("sni.example.com"));
        assert_eq!(node.text("name").as_deref(), Some("Tokyo 1"));
        assert_eq!(node.text("network").as_deref(), Some("ws"));

        let bare = parse_trojan("trojan://secret@example.com:443").unwrap();
        assert!(bare.text("name").is_none());
        assert!(bare.flag("tls"));
    }

    #[test]
    fn test_trojan_malformed() {
        assert!(parse_trojan("trojan://example.com:443").is_none());
        assert!(parse_trojan("trojan://pw@example.com").is_none());
        assert!(parse_trojan("trojan://pw@example.com:https").is_none());
    }

    #[test]
    fn test_vless_tls_and_reality() {
        let node = parse_vless("vless://uuid-1@example.com:443?security=tls&sni=a.example.com&flow=xtls-rprx-vision#v").unwrap();
        assert!(node.flag("tls"));
        assert_eq!(node.text("servername").as_deref(), Some("a.example.com"));
        assert_eq!(node.text("flow").as_deref(), Some("xtls-rprx-vision"));

        assert!(parse_vless("vless://uuid-1@example.com:443?security=reality&pbk=abc&sid=01#r").is_none());
        assert!(parse_vless("vless://uuid-1@example.com:443?pbk=abc#r").is_none());
    }

    #[test]
    fn test_scheme_dispatch_is_case_insensitive() {
        assert!(parse_share_link("TROJAN://pw@example.com:443").is_some());
        assert!(parse_share_link("ssr://abc").is_none());
        assert!(parse_share_link("no scheme").is_none());
    }
}
