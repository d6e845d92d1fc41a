use serde_json::Value;
use serde_yaml::Mapping;

use crate::config::MAX_PROXIES_PER_CONFIG;
use crate::models::{ProtocolType, RawNode};
use crate::parsers::proxy_urls::{NetworkHints, apply_network, apply_tls};

/// Entries of a top-level `proxies` collection, taken verbatim. `None` when
/// the text is not a document with such a collection. Non-mapping entries
/// are counted as skipped.
pub fn parse_clash_yaml(text: &str) -> Option<(Vec<RawNode>, usize)> {
    if !text.contains("proxies") {
        return None;
    }
    let doc = serde_yaml::from_str::<serde_yaml::Value>(text).ok()?;
    let proxies = doc.get("proxies")?.as_sequence()?;

    let mut nodes = Vec::new();
    let mut skipped = 0;
    for proxy in proxies.iter().take(MAX_PROXIES_PER_CONFIG) {
        match proxy.as_mapping() {
            Some(map) => nodes.push(RawNode::from_mapping(map.clone())),
            None => skipped += 1,
        }
    }
    Some((nodes, skipped))
}

/// One candidate per proxy outbound of a V2Ray/Xray style JSON config.
/// Non-proxy outbounds (`freedom`, `blackhole`, `dns`, ...) are ignored.
pub fn parse_v2ray_json(text: &str) -> Option<(Vec<RawNode>, usize)> {
    if !text.trim_start().starts_with('{') {
        return None;
    }
    let config = serde_json::from_str::<Value>(text).ok()?;
    let outbounds = config.get("outbounds")?.as_array()?;

    let mut nodes = Vec::new();
    let mut skipped = 0;
    for outbound in outbounds.iter().take(MAX_PROXIES_PER_CONFIG) {
        let Some(protocol) = outbound.get("protocol").and_then(Value::as_str).and_then(ProtocolType::from_tag) else {
            continue;
        };
        match translate_outbound(protocol, outbound) {
            Some(node) => nodes.push(node),
            None => skipped += 1,
        }
    }
    Some((nodes, skipped))
}

fn translate_outbound(protocol: ProtocolType, outbound: &Value) -> Option<RawNode> {
    let settings = outbound.get("settings")?;
    let node = RawNode::new()
        .set("type", protocol.as_str())
        .set_opt("name", str_at(outbound, "tag"));

    let node = match protocol {
        ProtocolType::Vmess | ProtocolType::Vless => {
            let server = settings.get("vnext")?.as_array()?.first()?;
            let user = server.get("users").and_then(Value::as_array).and_then(|u| u.first());
            let node = node
                .set("server", str_at(server, "address")?)
                .set("port", int_at(server, "port")?)
                .set_opt("uuid", user.and_then(|u| str_at(u, "id")));
            if protocol == ProtocolType::Vmess {
                node.set("alterId", user.and_then(|u| int_at(u, "alterId")).unwrap_or(0))
                    .set_opt("cipher", user.and_then(|u| str_at(u, "security")))
            } else {
                node.set_opt("flow", user.and_then(|u| str_at(u, "flow")))
            }
        }
        ProtocolType::Shadowsocks | ProtocolType::Trojan => {
            let server = settings.get("servers")?.as_array()?.first()?;
            let node = node
                .set("server", str_at(server, "address")?)
                .set("port", int_at(server, "port")?)
                .set_opt("password", str_at(server, "password"));
            if protocol == ProtocolType::Shadowsocks {
                node.set_opt("cipher", str_at(server, "method"))
            } else {
                node
            }
        }
    };

    Some(apply_stream_settings(protocol, node, outbound.get("streamSettings")))
}

fn apply_stream_settings(protocol: ProtocolType, node: RawNode, stream: Option<&Value>) -> RawNode {
    let Some(stream) = stream else {
        return node;
    };

    let sni_key = if protocol == ProtocolType::Trojan { "sni" } else { "servername" };
    let security = str_at(stream, "security").unwrap_or_default().to_lowercase();
    let node = match security.as_str() {
        "tls" | "xtls" => {
            let tls = stream.get("tlsSettings").or_else(|| stream.get("xtlsSettings"));
            let sni = tls.and_then(|t| str_at(t, "serverName"));
            let insecure = tls
                .and_then(|t| t.get("allowInsecure"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            apply_tls(node, sni_key, true, sni, insecure)
        }
        "reality" => {
            let reality = stream.get("realitySettings");
            let mut opts = Mapping::new();
            if let Some(key) = reality.and_then(|r| str_at(r, "publicKey")) {
                opts.insert("public-key".into(), key.into());
            }
            if let Some(id) = reality.and_then(|r| str_at(r, "shortId")) {
                opts.insert("short-id".into(), id.into());
            }
            let sni = reality.and_then(|r| str_at(r, "serverName"));
            apply_tls(node, sni_key, true, sni, false).set("reality-opts", serde_yaml::Value::Mapping(opts))
        }
        _ => node,
    };

    let network = str_at(stream, "network");
    let hints = match network.as_deref() {
        Some("ws") => {
            let ws = stream.get("wsSettings");
            NetworkHints {
                path: ws.and_then(|w| str_at(w, "path")),
                host: ws
                    .and_then(|w| w.get("headers"))
                    .and_then(|h| str_at(h, "Host"))
                    .or_else(|| ws.and_then(|w| str_at(w, "host"))),
                service_name: None,
            }
        }
        Some("grpc") => NetworkHints {
            service_name: stream.get("grpcSettings").and_then(|g| str_at(g, "serviceName")),
            ..NetworkHints::default()
        },
        Some("h2") | Some("http") => {
            let http = stream.get("httpSettings");
            NetworkHints {
                path: http.and_then(|h| str_at(h, "path")),
                host: http
                    .and_then(|h| h.get("host"))
                    .and_then(Value::as_array)
                    .and_then(|hosts| hosts.first())
                    .and_then(Value::as_str)
                    .map(str::to_string),
                service_name: None,
            }
        }
        _ => NetworkHints::default(),
    };
    apply_network(node, network.as_deref(), hints)
}

fn str_at(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn int_at(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
