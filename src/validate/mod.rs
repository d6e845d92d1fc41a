//! Candidate validation and normalisation.
//!
//! A [`RawNode`] is rebuilt field by field into a typed [`Node`]. Anything
//! the typed model does not carry (benchmark URLs, flow and fingerprint
//! hints, subscription-internal indices) is dropped on the way.

pub mod dedup;

pub use dedup::dedup;

use std::collections::BTreeMap;

use serde_yaml::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::{Network, Node, Protocol, ProtocolType, RawNode, Transport, UNNAMED_NODE, value_text};
use crate::parsers::proxy_urls::is_supported_cipher;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("port {0} outside 1..=65535")]
    InvalidPort(String),

    #[error("unsupported type `{0}`")]
    UnsupportedType(String),

    #[error("unsupported cipher `{0}`")]
    UnsupportedCipher(String),

    #[error("unsupported shadowsocks plugin `{0}`")]
    UnsupportedPlugin(String),

    #[error("unsupported network `{0}`")]
    UnsupportedNetwork(String),

    #[error("REALITY transport is not accepted")]
    Reality,
}

impl Rejection {
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::MissingField(_) => "missing-field",
            Rejection::InvalidPort(_) => "invalid-port",
            Rejection::UnsupportedType(_) => "unsupported-type",
            Rejection::UnsupportedCipher(_) => "unsupported-cipher",
            Rejection::UnsupportedPlugin(_) => "unsupported-plugin",
            Rejection::UnsupportedNetwork(_) => "unsupported-network",
            Rejection::Reality => "reality",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ValidationStats {
    pub accepted: usize,
    pub rejected: BTreeMap<&'static str, usize>,
}

impl ValidationStats {
    pub fn total_rejected(&self) -> usize {
        self.rejected.values().sum()
    }
}

pub fn validate_all(candidates: impl IntoIterator<Item = RawNode>) -> (Vec<Node>, ValidationStats) {
    let mut stats = ValidationStats::default();
    let mut nodes = Vec::new();

    for candidate in candidates {
        match validate(&candidate) {
            Ok(node) => {
                stats.accepted += 1;
                nodes.push(node);
            }
            Err(reason) => {
                debug!("Rejected candidate: {}", reason);
                *stats.rejected.entry(reason.label()).or_default() += 1;
            }
        }
    }

    (nodes, stats)
}

pub fn validate(candidate: &RawNode) -> Result<Node, Rejection> {
    let tag = candidate.text("type").ok_or(Rejection::MissingField("type"))?;
    let host = candidate.text("server").ok_or(Rejection::MissingField("server"))?;
    let port_value = candidate.get("port").ok_or(Rejection::MissingField("port"))?;
    let port = coerce_port(port_value)?;

    let kind = ProtocolType::from_tag(&tag).ok_or_else(|| Rejection::UnsupportedType(tag.clone()))?;
    let protocol = match kind {
        ProtocolType::Shadowsocks => {
            let cipher = candidate
                .text("cipher")
                .ok_or(Rejection::MissingField("cipher"))?
                .to_lowercase();
            if !is_supported_cipher(&cipher) {
                return Err(Rejection::UnsupportedCipher(cipher));
            }
            if let Some(plugin) = candidate.text("plugin") {
                return Err(Rejection::UnsupportedPlugin(plugin));
            }
            let password = candidate.text("password").ok_or(Rejection::MissingField("password"))?;
            Protocol::Shadowsocks { cipher, password }
        }
        ProtocolType::Vmess => Protocol::Vmess {
            uuid: candidate.text("uuid").ok_or(Rejection::MissingField("uuid"))?,
            alter_id: candidate.get("alterId").and_then(coerce_u32).unwrap_or(0),
            cipher: candidate.text("cipher").unwrap_or_else(|| "auto".to_string()),
        },
        ProtocolType::Trojan => Protocol::Trojan {
            password: candidate.text("password").ok_or(Rejection::MissingField("password"))?,
        },
        ProtocolType::Vless => {
            let reality = candidate.contains("reality-opts")
                || candidate.text("security").is_some_and(|s| s.eq_ignore_ascii_case("reality"));
            if reality {
                return Err(Rejection::Reality);
            }
            Protocol::Vless { uuid: candidate.text("uuid").ok_or(Rejection::MissingField("uuid"))? }
        }
    };

    let transport = build_transport(kind, candidate)?;
    let name = candidate.text("name").unwrap_or_else(|| UNNAMED_NODE.to_string());

    Ok(Node::new(name, host, port, protocol, transport).with_udp(candidate.flag("udp")))
}

fn coerce_port(value: &Value) -> Result<u16, Rejection> {
    let text = value_text(value).unwrap_or_default();
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(Rejection::InvalidPort(text)),
    }
}

fn coerce_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn build_transport(kind: ProtocolType, candidate: &RawNode) -> Result<Transport, Rejection> {
    let sni = candidate.text("servername").or_else(|| candidate.text("sni"));
    let tls = match kind {
        ProtocolType::Trojan => true,
        ProtocolType::Shadowsocks => false,
        ProtocolType::Vmess | ProtocolType::Vless => candidate.flag("tls"),
    };

    let opts = |key: &str, field: &str| candidate.get(key).and_then(|o| o.get(field)).and_then(value_text);
    let network = match candidate.text("network").map(|n| n.to_lowercase()).as_deref() {
        None | Some("tcp") => Network::Tcp,
        Some(_) if kind == ProtocolType::Shadowsocks => Network::Tcp,
        Some("ws") => Network::Ws {
            path: opts("ws-opts", "path"),
            host: candidate
                .get("ws-opts")
                .and_then(|o| o.get("headers"))
                .and_then(|h| h.get("Host").or_else(|| h.get("host")))
                .and_then(value_text),
        },
        Some("grpc") => Network::Grpc { service_name: opts("grpc-opts", "grpc-service-name") },
        Some("h2") => Network::H2 {
            path: opts("h2-opts", "path"),
            host: candidate
                .get("h2-opts")
                .and_then(|o| o.get("host"))
                .and_then(|h| h.as_sequence().and_then(|s| s.first()).or(Some(h)))
                .and_then(value_text),
        },
        Some(other) => return Err(Rejection::UnsupportedNetwork(other.to_string())),
    };

    Ok(Transport { tls, sni, skip_cert_verify: candidate.flag("skip-cert-verify"), network })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Mapping;

    fn candidate(yaml: &str) -> RawNode {
        RawNode::from_mapping(serde_yaml::from_str::<Mapping>(yaml).unwrap())
    }

    #[test]
    fn test_port_bounds_for_every_type() {
        let bases = [
            "{type: ss, server: h, cipher: aes-256-gcm, password: p}",
            "{type: vmess, server: h, uuid: u}",
            "{type: trojan, server: h, password: p}",
            "{type: vless, server: h, uuid: u}",
        ];
        for base in bases {
            for port in ["0", "-1", "65536", "99999", "'abc'", "'0'"] {
                let yaml = base.replacen('{', &format!("{{port: {port}, "), 1);
                assert!(
                    matches!(validate(&candidate(&yaml)), Err(Rejection::InvalidPort(_))),
                    "port {port} accepted for {base}"
                );
            }
            for port in ["1", "65535", "'443'"] {
                let yaml = base.replacen('{', &format!("{{port: {port}, "), 1);
                assert!(validate(&candidate(&yaml)).is_ok(), "port {port} rejected for {base}");
            }
        }
    }

    #[test]
    fn test_missing_identity_fields() {
        assert_eq!(
            validate(&candidate("{server: h, port: 1}")),
            Err(Rejection::MissingField("type"))
        );
        assert_eq!(
            validate(&candidate("{type: trojan, port: 1, password: p}")),
            Err(Rejection::MissingField("server"))
        );
        assert_eq!(
            validate(&candidate("{type: trojan, server: h, password: p}")),
            Err(Rejection::MissingField("port"))
        );
    }

    #[test]
    fn test_shadowsocks_cipher_whitelist() {
        for cipher in ["table", "none", "aes-256-ocb", "rc4"] {
            let yaml = format!("{{type: ss, server: h, port: 1, cipher: {cipher}, password: p}}");
            assert!(matches!(validate(&candidate(&yaml)), Err(Rejection::UnsupportedCipher(_))));
        }
        let ok = validate(&candidate("{type: ss, server: h, port: 1, cipher: AES-256-GCM, password: p}")).unwrap();
        assert_eq!(
            ok.protocol(),
            &Protocol::Shadowsocks { cipher: "aes-256-gcm".into(), password: "p".into() }
        );
    }

    #[test]
    fn test_shadowsocks_plugin_rejected() {
        let yaml = "{type: ss, server: h, port: 1, cipher: aes-256-gcm, password: p, plugin: obfs}";
        assert!(matches!(validate(&candidate(yaml)), Err(Rejection::UnsupportedPlugin(_))));
    }

    #[test]
    fn test_vmess_alter_id_coercion() {
        let node = validate(&candidate("{type: vmess, server: h, port: 1, uuid: u, alterId: 'x'}")).unwrap();
        assert!(matches!(node.protocol(), Protocol::Vmess { alter_id: 0, .. }));
        let node = validate(&candidate("{type: vmess, server: h, port: 1, uuid: u, alterId: '64'}")).unwrap();
        assert!(matches!(node.protocol(), Protocol::Vmess { alter_id: 64, .. }));
        assert_eq!(
            validate(&candidate("{type: vmess, server: h, port: 1}")),
            Err(Rejection::MissingField("uuid"))
        );
    }

    #[test]
    fn test_vless_reality_rejected() {
        let yaml = "{type: vless, server: h, port: 443, uuid: u, tls: true, reality-opts: {public-key: k}}";
        assert_eq!(validate(&candidate(yaml)), Err(Rejection::Reality));
    }

    #[test]
    fn test_unknown_type_and_network() {
        assert!(matches!(
            validate(&candidate("{type: hysteria2, server: h, port: 1, password: p}")),
            Err(Rejection::UnsupportedType(_))
        ));
        assert!(matches!(
            validate(&candidate("{type: vmess, server: h, port: 1, uuid: u, network: kcp}")),
            Err(Rejection::UnsupportedNetwork(_))
        ));
    }

    #[test]
    fn test_internal_fields_are_stripped() {
        let yaml = "{type: vless, server: h, port: 443, uuid: u, tls: true, flow: xtls-rprx-vision, \
                    client-fingerprint: chrome, benchmark-url: 'http://x', _index: 3}";
        let node = validate(&candidate(yaml)).unwrap();
        let out = node.to_clash();
        for key in ["flow", "client-fingerprint", "benchmark-url", "_index"] {
            assert!(!out.contains_key(key), "{key} survived");
        }
        assert_eq!(out.get("tls").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn test_placeholder_name() {
        let node = validate(&candidate("{type: trojan, server: h, port: 1, password: p, name: ''}")).unwrap();
        assert_eq!(node.name(), UNNAMED_NODE);
    }

    #[test]
    fn test_validate_all_counts() {
        let (nodes, stats) = validate_all(vec![
            candidate("{type: trojan, server: h, port: 1, password: p}"),
            candidate("{type: trojan, server: h, port: 0, password: p}"),
            candidate("{type: ssr, server: h, port: 1}"),
        ]);
        assert_eq!(nodes.len(), 1);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.total_rejected(), 2);
        assert_eq!(stats.rejected.get("invalid-port"), Some(&1));
    }
}
