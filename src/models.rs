use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::net::IpAddr;

/// Display name given to nodes that arrive without one.
pub const UNNAMED_NODE: &str = "Unnamed";

/// A loosely-typed node record as it comes out of a decoder. Keys follow
/// Clash proxy naming (`server`, `port`, `type`, `ws-opts`, ...), so entries
/// taken verbatim from a Clash document and entries translated from share
/// links look the same to the validator. Nothing in here is trusted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawNode {
    fields: Mapping,
}

impl RawNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mapping(fields: Mapping) -> Self {
        Self { fields }
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(Value::from(key), value.into());
        self
    }

    /// Like [`RawNode::set`] but skips absent or empty strings.
    pub fn set_opt(self, key: &str, value: Option<String>) -> Self {
        match value {
            Some(v) if !v.trim().is_empty() => self.set(key, v),
            _ => self,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Non-empty string value; numbers are rendered as text.
    pub fn text(&self, key: &str) -> Option<String> {
        value_text(self.get(key)?)
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "tls"),
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            _ => false,
        }
    }
}

pub fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() { None } else { Some(text) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolType {
    Shadowsocks,
    Vmess,
    Trojan,
    Vless,
}

impl ProtocolType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolType::Shadowsocks => "ss",
            ProtocolType::Vmess => "vmess",
            ProtocolType::Trojan => "trojan",
            ProtocolType::Vless => "vless",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "ss" | "shadowsocks" => Some(ProtocolType::Shadowsocks),
            "vmess" => Some(ProtocolType::Vmess),
            "trojan" => Some(ProtocolType::Trojan),
            "vless" => Some(ProtocolType::Vless),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials, one variant per supported protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Shadowsocks { cipher: String, password: String },
    Vmess { uuid: String, alter_id: u32, cipher: String },
    Trojan { password: String },
    Vless { uuid: String },
}

impl Protocol {
    pub fn kind(&self) -> ProtocolType {
        match self {
            Protocol::Shadowsocks { .. } => ProtocolType::Shadowsocks,
            Protocol::Vmess { .. } => ProtocolType::Vmess,
            Protocol::Trojan { .. } => ProtocolType::Trojan,
            Protocol::Vless { .. } => ProtocolType::Vless,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Network {
    #[default]
    Tcp,
    Ws { path: Option<String>, host: Option<String> },
    Grpc { service_name: Option<String> },
    H2 { path: Option<String>, host: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transport {
    pub tls: bool,
    pub sni: Option<String>,
    pub skip_cert_verify: bool,
    pub network: Network,
}

/// Identity of a node: `host:port:type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    host: String,
    port: u16,
    kind: ProtocolType,
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.kind)
    }
}

/// A validated proxy endpoint. Host, port and protocol are fixed at
/// construction; only the display name may be replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    host: String,
    port: u16,
    udp: bool,
    protocol: Protocol,
    transport: Transport,
}

impl Node {
    pub fn new(name: String, host: String, port: u16, protocol: Protocol, transport: Transport) -> Self {
        Self { name, host, port, udp: false, protocol, transport }
    }

    pub fn with_udp(mut self, udp: bool) -> Self {
        self.udp = udp;
        self
    }

    pub fn renamed(&self, name: String) -> Self {
        Self { name, ..self.clone() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn kind(&self) -> ProtocolType {
        self.protocol.kind()
    }

    pub fn key(&self) -> NodeKey {
        NodeKey { host: self.host.clone(), port: self.port, kind: self.kind() }
    }

    /// Clash proxy entry for this node.
    pub fn to_clash(&self) -> Mapping {
        let mut map = Mapping::new();
        put(&mut map, "name", self.name.as_str());
        put(&mut map, "type", self.kind().as_str());
        put(&mut map, "server", self.host.as_str());
        put(&mut map, "port", self.port);
        if self.udp {
            put(&mut map, "udp", true);
        }

        match &self.protocol {
            Protocol::Shadowsocks { cipher, password } => {
                put(&mut map, "cipher", cipher.as_str());
                put(&mut map, "password", password.as_str());
            }
            Protocol::Vmess { uuid, alter_id, cipher } => {
                put(&mut map, "uuid", uuid.as_str());
                put(&mut map, "alterId", *alter_id);
                put(&mut map, "cipher", cipher.as_str());
            }
            Protocol::Trojan { password } => {
                put(&mut map, "password", password.as_str());
            }
            Protocol::Vless { uuid } => {
                put(&mut map, "uuid", uuid.as_str());
            }
        }

        let t = &self.transport;
        match self.kind() {
            ProtocolType::Shadowsocks => {}
            ProtocolType::Trojan => {
                if let Some(sni) = &t.sni {
                    put(&mut map, "sni", sni.as_str());
                }
            }
            ProtocolType::Vmess | ProtocolType::Vless => {
                if t.tls {
                    put(&mut map, "tls", true);
                }
                if let Some(sni) = &t.sni {
                    put(&mut map, "servername", sni.as_str());
                }
            }
        }
        if t.skip_cert_verify {
            put(&mut map, "skip-cert-verify", true);
        }

        match &t.network {
            Network::Tcp => {}
            Network::Ws { path, host } => {
                put(&mut map, "network", "ws");
                let mut opts = Mapping::new();
                if let Some(path) = path {
                    put(&mut opts, "path", path.as_str());
                }
                if let Some(host) = host {
                    let mut headers = Mapping::new();
                    put(&mut headers, "Host", host.as_str());
                    opts.insert(Value::from("headers"), Value::Mapping(headers));
                }
                map.insert(Value::from("ws-opts"), Value::Mapping(opts));
            }
            Network::Grpc { service_name } => {
                put(&mut map, "network", "grpc");
                let mut opts = Mapping::new();
                if let Some(name) = service_name {
                    put(&mut opts, "grpc-service-name", name.as_str());
                }
                map.insert(Value::from("grpc-opts"), Value::Mapping(opts));
            }
            Network::H2 { path, host } => {
                put(&mut map, "network", "h2");
                let mut opts = Mapping::new();
                if let Some(path) = path {
                    put(&mut opts, "path", path.as_str());
                }
                if let Some(host) = host {
                    opts.insert(Value::from("host"), Value::Sequence(vec![Value::from(host.as_str())]));
                }
                map.insert(Value::from("h2-opts"), Value::Mapping(opts));
            }
        }

        map
    }
}

fn put(map: &mut Mapping, key: &str, value: impl Into<Value>) {
    map.insert(Value::from(key), value.into());
}

/// ISO 3166 alpha-2 country, or `Unknown` when nothing could be determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Country {
    Code([u8; 2]),
    #[default]
    Unknown,
}

impl Country {
    /// Accepts exactly two ASCII letters, any case.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().as_bytes() {
            [a, b] if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() => {
                Some(Country::Code([a.to_ascii_uppercase(), b.to_ascii_uppercase()]))
            }
            _ => None,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Country::Code(c) => std::str::from_utf8(c).unwrap_or("UN"),
            Country::Unknown => "UN",
        }
    }

    /// Regional-indicator flag, or a globe for unknown.
    pub fn flag(&self) -> String {
        let Country::Code(code) = self else {
            return "🌐".to_string();
        };
        code.iter()
            .map(|b| char::from_u32(0x1F1E6 + u32::from(b - b'A')))
            .collect::<Option<String>>()
            .unwrap_or_else(|| "🌐".to_string())
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    /// Verified end to end through a proxy runtime.
    Runtime,
    /// Only a raw TCP dial was possible.
    TcpOnly,
}

#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node: Node,
    pub alive: bool,
    pub country: Country,
    pub latency_ms: Option<u64>,
    pub egress_ip: Option<IpAddr>,
    pub method: ProbeMethod,
}

impl NodeResult {
    pub fn dead(node: Node, method: ProbeMethod) -> Self {
        Self { node, alive: false, country: Country::Unknown, latency_ms: None, egress_ip: None, method }
    }
}

pub struct RegexPatterns {
    pub url_regex: Regex,
    pub share_link_regex: Regex,
    pub base64_regex: Regex,
}

impl RegexPatterns {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            url_regex: Regex::new(r"https?://[^\s)]+")?,
            share_link_regex: Regex::new(r"(?i)^(vmess|ss|trojan|vless)://")?,
            base64_regex: Regex::new(r"^[A-Za-z0-9+/_\-]+={0,2}$")?,
        })
    }
}
