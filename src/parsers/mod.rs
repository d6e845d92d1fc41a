pub mod config_files;
pub mod proxy_urls;

use std::collections::BTreeMap;

use tracing::debug;

use crate::models::{RawNode, RegexPatterns};
use crate::parsers::{
    config_files::{parse_clash_yaml, parse_v2ray_json},
    proxy_urls::parse_share_link,
};
use crate::utils::{decode_base64_text, safe_limit_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceFormat {
    ClashYaml,
    V2rayJson,
    ShareLinks,
}

impl SourceFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceFormat::ClashYaml => "clash-yaml",
            SourceFormat::V2rayJson => "v2ray-json",
            SourceFormat::ShareLinks => "share-links",
        }
    }
}

#[derive(Debug, Default)]
pub struct Decoded {
    /// Format that produced the candidates, `None` if nothing matched.
    pub format: Option<SourceFormat>,
    /// Whether the payload was wrapped in base64.
    pub base64_wrapped: bool,
    pub nodes: Vec<RawNode>,
    /// Entries recognised as node records that could not be parsed.
    pub skipped: usize,
}

impl Decoded {
    fn from_format(format: SourceFormat, (nodes, skipped): (Vec<RawNode>, usize)) -> Self {
        Self { format: Some(format), base64_wrapped: false, nodes, skipped }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DecodeStats {
    pub sources: usize,
    pub candidates: usize,
    pub skipped: usize,
    pub undecodable: usize,
    pub by_format: BTreeMap<&'static str, usize>,
}

impl DecodeStats {
    pub fn record(&mut self, decoded: &Decoded) {
        self.sources += 1;
        self.candidates += decoded.nodes.len();
        self.skipped += decoded.skipped;
        match decoded.format {
            Some(format) => *self.by_format.entry(format.as_str()).or_default() += 1,
            None => self.undecodable += 1,
        }
    }
}

/// Turns a raw subscription body into node candidates, in input order.
/// Never fails: unusable input yields an empty result.
pub fn decode(raw: &[u8], patterns: &RegexPatterns) -> Decoded {
    let text = String::from_utf8_lossy(raw);
    decode_text(&text, patterns, true)
}

fn decode_text(text: &str, patterns: &RegexPatterns, allow_base64: bool) -> Decoded {
    let text = safe_limit_text(text).trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Decoded::default();
    }

    if let Some(parsed) = parse_clash_yaml(text) {
        debug!("Decoded Clash document with {} entries", parsed.0.len());
        return Decoded::from_format(SourceFormat::ClashYaml, parsed);
    }

    if let Some(parsed) = parse_v2ray_json(text) {
        debug!("Decoded outbound JSON with {} entries", parsed.0.len());
        return Decoded::from_format(SourceFormat::V2rayJson, parsed);
    }

    if allow_base64 {
        if let Some(inner) = unwrap_base64(text, patterns) {
            let mut decoded = decode_text(&inner, patterns, false);
            if decoded.format.is_some() {
                decoded.base64_wrapped = true;
                return decoded;
            }
        }
    }

    let parsed = parse_share_links(text, patterns);
    if parsed.0.is_empty() && parsed.1 == 0 {
        return Decoded::default();
    }
    Decoded::from_format(SourceFormat::ShareLinks, parsed)
}

fn unwrap_base64(text: &str, patterns: &RegexPatterns) -> Option<String> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.contains("://") || !patterns.base64_regex.is_match(&compact) {
        return None;
    }
    decode_base64_text(&compact)
}

fn parse_share_links(text: &str, patterns: &RegexPatterns) -> (Vec<RawNode>, usize) {
    let mut nodes = Vec::new();
    let mut skipped = 0;

    for line in text.lines().map(str::trim) {
        if !patterns.share_link_regex.is_match(line) {
            continue;
        }
        match parse_share_link(line) {
            Some(node) => nodes.push(node),
            None => {
                debug!("Skipping malformed link: {:.48}", line);
                skipped += 1;
            }
        }
    }

    (nodes, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    fn patterns() -> RegexPatterns {
        RegexPatterns::new().unwrap()
    }

    fn ss_link(name: &str) -> String {
        format!("ss://{}@1.2.3.4:8388#{name}", STANDARD.encode("aes-256-gcm:pw"))
    }

    #[test]
    fn test_share_link_list_keeps_order() {
        let text = format!("{}\n\ntrojan://pw@example.com:443#T\n{}", ss_link("A"), ss_link("B"));
        let decoded = decode(text.as_bytes(), &patterns());
        assert_eq!(decoded.format, Some(SourceFormat::ShareLinks));
        let names: Vec<_> = decoded.nodes.iter().filter_map(|n| n.text("name")).collect();
        assert_eq!(names, ["A", "T", "B"]);
    }

    #[test]
    fn test_malformed_vmess_does_not_affect_siblings() {
        let text = format!("vmess://%%%not-base64%%%\n{}\ntrojan://pw@example.com:443", ss_link("A"));
        let decoded = decode(text.as_bytes(), &patterns());
        assert_eq!(decoded.nodes.len(), 2);
        assert_eq!(decoded.skipped, 1);
    }

    #[test]
    fn test_base64_wrapped_list_is_unwrapped_once() {
        let inner = format!("{}\n{}", ss_link("A"), ss_link("B"));
        let wrapped = STANDARD.encode(&inner);
        let decoded = decode(wrapped.as_bytes(), &patterns());
        assert!(decoded.base64_wrapped);
        assert_eq!(decoded.nodes.len(), 2);

        // Two layers of base64 are not unwrapped.
        let twice = STANDARD.encode(&wrapped);
        let decoded = decode(twice.as_bytes(), &patterns());
        assert!(decoded.nodes.is_empty());
        assert_eq!(decoded.format, None);
    }

    #[test]
    fn test_base64_wrapped_clash_document() {
        let doc = "proxies:\n  - {name: a, type: trojan, server: example.com, port: 443, password: pw}\n";
        let decoded = decode(STANDARD.encode(doc).as_bytes(), &patterns());
        assert_eq!(decoded.format, Some(SourceFormat::ClashYaml));
        assert_eq!(decoded.nodes.len(), 1);
    }

    #[test]
    fn test_clash_document_wins_over_links() {
        let doc = format!("proxies:\n  - {{name: a, type: trojan, server: example.com, port: 443, password: pw}}\n# {}\n", ss_link("x"));
        let decoded = decode(doc.as_bytes(), &patterns());
        assert_eq!(decoded.format, Some(SourceFormat::ClashYaml));
        assert_eq!(decoded.nodes.len(), 1);
    }

    #[test]
    fn test_garbage_yields_nothing() {
        let p = patterns();
        assert!(decode(b"", &p).nodes.is_empty());
        assert!(decode(&[0xff, 0xfe, 0x00], &p).nodes.is_empty());
        assert!(decode(b"<html>blocked</html>", &p).format.is_none());
    }

    #[test]
    fn test_stats_record() {
        let p = patterns();
        let mut stats = DecodeStats::default();
        stats.record(&decode(ss_link("A").as_bytes(), &p));
        stats.record(&decode(b"nothing here", &p));
        assert_eq!(stats.sources, 2);
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.undecodable, 1);
        assert_eq!(stats.by_format.get("share-links"), Some(&1));
    }
}
