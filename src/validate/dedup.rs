use std::collections::HashSet;

use crate::models::Node;

/// Keeps the first node seen for each `host:port:type`, preserving input order.
pub fn dedup(nodes: impl IntoIterator<Item = Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    nodes.into_iter().filter(|node| seen.insert(node.key())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Protocol, RegexPatterns, Transport};
    use crate::parsers::decode;
    use crate::validate::validate_all;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    fn trojan(name: &str, host: &str, port: u16) -> Node {
        Node::new(
            name.into(),
            host.into(),
            port,
            Protocol::Trojan { password: "pw".into() },
            Transport { tls: true, ..Transport::default() },
        )
    }

    #[test]
    fn test_first_occurrence_wins() {
        let a = trojan("A", "1.1.1.1", 443);
        let b = trojan("B", "2.2.2.2", 443);
        let a2 = trojan("A'", "1.1.1.1", 443);
        let out = dedup(vec![a.clone(), b.clone(), a2]);
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn test_idempotent() {
        let nodes = vec![
            trojan("A", "1.1.1.1", 443),
            trojan("B", "1.1.1.1", 8443),
            trojan("C", "1.1.1.1", 443),
            trojan("D", "2.2.2.2", 443),
        ];
        let once = dedup(nodes);
        let twice = dedup(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn test_type_is_part_of_identity() {
        let t = trojan("T", "1.1.1.1", 443);
        let v = Node::new(
            "V".into(),
            "1.1.1.1".into(),
            443,
            Protocol::Vless { uuid: "u".into() },
            Transport::default(),
        );
        assert_eq!(dedup(vec![t, v]).len(), 2);
    }

    #[test]
    fn test_same_ss_endpoint_from_two_links() {
        let userinfo = STANDARD.encode("aes-256-gcm:pw");
        let text = format!("ss://{userinfo}@1.2.3.4:8388#A\nss://{userinfo}@1.2.3.4:8388#B\n");
        let patterns = RegexPatterns::new().unwrap();
        let (nodes, _) = validate_all(decode(text.as_bytes(), &patterns).nodes);
        assert_eq!(nodes.len(), 2);

        let unique = dedup(nodes);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].name(), "A");
    }
}
