use std::collections::BTreeMap;
use std::path::Path;

use serde_yaml::{Mapping, Value};
use tokio::fs;

use crate::config::HEALTH_CHECK_URL;
use crate::error::Result;
use crate::models::{Country, NodeResult, ProbeMethod};
use crate::verify::VerifyStats;

pub const TOP_GROUP: &str = "🔥 Proxy";
pub const DIRECT: &str = "DIRECT";

const GLOBAL_FLAG: &str = "🌍";
const HEALTH_CHECK_INTERVAL: u64 = 300;
const URL_TEST_TOLERANCE: u64 = 50;

#[derive(Debug)]
pub struct Assembled {
    pub text: String,
    pub proxies: usize,
    pub region_proxies: usize,
}

/// Builds the Clash document from alive results. Nodes are renamed
/// `<flag> <CC>-<NNN>`, region first, then the other countries in code order.
pub fn assemble(results: &[NodeResult], region: Country) -> Result<Assembled> {
    let mut by_country: BTreeMap<Country, Vec<&NodeResult>> = BTreeMap::new();
    for result in results.iter().filter(|r| r.alive) {
        by_country.entry(result.country).or_default().push(result);
    }

    let mut ordered: Vec<(Country, Vec<&NodeResult>)> = Vec::with_capacity(by_country.len());
    if let Some(local) = by_country.remove(&region) {
        ordered.push((region, local));
    }
    ordered.extend(by_country);

    let mut proxies = Vec::new();
    let mut all_names = Vec::new();
    let mut region_names = Vec::new();
    for (country, members) in ordered {
        for (idx, result) in members.into_iter().enumerate() {
            let name = format!("{} {}-{:03}", country.flag(), country.code(), idx + 1);
            proxies.push(Value::Mapping(result.node.renamed(name.clone()).to_clash()));
            if country == region {
                region_names.push(name.clone());
            }
            all_names.push(name);
        }
    }

    let flag = region.flag();
    let global_fastest = format!("{GLOBAL_FLAG} ⚡");
    let region_fastest = format!("{flag} ⚡");
    let global_balance = format!("{GLOBAL_FLAG} ⚖️");
    let region_balance = format!("{flag} ⚖️");

    let region_members = if region_names.is_empty() { vec![DIRECT.to_string()] } else { region_names.clone() };
    let groups = vec![
        Value::Mapping(group(
            TOP_GROUP,
            "select",
            vec![global_fastest.clone(), region_fastest.clone(), global_balance.clone(), region_balance.clone()],
        )),
        url_test(&global_fastest, all_names.clone()),
        url_test(&region_fastest, region_members.clone()),
        load_balance(&global_balance, all_names.clone()),
        load_balance(&region_balance, region_members),
    ];

    let mut doc = Mapping::new();
    doc.insert("proxies".into(), Value::Sequence(proxies));
    doc.insert("proxy-groups".into(), Value::Sequence(groups));
    doc.insert(
        "rules".into(),
        Value::Sequence(vec!["GEOIP,PRIVATE,DIRECT".into(), format!("MATCH,{TOP_GROUP}").into()]),
    );

    let runtime_verified = results
        .iter()
        .filter(|r| r.alive && r.method == ProbeMethod::Runtime)
        .count();
    let header = format!(
        "# Total Proxies: {}\n# {} Nodes: {}\n# Runtime Verified: {}\n# Generated by node-sieve\n\n",
        all_names.len(),
        region.code(),
        region_names.len(),
        runtime_verified
    );

    Ok(Assembled {
        text: header + &serde_yaml::to_string(&doc)?,
        proxies: all_names.len(),
        region_proxies: region_names.len(),
    })
}

/// Valid document with nothing to route through: everything goes direct.
pub fn fallback_document() -> Result<String> {
    let mut doc = Mapping::new();
    doc.insert("proxies".into(), Value::Sequence(Vec::new()));
    doc.insert("proxy-groups".into(), Value::Sequence(Vec::new()));
    doc.insert("rules".into(), Value::Sequence(vec![format!("MATCH,{DIRECT}").into()]));
    Ok(format!("# Total Proxies: 0\n# Generated by node-sieve\n\n{}", serde_yaml::to_string(&doc)?))
}

fn group(name: &str, kind: &str, proxies: Vec<String>) -> Mapping {
    let mut map = Mapping::new();
    map.insert("name".into(), name.into());
    map.insert("type".into(), kind.into());
    map.insert("proxies".into(), Value::Sequence(proxies.into_iter().map(Value::from).collect()));
    map
}

fn url_test(name: &str, proxies: Vec<String>) -> Value {
    let mut map = group(name, "url-test", proxies);
    map.insert("url".into(), HEALTH_CHECK_URL.into());
    map.insert("interval".into(), HEALTH_CHECK_INTERVAL.into());
    map.insert("tolerance".into(), URL_TEST_TOLERANCE.into());
    Value::Mapping(map)
}

fn load_balance(name: &str, proxies: Vec<String>) -> Value {
    let mut map = group(name, "load-balance", proxies);
    map.insert("url".into(), HEALTH_CHECK_URL.into());
    map.insert("interval".into(), HEALTH_CHECK_INTERVAL.into());
    map.insert("strategy".into(), "round-robin".into());
    Value::Mapping(map)
}

pub async fn write_config(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, text).await?;
    Ok(())
}

pub async fn write_node_report(path: &Path, results: &[NodeResult], stats: &VerifyStats) -> Result<()> {
    let mut content = String::from(
        "# Node Verification\n\n| Host | Port | Type | Status | Country | Latency (ms) | Method |\n|:-----|-----:|:-----|:------|:-------|------------:|:-------|\n",
    );

    let mut sorted_results: Vec<&NodeResult> = results.iter().collect();
    sorted_results.sort_by(|a, b| {
        a.node
            .host()
            .cmp(b.node.host())
            .then_with(|| a.node.port().cmp(&b.node.port()))
    });

    for result in sorted_results {
        let status = if result.alive { "alive" } else { "dead" };
        let latency = result.latency_ms.map_or("—".to_string(), |l| l.to_string());
        let method = match result.method {
            ProbeMethod::Runtime => "runtime",
            ProbeMethod::TcpOnly => "tcp",
        };
        content.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} |\n",
            result.node.host(),
            result.node.port(),
            result.node.kind(),
            status,
            result.country,
            latency,
            method
        ));
    }

    content.push_str(&format!(
        "\n## Countries\n\nTested {}, alive {}, dead {}, TCP-only {}.\n\n| Country | Alive |\n|:--------|------:|\n",
        stats.tested, stats.alive, stats.dead, stats.tcp_only
    ));
    let mut countries: Vec<_> = stats.per_country.iter().collect();
    countries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (country, count) in countries {
        content.push_str(&format!("| {} {} | {} |\n", country.flag(), country, count));
    }

    fs::write(path, content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Node, Protocol, Transport};

    fn result(host: &str, country: &str, alive: bool) -> NodeResult {
        let node = Node::new(
            "orig".into(),
            host.into(),
            443,
            Protocol::Trojan { password: "pw".into() },
            Transport { tls: true, ..Transport::default() },
        );
        NodeResult {
            node,
            alive,
            country: Country::parse(country).unwrap_or_default(),
            latency_ms: Some(120),
            egress_ip: None,
            method: ProbeMethod::Runtime,
        }
    }

    fn names(doc: &Value) -> Vec<String> {
        doc["proxies"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_region_first_then_code_order() {
        let results = vec![
            result("a.example", "US", true),
            result("b.example", "SG", true),
            result("c.example", "JP", true),
            result("d.example", "SG", true),
            result("e.example", "JP", false),
            result("f.example", "", true),
        ];
        let region = Country::parse("SG").unwrap();
        let assembled = assemble(&results, region).unwrap();
        assert_eq!(assembled.proxies, 5);
        assert_eq!(assembled.region_proxies, 2);

        let doc: Value = serde_yaml::from_str(&assembled.text).unwrap();
        assert_eq!(
            names(&doc),
            ["🇸🇬 SG-001", "🇸🇬 SG-002", "🇯🇵 JP-001", "🇺🇸 US-001", "🌐 UN-001"]
        );

        let groups = doc["proxy-groups"].as_sequence().unwrap();
        assert_eq!(groups.len(), 5);
        assert_eq!(groups[0]["name"].as_str(), Some(TOP_GROUP));
        assert_eq!(groups[0]["proxies"].as_sequence().map(Vec::len), Some(4));
        assert_eq!(groups[2]["proxies"].as_sequence().map(Vec::len), Some(2));
        assert_eq!(groups[4]["strategy"].as_str(), Some("round-robin"));

        let rules = doc["rules"].as_sequence().unwrap();
        assert_eq!(rules[1].as_str(), Some("MATCH,🔥 Proxy"));
        assert!(assembled.text.starts_with("# Total Proxies: 5\n"));
    }

    #[test]
    fn test_empty_region_routes_direct() {
        let results = vec![result("a.example", "US", true)];
        let assembled = assemble(&results, Country::parse("SG").unwrap()).unwrap();
        let doc: Value = serde_yaml::from_str(&assembled.text).unwrap();
        let groups = doc["proxy-groups"].as_sequence().unwrap();
        assert_eq!(groups[2]["proxies"][0].as_str(), Some(DIRECT));
        assert_eq!(groups[4]["proxies"][0].as_str(), Some(DIRECT));
        assert_eq!(groups[1]["proxies"][0].as_str(), Some("🇺🇸 US-001"));
    }

    #[test]
    fn test_fallback_document() {
        let doc: Value = serde_yaml::from_str(&fallback_document().unwrap()).unwrap();
        assert_eq!(doc["proxies"].as_sequence().map(Vec::len), Some(0));
        assert_eq!(doc["proxy-groups"].as_sequence().map(Vec::len), Some(0));
        assert_eq!(doc["rules"][0].as_str(), Some("MATCH,DIRECT"));
    }

    #[tokio::test]
    async fn test_node_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        let results = vec![result("b.example", "SG", true), result("a.example", "JP", false)];
        let stats = VerifyStats::from_results(&results);
        write_node_report(&path, &results, &stats).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let a = text.find("| a.example |").unwrap();
        let b = text.find("| b.example |").unwrap();
        assert!(a < b);
        assert!(text.contains("| a.example | 443 | trojan | dead | JP | 120 | runtime |"));
        assert!(text.contains("| 🇸🇬 SG | 1 |"));
    }
}
