use std::collections::HashSet;

use crate::models::RegexPatterns;

/// Pulls subscription URLs out of free text, skipping `#` comment lines.
/// First occurrence wins; order is preserved.
pub fn extract_urls(text: &str, patterns: &RegexPatterns) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .flat_map(|line| patterns.url_regex.find_iter(line))
        .map(|m| m.as_str().to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}
