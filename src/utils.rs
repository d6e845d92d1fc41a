use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use percent_encoding::percent_decode_str;

use crate::config::*;

pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.0}s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.0}m {:.0}s", (seconds / 60.0).floor(), seconds % 60.0)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = (seconds % 3600.0) / 60.0;
        format!("{:.0}h {:.0}m", hours, minutes)
    }
}

/// Rough wall-clock estimate for a run over `num_nodes` validated nodes.
pub fn estimate_verification_time(num_nodes: usize, dial_workers: usize, probe_workers: usize) -> f64 {
    let nodes = num_nodes as f64;
    let dial_phase = (nodes * EST_DIAL_TIME) / dial_workers.max(1) as f64;
    let probe_phase = (nodes * EST_DIAL_SURVIVAL * EST_PROBE_TIME) / probe_workers.max(1) as f64;
    dial_phase + probe_phase
}

pub fn estimate_fetch_time(num_urls: usize, io_workers: usize) -> (f64, f64) {
    let urls = num_urls as f64;
    let fetch = (urls * EST_FETCH_TIME) / io_workers.max(1) as f64;
    (fetch, urls * EST_NODES_PER_SUB)
}

pub fn safe_limit_text(text: &str) -> &str {
    let mut end = text.len().min(MAX_TEXT_SIZE);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let limited = &text[..end];

    match limited.match_indices('\n').nth(MAX_LINES - 1) {
        Some((idx, _)) => &limited[..idx],
        None => limited,
    }
}

/// Decodes standard or URL-safe base64, tolerating stripped padding and
/// embedded whitespace.
pub fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let mut cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    let pad = (4 - cleaned.len() % 4) % 4;
    cleaned.push_str(&"=".repeat(pad));

    STANDARD
        .decode(&cleaned)
        .or_else(|_| URL_SAFE.decode(&cleaned))
        .ok()
}

pub fn decode_base64_text(input: &str) -> Option<String> {
    decode_base64(input).and_then(|bytes| String::from_utf8(bytes).ok())
}

pub fn percent_decode(input: &str) -> String {
    match percent_decode_str(input).decode_utf8() {
        Ok(cow) => cow.into_owned(),
        Err(_) => input.to_string(),
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts. The port is only
/// checked for being an integer; range checks belong to the validator.
pub fn split_host_port(input: &str) -> Option<(String, i64)> {
    let input = input.trim().trim_end_matches('/');
    let (host, port) = input.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<i64>().ok()?;
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_fixes_padding() {
        let encoded = STANDARD.encode("aes-256-gcm:secret");
        let stripped = encoded.trim_end_matches('=');
        assert_eq!(decode_base64_text(stripped).as_deref(), Some("aes-256-gcm:secret"));
    }

    #[test]
    fn test_decode_base64_url_safe() {
        let encoded = URL_SAFE.encode([0xfb, 0xff, 0xfe]);
        assert_eq!(decode_base64(&encoded), Some(vec![0xfb, 0xff, 0xfe]));
        assert!(decode_base64("!!not base64!!").is_none());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("1.2.3.4:8388"), Some(("1.2.3.4".into(), 8388)));
        assert_eq!(split_host_port("[2001:db8::1]:443"), Some(("2001:db8::1".into(), 443)));
        assert_eq!(split_host_port("example.com:0"), Some(("example.com".into(), 0)));
        assert!(split_host_port("example.com").is_none());
        assert!(split_host_port("example.com:http").is_none());
        assert!(split_host_port(":443").is_none());
    }

    #[test]
    fn test_safe_limit_text_keeps_char_boundary() {
        let text = "ä".repeat(10);
        assert_eq!(safe_limit_text(&text), text);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42.0), "42s");
        assert_eq!(format_duration(125.0), "2m 5s");
        assert_eq!(format_duration(7260.0), "2h 1m");
    }
}
