use reqwest::{Client, Response};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{AGGREGATOR_TIMEOUT, MAX_TEXT_SIZE, URL_TIMEOUT, USER_AGENT};
use crate::error::Result;
use crate::parsers::config_files::parse_clash_yaml;

pub fn build_client() -> Result<Client> {
    Ok(Client::builder().user_agent(USER_AGENT).timeout(URL_TIMEOUT).build()?)
}

/// Reads at most `limit` bytes. A body advertised as larger is not read at all.
async fn read_limited(mut response: Response, limit: usize) -> reqwest::Result<Option<Vec<u8>>> {
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Ok(None);
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = limit - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

pub async fn fetch_body(client: &Client, url: &str, timeout_duration: Duration) -> (String, Option<Vec<u8>>) {
    fetch_body_limited(client, url, timeout_duration, MAX_TEXT_SIZE).await
}

async fn fetch_body_limited(
    client: &Client,
    url: &str,
    timeout_duration: Duration,
    limit: usize,
) -> (String, Option<Vec<u8>>) {
    let result = timeout(timeout_duration, async {
        let response = client.get(url).send().await?.error_for_status()?;
        read_limited(response, limit).await
    })
    .await;

    match result {
        Ok(Ok(Some(body))) => (url.to_string(), Some(body)),
        Ok(Ok(None)) => {
            debug!("Fetch {} skipped: body over {} bytes", url, limit);
            (url.to_string(), None)
        }
        Ok(Err(e)) => {
            debug!("Fetch {} failed: {}", url, e);
            (url.to_string(), None)
        }
        Err(_) => {
            debug!("Fetch {} timed out", url);
            (url.to_string(), None)
        }
    }
}

/// Fetches every subscription; failed URLs are skipped.
pub async fn fetch_all(client: &Client, urls: &[String], workers: usize) -> Vec<(String, Vec<u8>)> {
    info!("📥 Fetching {} subscriptions with {} workers...", urls.len(), workers);
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let counter = Arc::new(AtomicUsize::new(0));
    let total = urls.len();

    let mut tasks = Vec::new();
    for url in urls.iter().cloned() {
        let client = client.clone();
        let semaphore = semaphore.clone();
        let counter = counter.clone();

        tasks.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return (url, None);
            };
            let (url, body) = fetch_body(&client, &url, URL_TIMEOUT).await;
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;

            let size = body.as_ref().map_or(0, |b| b.len());
            let status = if body.is_some() { "OK" } else { "FAIL" };
            info!("Fetch [{}/{}] {} -> {}, {} bytes", count, total, url, status, size);

            (url, body)
        }));
    }

    let mut bodies = Vec::new();
    for task in tasks {
        match task.await {
            Ok((url, Some(body))) => bodies.push((url, body)),
            Ok((_, None)) => {}
            Err(e) => warn!("Fetch task failed: {}", e),
        }
    }
    bodies
}

/// Asks a remote aggregation service to merge all subscriptions into one
/// Clash document. Endpoints are tried in order; the first body with a
/// `proxies` collection wins.
pub async fn fetch_via_aggregator(client: &Client, endpoints: &[String], urls: &[String]) -> Option<Vec<u8>> {
    let combined = urls.join("|");
    info!("🔄 Using aggregation service for {} subscriptions...", urls.len());

    for endpoint in endpoints {
        info!("   Trying {}...", endpoint);
        let request = client
            .get(endpoint)
            .timeout(AGGREGATOR_TIMEOUT)
            .query(&[
                ("target", "clash"),
                ("url", combined.as_str()),
                ("list", "true"),
                ("udp", "true"),
                ("emoji", "false"),
                ("insert", "false"),
            ]);

        let body = match request.send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => match read_limited(response, MAX_TEXT_SIZE).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    warn!("   ❌ Response larger than {} bytes", MAX_TEXT_SIZE);
                    continue;
                }
                Err(e) => {
                    warn!("   ❌ Failed: {}", e);
                    continue;
                }
            },
            Err(e) => {
                warn!("   ❌ Failed: {}", e);
                continue;
            }
        };

        let text = String::from_utf8_lossy(&body);
        if let Some((nodes, _)) = parse_clash_yaml(&text) {
            info!("   ✅ Success! Got {} nodes", nodes.len());
            return Some(body);
        }
        warn!("   ❌ Response carried no proxies");
    }

    warn!("   ❌ All aggregation endpoints failed");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_raw(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}/sub")
    }

    async fn serve_once(body: &'static str) -> String {
        serve_raw(format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        ))
        .await
    }

    #[tokio::test]
    async fn test_fetch_body_ok() {
        let url = serve_once("ss://abc").await;
        let client = build_client().unwrap();
        let (_, body) = fetch_body(&client, &url, Duration::from_secs(2)).await;
        assert_eq!(body.as_deref(), Some(&b"ss://abc"[..]));
    }

    #[tokio::test]
    async fn test_oversized_body_is_skipped() {
        let url = serve_raw(format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            64,
            "x".repeat(64)
        ))
        .await;
        let client = build_client().unwrap();
        let (_, body) = fetch_body_limited(&client, &url, Duration::from_secs(2), 16).await;
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn test_unsized_body_is_cut_at_limit() {
        let url = serve_raw(format!("HTTP/1.1 200 OK\r\nconnection: close\r\n\r\n{}", "y".repeat(64))).await;
        let client = build_client().unwrap();
        let (_, body) = fetch_body_limited(&client, &url, Duration::from_secs(2), 16).await;
        assert_eq!(body.map(|b| b.len()), Some(16));
    }

    #[tokio::test]
    async fn test_fetch_all_skips_failures() {
        let good = serve_once("proxies: []").await;
        let client = build_client().unwrap();
        let urls = vec![good.clone(), "http://127.0.0.1:1/missing".to_string()];
        let bodies = fetch_all(&client, &urls, 4).await;
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].0, good);
    }

    #[tokio::test]
    async fn test_aggregator_falls_through_endpoints() {
        let good = serve_once("proxies:\n  - {name: a, type: trojan, server: h, port: 443, password: p}\n").await;
        let client = build_client().unwrap();
        let endpoints = vec!["http://127.0.0.1:1/sub".to_string(), good];
        let body = fetch_via_aggregator(&client, &endpoints, &["https://example.com/s".to_string()]).await;
        assert!(body.is_some());
    }
}
