use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::net::{TcpStream, lookup_host};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::models::Node;

#[derive(Debug, Default, Clone, Copy)]
pub struct PrefilterStats {
    pub tested: usize,
    pub reachable: usize,
    pub unreachable: usize,
}

/// Resolves `host` and opens a TCP connection. DNS and connect each get
/// `timeout_duration`. Returns the connect latency in milliseconds.
pub async fn tcp_dial(host: &str, port: u16, timeout_duration: Duration) -> Option<u64> {
    let addrs = match timeout(timeout_duration, lookup_host((host, port))).await {
        Ok(Ok(addrs)) => addrs,
        _ => return None,
    };

    let start = Instant::now();
    let deadline = start + timeout_duration;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Ok(Ok(_stream)) = timeout(remaining, TcpStream::connect(addr)).await {
            return Some(start.elapsed().as_millis() as u64);
        }
    }
    None
}

/// Dials every node through a pool of `workers`; output order matches input.
pub async fn dial_all(nodes: Vec<Node>, workers: usize, timeout_duration: Duration) -> Vec<(Node, Option<u64>)> {
    let total = nodes.len();
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let counter = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::with_capacity(total);
    for node in nodes {
        let semaphore = semaphore.clone();
        let counter = counter.clone();
        let fallback = node.clone();

        let task = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return (node, None);
            };
            let latency = tcp_dial(node.host(), node.port(), timeout_duration).await;
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;

            let status = latency.map_or("FAIL".to_string(), |l| format!("{} ms", l));
            debug!("Dial [{}/{}] {}:{} -> {}", count, total, node.host(), node.port(), status);

            (node, latency)
        });
        tasks.push((fallback, task));
    }

    let mut results = Vec::with_capacity(total);
    for (fallback, task) in tasks {
        match task.await {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!("Dial task for {}:{} failed: {}", fallback.host(), fallback.port(), e);
                results.push((fallback, None));
            }
        }
    }
    results
}

/// Phase A: drops nodes whose `host:port` does not accept a TCP connection.
pub async fn prefilter(nodes: Vec<Node>, workers: usize, timeout_duration: Duration) -> (Vec<(Node, u64)>, PrefilterStats) {
    info!("🔌 Dialing {} nodes with {} workers...", nodes.len(), workers);
    let dialed = dial_all(nodes, workers, timeout_duration).await;

    let mut stats = PrefilterStats { tested: dialed.len(), ..PrefilterStats::default() };
    let reachable: Vec<(Node, u64)> = dialed
        .into_iter()
        .filter_map(|(node, latency)| latency.map(|l| (node, l)))
        .collect();
    stats.reachable = reachable.len();
    stats.unreachable = stats.tested - stats.reachable;

    info!("✅ {} of {} nodes accept TCP connections", stats.reachable, stats.tested);
    (reachable, stats)
}
