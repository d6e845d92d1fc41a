//! Two-phase liveness verification.
//!
//! Phase A dials every node's `host:port` and drops the unreachable ones.
//! Phase B loads the survivors into proxy-runtime instances in batches and
//! sends a real request through each node, recording its egress country.

pub mod ports;
pub mod runtime;

pub use ports::{PortLease, PortPool};
pub use runtime::{BatchMember, BatchPlan, Egress, MihomoRuntime, ProxyRuntime, parse_egress_body};

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use reqwest::Client;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::geo::GeoResolver;
use crate::models::{Country, Node, NodeResult, ProbeMethod};
use crate::network::{PrefilterStats, dial_all, prefilter};

#[derive(Debug, Default, Clone)]
pub struct VerifyStats {
    pub tested: usize,
    pub alive: usize,
    pub dead: usize,
    pub tcp_only: usize,
    /// Alive nodes only.
    pub per_country: BTreeMap<Country, usize>,
}

impl VerifyStats {
    pub fn from_results(results: &[NodeResult]) -> Self {
        let mut stats = VerifyStats { tested: results.len(), ..VerifyStats::default() };
        for result in results {
            if result.method == ProbeMethod::TcpOnly {
                stats.tcp_only += 1;
            }
            if result.alive {
                stats.alive += 1;
                *stats.per_country.entry(result.country).or_insert(0) += 1;
            } else {
                stats.dead += 1;
            }
        }
        stats
    }
}

#[derive(Debug, Default)]
pub struct Verification {
    /// One entry per node that passed Phase A, in input order.
    pub results: Vec<NodeResult>,
    pub prefilter: PrefilterStats,
    pub stats: VerifyStats,
}

pub struct VerificationEngine<R: ProxyRuntime> {
    batch: BatchContext<R>,
}

impl<R: ProxyRuntime> VerificationEngine<R> {
    pub fn new(runtime: R, geo: Arc<GeoResolver>, settings: EngineSettings) -> Self {
        let ports = PortPool::new(settings.port_base, settings.port_span);
        let probes = Arc::new(Semaphore::new(settings.probe_workers.max(1)));
        Self {
            batch: BatchContext {
                runtime: Arc::new(runtime),
                geo,
                settings: Arc::new(settings),
                ports,
                probes,
                self_ip: None,
            },
        }
    }

    /// Host's own public address, used by the self-egress guard.
    pub fn with_self_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.batch.self_ip = ip;
        self
    }

    pub async fn verify(&self, nodes: Vec<Node>) -> Verification {
        if nodes.is_empty() {
            warn!("⚠️  Nothing to verify");
            return Verification::default();
        }

        let settings = &self.batch.settings;
        let (reachable, prefilter) = prefilter(nodes, settings.dial_workers, settings.dial_timeout).await;

        let results = if reachable.is_empty() {
            Vec::new()
        } else if settings.skip_runtime {
            self.tcp_only(reachable).await
        } else {
            self.run_batches(reachable.into_iter().map(|(node, _)| node).collect()).await
        };

        let stats = VerifyStats::from_results(&results);
        Verification { results, prefilter, stats }
    }

    /// Phase A latency stands in for liveness; country comes from the
    /// node's own address.
    async fn tcp_only(&self, reachable: Vec<(Node, u64)>) -> Vec<NodeResult> {
        info!("⏭️  Runtime verification skipped, keeping {} reachable nodes", reachable.len());
        let mut results = Vec::with_capacity(reachable.len());
        for (node, latency) in reachable {
            let country = self.batch.geo.resolve(node.host()).await;
            results.push(NodeResult {
                node,
                alive: true,
                country,
                latency_ms: Some(latency),
                egress_ip: None,
                method: ProbeMethod::TcpOnly,
            });
        }
        results
    }

    async fn run_batches(&self, nodes: Vec<Node>) -> Vec<NodeResult> {
        let settings = &self.batch.settings;
        let batches: Vec<Vec<Node>> = nodes.chunks(settings.batch_size.max(1)).map(<[Node]>::to_vec).collect();
        let total = batches.len();
        info!(
            "🧪 Verifying {} nodes in {} batches ({} concurrent, {} probe workers)...",
            nodes.len(),
            total,
            settings.max_batches,
            settings.probe_workers
        );

        let semaphore = Arc::new(Semaphore::new(settings.max_batches.max(1)));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::with_capacity(total);
        for (index, batch) in batches.into_iter().enumerate() {
            let ctx = self.batch.clone();
            let semaphore = semaphore.clone();
            let counter = counter.clone();
            let fallback = batch.clone();

            let task = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return batch.into_iter().map(|n| NodeResult::dead(n, ProbeMethod::Runtime)).collect();
                };
                let results = ctx.run(index, batch).await;
                let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let alive = results.iter().filter(|r| r.alive).count();
                info!("Batch [{}/{}] {} of {} alive", count, total, alive, results.len());
                results
            });
            tasks.push((fallback, task));
        }

        let mut results = Vec::with_capacity(nodes.len());
        for (fallback, task) in tasks {
            match task.await {
                Ok(batch) => results.extend(batch),
                Err(e) => {
                    warn!("Batch task failed: {}", e);
                    results.extend(fallback.into_iter().map(|n| NodeResult::dead(n, ProbeMethod::Runtime)));
                }
            }
        }
        results
    }
}

/// Everything one batch needs, shareable across spawned tasks.
struct BatchContext<R: ProxyRuntime> {
    runtime: Arc<R>,
    geo: Arc<GeoResolver>,
    settings: Arc<EngineSettings>,
    ports: PortPool,
    probes: Arc<Semaphore>,
    self_ip: Option<IpAddr>,
}

impl<R: ProxyRuntime> Clone for BatchContext<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            geo: self.geo.clone(),
            settings: self.settings.clone(),
            ports: self.ports.clone(),
            probes: self.probes.clone(),
            self_ip: self.self_ip,
        }
    }
}

impl<R: ProxyRuntime> BatchContext<R> {
    async fn run(self, index: usize, nodes: Vec<Node>) -> Vec<NodeResult> {
        let lease = match self.ports.lease() {
            Ok(lease) => lease,
            Err(e) => {
                warn!("⚠️  Batch {}: {}, falling back to TCP checks", index, e);
                return self.tcp_fallback(nodes).await;
            }
        };

        let plan = BatchPlan::new(index, nodes, lease.listen, lease.control);
        let handle = match self.runtime.launch(&plan).await {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                warn!("⚠️  Batch {} runtime failed to start: {}, falling back to TCP checks", index, e);
                return self.tcp_fallback(plan.members.into_iter().map(|m| m.node).collect()).await;
            }
        };
        debug!("Batch {} up on ports {}/{}", index, lease.listen, lease.control);

        // one switch+probe at a time per shared listener
        let listener = Arc::new(Mutex::new(()));
        let mut set = JoinSet::new();
        for (slot, member) in plan.members.iter().cloned().enumerate() {
            let ctx = self.clone();
            let handle = handle.clone();
            let listener = listener.clone();
            set.spawn(async move { (slot, ctx.probe_member(&handle, &listener, member).await) });
        }

        let mut outcomes: Vec<Option<NodeResult>> = vec![None; plan.members.len()];
        let finished = timeout(self.settings.batch_timeout, async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((slot, result)) => outcomes[slot] = Some(result),
                    Err(e) => warn!("Probe task in batch {} failed: {}", index, e),
                }
            }
        })
        .await;

        if finished.is_err() {
            warn!("⏰ Batch {} exceeded {:?}, abandoning remaining probes", index, self.settings.batch_timeout);
            set.abort_all();
            while set.join_next().await.is_some() {}
        }

        match Arc::try_unwrap(handle) {
            Ok(handle) => self.runtime.teardown(handle).await,
            Err(_) => warn!("Batch {} runtime still referenced, leaving cleanup to drop", index),
        }
        drop(lease);

        plan.members
            .into_iter()
            .zip(outcomes)
            .map(|(member, outcome)| outcome.unwrap_or_else(|| NodeResult::dead(member.node, ProbeMethod::Runtime)))
            .collect()
    }

    async fn probe_member(&self, handle: &R::Handle, listener: &Mutex<()>, member: BatchMember) -> NodeResult {
        let _active = listener.lock().await;
        let Ok(_permit) = self.probes.acquire().await else {
            return NodeResult::dead(member.node, ProbeMethod::Runtime);
        };

        match timeout(self.settings.switch_timeout, self.runtime.switch_active(handle, &member)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Switch to {} failed: {}", member.node.name(), e);
                return NodeResult::dead(member.node, ProbeMethod::Runtime);
            }
            Err(_) => {
                debug!("Switch to {} timed out", member.node.name());
                return NodeResult::dead(member.node, ProbeMethod::Runtime);
            }
        }

        let start = Instant::now();
        let egress = match timeout(self.settings.probe_timeout, self.runtime.probe_egress(handle)).await {
            Ok(Ok(egress)) => egress,
            Ok(Err(e)) => {
                debug!("Probe via {} failed: {}", member.node.name(), e);
                return NodeResult::dead(member.node, ProbeMethod::Runtime);
            }
            Err(_) => {
                debug!("Probe via {} timed out", member.node.name());
                return NodeResult::dead(member.node, ProbeMethod::Runtime);
            }
        };
        let latency = start.elapsed().as_millis() as u64;
        drop(_permit);
        drop(_active);

        if self.settings.reject_self_egress
            && let (Some(own), Some(seen)) = (self.self_ip, egress.ip)
            && own == seen
        {
            debug!("{} egresses from this host, rejecting", member.node.name());
            return NodeResult::dead(member.node, ProbeMethod::Runtime);
        }

        let resolved = match egress.ip {
            Some(ip) => self.geo.resolve(&ip.to_string()).await,
            None => Country::Unknown,
        };
        let country = match (resolved, egress.country) {
            (Country::Unknown, Some(reported)) => reported,
            (resolved, _) => resolved,
        };

        NodeResult {
            node: member.node,
            alive: true,
            country,
            latency_ms: Some(latency),
            egress_ip: egress.ip,
            method: ProbeMethod::Runtime,
        }
    }

    /// Used when no runtime instance could be started for a batch.
    async fn tcp_fallback(&self, nodes: Vec<Node>) -> Vec<NodeResult> {
        dial_all(nodes, self.settings.dial_workers, self.settings.dial_timeout)
            .await
            .into_iter()
            .map(|(node, latency)| NodeResult {
                node,
                alive: latency.is_some(),
                country: Country::Unknown,
                latency_ms: latency,
                egress_ip: None,
                method: ProbeMethod::TcpOnly,
            })
            .collect()
    }
}

/// Asks the egress endpoints directly, without any proxy, for this host's
/// public address.
pub async fn public_ip(client: &Client, endpoints: &[String]) -> Option<IpAddr> {
    for endpoint in endpoints {
        let Ok(response) = client.get(endpoint).send().await.and_then(|r| r.error_for_status()) else {
            continue;
        };
        if let Ok(body) = response.text().await
            && let Some(ip) = parse_egress_body(&body).and_then(|e| e.ip)
        {
            return Some(ip);
        }
    }
    None
}
