use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

// Fetch
pub const URL_TIMEOUT: Duration = Duration::from_secs(10);
pub const AGGREGATOR_TIMEOUT: Duration = Duration::from_secs(60);
pub const USER_AGENT: &str = "clash-verge/v1.7.7";
pub const MAX_IO_WORKERS: usize = 32;
pub const MAX_TEXT_SIZE: usize = 50 * 1024 * 1024; // 50MB
pub const MAX_LINES: usize = 50000;
pub const MAX_PROXIES_PER_CONFIG: usize = 5000;
pub const AGGREGATOR_ENDPOINTS: &[&str] = &[
    "https://sub.xeton.dev/sub",
    "https://api.dler.io/sub",
    "https://sub.id9.cc/sub",
];

// Phase A
pub const DIAL_TIMEOUT: Duration = Duration::from_millis(1500);
pub const MAX_DIAL_WORKERS: usize = 128;

// Phase B
pub const BATCH_SIZE: usize = 40;
pub const MAX_BATCHES: usize = 4;
pub const MAX_PROBE_WORKERS: usize = MAX_BATCHES;
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(6);
pub const SWITCH_TIMEOUT: Duration = Duration::from_secs(2);
pub const READY_TIMEOUT: Duration = Duration::from_secs(8);
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(300);
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(2);
pub const PORT_BASE: u16 = 17890;
pub const PORT_SPAN: u16 = 200;
pub const DEFAULT_RUNTIME_BIN: &str = "mihomo";
pub const EGRESS_ENDPOINTS: &[&str] = &[
    "http://ip-api.com/json/?fields=status,countryCode,query",
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
];

// Geo
pub const GEO_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);
pub const DNS_TIMEOUT: Duration = Duration::from_secs(2);
pub const GEOIP_DB_PATH: &str = "GeoLite2-Country.mmdb";
pub const GEOIP_DB_URL: &str =
    "https://cdn.jsdelivr.net/npm/@ip-location-db/geolite2-country-mmdb/geolite2-country.mmdb";

// Output
pub const DEFAULT_REGION: &str = "SG";
pub const HEALTH_CHECK_URL: &str = "http://clients3.google.com/generate_204";

// ETA estimation constants
pub const EST_FETCH_TIME: f64 = 0.4;
pub const EST_NODES_PER_SUB: f64 = 50.0;
pub const EST_DIAL_TIME: f64 = 0.3;
pub const EST_PROBE_TIME: f64 = 1.5;
pub const EST_DIAL_SURVIVAL: f64 = 0.5;

#[derive(Parser, Debug)]
#[command(about = "Subscription node aggregator with egress verification")]
pub struct Args {
    /// File listing subscription URLs, one per line
    #[arg(default_value = "sources.txt")]
    pub input: PathBuf,

    /// Output Clash YAML
    #[arg(short, long, default_value = "clash.yaml")]
    pub output: PathBuf,

    /// Optional markdown report of every verified node
    #[arg(short, long)]
    pub report: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Country code for the region groups
    #[arg(long, default_value = DEFAULT_REGION)]
    pub region: String,

    /// Resolve subscriptions through a remote aggregation service first
    #[arg(long)]
    pub aggregator: bool,

    /// Aggregation service endpoints, tried in order
    #[arg(long = "aggregator-endpoint")]
    pub aggregator_endpoints: Vec<String>,

    /// Maximum concurrent subscription fetches
    #[arg(long, default_value_t = MAX_IO_WORKERS)]
    pub max_io_workers: usize,

    /// Maximum concurrent TCP dials
    #[arg(long, default_value_t = MAX_DIAL_WORKERS)]
    pub max_dial_workers: usize,

    /// TCP dial timeout in milliseconds
    #[arg(long, default_value_t = DIAL_TIMEOUT.as_millis() as u64)]
    pub dial_timeout_ms: u64,

    /// Maximum concurrent egress probes across all batches. Each batch
    /// probes one node at a time, so values above --max-batches have no effect
    #[arg(long, default_value_t = MAX_PROBE_WORKERS)]
    pub max_probe_workers: usize,

    /// Egress probe timeout in milliseconds
    #[arg(long, default_value_t = PROBE_TIMEOUT.as_millis() as u64)]
    pub probe_timeout_ms: u64,

    /// Nodes per proxy runtime instance
    #[arg(long, default_value_t = BATCH_SIZE)]
    pub batch_size: usize,

    /// Proxy runtime instances running at once
    #[arg(long, default_value_t = MAX_BATCHES)]
    pub max_batches: usize,

    /// Upper bound on one batch, in seconds
    #[arg(long, default_value_t = BATCH_TIMEOUT.as_secs())]
    pub batch_timeout_secs: u64,

    /// First local port handed to proxy runtime instances
    #[arg(long, default_value_t = PORT_BASE)]
    pub port_base: u16,

    /// Proxy runtime executable (Clash/mihomo compatible)
    #[arg(long, default_value = DEFAULT_RUNTIME_BIN)]
    pub runtime_bin: PathBuf,

    /// Working directory for the proxy runtime
    #[arg(long)]
    pub runtime_workdir: Option<PathBuf>,

    /// Skip the proxy runtime and keep every node that accepts a TCP dial
    #[arg(long)]
    pub skip_runtime: bool,

    /// Treat a node whose egress IP equals our own public IP as dead
    #[arg(long)]
    pub reject_self_egress: bool,

    /// Offline MaxMind-format country database
    #[arg(long, default_value = GEOIP_DB_PATH)]
    pub geoip_db: PathBuf,

    /// Download the country database when it is missing
    #[arg(long)]
    pub geoip_download: bool,

    /// Never query remote geolocation services
    #[arg(long)]
    pub no_remote_geo: bool,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub dial_workers: usize,
    pub dial_timeout: Duration,
    pub probe_workers: usize,
    pub probe_timeout: Duration,
    pub switch_timeout: Duration,
    pub batch_size: usize,
    pub max_batches: usize,
    pub batch_timeout: Duration,
    pub port_base: u16,
    pub port_span: u16,
    pub skip_runtime: bool,
    pub reject_self_egress: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dial_workers: MAX_DIAL_WORKERS,
            dial_timeout: DIAL_TIMEOUT,
            probe_workers: MAX_PROBE_WORKERS,
            probe_timeout: PROBE_TIMEOUT,
            switch_timeout: SWITCH_TIMEOUT,
            batch_size: BATCH_SIZE,
            max_batches: MAX_BATCHES,
            batch_timeout: BATCH_TIMEOUT,
            port_base: PORT_BASE,
            port_span: PORT_SPAN,
            skip_runtime: false,
            reject_self_egress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub binary: PathBuf,
    pub workdir: Option<PathBuf>,
    pub egress_endpoints: Vec<String>,
    pub ready_timeout: Duration,
    pub grace_period: Duration,
}

#[derive(Debug, Clone)]
pub struct GeoSettings {
    pub db_path: Option<PathBuf>,
    pub download: bool,
    pub remote: bool,
    pub lookup_timeout: Duration,
    pub dns_timeout: Duration,
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            db_path: None,
            download: false,
            remote: true,
            lookup_timeout: GEO_LOOKUP_TIMEOUT,
            dns_timeout: DNS_TIMEOUT,
        }
    }
}

impl Args {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            dial_workers: self.max_dial_workers.max(1),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            probe_workers: self.max_probe_workers.clamp(1, self.max_batches.max(1)),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            batch_size: self.batch_size.max(1),
            max_batches: self.max_batches.max(1),
            batch_timeout: Duration::from_secs(self.batch_timeout_secs),
            port_base: self.port_base,
            skip_runtime: self.skip_runtime,
            reject_self_egress: self.reject_self_egress,
            ..EngineSettings::default()
        }
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            binary: self.runtime_bin.clone(),
            workdir: self.runtime_workdir.clone(),
            egress_endpoints: EGRESS_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            ready_timeout: READY_TIMEOUT,
            grace_period: TEARDOWN_GRACE,
        }
    }

    pub fn geo_settings(&self) -> GeoSettings {
        GeoSettings {
            db_path: Some(self.geoip_db.clone()),
            download: self.geoip_download,
            remote: !self.no_remote_geo,
            ..GeoSettings::default()
        }
    }

    pub fn aggregator_endpoints(&self) -> Vec<String> {
        if self.aggregator_endpoints.is_empty() {
            AGGREGATOR_ENDPOINTS.iter().map(|s| s.to_string()).collect()
        } else {
            self.aggregator_endpoints.clone()
        }
    }
}
