//! Host to country resolution.
//!
//! Order of attempts: run cache, bogon filter, DNS, offline database,
//! remote services, hostname hints. Every result, `Unknown` included, is
//! cached for the rest of the run.

pub mod bogon;
pub mod heuristics;
pub mod lookup;

pub use bogon::is_bogon;
pub use heuristics::heuristic_country;
pub use lookup::{LOOKUP_SERVICES, LookupService, OfflineDb};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use reqwest::Client;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{GEOIP_DB_URL, GeoSettings};
use crate::error::Result;
use crate::models::Country;

pub struct GeoResolver {
    cache: Mutex<HashMap<String, Country>>,
    offline: Option<OfflineDb>,
    services: Vec<LookupService>,
    client: Client,
    settings: GeoSettings,
}

impl GeoResolver {
    pub fn new(settings: GeoSettings, offline: Option<OfflineDb>) -> Result<Self> {
        let client = Client::builder().timeout(settings.lookup_timeout).build()?;
        let services = if settings.remote { LOOKUP_SERVICES.to_vec() } else { Vec::new() };
        Ok(Self { cache: Mutex::new(HashMap::new()), offline, services, client, settings })
    }

    /// Replaces the remote lookup services, in the order they are tried.
    #[cfg(test)]
    pub fn with_services(mut self, services: Vec<LookupService>) -> Self {
        self.services = services;
        self
    }

    /// Opens the offline database, downloading it first when allowed.
    pub async fn from_settings(settings: GeoSettings, client: &Client) -> Result<Self> {
        let offline = match &settings.db_path {
            Some(path) if path.exists() => match OfflineDb::from_file(path) {
                Ok(db) => Some(db),
                Err(e) => {
                    warn!("⚠️  {}", e);
                    None
                }
            },
            Some(path) if settings.download => match lookup::download_db(client, GEOIP_DB_URL, path).await {
                Ok(db) => Some(db),
                Err(e) => {
                    warn!("⚠️  GeoIP download failed: {}", e);
                    None
                }
            },
            _ => None,
        };
        if offline.is_none() {
            debug!("No offline GeoIP database, relying on remote lookups");
        }
        Self::new(settings, offline)
    }

    pub fn has_offline_db(&self) -> bool {
        self.offline.is_some()
    }

    pub fn cached_hosts(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Never fails; anything unresolvable is [`Country::Unknown`].
    pub async fn resolve(&self, host: &str) -> Country {
        let key = host.trim().trim_start_matches('[').trim_end_matches(']').to_lowercase();
        if let Some(country) = self.cached(&key) {
            return country;
        }

        let country = self.lookup(&key).await;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, country);
        }
        country
    }

    fn cached(&self, key: &str) -> Option<Country> {
        self.cache.lock().ok()?.get(key).copied()
    }

    async fn lookup(&self, host: &str) -> Country {
        let literal = host.parse::<IpAddr>().ok();
        let ip = match literal {
            Some(ip) => ip,
            None => match self.resolve_dns(host).await {
                Some(ip) => ip,
                None => return heuristic_country(host).unwrap_or_default(),
            },
        };

        self.locate(host, ip, literal.is_some()).await
    }

    /// Country of an already-resolved address; `host` feeds the hint table
    /// when it is a name and every source comes up empty.
    async fn locate(&self, host: &str, ip: IpAddr, literal: bool) -> Country {
        if is_bogon(ip) {
            return Country::Unknown;
        }

        if let Some(country) = self.offline.as_ref().and_then(|db| db.country(ip)) {
            return country;
        }

        for service in &self.services {
            if let Some(country) = service.query(&self.client, ip, self.settings.lookup_timeout).await {
                debug!("{} -> {} via {}", host, country, service.name);
                return country;
            }
        }

        if literal {
            Country::Unknown
        } else {
            heuristic_country(host).unwrap_or_default()
        }
    }

    async fn resolve_dns(&self, host: &str) -> Option<IpAddr> {
        let addrs = timeout(self.settings.dns_timeout, lookup_host((host, 0))).await.ok()?.ok()?;
        let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        addrs.iter().find(|ip| ip.is_ipv4()).or_else(|| addrs.first()).copied()
    }
}
