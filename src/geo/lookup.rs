use std::borrow::Cow;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use maxminddb::Reader;
use reqwest::Client;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::Country;

/// MaxMind-format country database held in memory.
pub struct OfflineDb {
    reader: Reader<Vec<u8>>,
}

impl OfflineDb {
    pub fn from_file(path: &Path) -> Result<Self> {
        let reader = Reader::open_readfile(path)
            .map_err(|e| Error::GeoDb(format!("failed to open {}: {e}", path.display())))?;
        Ok(Self { reader })
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let reader = Reader::from_source(data).map_err(|e| Error::GeoDb(format!("failed to parse database: {e}")))?;
        Ok(Self { reader })
    }

    /// Tries the Country record first, then City, so both country-level and
    /// city-level databases work.
    pub fn country(&self, ip: IpAddr) -> Option<Country> {
        if let Ok(record) = self.reader.lookup::<maxminddb::geoip2::Country>(ip)
            && let Some(code) = record.country.and_then(|c| c.iso_code)
        {
            return Country::parse(code);
        }
        if let Ok(record) = self.reader.lookup::<maxminddb::geoip2::City>(ip)
            && let Some(code) = record.country.and_then(|c| c.iso_code)
        {
            return Country::parse(code);
        }
        None
    }
}

/// Downloads the database to `path`, checking that it parses before the
/// file is written.
pub async fn download_db(client: &Client, url: &str, path: &Path) -> Result<OfflineDb> {
    info!("📥 Downloading GeoIP database from {}", url);
    let response = client.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?.to_vec();
    let db = OfflineDb::from_bytes(bytes.clone())?;
    tokio::fs::write(path, bytes).await?;
    info!("✅ GeoIP database saved to {}", path.display());
    Ok(db)
}

/// A remote IP-to-country service. `{ip}` in the URL is substituted.
#[derive(Debug, Clone)]
pub struct LookupService {
    pub name: Cow<'static, str>,
    pub url: Cow<'static, str>,
}

pub const LOOKUP_SERVICES: &[LookupService] = &[
    LookupService::fixed("ip-api", "http://ip-api.com/json/{ip}?fields=status,countryCode"),
    LookupService::fixed("ipinfo", "https://ipinfo.io/{ip}/country"),
    LookupService::fixed("ipapi", "https://ipapi.co/{ip}/country/"),
];

impl LookupService {
    const fn fixed(name: &'static str, url: &'static str) -> Self {
        Self { name: Cow::Borrowed(name), url: Cow::Borrowed(url) }
    }

    #[cfg(test)]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self { name: Cow::Owned(name.into()), url: Cow::Owned(url.into()) }
    }

    pub async fn query(&self, client: &Client, ip: IpAddr, timeout_duration: Duration) -> Option<Country> {
        let url = self.url.replace("{ip}", &ip.to_string());
        let result = timeout(timeout_duration, async {
            let response = client.get(&url).send().await?.error_for_status()?;
            response.text().await
        })
        .await;

        match result {
            Ok(Ok(body)) => country_from_body(&body),
            Ok(Err(e)) => {
                debug!("{} lookup for {} failed: {}", self.name, ip, e);
                None
            }
            Err(_) => {
                debug!("{} lookup for {} timed out", self.name, ip);
                None
            }
        }
    }
}

/// Accepts either a bare two-letter code or a JSON object carrying one.
pub fn country_from_body(body: &str) -> Option<Country> {
    let body = body.trim();
    if body.starts_with('{') {
        let json: Value = serde_json::from_str(body).ok()?;
        country_from_json(&json)
    } else {
        Country::parse(body)
    }
}

pub fn country_from_json(json: &Value) -> Option<Country> {
    ["countryCode", "country_code", "country"]
        .iter()
        .filter_map(|key| json.get(key).and_then(Value::as_str))
        .find_map(Country::parse)
}
