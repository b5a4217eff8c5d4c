// AutoPeer: BGP peering automation toolchain written in Rust
// Copyright (C) 2022-2023 AutoPeer contributors <noc@autopeer.example.net>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Client for the PeeringDB registry. Fetches the session addresses
//! (`netixlan`) and advertised prefix counts (`net`) of all networks, with
//! offset-based pagination, chunked downloads, bounded retries, mirror
//! fallback, and a compressed on-disk cache as the last resort.

use std::{
    collections::BTreeMap,
    io::{Read, Write},
    net::IpAddr,
    path::PathBuf,
    time::Duration,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::communities::Asn;
use crate::config::{ConfigError, RegistryConfig};

const MAX_RETRIES: usize = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Cache files older than this trigger a staleness warning when used.
const CACHE_STALE_AFTER: Duration = Duration::from_secs(24 * 3600);
const USER_AGENT: &str = "autopeer";

/// Effective max-prefix limits of one network, already scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrefixLimits {
    pub v4: u32,
    pub v6: u32,
}

/// One `netixlan` row: a network's presence on an IXP LAN.
#[derive(Debug, Deserialize, Serialize)]
struct NetIxLanRecord {
    asn: Option<u32>,
    ipaddr4: Option<IpAddr>,
    ipaddr6: Option<IpAddr>,
}

/// One `net` row, reduced to the fields we consume.
#[derive(Debug, Deserialize, Serialize)]
struct NetRecord {
    asn: Option<u32>,
    info_prefixes4: Option<i64>,
    info_prefixes6: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Option<Vec<T>>,
}

/// Client over the configured registry mirrors.
pub struct RegistryClient {
    http: reqwest::Client,
    auth: String,
    mirrors: Vec<String>,
    cache_dir: PathBuf,
    page_size: usize,
}

impl RegistryClient {
    /// Create a client. Fails when no API key can be resolved.
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let api_key = config.resolve_api_key()?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            auth: format!("Api-Key {api_key}"),
            mirrors: config.mirrors.clone(),
            cache_dir: config.cache_dir.clone(),
            page_size: config.page_size,
        })
    }

    /// Fetch all registry sessions, keyed by the raw ASN value.
    pub async fn fetch_sessions(&self) -> Result<BTreeMap<u32, Vec<IpAddr>>, RegistryError> {
        let records: Vec<NetIxLanRecord> = self.fetch_endpoint("netixlan").await?;
        let mut sessions: BTreeMap<u32, Vec<IpAddr>> = BTreeMap::new();
        let mut processed = 0usize;
        for record in records {
            let Some(asn) = record.asn else { continue };
            let entry = sessions.entry(asn).or_default();
            if let Some(v4) = record.ipaddr4 {
                entry.push(v4);
            }
            if let Some(v6) = record.ipaddr6 {
                entry.push(v6);
            }
            processed += 1;
            if processed % 10_000 == 0 {
                log::debug!("[registry] processed {processed} connections for {} ASNs", sessions.len());
            }
        }
        log::info!(
            "[registry] {} sessions across {} ASNs",
            sessions.values().map(Vec::len).sum::<usize>(),
            sessions.len()
        );
        Ok(sessions)
    }

    /// Fetch the advertised-prefix counts of all networks and derive the
    /// effective max-prefix limits.
    pub async fn fetch_prefix_limits(&self) -> Result<BTreeMap<Asn, PrefixLimits>, RegistryError> {
        let records: Vec<NetRecord> = self.fetch_endpoint("net").await?;
        let mut limits = BTreeMap::new();
        for record in records {
            let Some(raw) = record.asn else { continue };
            let Ok(asn) = Asn::new(raw) else {
                log::debug!("[registry] skipping reserved ASN {raw} in net data");
                continue;
            };
            limits.insert(
                asn,
                PrefixLimits {
                    v4: effective_prefix_limit(record.info_prefixes4),
                    v6: effective_prefix_limit(record.info_prefixes6),
                },
            );
        }
        log::info!("[registry] prefix limits for {} ASNs", limits.len());
        Ok(limits)
    }

    /// Download a text document (e.g. the peering manifest) with the same
    /// retry discipline as registry pages.
    pub async fn download_text(&self, url: &str) -> Result<String, RegistryError> {
        let body = self.get_with_retry(url, false).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Fetch every record of one endpoint: each mirror is tried in order,
    /// the first success refreshes the on-disk cache, and only when all
    /// mirrors fail is the cache consulted.
    async fn fetch_endpoint<T>(&self, endpoint: &str) -> Result<Vec<T>, RegistryError>
    where
        T: DeserializeOwned + Serialize,
    {
        for mirror in &self.mirrors {
            match self.fetch_paginated::<T>(mirror, endpoint).await {
                Ok(records) => {
                    if let Err(e) = self.write_cache(endpoint, &records) {
                        log::warn!("[registry] failed to cache {endpoint}: {e}");
                    }
                    return Ok(records);
                }
                Err(e) => {
                    log::warn!("[registry] mirror {mirror} failed for {endpoint}: {e}");
                }
            }
        }

        match self.read_cache::<T>(endpoint) {
            Ok(records) => {
                log::warn!("[registry] all mirrors failed, using cached {endpoint} data");
                Ok(records)
            }
            Err(e) => {
                log::error!("[registry] no usable cache for {endpoint}: {e}");
                Err(RegistryError::Exhausted {
                    endpoint: endpoint.to_string(),
                })
            }
        }
    }

    /// Walk one endpoint page by page until a short or empty page. Page
    /// buffers are dropped as soon as they are decoded so peak memory stays
    /// proportional to one page plus the accumulated records.
    async fn fetch_paginated<T: DeserializeOwned>(
        &self,
        base: &str,
        endpoint: &str,
    ) -> Result<Vec<T>, RegistryError> {
        let mut records: Vec<T> = Vec::new();
        let mut page = 0usize;
        loop {
            let url = format!(
                "{base}/{endpoint}?limit={}&skip={}",
                self.page_size,
                page * self.page_size
            );
            log::debug!(
                "[registry] fetching page {} of {endpoint} ({} records so far)",
                page + 1,
                records.len()
            );
            let body = self.get_with_retry(&url, true).await?;
            let parsed: Page<T> =
                serde_json::from_slice(&body).map_err(|source| RegistryError::Decode {
                    url: url.clone(),
                    source,
                })?;
            drop(body);

            let Some(data) = parsed.data else {
                log::warn!("[registry] no 'data' field in response from {url}");
                break;
            };
            let count = data.len();
            if count == 0 {
                break;
            }
            records.extend(data);
            if count < self.page_size {
                break;
            }
            page += 1;
        }
        records.shrink_to_fit();
        Ok(records)
    }

    /// One GET with up to [`MAX_RETRIES`] attempts. Timeouts and connection
    /// errors back off exponentially and retry; an HTTP error status aborts
    /// immediately. The body is read chunk by chunk.
    async fn get_with_retry(&self, url: &str, authenticated: bool) -> Result<Vec<u8>, RegistryError> {
        let mut attempt = 0usize;
        loop {
            match self.get_streamed(url, authenticated).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_RETRIES => {
                    let wait = Duration::from_secs(1 << attempt);
                    log::warn!(
                        "[registry] {e} (attempt {}/{MAX_RETRIES}), retrying in {}s",
                        attempt + 1,
                        wait.as_secs()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_streamed(&self, url: &str, authenticated: bool) -> Result<Vec<u8>, RegistryError> {
        let mut request = self.http.get(url);
        if authenticated {
            request = request.header(reqwest::header::AUTHORIZATION, &self.auth);
        }
        let response = request.send().await.map_err(|e| classify(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let mut response = response;
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(url, e))? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn cache_path(&self, endpoint: &str) -> PathBuf {
        self.cache_dir.join(format!("{endpoint}.json.gz"))
    }

    fn write_cache<T: Serialize>(&self, endpoint: &str, records: &[T]) -> Result<(), RegistryError> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let path = self.cache_path(endpoint);
        let file = std::fs::File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&serde_json::to_vec(records).map_err(RegistryError::CacheEncode)?)?;
        encoder.finish()?;
        log::debug!("[registry] cached {endpoint} response to {}", path.display());
        Ok(())
    }

    fn read_cache<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Vec<T>, RegistryError> {
        let path = self.cache_path(endpoint);
        let metadata = std::fs::metadata(&path)?;
        if let Ok(age) = metadata.modified().and_then(|m| {
            m.elapsed()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        }) {
            if age > CACHE_STALE_AFTER {
                log::warn!(
                    "[registry] cached {endpoint} data is {:.1} hours old",
                    age.as_secs_f64() / 3600.0
                );
            }
        }
        let file = std::fs::File::open(&path)?;
        let mut decoder = GzDecoder::new(file);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        serde_json::from_slice(&raw).map_err(RegistryError::CacheEncode)
    }
}

/// Derive the effective max-prefix limit from a registry-reported value.
/// Missing or tiny values clamp to 100; anything else gets 10% headroom
/// against registry under-reporting, truncated to an integer.
pub fn effective_prefix_limit(reported: Option<i64>) -> u32 {
    match reported {
        None => 100,
        Some(n) if n < 100 => 100,
        Some(n) => (n as f64 * 1.1) as u32,
    }
}

fn classify(url: &str, error: reqwest::Error) -> RegistryError {
    if error.is_timeout() {
        RegistryError::Timeout {
            url: url.to_string(),
        }
    } else if error.is_connect() {
        RegistryError::Connect {
            url: url.to_string(),
            source: error,
        }
    } else {
        RegistryError::Http(error)
    }
}

/// Error kind returned by the [`RegistryClient`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Generic HTTP client error.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    /// The request timed out.
    #[error("timeout downloading {url}")]
    Timeout { url: String },
    /// The connection could not be established.
    #[error("connection error downloading {url}: {source}")]
    Connect { url: String, source: reqwest::Error },
    /// The server answered with a non-success status. Not retried.
    #[error("HTTP error downloading {url}: status {status}")]
    Status { url: String, status: u16 },
    /// The response body is not the expected JSON.
    #[error("cannot decode response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
    /// I/O failure on the fallback cache.
    #[error("cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),
    /// The fallback cache holds unparsable data.
    #[error("cache encode/decode error: {0}")]
    CacheEncode(serde_json::Error),
    /// Every mirror and the cache failed.
    #[error("all registry mirrors failed for {endpoint} and no usable cache exists")]
    Exhausted { endpoint: String },
    /// Configuration problem (e.g. no API key).
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RegistryError {
    /// Whether a fresh attempt of the same request can succeed.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Timeout { .. } | RegistryError::Connect { .. }
        )
    }
}
