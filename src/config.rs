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

//! This module contains the code for reading the configuration: the global
//! YAML configuration (routers, IXPs, BGP settings) and the declarative
//! peering manifest. Everything is parsed into typed structures and
//! validated once at load time; the rest of the pipeline never touches raw
//! YAML values.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
};

use ipnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::communities::Asn;
use crate::AddressFamily;

/// Default IRR source order used when neither the peer nor the global
/// configuration specifies one.
pub const DEFAULT_IRR_ORDER: &str = "NTTCOM,INTERNAL,RADB,RIPE,ALTDB,BELL,LEVEL3,RGNET,APNIC,\
                                     JPIRR,ARIN,BBOI,TC,AFRINIC,RPKI,ARIN-WHOIS,REGISTROBR";

/// Environment variable overriding the PeeringDB API key from the config.
pub const PEERINGDB_KEY_ENV: &str = "AUTOPEER_PEERINGDB_KEY";

/// Environment variable pointing to a local peering manifest, used instead
/// of fetching `peerings_url`.
pub const PEERINGS_FILE_ENV: &str = "AUTOPEER_PEERINGS_FILE";

/// Environment variable overriding the configured build directory.
pub const BUILDDIR_ENV: &str = "AUTOPEER_BUILDDIR";

/// The global configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// All managed routers, keyed by their short name.
    pub bgp: BTreeMap<String, RouterConfig>,
    /// All IXPs we are present on, keyed by IXP name.
    pub ixp_map: BTreeMap<String, IxpConfig>,
    /// Per-IXP and per-(IXP, router) group settings. Keys are either an IXP
    /// name or `<ixp>-<routershort>`.
    #[serde(default)]
    pub bgp_groups: BTreeMap<String, GroupSettings>,
    /// Layered per-peer BGP setting overrides.
    #[serde(default)]
    pub bgp_settings: BTreeMap<Asn, PeerBgpSettings>,
    /// MD5 session passwords per peer ASN.
    #[serde(default)]
    pub bgp_passwords: BTreeMap<Asn, String>,
    /// Whether to emit RPKI origin-validation clauses.
    #[serde(default)]
    pub rpki: bool,
    /// URL of the peering manifest. May be left out when a local manifest
    /// file is given via the environment.
    #[serde(default)]
    pub peerings_url: Option<String>,
    /// Directory for generated prefix sets and per-router config files.
    #[serde(default = "default_builddir")]
    pub builddir: PathBuf,
    /// Directory holding the staged per-router configuration trees.
    #[serde(default = "default_stagedir")]
    pub stagedir: PathBuf,
    /// IRR server queried by the filter generator.
    #[serde(default = "default_irr_source_host")]
    pub irr_source_host: String,
    /// Global IRR source order.
    #[serde(default = "default_irr_order")]
    pub irr_order: String,
    /// Our own AS number, used by the renderers.
    #[serde(default)]
    pub local_asn: Option<Asn>,
    /// Router ID handed to the renderers when a template needs one.
    #[serde(default)]
    pub router_id: Option<Ipv4Addr>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl GlobalConfig {
    /// Load and validate the global configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_with_origin(&content, path)
    }

    /// Parse the global configuration from a YAML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::parse_with_origin(content, Path::new("<inline>"))
    }

    fn parse_with_origin(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Err(ConfigError::Empty(origin.to_path_buf()));
        }
        let mut config: GlobalConfig =
            serde_yaml_ng::from_str(content).map_err(|source| ConfigError::Yaml {
                path: origin.to_path_buf(),
                source,
            })?;
        config.post_load();
        Ok(config)
    }

    /// Fill in derived fields and report referential problems. Unknown
    /// routers in `present_on` lists are warnings, not errors: an IXP entry
    /// may legitimately predate the router definition during a migration.
    fn post_load(&mut self) {
        for (short_name, router) in self.bgp.iter_mut() {
            router.short_name = short_name.clone();
        }
        for (ixp, entry) in &self.ixp_map {
            for fqdn in &entry.present_on {
                let short = fqdn.split('.').next().unwrap_or(fqdn);
                if !self.bgp.contains_key(short) {
                    log::warn!("[{ixp}] router {fqdn} is not defined in the bgp section");
                }
            }
        }
    }

    /// Iterate over all configured routers.
    pub fn routers(&self) -> impl Iterator<Item = &RouterConfig> {
        self.bgp.values()
    }

    /// Look up a router by its fully qualified domain name.
    pub fn router_by_fqdn(&self, fqdn: &str) -> Option<&RouterConfig> {
        self.bgp.values().find(|r| r.fqdn == fqdn)
    }

    /// Look up a router by its short name.
    pub fn router_by_short_name(&self, short: &str) -> Option<&RouterConfig> {
        self.bgp.get(short)
    }

    /// Group settings for the given key (`<ixp>` or `<ixp>-<routershort>`).
    pub fn group(&self, key: &str) -> Option<&GroupSettings> {
        self.bgp_groups.get(key)
    }

    /// The effective build directory, honoring the environment override.
    pub fn effective_builddir(&self) -> PathBuf {
        std::env::var_os(BUILDDIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.builddir.clone())
    }
}

/// A single managed router.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Short name, filled from the map key in the `bgp` section.
    #[serde(skip)]
    pub short_name: String,
    /// The fully qualified domain name used for SSH and staging paths.
    pub fqdn: String,
    /// IPv4 source address for multihop sessions on this router.
    pub ipv4: Ipv4Addr,
    /// IPv6 source address for multihop sessions on this router.
    pub ipv6: Ipv6Addr,
    /// Vendor tag selecting the config renderer.
    #[serde(default = "default_vendor")]
    pub vendor: String,
    #[serde(default)]
    pub graceful_shutdown: bool,
    #[serde(default)]
    pub maintenance_mode: bool,
}

impl RouterConfig {
    /// The session source address for the given address family.
    pub fn source_address(&self, family: AddressFamily) -> IpAddr {
        match family {
            AddressFamily::Ipv4 => IpAddr::V4(self.ipv4),
            AddressFamily::Ipv6 => IpAddr::V6(self.ipv6),
        }
    }
}

/// A single IXP definition.
#[derive(Debug, Clone, Deserialize)]
pub struct IxpConfig {
    /// The IPv4 peering LAN of the IXP.
    pub ipv4_range: Ipv4Net,
    /// The IPv6 peering LAN of the IXP.
    pub ipv6_range: Ipv6Net,
    /// Default local preference for sessions found on this IXP. When unset,
    /// the resolver falls back to the per-type default.
    #[serde(default)]
    pub bgp_local_pref: Option<u32>,
    /// Optional community tagged onto routes learned on this IXP.
    #[serde(default)]
    pub ixp_community: Option<String>,
    /// FQDNs of the routers present on this IXP.
    pub present_on: Vec<String>,
}

impl IxpConfig {
    /// Whether the given address lies within one of the IXP peering LANs.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(a) => self.ipv4_range.contains(&a),
            IpAddr::V6(a) => self.ipv6_range.contains(&a),
        }
    }
}

/// Settings attached to an IXP or to a specific (IXP, router) pair.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupSettings {
    #[serde(default)]
    pub admin_down_state: Option<bool>,
    #[serde(default)]
    pub graceful_shutdown: Option<bool>,
    #[serde(default)]
    pub block_importexport: Option<bool>,
}

/// Overridable BGP settings at one precedence scope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingScope {
    #[serde(default)]
    pub bgp_local_pref: Option<u32>,
}

/// Layered BGP setting overrides for one peer ASN.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerBgpSettings {
    /// Per-session-IP overrides. Highest precedence.
    #[serde(default)]
    pub session: BTreeMap<IpAddr, SettingScope>,
    /// Per-IXP overrides.
    #[serde(default)]
    pub ixp: BTreeMap<String, SettingScope>,
    /// Overrides common to all sessions of the peer.
    #[serde(default)]
    pub common: SettingScope,
}

/// Registry (PeeringDB) client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Ordered list of API base URLs to try.
    #[serde(default = "default_mirrors")]
    pub mirrors: Vec<String>,
    /// API key. The `AUTOPEER_PEERINGDB_KEY` environment variable takes
    /// precedence over this value.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Directory holding the compressed fallback cache.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Records requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mirrors: default_mirrors(),
            api_key: None,
            cache_dir: default_cache_dir(),
            page_size: default_page_size(),
        }
    }
}

impl RegistryConfig {
    /// Resolve the API key, preferring the environment over the config.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(PEERINGDB_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone().filter(|k| !k.is_empty()))
            .ok_or(ConfigError::MissingApiKey)
    }
}

/// Deployment settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_key_path")]
    pub ssh_key_path: PathBuf,
    /// SSH connect timeout in seconds.
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout: u64,
    #[serde(default = "default_bird_bin")]
    pub bird_bin: PathBuf,
    #[serde(default = "default_birdc_bin")]
    pub birdc_bin: PathBuf,
    #[serde(default = "default_birdc6_bin")]
    pub birdc6_bin: PathBuf,
    /// Where the configuration tree lives on the routers.
    #[serde(default = "default_remote_config_dir")]
    pub remote_config_dir: String,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_deployments: usize,
    /// Wall-clock bound over a whole deployment batch, in seconds.
    #[serde(default = "default_deployment_timeout")]
    pub deployment_timeout: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            ssh_user: default_ssh_user(),
            ssh_key_path: default_ssh_key_path(),
            ssh_timeout: default_ssh_timeout(),
            bird_bin: default_bird_bin(),
            birdc_bin: default_birdc_bin(),
            birdc6_bin: default_birdc6_bin(),
            remote_config_dir: default_remote_config_dir(),
            max_parallel_deployments: default_max_parallel(),
            deployment_timeout: default_deployment_timeout(),
        }
    }
}

/// State store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub events: EventTrackingConfig,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            retention: RetentionConfig::default(),
            events: EventTrackingConfig::default(),
        }
    }
}

/// Retention windows for the state store cleanup.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Events older than this many days are removed.
    #[serde(default = "default_retention_days")]
    pub days: i64,
    /// Only the most recent N generation rows are kept.
    #[serde(default = "default_retention_generations")]
    pub generations: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
            generations: default_retention_generations(),
        }
    }
}

/// Toggles for which event categories are persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct EventTrackingConfig {
    #[serde(default = "default_true")]
    pub track_generations: bool,
    #[serde(default = "default_true")]
    pub track_deployments: bool,
    #[serde(default = "default_true")]
    pub track_errors: bool,
}

impl Default for EventTrackingConfig {
    fn default() -> Self {
        Self {
            track_generations: true,
            track_deployments: true,
            track_errors: true,
        }
    }
}

/// The commercial relationship of a peer, driving the local-pref fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    Upstream,
    #[default]
    Peer,
    Downstream,
}

impl std::fmt::Display for PeerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerType::Upstream => f.write_str("upstream"),
            PeerType::Peer => f.write_str("peer"),
            PeerType::Downstream => f.write_str("downstream"),
        }
    }
}

/// One entry of the peering manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerDeclaration {
    /// Import filter expression: a whitespace-separated list of AS-SETs and
    /// ASNs, or the literal `ANY` for an unfiltered peer.
    pub import: String,
    /// Export expression, `ANY` meaning full-table export.
    pub export: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub peer_type: PeerType,
    /// Pin the sessions to exactly these addresses.
    #[serde(default)]
    pub only_with: Option<Vec<IpAddr>>,
    /// Private (non-registry) session addresses.
    #[serde(default)]
    pub private_peerings: Option<Vec<IpAddr>>,
    /// Registry-derived session addresses to drop. Kept as strings so a
    /// single invalid entry can be rejected without failing the whole
    /// manifest.
    #[serde(default)]
    pub not_with: Vec<String>,
    /// Restrict deployment to these routers (FQDNs).
    #[serde(default)]
    pub only_on: Option<Vec<String>>,
    /// Never deploy sessions found on these IXPs.
    #[serde(default)]
    pub not_on: Vec<String>,
    #[serde(default)]
    pub ipv4_limit: Option<u32>,
    #[serde(default)]
    pub ipv6_limit: Option<u32>,
    #[serde(default)]
    pub gtsm: bool,
    #[serde(default)]
    pub multihop: bool,
    #[serde(default)]
    pub disable_multihop_source_map: bool,
    #[serde(default)]
    pub blackhole_accept: bool,
    #[serde(default)]
    pub blackhole_community: Option<Vec<String>>,
    /// Per-peer IRR source order override.
    #[serde(default)]
    pub irr_order: Option<String>,
}

impl PeerDeclaration {
    /// The individual AS-SET/ASN tokens of the import expression.
    pub fn import_tokens(&self) -> Vec<&str> {
        self.import.split_whitespace().collect()
    }

    /// Whether the peer is imported without a prefix filter.
    pub fn is_unfiltered(&self) -> bool {
        self.import == "ANY"
    }

    /// Whether the peer receives a full table.
    pub fn exports_full_table(&self) -> bool {
        self.export == "ANY"
    }
}

/// The parsed peering manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// All valid peer declarations, keyed by ASN.
    pub peers: BTreeMap<Asn, PeerDeclaration>,
    /// Manifest keys that failed ASN validation. They are excluded from the
    /// run but still accounted for.
    pub invalid_asns: Vec<String>,
    /// Truncated SHA-256 over the raw manifest text.
    pub config_hash: String,
}

impl Manifest {
    /// Parse a manifest document. Invalid ASN keys are logged and collected
    /// rather than failing the parse; everything else is strict.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Err(ConfigError::EmptyManifest);
        }
        let raw: BTreeMap<String, PeerDeclaration> =
            serde_yaml_ng::from_str(content).map_err(ConfigError::ManifestYaml)?;

        let mut peers = BTreeMap::new();
        let mut invalid_asns = Vec::new();
        for (key, declaration) in raw {
            match key.parse::<Asn>() {
                Ok(asn) => {
                    peers.insert(asn, declaration);
                }
                Err(_) => {
                    log::error!("invalid ASN in peering manifest: {key}");
                    invalid_asns.push(key);
                }
            }
        }

        Ok(Self {
            peers,
            invalid_asns,
            config_hash: hex::encode(Sha256::digest(content.as_bytes()))[..16].to_string(),
        })
    }

    /// Load a manifest from a local file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }
}

/// Error kind returned when loading configuration documents.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid YAML or does not match the schema.
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml_ng::Error,
    },
    /// The document exists but holds nothing.
    #[error("configuration document {0} is empty")]
    Empty(PathBuf),
    /// The peering manifest is not valid YAML or violates the schema.
    #[error("invalid YAML in peering manifest: {0}")]
    ManifestYaml(serde_yaml_ng::Error),
    /// The peering manifest holds nothing.
    #[error("peering manifest is empty")]
    EmptyManifest,
    /// Neither the environment nor the config provides an API key.
    #[error("no PeeringDB API key: set {PEERINGDB_KEY_ENV} or registry.api_key")]
    MissingApiKey,
    /// Neither a manifest URL nor a local manifest file is configured.
    #[error("no peering manifest source: set peerings_url or {PEERINGS_FILE_ENV}")]
    NoManifestSource,
}

fn default_builddir() -> PathBuf {
    PathBuf::from("/opt/routefilters")
}

fn default_stagedir() -> PathBuf {
    PathBuf::from("/opt/router-staging")
}

fn default_irr_source_host() -> String {
    "rr.ntt.net".to_string()
}

fn default_irr_order() -> String {
    DEFAULT_IRR_ORDER.to_string()
}

fn default_vendor() -> String {
    "bird".to_string()
}

fn default_mirrors() -> Vec<String> {
    vec![
        "https://www.peeringdb.com/api".to_string(),
        "https://peeringdb.org/api".to_string(),
    ]
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/autopeer")
}

fn default_page_size() -> usize {
    1000
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_key_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    PathBuf::from(home).join(".ssh/id_rsa")
}

fn default_ssh_timeout() -> u64 {
    30
}

fn default_bird_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/bird")
}

fn default_birdc_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/birdc")
}

fn default_birdc6_bin() -> PathBuf {
    PathBuf::from("/usr/local/bin/birdc6")
}

fn default_remote_config_dir() -> String {
    "/etc/bird".to_string()
}

fn default_max_parallel() -> usize {
    3
}

fn default_deployment_timeout() -> u64 {
    300
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/autopeer/state.db")
}

fn default_retention_days() -> i64 {
    30
}

fn default_retention_generations() -> i64 {
    100
}

fn default_true() -> bool {
    true
}
