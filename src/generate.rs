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

//! One configuration generation run: pull the registry snapshot, resolve
//! the manifest into session policies, materialize the prefix filter sets,
//! and render the per-router configuration files. Every run — successful or
//! not — leaves one generation record and its correlated event behind.

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::Path;
use std::time::Instant;

use crate::communities::Asn;
use crate::config::{ConfigError, GlobalConfig, Manifest, PEERINGS_FILE_ENV};
use crate::filters::{has_prefix_sets, FilterGenerator, FilterRequest};
use crate::policy::{PolicyResolver, ResolutionOutcome};
use crate::registry::RegistryClient;
use crate::state::{EventKind, GenerationRecord, StateEvent, StateStore};
use crate::vendor::{PluginRegistry, TemplateVars};
use crate::AutopeerError;

/// What a generation run should produce.
#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    /// Render the per-router configuration files.
    pub configs: bool,
    /// Materialize the prefix filter sets.
    pub prefixsets: bool,
    /// Report peers whose prefix sets are missing when only rendering
    /// configs (disabled by `--no-checks`).
    pub do_checks: bool,
}

/// Result of one generation run.
#[derive(Debug)]
pub struct GenerationSummary {
    pub generation_id: i64,
    pub peer_count: usize,
    /// Session policies emitted by the resolver.
    pub session_policies: usize,
    /// Filter stanzas rendered, one per (router, ASN, family).
    pub filter_count: usize,
    /// ASNs whose filter task reported an error.
    pub filters_failed: usize,
    /// ASNs skipped because their prefix sets are missing.
    pub skipped_missing_filters: Vec<Asn>,
}

struct RunStats {
    resolution: ResolutionOutcome,
    filter_count: usize,
    filters_failed: usize,
    skipped_missing_filters: Vec<Asn>,
}

/// Drives one generation run over explicitly injected services.
pub struct Generator<'a> {
    config: &'a GlobalConfig,
    manifest: &'a Manifest,
    plugins: &'a PluginRegistry,
    state: &'a StateStore,
    registry: &'a RegistryClient,
}

impl<'a> Generator<'a> {
    pub fn new(
        config: &'a GlobalConfig,
        manifest: &'a Manifest,
        plugins: &'a PluginRegistry,
        state: &'a StateStore,
        registry: &'a RegistryClient,
    ) -> Self {
        Self {
            config,
            manifest,
            plugins,
            state,
            registry,
        }
    }

    pub async fn run(
        &self,
        options: &GenerationOptions,
    ) -> Result<GenerationSummary, AutopeerError> {
        let start = Instant::now();
        let start_memory = peak_memory_mb();

        let start_event = StateEvent::new(
            EventKind::GenerationStart,
            "generate",
            "Starting configuration generation",
        )
        .details(serde_json::json!({
            "total_peers": self.manifest.peers.len(),
            "generate_configs": options.configs,
            "generate_prefixsets": options.prefixsets,
            "memory_start_mb": start_memory,
        }));
        if let Err(e) = self.state.track_event(&start_event) {
            log::error!("[state] cannot record generation start: {e}");
        }

        let result = self.run_inner(options).await;
        let duration_ms = start.elapsed().as_millis() as i64;
        let memory_peak_mb = peak_memory_mb().max(start_memory);

        match result {
            Ok(stats) => {
                let record = GenerationRecord {
                    config_hash: self.manifest.config_hash.clone(),
                    peer_count: self.manifest.peers.len() as i64,
                    filter_count: stats.filter_count as i64,
                    duration_ms,
                    memory_peak_mb,
                    success: true,
                    metadata: serde_json::json!({
                        "generate_configs": options.configs,
                        "generate_prefixsets": options.prefixsets,
                        "memory_start_mb": start_memory,
                        "sessions_matched": stats.resolution.sessions_matched,
                        "invalid_manifest_keys": stats.resolution.invalid_manifest_keys,
                        "invalid_import_tokens": stats.resolution.invalid_import_tokens,
                        "filters_failed": stats.filters_failed,
                    }),
                    ..Default::default()
                };
                let generation_id = self.state.track_generation(&record).unwrap_or_else(|e| {
                    log::error!("[state] cannot record generation: {e}");
                    0
                });
                log::info!(
                    "Generation {generation_id} completed in {:.1}s ({} policies, {} filter stanzas)",
                    duration_ms as f64 / 1000.0,
                    stats.resolution.policies.len(),
                    stats.filter_count
                );
                Ok(GenerationSummary {
                    generation_id,
                    peer_count: self.manifest.peers.len(),
                    session_policies: stats.resolution.policies.len(),
                    filter_count: stats.filter_count,
                    filters_failed: stats.filters_failed,
                    skipped_missing_filters: stats.skipped_missing_filters,
                })
            }
            Err(e) => {
                // failed runs still leave an audit trail
                let record = GenerationRecord {
                    config_hash: self.manifest.config_hash.clone(),
                    peer_count: self.manifest.peers.len() as i64,
                    duration_ms,
                    memory_peak_mb,
                    success: false,
                    error_message: e.to_string(),
                    ..Default::default()
                };
                if let Err(track_error) = self.state.track_generation(&record) {
                    log::error!("[state] cannot record failed generation: {track_error}");
                }
                Err(e)
            }
        }
    }

    async fn run_inner(&self, options: &GenerationOptions) -> Result<RunStats, AutopeerError> {
        let sessions = self.registry.fetch_sessions().await?;
        let limits = self.registry.fetch_prefix_limits().await?;

        let resolver = PolicyResolver::new(self.config, self.manifest, &sessions, &limits);
        let resolution = resolver.resolve_all();

        let builddir = self.config.effective_builddir();

        let mut filters_failed = 0;
        let mut skipped_missing_filters = Vec::new();
        if options.prefixsets {
            let generator = FilterGenerator::new(&builddir, self.config.irr_source_host.clone());
            let requests: Vec<FilterRequest> = self
                .manifest
                .peers
                .iter()
                .map(|(asn, decl)| FilterRequest {
                    asn: *asn,
                    tokens: decl.import_tokens().iter().map(ToString::to_string).collect(),
                    irr_order: decl
                        .irr_order
                        .clone()
                        .unwrap_or_else(|| self.config.irr_order.clone()),
                    blackhole_accept: decl.blackhole_accept,
                })
                .collect();
            let outcomes = generator.generate_all(requests).await;
            filters_failed = outcomes.iter().filter(|o| !o.is_success()).count();
        } else if options.do_checks {
            for (asn, decl) in &self.manifest.peers {
                if !decl.is_unfiltered() && !has_prefix_sets(&builddir, *asn) {
                    log::info!("skipped {asn} due to missing prefix set files");
                    skipped_missing_filters.push(*asn);
                }
            }
        }

        let filter_count = if options.configs {
            self.render_configs(&builddir, &resolution)?
        } else {
            0
        };

        Ok(RunStats {
            resolution,
            filter_count,
            filters_failed,
            skipped_missing_filters,
        })
    }

    /// Render the per-router, per-family configuration files. The filter
    /// stanza of one (router, ASN, family) is emitted exactly once, in
    /// front of its first session stanza.
    fn render_configs(
        &self,
        builddir: &Path,
        resolution: &ResolutionOutcome,
    ) -> Result<usize, AutopeerError> {
        for router in self.config.routers() {
            for v in [4u8, 6u8] {
                let path = builddir.join(format!("{}.ipv{v}.config", router.fqdn));
                match std::fs::remove_file(&path) {
                    Ok(()) => log::debug!("removed stale config {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        log::debug!("config for {} was not present, nothing to delete", router.fqdn)
                    }
                    Err(e) => return Err(AutopeerError::Io(e)),
                }
            }
        }

        let vars = TemplateVars::from_config(self.config);
        let mut seen_policy: BTreeSet<(String, Asn, u8)> = BTreeSet::new();
        let mut rendered = 0usize;

        for peer in &resolution.policies {
            let Some(router) = self.config.router_by_fqdn(&peer.router) else {
                log::error!("[{}] router disappeared from configuration", peer.router);
                continue;
            };
            let Some(plugin) = self.plugins.get(&router.vendor) else {
                log::error!(
                    "[{}] no active plugin for vendor {}, session {} not rendered",
                    peer.router,
                    router.vendor,
                    peer.session_ip
                );
                continue;
            };

            let mut blob = String::new();
            let key = (peer.router.clone(), peer.asn, peer.family.as_num());
            if seen_policy.insert(key) {
                blob.push_str(&plugin.generate_filter_config(peer)?);
                rendered += 1;
            }
            blob.push_str(&plugin.generate_config(peer, &vars)?);

            let path = builddir.join(format!("{}.ipv{}.config", peer.router, peer.family.as_num()));
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(blob.as_bytes())?;
        }

        Ok(rendered)
    }
}

/// Acquire the peering manifest: a local override file when the environment
/// names one, otherwise the configured URL.
pub async fn load_manifest(
    config: &GlobalConfig,
    registry: &RegistryClient,
) -> Result<Manifest, AutopeerError> {
    if let Ok(path) = std::env::var(PEERINGS_FILE_ENV) {
        log::info!("loading peering manifest from {path}");
        return Ok(Manifest::load(path)?);
    }
    let Some(url) = &config.peerings_url else {
        return Err(ConfigError::NoManifestSource.into());
    };
    log::info!("fetching peering manifest from {url}");
    let text = registry.download_text(url).await?;
    Ok(Manifest::parse(&text)?)
}

/// Peak resident memory of this process in MB (`VmHWM`). Reported as 0 on
/// platforms without procfs.
pub fn peak_memory_mb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmHWM:") {
                    if let Some(kb) = rest
                        .split_whitespace()
                        .next()
                        .and_then(|t| t.parse::<f64>().ok())
                    {
                        return kb / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}
