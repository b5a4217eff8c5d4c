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

//! The deployment orchestrator. Validates the local environment and the
//! staged configuration trees, then rolls the staged configuration out to
//! the fleet over rsync + SSH with bounded parallelism and a batch
//! deadline. Every attempt, including a failed or timed-out one, leaves
//! exactly one deployment record behind. There is no automatic rollback: a
//! failed router is recorded and left to the operator.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet, time::timeout};

use crate::config::{DeployConfig, GlobalConfig};
use crate::ssh::{SshError, SshSession};
use crate::state::{DeploymentRecord, EventKind, StateError, StateEvent, StateStore};
use crate::vendor::{DaemonStatus, PluginRegistry};

/// Config fragments that must exist in every staged router tree. An empty
/// fragment is a warning (deployed but trivial), a missing one an error.
pub const ESSENTIAL_FILES: [&str; 6] = [
    "header-ipv4.conf",
    "header-ipv6.conf",
    "interfaces-ipv4.conf",
    "interfaces-ipv6.conf",
    "peerings/peers.ipv4.conf",
    "peerings/peers.ipv6.conf",
];

/// Per-address-family configs validated through the vendor plugin.
const VALIDATED_CONFIGS: [&str; 2] = ["bird.conf", "bird6.conf"];

/// Rollout state of one router deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    Pending,
    Uploading,
    Reloading,
    Succeeded,
    Failed,
}

impl std::fmt::Display for DeployState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployState::Pending => f.write_str("pending"),
            DeployState::Uploading => f.write_str("uploading"),
            DeployState::Reloading => f.write_str("reloading"),
            DeployState::Succeeded => f.write_str("succeeded"),
            DeployState::Failed => f.write_str("failed"),
        }
    }
}

/// One router as seen by the deployer.
#[derive(Debug, Clone)]
pub struct RouterTarget {
    /// FQDN, also the SSH host.
    pub name: String,
    pub short_name: String,
    pub vendor: String,
    /// Staged configuration tree for this router.
    pub config_dir: PathBuf,
    pub maintenance_mode: bool,
}

/// Terminal result of one router rollout.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub router: String,
    pub state: DeployState,
    /// The router was skipped because it is in maintenance mode.
    pub skipped_maintenance: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Aggregate of one deployment batch.
#[derive(Debug)]
pub struct DeploymentSummary {
    pub successful: usize,
    pub failed: usize,
    pub duration: Duration,
    pub outcomes: Vec<DeployOutcome>,
}

impl DeploymentSummary {
    /// The batch counts as successful only with zero failures.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Status of one router as reported by `check_router_status`.
#[derive(Debug, Clone)]
pub struct RouterStatus {
    pub reachable: bool,
    pub daemon: Option<DaemonStatus>,
    pub error: Option<String>,
}

/// Orchestrates validation and rollout for the configured fleet.
pub struct Deployer<'a> {
    config: &'a GlobalConfig,
    plugins: &'a PluginRegistry,
    state: StateStore,
    routers: Vec<RouterTarget>,
    parallel: usize,
    deadline: Duration,
}

impl<'a> Deployer<'a> {
    pub fn new(config: &'a GlobalConfig, plugins: &'a PluginRegistry, state: &StateStore) -> Self {
        let routers = config
            .routers()
            .map(|r| RouterTarget {
                name: r.fqdn.clone(),
                short_name: r.short_name.clone(),
                vendor: r.vendor.clone(),
                config_dir: config.stagedir.join(&r.fqdn),
                maintenance_mode: r.maintenance_mode,
            })
            .collect();
        Self {
            config,
            plugins,
            state: state.clone(),
            routers,
            parallel: config.deploy.max_parallel_deployments,
            deadline: Duration::from_secs(config.deploy.deployment_timeout),
        }
    }

    /// The routers this deployer operates on.
    pub fn routers(&self) -> &[RouterTarget] {
        &self.routers
    }

    /// Restrict the batch to routers whose name contains the fragment.
    /// Returns how many routers remain.
    pub fn retain_routers(&mut self, fragment: &str) -> usize {
        self.routers.retain(|r| r.name.contains(fragment));
        self.routers.len()
    }

    pub fn set_parallelism(&mut self, parallel: usize) {
        self.parallel = parallel.max(1);
    }

    pub fn set_timeout(&mut self, seconds: u64) {
        self.deadline = Duration::from_secs(seconds);
    }

    /// Check the local preconditions: writable work directories, the deploy
    /// key, the router-control binaries, and a staged tree per router. Any
    /// failure aborts before anything touches the network.
    pub fn validate_environment(&self) -> Result<(), DeployError> {
        log::info!("Validating deployment environment");

        let builddir = self.config.effective_builddir();
        for dir in [&builddir, &self.config.stagedir] {
            if !dir.is_dir() {
                return Err(DeployError::MissingDirectory(dir.clone()));
            }
            if tempfile::tempfile_in(dir).is_err() {
                return Err(DeployError::NotWritable(dir.clone()));
            }
        }

        self.validate_ssh_key()?;

        let deploy = &self.config.deploy;
        for binary in [&deploy.bird_bin, &deploy.birdc_bin] {
            if !binary.exists() {
                return Err(DeployError::MissingBinary(binary.clone()));
            }
            if !crate::is_executable(binary) {
                return Err(DeployError::NotExecutable(binary.clone()));
            }
        }

        for router in &self.routers {
            if !router.config_dir.is_dir() {
                return Err(DeployError::MissingStagedConfig {
                    router: router.name.clone(),
                    path: router.config_dir.clone(),
                });
            }
        }

        log::info!("Environment validation passed");
        Ok(())
    }

    fn validate_ssh_key(&self) -> Result<(), DeployError> {
        let key = &self.config.deploy.ssh_key_path;
        if !key.exists() {
            return Err(DeployError::MissingSshKey(key.clone()));
        }
        let metadata = std::fs::File::open(key)
            .and_then(|f| f.metadata())
            .map_err(|_| DeployError::SshKeyNotReadable(key.clone()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = metadata.permissions().mode() & 0o777;
            if mode != 0o600 && mode != 0o400 {
                log::warn!(
                    "SSH key permissions are {mode:o}, should be 600 or 400: {}",
                    key.display()
                );
            }
        }
        #[cfg(not(unix))]
        let _ = metadata;

        let probe = std::process::Command::new("ssh-keygen")
            .arg("-l")
            .arg("-f")
            .arg(key)
            .output();
        match probe {
            Ok(output) if output.status.success() => {
                log::debug!("SSH key validated: {}", key.display());
                Ok(())
            }
            Ok(output) => Err(DeployError::InvalidSshKey(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Err(e) => Err(DeployError::InvalidSshKey(e.to_string())),
        }
    }

    /// Validate every staged per-address-family config through its vendor
    /// plugin and check the essential fragments. A router without an active
    /// plugin is an error for that router; errors are counted across the
    /// fleet and reported together.
    pub async fn comprehensive_validation(&self) -> Result<(), DeployError> {
        log::info!("Performing comprehensive configuration validation");
        let mut errors = 0usize;

        for router in &self.routers {
            log::info!("[{}] validating staged configuration", router.name);

            let Some(plugin) = self.plugins.get(&router.vendor) else {
                log::error!(
                    "[{}] no active plugin for vendor: {}",
                    router.name,
                    router.vendor
                );
                errors += 1;
                continue;
            };

            for config_file in VALIDATED_CONFIGS {
                let path = router.config_dir.join(config_file);
                if !path.exists() {
                    log::warn!("[{}] configuration file not found: {}", router.name, path.display());
                    continue;
                }
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => {
                        if !plugin.validate_config(&content).await {
                            log::error!(
                                "[{}] configuration validation failed: {}",
                                router.name,
                                path.display()
                            );
                            errors += 1;
                        }
                    }
                    Err(e) => {
                        log::error!("[{}] cannot read {}: {e}", router.name, path.display());
                        errors += 1;
                    }
                }
            }

            errors += self.validate_config_sections(router);
        }

        if errors > 0 {
            let event = StateEvent::new(
                EventKind::ValidationFailure,
                "deploy",
                format!("Configuration validation failed with {errors} errors"),
            )
            .failure();
            if let Err(e) = self.state.track_event(&event) {
                log::error!("[state] cannot record validation failure: {e}");
            }
            return Err(DeployError::ValidationFailed(errors));
        }
        log::info!("Comprehensive validation passed");
        Ok(())
    }

    fn validate_config_sections(&self, router: &RouterTarget) -> usize {
        let mut errors = 0;
        for file in ESSENTIAL_FILES {
            let path = router.config_dir.join(file);
            match std::fs::metadata(&path) {
                Err(_) => {
                    log::error!(
                        "[{}] essential configuration file missing: {}",
                        router.name,
                        path.display()
                    );
                    errors += 1;
                }
                Ok(m) if m.len() == 0 => {
                    log::warn!(
                        "[{}] configuration file is empty: {}",
                        router.name,
                        path.display()
                    );
                }
                Ok(_) => {}
            }
        }
        errors
    }

    /// Deploy the staged configuration to every router in the batch over a
    /// fixed-size worker pool. Routers in maintenance mode are skipped and
    /// counted as success; a router's failure never cancels its siblings.
    /// The whole batch is bounded by the deployment timeout — routers whose
    /// task has not finished by then are recorded as failed.
    pub async fn deploy_all(&self) -> Result<DeploymentSummary, DeployError> {
        log::info!("Starting deployment to {} routers", self.routers.len());
        let start = Instant::now();
        let generation_id = self.state.latest_generation_id().unwrap_or_default();

        let start_event = StateEvent::new(
            EventKind::DeploymentStart,
            "deploy",
            format!("Starting deployment to {} routers", self.routers.len()),
        )
        .details(serde_json::json!({
            "router_count": self.routers.len(),
            "routers": self.routers.iter().map(|r| r.name.clone()).collect::<Vec<_>>(),
            "parallel_deployments": self.parallel,
        }));
        if let Err(e) = self.state.track_event(&start_event) {
            log::error!("[state] cannot record deployment start: {e}");
        }

        let semaphore = Arc::new(Semaphore::new(self.parallel));
        let mut pending: BTreeSet<String> =
            self.routers.iter().map(|r| r.name.clone()).collect();
        let mut jobs: JoinSet<DeployOutcome> = JoinSet::new();
        for router in self.routers.iter().cloned() {
            let semaphore = semaphore.clone();
            let deploy_config = self.config.deploy.clone();
            let state = self.state.clone();
            jobs.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                deploy_single(router, deploy_config, state, generation_id).await
            });
        }

        let mut outcomes: Vec<DeployOutcome> = Vec::new();
        let all_joined = timeout(self.deadline, async {
            while let Some(joined) = jobs.join_next().await {
                match joined {
                    Ok(outcome) => {
                        pending.remove(&outcome.router);
                        outcomes.push(outcome);
                    }
                    Err(e) => log::error!("deployment worker panicked: {e}"),
                }
            }
        })
        .await;

        if all_joined.is_err() {
            log::error!(
                "Deployment timeout after {}s, abandoning outstanding transfers",
                self.deadline.as_secs()
            );
            jobs.abort_all();
        }

        // every attempt gets its terminal record, even an abandoned one
        for router in pending {
            let record = DeploymentRecord {
                generation_id,
                router: router.clone(),
                config_hash: "unknown".to_string(),
                duration_ms: self.deadline.as_millis() as i64,
                success: false,
                error_message: "deployment timed out".to_string(),
                validation_passed: false,
                ..Default::default()
            };
            if let Err(e) = self.state.track_deployment(&record) {
                log::error!("[{router}] cannot record timed-out deployment: {e}");
            }
            outcomes.push(DeployOutcome {
                router,
                state: DeployState::Failed,
                skipped_maintenance: false,
                duration: self.deadline,
                error: Some("deployment timed out".to_string()),
            });
        }

        let successful = outcomes
            .iter()
            .filter(|o| o.state == DeployState::Succeeded)
            .count();
        let failed = outcomes.len() - successful;
        let duration = start.elapsed();
        let success = failed == 0;

        let mut summary_event = StateEvent::new(
            if success {
                EventKind::DeploymentSuccess
            } else {
                EventKind::DeploymentFailure
            },
            "deploy",
            format!("Deployment completed: {successful} successful, {failed} failed"),
        )
        .details(serde_json::json!({
            "successful_deployments": successful,
            "failed_deployments": failed,
            "total_routers": outcomes.len(),
            "total_duration_ms": duration.as_millis() as i64,
        }))
        .duration_ms(duration.as_millis() as i64);
        if !success {
            summary_event = summary_event.failure();
        }
        if let Err(e) = self.state.track_event(&summary_event) {
            log::error!("[state] cannot record deployment summary: {e}");
        }

        if success {
            log::info!(
                "All deployments completed successfully in {:.1}s",
                duration.as_secs_f64()
            );
        } else {
            log::error!("Deployment completed with {failed} failures");
        }

        Ok(DeploymentSummary {
            successful,
            failed,
            duration,
            outcomes,
        })
    }

    /// Check every router, preferring the vendor plugin's live status query
    /// and falling back to a bare SSH reachability probe.
    pub async fn check_router_status(&self) -> BTreeMap<String, RouterStatus> {
        log::info!("Checking router status");
        let mut results = BTreeMap::new();
        for router in &self.routers {
            let status = match self.plugins.get(&router.vendor) {
                Some(plugin) => match plugin.daemon_status().await {
                    Some(daemon) => RouterStatus {
                        reachable: daemon.running,
                        error: daemon.error.clone(),
                        daemon: Some(daemon),
                    },
                    None => self.probe_router(router).await,
                },
                None => self.probe_router(router).await,
            };
            results.insert(router.name.clone(), status);
        }
        results
    }

    async fn probe_router(&self, router: &RouterTarget) -> RouterStatus {
        let deploy = &self.config.deploy;
        let session = SshSession::new(
            &deploy.ssh_user,
            &router.name,
            &deploy.ssh_key_path,
            deploy.ssh_timeout,
        );
        let reachable = session
            .reachable(Duration::from_secs(deploy.ssh_timeout))
            .await;
        RouterStatus {
            reachable,
            daemon: None,
            error: (!reachable).then(|| "unreachable".to_string()),
        }
    }
}

/// Deploy the staged tree to one router: hash the staged files, rsync the
/// tree with delete-extraneous semantics, then trigger the remote reload.
/// The deployment record is written regardless of the outcome.
async fn deploy_single(
    router: RouterTarget,
    config: DeployConfig,
    state: StateStore,
    generation_id: Option<i64>,
) -> DeployOutcome {
    log::info!("[{}] deploying configuration", router.name);
    let start = Instant::now();

    if router.maintenance_mode {
        log::info!("[{}] in maintenance mode, skipping", router.name);
        return DeployOutcome {
            router: router.name,
            state: DeployState::Succeeded,
            skipped_maintenance: true,
            duration: start.elapsed(),
            error: None,
        };
    }

    let config_hash = staged_config_hash(&router.config_dir).unwrap_or_else(|e| {
        log::warn!("[{}] cannot hash staged configuration: {e}", router.name);
        "unknown".to_string()
    });

    let session = SshSession::new(
        &config.ssh_user,
        &router.name,
        &config.ssh_key_path,
        config.ssh_timeout,
    );

    let mut state_machine = DeployState::Uploading;
    let result: Result<(), SshError> = async {
        session
            .sync_directory(&router.config_dir, &config.remote_config_dir)
            .await?;
        state_machine = DeployState::Reloading;
        let reload = format!(
            "chown -R root: {} && {} configure && {} configure",
            config.remote_config_dir,
            config.birdc_bin.display(),
            config.birdc6_bin.display()
        );
        session.execute_cmd(&[reload.as_str()]).await?;
        Ok(())
    }
    .await;

    let duration = start.elapsed();
    let error = result.as_ref().err().map(|e| e.to_string());
    let success = error.is_none();

    let record = DeploymentRecord {
        generation_id,
        router: router.name.clone(),
        config_hash,
        duration_ms: duration.as_millis() as i64,
        success,
        error_message: error.clone().unwrap_or_default(),
        validation_passed: success,
        ..Default::default()
    };
    if let Err(e) = state.track_deployment(&record) {
        log::error!("[{}] cannot record deployment: {e}", router.name);
    }

    if success {
        log::info!(
            "[{}] deployment succeeded in {:.1}s",
            router.name,
            duration.as_secs_f64()
        );
        DeployOutcome {
            router: router.name,
            state: DeployState::Succeeded,
            skipped_maintenance: false,
            duration,
            error: None,
        }
    } else {
        log::error!(
            "[{}] deployment failed in state {state_machine}: {}",
            router.name,
            error.as_deref().unwrap_or("unknown")
        );
        DeployOutcome {
            router: router.name,
            state: DeployState::Failed,
            skipped_maintenance: false,
            duration,
            error,
        }
    }
}

/// Truncated SHA-256 over all staged `.conf` files, walked recursively in
/// sorted order. Unreadable files are skipped.
pub fn staged_config_hash(dir: &Path) -> std::io::Result<String> {
    let mut files = Vec::new();
    collect_conf_files(dir, &mut files)?;
    files.sort();
    let mut hasher = Sha256::new();
    for file in files {
        if let Ok(bytes) = std::fs::read(&file) {
            hasher.update(&bytes);
        }
    }
    Ok(hex::encode(hasher.finalize())[..16].to_string())
}

fn collect_conf_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_conf_files(&path, out)?;
        } else if path.extension().map(|e| e == "conf").unwrap_or(false) {
            out.push(path);
        }
    }
    Ok(())
}

/// Error kind returned by the [`Deployer`].
#[derive(Debug, Error)]
pub enum DeployError {
    /// A required work directory does not exist.
    #[error("directory does not exist: {0}")]
    MissingDirectory(PathBuf),
    /// A required work directory is not writable.
    #[error("directory not writable: {0}")]
    NotWritable(PathBuf),
    /// The deploy credential is missing.
    #[error("SSH key not found: {0}")]
    MissingSshKey(PathBuf),
    /// The deploy credential cannot be read.
    #[error("SSH key not readable: {0}")]
    SshKeyNotReadable(PathBuf),
    /// `ssh-keygen` rejected the deploy credential.
    #[error("SSH key validation failed: {0}")]
    InvalidSshKey(String),
    /// A required router-control binary is missing.
    #[error("required binary not found: {0}")]
    MissingBinary(PathBuf),
    /// A required router-control binary is not executable.
    #[error("binary not executable: {0}")]
    NotExecutable(PathBuf),
    /// A router has no staged configuration tree.
    #[error("missing staged configuration for {router}: {path}")]
    MissingStagedConfig { router: String, path: PathBuf },
    /// Comprehensive validation found errors.
    #[error("configuration validation failed with {0} errors")]
    ValidationFailed(usize),
    /// Transport failure.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// State store failure.
    #[error(transparent)]
    State(#[from] StateError),
    /// I/O failure on staged artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
