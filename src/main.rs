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

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use time::macros::format_description;
use time::OffsetDateTime;

use autopeer::config::GlobalConfig;
use autopeer::deploy::Deployer;
use autopeer::generate::{load_manifest, GenerationOptions, Generator};
use autopeer::registry::RegistryClient;
use autopeer::state::StateStore;
use autopeer::vendor::PluginRegistry;
use autopeer::AutopeerError;

const EXIT_SUCCESS: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_TOOL_ERROR: i32 = 2;
const EXIT_VALIDATION_ERROR: i32 = 4;
const EXIT_DEPLOYMENT_ERROR: i32 = 5;

/// BGP peering automation toolchain.
#[derive(Debug, Parser)]
#[clap(name = "autopeer", version)]
struct Cli {
    /// Path to the global configuration file.
    #[clap(long, short, global = true, default_value = "vars/generic.yml")]
    config: PathBuf,
    /// Enable debug logging.
    #[clap(long, short, global = true)]
    debug: bool,
    /// Enable verbose output.
    #[clap(long, short, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate router configurations and prefix sets.
    Generate {
        /// What to generate.
        #[clap(value_enum, default_values_t = vec![GenerateTarget::All])]
        targets: Vec<GenerateTarget>,
        /// Skip existence checks for prefix sets when generating configs.
        #[clap(long)]
        no_checks: bool,
    },
    /// Validate, deploy or probe the router fleet.
    Deploy {
        #[clap(value_enum)]
        action: DeployAction,
        /// Act on a specific router only (substring match on the FQDN).
        #[clap(long, short)]
        router: Option<String>,
        /// Maximum parallel deployments.
        #[clap(long, short)]
        parallel: Option<usize>,
        /// Deployment timeout in seconds.
        #[clap(long, short)]
        timeout: Option<u64>,
    },
    /// Inspect and maintain the run history.
    State {
        #[clap(value_enum)]
        action: StateAction,
        /// Limit the number of results.
        #[clap(long)]
        limit: Option<usize>,
        /// Filter deployments by router name.
        #[clap(long)]
        router: Option<String>,
        /// Number of days for the statistics window.
        #[clap(long)]
        days: Option<i64>,
        /// Output file for the export.
        #[clap(long, short)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GenerateTarget {
    All,
    Configs,
    Prefixsets,
}

impl std::fmt::Display for GenerateTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerateTarget::All => f.write_str("all"),
            GenerateTarget::Configs => f.write_str("configs"),
            GenerateTarget::Prefixsets => f.write_str("prefixsets"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeployAction {
    Push,
    Check,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StateAction {
    Events,
    Generations,
    Deployments,
    Stats,
    Cleanup,
    Export,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut builder = pretty_env_logger::formatted_timed_builder();
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    } else if cli.debug {
        builder.filter_level(log::LevelFilter::Debug);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Trace);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match GlobalConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };
    let state = match StateStore::open(&config.state) {
        Ok(state) => state,
        Err(e) => {
            log::error!("Cannot open state store: {e}");
            return EXIT_TOOL_ERROR;
        }
    };

    match cli.command {
        Command::Generate { targets, no_checks } => {
            cmd_generate(&config, &state, &targets, no_checks).await
        }
        Command::Deploy {
            action,
            router,
            parallel,
            timeout,
        } => cmd_deploy(&config, &state, action, router, parallel, timeout).await,
        Command::State {
            action,
            limit,
            router,
            days,
            output,
        } => cmd_state(&state, action, limit, router, days, output),
    }
}

fn exit_code_for(error: &AutopeerError) -> i32 {
    use autopeer::deploy::DeployError;
    match error {
        AutopeerError::Config(_) => EXIT_CONFIG_ERROR,
        AutopeerError::Deploy(DeployError::ValidationFailed(_)) => EXIT_VALIDATION_ERROR,
        AutopeerError::Deploy(_) | AutopeerError::Ssh(_) => EXIT_DEPLOYMENT_ERROR,
        _ => EXIT_TOOL_ERROR,
    }
}

async fn cmd_generate(
    config: &GlobalConfig,
    state: &StateStore,
    targets: &[GenerateTarget],
    no_checks: bool,
) -> i32 {
    let options = GenerationOptions {
        configs: targets
            .iter()
            .any(|t| matches!(t, GenerateTarget::All | GenerateTarget::Configs)),
        prefixsets: targets
            .iter()
            .any(|t| matches!(t, GenerateTarget::All | GenerateTarget::Prefixsets)),
        do_checks: !no_checks,
    };
    if no_checks {
        log::info!("Saw --no-checks: skipping existence checks for prefix sets");
    }

    let registry = match RegistryClient::new(&config.registry) {
        Ok(registry) => registry,
        Err(e) => {
            log::error!("{e}");
            return EXIT_CONFIG_ERROR;
        }
    };
    let manifest = match load_manifest(config, &registry).await {
        Ok(manifest) => manifest,
        Err(e) => {
            log::error!("Cannot load peering manifest: {e}");
            return exit_code_for(&e);
        }
    };

    let mut plugins = PluginRegistry::with_default_plugins(config);
    plugins.initialize_all().await;

    let generator = Generator::new(config, &manifest, &plugins, state, &registry);
    match generator.run(&options).await {
        Ok(summary) => {
            println!(
                "Generation {} completed: {} peers, {} session policies, {} filter stanzas",
                summary.generation_id,
                summary.peer_count,
                summary.session_policies,
                summary.filter_count
            );
            if summary.filters_failed > 0 {
                println!("{} ASNs failed filter generation", summary.filters_failed);
            }
            for asn in &summary.skipped_missing_filters {
                println!("Skipped {asn} due to missing files");
            }
            EXIT_SUCCESS
        }
        Err(e) => {
            log::error!("Generation failed: {e}");
            exit_code_for(&e)
        }
    }
}

async fn cmd_deploy(
    config: &GlobalConfig,
    state: &StateStore,
    action: DeployAction,
    router: Option<String>,
    parallel: Option<usize>,
    timeout: Option<u64>,
) -> i32 {
    let mut plugins = PluginRegistry::with_default_plugins(config);
    plugins.initialize_all().await;

    let mut deployer = Deployer::new(config, &plugins, state);
    if let Some(fragment) = &router {
        if deployer.retain_routers(fragment) == 0 {
            log::error!("Router not found: {fragment}");
            return EXIT_CONFIG_ERROR;
        }
    }
    if let Some(parallel) = parallel {
        deployer.set_parallelism(parallel);
    }
    if let Some(timeout) = timeout {
        deployer.set_timeout(timeout);
    }

    match action {
        DeployAction::Check => {
            if let Err(e) = deployer.validate_environment() {
                log::error!("{e}");
                return EXIT_CONFIG_ERROR;
            }
            if let Err(e) = deployer.comprehensive_validation().await {
                log::error!("{e}");
                return EXIT_VALIDATION_ERROR;
            }
            println!("All validations passed");
            EXIT_SUCCESS
        }
        DeployAction::Status => {
            let statuses = deployer.check_router_status().await;
            println!("\nRouter Status Report:");
            println!("{}", "=".repeat(50));
            for (router, status) in statuses {
                let mark = if status.reachable { "✓" } else { "✗" };
                let word = if status.reachable { "OK" } else { "UNREACHABLE" };
                println!("{mark} {router}: {word}");
                if let Some(daemon) = &status.daemon {
                    if let Some(version) = &daemon.version {
                        println!("    version: {version}");
                    }
                    if let Some(router_id) = &daemon.router_id {
                        println!("    router id: {router_id}");
                    }
                }
                if let Some(error) = &status.error {
                    println!("    error: {error}");
                }
            }
            EXIT_SUCCESS
        }
        DeployAction::Push => {
            if let Err(e) = deployer.validate_environment() {
                log::error!("{e}");
                return EXIT_CONFIG_ERROR;
            }
            if let Err(e) = deployer.comprehensive_validation().await {
                log::error!("{e}");
                return EXIT_VALIDATION_ERROR;
            }
            match deployer.deploy_all().await {
                Ok(summary) if summary.is_success() => {
                    println!("Deployment completed successfully");
                    EXIT_SUCCESS
                }
                Ok(summary) => {
                    log::error!(
                        "{} of {} routers failed to deploy",
                        summary.failed,
                        summary.outcomes.len()
                    );
                    EXIT_DEPLOYMENT_ERROR
                }
                Err(e) => {
                    log::error!("Deployment error: {e}");
                    EXIT_DEPLOYMENT_ERROR
                }
            }
        }
    }
}

fn cmd_state(
    state: &StateStore,
    action: StateAction,
    limit: Option<usize>,
    router: Option<String>,
    days: Option<i64>,
    output: Option<PathBuf>,
) -> i32 {
    let ts_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let fmt_ts = |ts: OffsetDateTime| ts.format(&ts_format).unwrap_or_else(|_| ts.to_string());
    let mark = |success: bool| if success { "✓" } else { "✗" };

    match action {
        StateAction::Events => match state.recent_events(limit.unwrap_or(50), None) {
            Ok(events) => {
                println!("Recent {} events:", events.len());
                for event in events {
                    println!(
                        "  {} {} [{}] {}: {}",
                        mark(event.success),
                        fmt_ts(event.timestamp),
                        event.component,
                        event.kind,
                        event.message
                    );
                }
                EXIT_SUCCESS
            }
            Err(e) => {
                log::error!("State management error: {e}");
                EXIT_TOOL_ERROR
            }
        },
        StateAction::Generations => match state.recent_generations(limit.unwrap_or(20)) {
            Ok(generations) => {
                println!("Recent {} generations:", generations.len());
                for generation in generations {
                    println!(
                        "  {} {} Peers: {}, Filters: {}, Duration: {:.1}s, Memory: {:.1}MB",
                        mark(generation.success),
                        fmt_ts(generation.timestamp),
                        generation.peer_count,
                        generation.filter_count,
                        generation.duration_ms as f64 / 1000.0,
                        generation.memory_peak_mb
                    );
                }
                EXIT_SUCCESS
            }
            Err(e) => {
                log::error!("State management error: {e}");
                EXIT_TOOL_ERROR
            }
        },
        StateAction::Deployments => {
            match state.deployment_history(router.as_deref(), limit.unwrap_or(20)) {
                Ok(deployments) => {
                    println!("Recent {} deployments:", deployments.len());
                    for deployment in deployments {
                        println!(
                            "  {} {} {} ({}) Duration: {:.1}s",
                            mark(deployment.success),
                            fmt_ts(deployment.timestamp),
                            deployment.router,
                            deployment.deployment_method,
                            deployment.duration_ms as f64 / 1000.0
                        );
                    }
                    EXIT_SUCCESS
                }
                Err(e) => {
                    log::error!("State management error: {e}");
                    EXIT_TOOL_ERROR
                }
            }
        }
        StateAction::Stats => match state.performance_stats(days.unwrap_or(7)) {
            Ok(stats) => {
                println!("Performance stats for last {} days:", stats.period_days);
                match serde_json::to_string_pretty(&stats) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(e) => {
                        log::error!("Cannot render stats: {e}");
                        return EXIT_TOOL_ERROR;
                    }
                }
                EXIT_SUCCESS
            }
            Err(e) => {
                log::error!("State management error: {e}");
                EXIT_TOOL_ERROR
            }
        },
        StateAction::Cleanup => {
            let stats = state.cleanup_old_data();
            println!(
                "Cleanup completed: {} events, {} generations, {} deployments removed",
                stats.events_deleted, stats.generations_deleted, stats.deployments_deleted
            );
            EXIT_SUCCESS
        }
        StateAction::Export => {
            let path = output.unwrap_or_else(|| PathBuf::from("autopeer_state.json"));
            match state.export_data(&path) {
                Ok(()) => {
                    println!("✓ Data exported to {}", path.display());
                    EXIT_SUCCESS
                }
                Err(e) => {
                    log::error!("Export failed: {e}");
                    EXIT_TOOL_ERROR
                }
            }
        }
    }
}
