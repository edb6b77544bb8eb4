//! Taproot DNS Resolver
//!
//! Recursive, DNSSEC-validating resolution with an aggressive in-memory
//! cache, served over UDP and TCP.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use data_encoding::HEXUPPER;
use hickory_proto::dnssec::rdata::DS;
use hickory_proto::dnssec::{Algorithm, DigestType};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taproot::Coordinator;
use taproot_cache::{CacheConfig, MessageCache, PrefetchCounters};
use taproot_config::Config;
use taproot_dnssec::TrustAnchors;
use taproot_metrics::{init_tracing, parse_log_level, LogConfig, LogFormat};
use taproot_resolver::{DelegationWalker, NameserverPool, PoolConfig, WalkerConfig};
use taproot_server::{DnsServer, ServerConfig};
use tokio::signal;
use tracing::{error, info, warn};

/// Taproot DNS Resolver - recursive resolution with aggressive caching
#[derive(Parser, Debug)]
#[command(name = "taproot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the resolver (default)
    Run,

    /// Validate the configuration file
    Validate {
        /// Show detailed validation output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show version information
    Version,
}

/// Finds the configuration file in standard locations.
fn find_config_file(explicit_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path);
    }

    let search_paths = [
        PathBuf::from("./taproot.yaml"),
        PathBuf::from("./taproot.yml"),
        PathBuf::from("./config.yaml"),
        PathBuf::from("/etc/taproot/config.yaml"),
        PathBuf::from("/etc/taproot/taproot.yaml"),
    ];

    search_paths.into_iter().find(|path| path.exists())
}

fn init_logging(config: &Config, cli_level: Option<&str>, quiet: bool) {
    let level = if quiet {
        tracing::Level::ERROR
    } else if let Some(level) = cli_level {
        parse_log_level(level)
    } else {
        parse_log_level(&config.logging.level)
    };

    let format = match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    };

    init_tracing(&LogConfig {
        level,
        format,
        span_events: false,
    });
}

fn print_banner(config: &Config, quiet: bool) {
    if quiet {
        return;
    }

    let version = env!("CARGO_PKG_VERSION");

    println!();
    println!(
        "  {} {}",
        style("Taproot DNS Resolver").cyan().bold(),
        style(format!("v{version}")).dim()
    );
    println!("  {}", style("Recursive resolution with aggressive caching").dim());
    println!();
    println!("  {} {}", style("Listen:").green(), config.server.listen);

    let mut features = vec!["Cache", "Prefetch"];
    if config.dnssec.enabled {
        features.push("DNSSEC");
    }
    println!("  {} {}", style("Features:").green(), features.join(", "));
    println!();
}

/// Converts configured trust anchors to DS records, falling back to the
/// built-in ICANN root KSKs.
fn build_trust_anchors(config: &Config) -> TrustAnchors {
    if config.dnssec.trust_anchors.is_empty() {
        return TrustAnchors::default();
    }

    let ds: Vec<DS> = config
        .dnssec
        .trust_anchors
        .iter()
        .filter_map(|anchor| {
            let digest = HEXUPPER
                .decode(anchor.digest.to_ascii_uppercase().as_bytes())
                .map_err(|e| {
                    warn!(key_tag = anchor.key_tag, error = %e, "skipping malformed trust anchor");
                })
                .ok()?;

            let algorithm = match anchor.algorithm {
                10 => Algorithm::RSASHA512,
                13 => Algorithm::ECDSAP256SHA256,
                14 => Algorithm::ECDSAP384SHA384,
                15 => Algorithm::ED25519,
                _ => Algorithm::RSASHA256,
            };
            let digest_type = match anchor.digest_type {
                1 => DigestType::SHA1,
                4 => DigestType::SHA384,
                _ => DigestType::SHA256,
            };

            Some(DS::new(anchor.key_tag, algorithm, digest_type, digest))
        })
        .collect();

    if ds.is_empty() {
        warn!("no usable configured trust anchors, using built-in root KSKs");
        return TrustAnchors::default();
    }

    TrustAnchors::from_ds(ds)
}

fn build_cache(config: &Config) -> Arc<MessageCache> {
    Arc::new(MessageCache::new(CacheConfig {
        max_entries: config.cache.size,
        max_allowed_ttl: config.cache.max_allowed_ttl_secs,
        negative_ttl: config.cache.negative_ttl_secs,
        cleaner_interval: Duration::from_secs(config.cache.cleaner_interval_secs),
        ..CacheConfig::default()
    }))
}

fn build_walker(config: &Config, cache: Arc<MessageCache>) -> Arc<DelegationWalker> {
    let walker_config = WalkerConfig {
        max_queries_per_request: config.resolver.max_queries_per_request,
        desired_nameservers_per_zone: config.resolver.desired_nameservers_per_zone,
        lazy_enrichment: config.resolver.lazy_enrichment,
        enable_dnssec: config.dnssec.enabled,
        require_all_signatures_valid: config.dnssec.require_all_signatures_valid,
        max_allowed_ttl: config.cache.max_allowed_ttl_secs,
        request_timeout: config.resolver.request_timeout(),
    };

    let pool = Arc::new(NameserverPool::new(PoolConfig::default()));
    let trust_anchors = Arc::new(build_trust_anchors(config));

    Arc::new(DelegationWalker::with_cache(
        walker_config,
        pool,
        trust_anchors,
        cache,
    ))
}

/// Logs cache statistics once a minute.
fn spawn_stats_logger(cache: &Arc<MessageCache>) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(cache);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(cache) = weak.upgrade() else { break };
            let stats = cache.stats();
            info!(
                size = cache.size(),
                hits = stats.hits,
                misses = stats.misses,
                hit_rate = format!("{:.2}%", stats.hit_rate() * 100.0),
                evictions = stats.evictions,
                expired = stats.expirations,
                negative = stats.negatives,
                "cache stats"
            );
        }
    })
}

async fn run_server(config: Config, quiet: bool) -> Result<()> {
    print_banner(&config, quiet);

    let config = Arc::new(config);
    let cache = build_cache(&config);
    let walker = build_walker(&config, cache.clone());
    let prefetch = Arc::new(PrefetchCounters::default());

    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        cache.clone(),
        walker,
        prefetch,
    ));

    // Background workers: expired-entry cleaner, prefetch sweep, stats.
    let cleaner = MessageCache::spawn_cleaner(&cache);
    let maintenance = Coordinator::spawn_maintenance(&coordinator);
    let stats_logger = spawn_stats_logger(&cache);

    let server = DnsServer::new(
        ServerConfig {
            listen: config.server.listen,
            tcp_idle_timeout: config.server.tcp_idle_timeout(),
        },
        coordinator,
    );

    info!(listen = %config.server.listen, dnssec = config.dnssec.enabled, "taproot started");

    let shutdown = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                return Err(e.into());
            }
        }
        _ = shutdown => {
            server.shutdown();
        }
    }

    cleaner.abort();
    maintenance.abort();
    stats_logger.abort();

    info!("taproot stopped");
    Ok(())
}

fn validate_config(path: Option<PathBuf>, verbose: bool) -> Result<()> {
    let config_path = find_config_file(path).context("no configuration file found")?;

    println!("Validating configuration: {}", config_path.display());

    let config = Config::from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    if verbose {
        println!();
        println!("  Listen address: {}", config.server.listen);
        println!("  Query budget: {}", config.resolver.max_queries_per_request);
        println!("  Cache size: {}", config.cache.size);
        println!("  Max TTL: {}s", config.cache.max_allowed_ttl_secs);
        println!("  DNSSEC: {}", config.dnssec.enabled);
        println!("  Trust anchors: {}", config.dnssec.trust_anchors.len());
    }

    config.validate().context("configuration validation failed")?;

    println!("{}", style("Configuration is valid!").green().bold());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Version) = &cli.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if let Some(Commands::Validate { verbose }) = &cli.command {
        return validate_config(cli.config, *verbose);
    }

    let config = match find_config_file(cli.config.clone()) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => {
            if !cli.quiet {
                eprintln!(
                    "{}",
                    style("No configuration file found, using defaults").yellow()
                );
            }
            Config::default()
        }
    };

    config.validate().context("invalid configuration")?;
    init_logging(&config, cli.log_level.as_deref(), cli.quiet);

    run_server(config, cli.quiet).await
}
