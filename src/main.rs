use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use toolpool::config::{self, ResilienceConfig};

#[derive(Parser)]
#[command(name = "toolpool")]
#[command(version, about = "Resilience and caching runtime for remote tool execution", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to TOOLPOOL_* environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and summarize it
    Check,

    /// Print the effective configuration
    Show {
        #[arg(long, value_enum, default_value = "yaml")]
        format: OutputFormat,
    },

    /// Print the default configuration
    Defaults {
        #[arg(long, value_enum, default_value = "yaml")]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Check => {
            let config = config::load_config(cli.config.as_deref())?;
            print_summary(&config);
        }
        Commands::Show { format } => {
            let config = config::load_config(cli.config.as_deref())?;
            println!("{}", render(&config, format)?);
        }
        Commands::Defaults { format } => {
            println!("{}", render(&ResilienceConfig::default(), format)?);
        }
    }

    Ok(())
}

fn render(config: &ResilienceConfig, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Yaml => serde_yaml::to_string(config).context("Failed to render YAML"),
        OutputFormat::Json => serde_json::to_string_pretty(config).context("Failed to render JSON"),
    }
}

fn print_summary(config: &ResilienceConfig) {
    info!("Configuration is valid");

    println!(
        "pool:            {}..{} connections per endpoint, acquire timeout {}",
        config.pool.min_connections,
        config.pool.max_connections,
        humantime::format_duration(config.pool.acquire_timeout)
    );
    if config.health.enabled {
        println!(
            "health checks:   every {}, unreachable after {} failures",
            humantime::format_duration(config.health.interval),
            config.health.unhealthy_threshold
        );
    } else {
        println!("health checks:   disabled");
    }
    let retry = &config.retry.policy;
    println!(
        "retry:           {} backoff, {} attempts, {}..{}{}",
        retry.strategy,
        retry.max_attempts,
        humantime::format_duration(retry.base_delay),
        humantime::format_duration(retry.max_delay),
        if retry.jitter_enabled { " with jitter" } else { "" }
    );
    println!(
        "circuit breaker: opens after {} failures, recovers after {}",
        config.circuit_breaker.failure_threshold,
        humantime::format_duration(config.circuit_breaker.recovery_timeout)
    );
    println!("load balancer:   {}", config.load_balancer.strategy);
    if config.cache.enabled {
        println!(
            "cache:           {} eviction, ttl {}, max {} keys / {} bytes",
            config.cache.eviction_policy,
            humantime::format_duration(config.cache.default_ttl),
            config.cache.max_keys,
            config.cache.max_size_bytes
        );
    } else {
        println!("cache:           disabled");
    }

    for (capability, endpoints) in &config.endpoints {
        for endpoint in endpoints {
            println!(
                "endpoint:        {capability} -> {} ({}, weight {})",
                endpoint.spec.id, endpoint.spec.address, endpoint.weight
            );
        }
    }
}
