// ============================================================================
// CLI & MAIN ENTRY POINT
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cerebro_observe::chunk;
use cerebro_observe::constants::{FULL_NAME, VERSION};
use cerebro_observe::logging::init_logging;
use cerebro_observe::{Engine, ObserveConfig, ObserveResult};

// ----------------------------------------------------------------------------
// 1. CLI Argument Parser
// ----------------------------------------------------------------------------

/// Cerebro observability core
#[derive(Parser, Debug)]
#[command(
    name = "cerebro-observe",
    author = "AIOps Team",
    version,
    about = "Metric cache, OTLP ingestion and alerting core for AIOps",
    long_about = "Caches Prometheus range queries in compact on-disk chunks, ingests \
                  OTLP traces, logs, metrics and profiles into ClickHouse, and turns \
                  the observed state into deployments, incidents and alerts."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "cerebro.toml", env = "CEREBRO_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CEREBRO_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "CEREBRO_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the service
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,

    /// Print the header of a chunk file
    ChunkInfo {
        /// Path to a `.db` chunk
        path: PathBuf,
    },
}

// ----------------------------------------------------------------------------
// 2. CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> ObserveResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match ObserveConfig::load(config_path).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            return Err(e.into());
        }
    };
    println!("✅ Configuration is valid!");

    if verbose {
        println!("\n📋 Parsed configuration:");
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!("\n📊 Configuration Summary:");
    println!("  • HTTP listen address: {}", config.listen_address);
    println!("  • gRPC listen address: {}", config.grpc_listen_address);
    println!("  • Data directory: {}", config.data_dir.display());
    println!("  • Projects defined: {}", config.projects.len());
    println!(
        "  • ClickHouse: {}",
        config.global_clickhouse.as_ref().map_or("disabled", |c| c.address.as_str())
    );
    println!(
        "  • Global Prometheus: {}",
        config.global_prometheus.as_ref().map_or("none", |p| p.url.as_str())
    );
    println!("  • Watchers enabled: {}", config.watchers.enabled);
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> ObserveResult<()> {
    let config_str = ObserveConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("🧠 {} v{}", FULL_NAME, VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • gRPC receiver: {}", cfg!(feature = "grpc"));
}

fn handle_chunk_info(path: &Path) -> ObserveResult<()> {
    let meta = chunk::read_meta(path)?;
    println!("{}: {}", path.display(), chunk::describe(&meta));
    Ok(())
}

// ----------------------------------------------------------------------------
// 3. Main
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::ChunkInfo { path }) => {
            handle_chunk_info(path).with_context(|| format!("Failed to read chunk {}", path.display()))?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config_exists = cli.config.exists();
    let config = if config_exists {
        ObserveConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        ObserveConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!("🧠 {} v{}", FULL_NAME, VERSION);
    let engine = if config_exists {
        Engine::from_config_file(&cli.config)?
    } else {
        warn!("Config file not found at {}, using defaults", cli.config.display());
        Engine::new(config)
    };
    engine.run().await.context("engine failed")?;
    Ok(())
}
