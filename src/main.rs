//! Command-line entry point for the Cerebro host daemon.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cerebro_hostd::config::AgentConfig;
use cerebro_hostd::constants::{AGENT_FULL_NAME, AGENT_NAME, AGENT_VERSION};
use cerebro_hostd::logging::init_logging;
use cerebro_hostd::Agent;

// ============================================================================
// CLI
// ============================================================================

/// Cerebro host daemon CLI
#[derive(Parser, Debug)]
#[command(
    name = "cerebro-hostd",
    author = "AIOps Team",
    version,
    about = "Host-resident agent for the Cerebro AIOps console",
    long_about = "cerebro-hostd runs on a managed host, records container, SSH and \
                  resource activity into a bounded cache, and serves operator \
                  commands and live streams over an authenticated WebSocket channel."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "hostd.toml", env = "HOSTD_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "HOSTD_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "HOSTD_DEBUG")]
    pub debug: bool,

    /// Subcommand to run (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent
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
}

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match AgentConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            return Err(e.into());
        }
    };

    println!("✅ Configuration is valid!");
    if verbose {
        println!();
        println!("{:#?}", config);
        return Ok(());
    }

    println!();
    println!("Summary:");
    println!("  • Instance: {}", config.agent.instance_name);
    println!("  • Listen: {}", config.channel.listen_addr);
    println!("  • Auth required: {}", config.channel.require_auth);
    println!(
        "  • Store: {} ({:?})",
        if config.store.enabled { "enabled" } else { "disabled" },
        config.store.backend
    );
    println!("  • Collectors enabled:");
    let collectors = &config.collectors;
    if collectors.docker_events.enabled { println!("    - Container events"); }
    if collectors.auth_log.enabled { println!("    - SSH auth log"); }
    if collectors.resources.enabled { println!("    - Resource metrics"); }
    if collectors.container_logs.enabled { println!("    - Container logs"); }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = AgentConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("{} ({}) v{}", AGENT_FULL_NAME, AGENT_NAME, AGENT_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        Some(Commands::Run) | None => {}
    }

    let (config, from_file) = if cli.config.exists() {
        let config = AgentConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
        (config, true)
    } else {
        let config = AgentConfig::from_env().context("Failed to build config from environment")?;
        (config, false)
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _guard = init_logging(&logging_config)?;

    info!("{} v{}", AGENT_FULL_NAME, AGENT_VERSION);
    if !from_file {
        warn!("Config file not found at {}, using defaults and environment", cli.config.display());
    }

    let agent = Agent::new(config).context("Failed to initialise agent")?;
    agent.run().await?;
    Ok(())
}
