//! Veilwatch CLI
//!
//! Continuous threat scoring of dark web sources over Tor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use veil_agents::{
    create_anthropic_backend, create_backend, AnthropicConfig, OpenAIBackendConfig, SharedBackend,
};
use veil_runtime::{Monitor, Provider, RefinementSettings, Settings, DEFAULT_SETTINGS};
use veil_tor::{normalize_targets, SessionProvider, TorConfig};

#[derive(Parser)]
#[command(name = "veilwatch")]
#[command(author, version, about = "Veilwatch: adaptive dark web threat scoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file
    #[arg(short, long, global = true, default_value = "veilwatch.toml")]
    config: PathBuf,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1")]
    verbose: u8,
}

/// Reasoning service credentials
#[derive(Args)]
struct ApiKeys {
    /// Anthropic API key (or set ANTHROPIC_API_KEY env var)
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_key: Option<String>,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// OpenRouter API key (or set OPENROUTER_API_KEY env var)
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    openrouter_key: Option<String>,

    /// Skip LLM refinement
    #[arg(long)]
    no_refine: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll targets on a fixed cadence and score everything fetched
    Monitor {
        /// Seconds between cycles (overrides the settings file)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Extra target URL (repeatable)
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// File with one target per line
        #[arg(long)]
        targets_file: Option<PathBuf>,

        #[command(flatten)]
        keys: ApiKeys,
    },

    /// Score a single URL and print the record as JSON
    Score {
        url: String,

        #[command(flatten)]
        keys: ApiKeys,
    },

    /// Check Tor connection status
    Status,

    /// Request a new Tor identity
    Renew,

    /// Write a default settings file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match cli.command {
        Commands::Monitor {
            interval,
            targets,
            targets_file,
            keys,
        } => {
            let mut settings = load_settings(&cli.config)?;
            if let Some(interval) = interval {
                settings.monitor.interval_secs = interval;
            }
            settings.monitor.targets.extend(targets);
            if targets_file.is_some() {
                settings.monitor.targets_file = targets_file;
            }
            run_monitor(settings, keys).await?;
        }
        Commands::Score { url, keys } => {
            let settings = load_settings(&cli.config)?;
            score_once(settings, &url, keys).await?;
        }
        Commands::Status => {
            let settings = load_settings(&cli.config)?;
            check_status(&settings.tor.proxy).await?;
        }
        Commands::Renew => {
            let settings = load_settings(&cli.config)?;
            let sessions = SessionProvider::new(settings.tor.proxy)?;
            if sessions.renew_identity().await {
                println!("✅ New Tor identity requested");
            } else {
                println!("❌ Identity renewal failed (is the control port enabled?)");
            }
        }
        Commands::InitConfig { force } => {
            init_config(&cli.config, force)?;
        }
    }

    Ok(())
}

fn load_settings(path: &Path) -> Result<Settings> {
    let settings = Settings::load(path)?;
    settings.validate()?;
    Ok(settings)
}

/// Reasoning backend for the configured provider, if refinement is on and a key is present
fn select_backend(refinement: &RefinementSettings, keys: ApiKeys) -> Result<Option<SharedBackend>> {
    if keys.no_refine || !refinement.enabled {
        return Ok(None);
    }

    let model = refinement.model.as_str();
    let (key, hint) = match refinement.provider {
        Provider::Anthropic => (keys.anthropic_key, "ANTHROPIC_API_KEY"),
        Provider::Openai => (keys.api_key, "OPENAI_API_KEY"),
        Provider::Openrouter => (keys.openrouter_key, "OPENROUTER_API_KEY"),
        Provider::Local => {
            let base_url = refinement
                .base_url
                .as_deref()
                .context("refinement.base_url is required for the local provider")?;
            return Ok(Some(create_backend(OpenAIBackendConfig::local(base_url, model))?));
        }
    };

    let Some(key) = key else {
        warn!("{} not set; continuing without refinement", hint);
        return Ok(None);
    };

    let backend = match refinement.provider {
        Provider::Anthropic => {
            let mut config = AnthropicConfig::new(&key, model);
            if let Some(base_url) = &refinement.base_url {
                config.base_url = base_url.clone();
            }
            create_anthropic_backend(config)?
        }
        Provider::Openrouter => create_backend(OpenAIBackendConfig::openrouter(&key, model))?,
        _ => {
            let mut config = OpenAIBackendConfig::openai(&key, model);
            config.base_url = refinement.base_url.clone();
            create_backend(config)?
        }
    };

    Ok(Some(backend))
}

async fn run_monitor(settings: Settings, keys: ApiKeys) -> Result<()> {
    println!("🕵️ Veilwatch - adaptive dark web threat scoring\n");

    let sources = settings.sources()?;
    let backend = select_backend(&settings.refinement, keys)?;

    let sessions = Arc::new(SessionProvider::new(settings.tor.proxy.clone())?);
    let pipeline = settings
        .build_pipeline(sessions.clone(), backend)
        .await
        .context("Failed to assemble scoring pipeline")?;

    let mut monitor = Monitor::new(Arc::new(pipeline), sources, settings.monitor.monitor_config())?
        .with_sessions(sessions);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing in-flight items");
            let _ = stop_tx.send(true);
        }
    });

    monitor.run(stop_rx).await;
    Ok(())
}

async fn score_once(settings: Settings, url: &str, keys: ApiKeys) -> Result<()> {
    let url = normalize_targets([url])
        .pop()
        .context("Empty URL")?;
    let backend = select_backend(&settings.refinement, keys)?;

    let sessions = Arc::new(SessionProvider::new(settings.tor.proxy.clone())?);
    let pipeline = settings.build_pipeline(sessions, backend).await?;

    let record = pipeline
        .process_url(&url)
        .await
        .with_context(|| format!("Failed to score {}", url))?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(path, DEFAULT_SETTINGS)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("📄 Settings written to {}", path.display());
    Ok(())
}

async fn check_status(config: &TorConfig) -> Result<()> {
    println!("🔌 Checking Tor connection...\n");

    match veil_tor::check_tor_connection(config).await {
        Ok(true) => {
            println!("✅ Tor is running and accessible");
            println!("   Proxy: {}", config.socks_addr);
        }
        Ok(false) => {
            println!("❌ Tor is not accessible");
            println!("   Expected proxy at: {}", config.socks_addr);
            println!("\n   To install Tor:");
            println!("   - Linux: sudo apt install tor");
            println!("   - Mac: brew install tor");
            println!("   - Then start: sudo systemctl start tor (or brew services start tor)");
        }
        Err(e) => {
            println!("❌ Error checking Tor: {}", e);
        }
    }

    Ok(())
}
