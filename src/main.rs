//! AgentDock - launch MCP agent definitions on demand and chat with them
//!
//! Serves the REST and WebSocket API, runs diagnostics and prints the
//! effective configuration.

use agentdock::{
    agent::ProcessEngine, api::build_app, catalog::Catalog, config::AgentDockConfig,
    materializer::ConfigMaterializer, Orchestrator,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agentdock")]
#[command(version)]
#[command(about = "Launch MCP agent definitions on demand and chat with them over WebSocket")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AGENTDOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run diagnostics
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("agentdock={},tower_http=debug", log_level).into());
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => AgentDockConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AgentDockConfig::default(),
    };

    match cli.command {
        Commands::Serve { host, port } => {
            run_server(config, host, port).await?;
        }
        Commands::Doctor => {
            run_doctor(&config).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run_server(mut config: AgentDockConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!("Starting AgentDock");

    let engine = Arc::new(ProcessEngine::new(&config.engine));
    let orchestrator = Arc::new(
        Orchestrator::open(&config, engine)
            .await
            .context("failed to open storage")?,
    );
    let app = build_app(orchestrator.clone(), &config.server);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("AgentDock is running on http://{}. Press Ctrl+C to stop.", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("Shutting down...");
    orchestrator.shutdown().await;

    Ok(())
}

/// Wait for Ctrl-C
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal");
}

async fn run_doctor(config: &AgentDockConfig) -> Result<()> {
    println!("AgentDock Doctor");
    println!();

    let storage = &config.storage;
    let mut healthy = true;

    println!("Checking data directory...");
    healthy &= report(check_writable(&storage.data_dir), &storage.data_dir);

    println!("Checking config directory...");
    let config_dir = storage.config_dir_path();
    let materializer = match ConfigMaterializer::open(&config_dir).await {
        Ok(m) => {
            healthy &= report(check_writable(&config_dir), &config_dir);
            Some(Arc::new(m))
        }
        Err(e) => {
            println!("  ✗ {}: {}", config_dir.display(), e);
            healthy = false;
            None
        }
    };

    println!("Checking database...");
    let database = storage.database_path();
    if let Some(materializer) = materializer {
        match Catalog::open(&database, materializer, config.catalog.batch_mode)
            .and_then(|catalog| catalog.count())
        {
            Ok(count) => println!("  ✓ {} ({} agents)", database.display(), count),
            Err(e) => {
                println!("  ✗ {}: {}", database.display(), e);
                healthy = false;
            }
        }
    }

    println!("Checking agent types...");
    let types_path = storage.agent_types_path();
    if types_path.exists() {
        println!("  ✓ {}", types_path.display());
    } else {
        println!("  ℹ {} not found (agent type lookups will fail)", types_path.display());
    }

    println!("Checking credential...");
    if std::env::var(&config.engine.credential_env).is_ok() {
        println!("  ✓ {} is set", config.engine.credential_env);
    } else {
        println!("  ℹ {} is not set", config.engine.credential_env);
    }

    println!();
    if healthy {
        println!("Doctor check complete!");
        Ok(())
    } else {
        anyhow::bail!("doctor found problems")
    }
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".agentdock-doctor");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)
}

fn report(result: std::io::Result<()>, path: &Path) -> bool {
    match result {
        Ok(()) => {
            println!("  ✓ {} is writable", path.display());
            true
        }
        Err(e) => {
            println!("  ✗ {}: {}", path.display(), e);
            false
        }
    }
}

fn show_config(config: Option<&AgentDockConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
