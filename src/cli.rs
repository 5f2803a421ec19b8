//! Command-line entry points: run the service and provision zones/agents.

use crate::api::{ApiConfig, ApiServer, AppState, AuthService};
use crate::config::AppConfig;
use crate::engine::Services;
use crate::geo;
use crate::persistence::Persistence;
use crate::types::Coord;
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fieldwatch", version, about = "Field-presence and geofence compliance engine")]
pub struct Cli {
    /// Path to a TOML config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP service
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print a bearer token for an agent
    Token {
        #[arg(long)]
        agent: String,
    },
    /// Manage zones
    #[command(subcommand)]
    Zone(ZoneCommand),
    /// Manage agents
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Print an agent's transitions and compliance records as JSON
    History {
        #[arg(long)]
        agent: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum ZoneCommand {
    /// Create or replace a zone
    Add(ZoneArgs),
}

#[derive(Args, Debug)]
pub struct ZoneArgs {
    #[arg(long)]
    pub id: String,
    #[arg(long, allow_hyphen_values = true)]
    pub lat: f64,
    #[arg(long, allow_hyphen_values = true)]
    pub lng: f64,
    /// Radius in meters; the configured default applies when omitted
    #[arg(long)]
    pub radius: Option<f64>,
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Create or replace an agent
    Add(AgentArgs),
}

#[derive(Args, Debug)]
pub struct AgentArgs {
    #[arg(long)]
    pub id: String,
    /// Assigned zone; omit for a roaming agent
    #[arg(long)]
    pub zone: Option<String>,
    /// Exempt the agent from geofence enforcement
    #[arg(long)]
    pub bypass: bool,
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config.logging.level);
    execute(cli.command, &config).await
}

pub async fn execute(command: Command, config: &AppConfig) -> Result<()> {
    match command {
        Command::Serve { host, port } => serve(config, host, port).await,
        Command::Token { agent } => {
            if config.auth.token_secret.is_none() {
                bail!(
                    "auth.token_secret is not set; a token signed with a random key would be useless"
                );
            }
            let auth = AuthService::new(
                config.auth.token_secret.as_deref(),
                Some(config.auth.token_expiry_secs),
            )?;
            println!("{}", auth.generate_token(&agent)?);
            Ok(())
        }
        Command::Zone(ZoneCommand::Add(args)) => {
            let center = geo::validate(Coord::new(args.lat, args.lng))?;
            if let Some(radius) = args.radius {
                if !radius.is_finite() || radius < 0.0 {
                    bail!("--radius must be a non-negative number, got {}", radius);
                }
            }
            let persistence = open_store(config)?;
            persistence.upsert_zone(&args.id, args.name.as_deref(), center, args.radius)?;
            tracing::info!("Zone {} saved", args.id);
            Ok(())
        }
        Command::Agent(AgentCommand::Add(args)) => {
            let persistence = open_store(config)?;
            if let Some(zone_id) = &args.zone {
                if persistence.get_zone(zone_id)?.is_none() {
                    tracing::warn!(
                        "Zone {} does not exist yet; agent {} will roam until it does",
                        zone_id,
                        args.id
                    );
                }
            }
            persistence.upsert_agent(&args.id, args.zone.as_deref(), args.bypass)?;
            tracing::info!("Agent {} saved", args.id);
            Ok(())
        }
        Command::History { agent, limit } => {
            let persistence = open_store(config)?;
            let history = serde_json::json!({
                "agent_id": agent,
                "transitions": persistence.list_transitions(&agent, limit)?,
                "compliance": persistence.list_compliance_records(&agent, limit)?,
            });
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
    }
}

fn open_store(config: &AppConfig) -> Result<Persistence> {
    Persistence::new(&config.database.path)
        .map(|p| p.with_default_radius(config.geofence.default_radius_meters))
        .with_context(|| format!("Failed to open {}", config.database.path.display()))
}

async fn serve(config: &AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    let persistence = open_store(config)?;
    let services = Services::start(persistence, config);
    let auth = AuthService::new(
        config.auth.token_secret.as_deref(),
        Some(config.auth.token_expiry_secs),
    )?;
    let state = AppState::new(&services, auth);

    let mut api_config = ApiConfig::from(&config.api);
    if let Some(host) = host {
        api_config = api_config.with_host(host);
    }
    if let Some(port) = port {
        api_config = api_config.with_port(port);
    }

    ApiServer::new(api_config, state)
        .run_with_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = services.engine.compliance().flush().await {
        tracing::error!("Failed to flush compliance queue on shutdown: {}", e);
    }
    services.maintenance.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining requests");
}
