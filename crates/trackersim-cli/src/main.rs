//! Command-line interface for the TrackerSim device simulator.

mod interactive;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use trackersim_core::config::env_vars;
use trackersim_core::SimulatorConfig;
use trackersim_device::{
    ConnectionInfoCache, DeviceSession, ProvisionOutcome, SessionContext, SessionError,
};

use crate::interactive::{spawn_stdin_reader, InteractiveController, HELP};

/// TrackerSim - simulate a cellular GPS tracker against the cloud.
#[derive(Parser, Debug)]
#[command(name = "trackersim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform (defaults to `run`).
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, env = "TRACKERSIM_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Provision if needed, connect and start reporting telemetry.
    Run,
    /// Generate and register the device identity, then exit.
    Provision,
    /// Diagnose connection problems step by step.
    Diag {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show the cached connection info and the cloud device record.
    Status,
    /// Update the desired device config through the REST API.
    Shadow {
        /// New location reporting interval in seconds.
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        location_interval: Option<u64>,
        /// Enable or disable the counter feature.
        #[arg(long)]
        counter_enable: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args.config)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_simulator(config).await,
        Command::Provision => run_provision(config).await,
        Command::Diag { json } => run_diag(config, json).await,
        Command::Status => show_status(config).await,
        Command::Shadow {
            location_interval,
            counter_enable,
        } => update_shadow(config, location_interval, counter_enable).await,
    }
}

fn init_logging(verbose: bool) {
    // JSON format for log collectors
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose {
        "trackersim=debug"
    } else {
        "trackersim=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_level(false)
            .init();
    }
}

fn load_config(path: &Path) -> Result<SimulatorConfig> {
    SimulatorConfig::load(path).with_context(|| {
        format!(
            "Could not load {} (copy config.template.toml and set the API key)",
            path.display()
        )
    })
}

fn build_session(config: SimulatorConfig) -> Result<DeviceSession> {
    let ctx = SessionContext::from_config(config).context("Failed to create the REST client")?;
    Ok(DeviceSession::new(ctx))
}

/// Provisioning conflicts need the operator; they are reported, not raised.
fn report_provision_error(err: SessionError) -> Result<()> {
    match err {
        SessionError::Provision(e) if !e.is_fatal() => {
            warn!("{}", e);
            eprintln!("{}", e);
            Ok(())
        }
        other => Err(other.into()),
    }
}

async fn run_simulator(config: SimulatorConfig) -> Result<()> {
    let session = build_session(config)?;
    info!(device_id = %session.device_id(), "Starting simulator");

    if let Err(e) = session.start().await {
        session.shutdown().await;
        return report_provision_error(e);
    }

    println!("{}", HELP);
    let controller = InteractiveController::new(session.producer().clone());
    tokio::select! {
        _ = controller.run(spawn_stdin_reader()) => {}
        _ = tokio::signal::ctrl_c() => {
            println!();
            info!("Interrupted");
        }
    }

    session.shutdown().await;
    Ok(())
}

async fn run_provision(config: SimulatorConfig) -> Result<()> {
    let session = build_session(config)?;
    match session.provision().await {
        Ok(ProvisionOutcome::AlreadyProvisioned) => {
            println!("Device {} is already provisioned", session.device_id());
            Ok(())
        }
        Ok(ProvisionOutcome::Registered { mqtt_host, .. }) => {
            println!(
                "Device {} registered (broker: {})",
                session.device_id(),
                mqtt_host
            );
            Ok(())
        }
        Err(e) => report_provision_error(e),
    }
}

async fn run_diag(config: SimulatorConfig, as_json: bool) -> Result<()> {
    let session = build_session(config)?;
    let report = session.diagnose().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Device:    {}", report.device_id);
        println!("Lookup:    {}", serde_json::to_string(&report.lookup)?);
        if let Some(err) = &report.connect_error {
            println!("Connect:   {}", err);
        }
        if let Some(hold) = &report.hold {
            println!("Hold:      {}", serde_json::to_string(hold)?);
        }
        if let Some(probe) = &report.subscribe {
            println!(
                "Subscribe: subscribed={} connected_after={}",
                probe.subscribed, probe.connected_after
            );
        }
        println!("Verdict:   {}", report.verdict());
    }

    if !report.healthy() {
        anyhow::bail!("Diagnostics for {} failed: {}", report.device_id, report.verdict());
    }
    Ok(())
}

async fn show_status(config: SimulatorConfig) -> Result<()> {
    let cache = ConnectionInfoCache::new(&config.cloud.certs_dir, &config.cloud.device_id);
    match cache.load().await {
        Some(info) => {
            println!("Cached connection info ({}):", cache.path().display());
            println!("  broker: {}", info.mqtt_host);
            println!("  d2c:    {}", info.topic_d2c);
            println!("  c2d:    {}", info.topic_c2d);
        }
        None => println!("No cached connection info"),
    }

    let device_id = config.cloud.device_id.clone();
    let ctx = SessionContext::from_config(config)?;
    let record = ctx
        .cloud
        .get_device(&device_id)
        .await
        .with_context(|| format!("Failed to look up device {}", device_id))?;

    println!("Cloud device record:");
    println!("  id:       {}", record.id.as_deref().unwrap_or(&device_id));
    println!("  tags:     {}", record.tags.join(", "));
    println!("  firmware: {}", record.firmware);
    if let Some((d2c, c2d)) = record.assigned_topics() {
        println!("  topics:   {} / {}", d2c, c2d);
    }
    Ok(())
}

async fn update_shadow(
    config: SimulatorConfig,
    location_interval: Option<u64>,
    counter_enable: Option<bool>,
) -> Result<()> {
    let mut fields = Map::new();
    if let Some(secs) = location_interval {
        fields.insert("locationInterval".to_string(), json!(secs));
    }
    if let Some(enabled) = counter_enable {
        fields.insert("counterEnable".to_string(), json!(enabled));
    }
    if fields.is_empty() {
        anyhow::bail!("Nothing to update: pass --location-interval and/or --counter-enable");
    }

    let device_id = config.cloud.device_id.clone();
    let ctx = SessionContext::from_config(config)?;
    let body = json!({ "desired": { "config": Value::Object(fields) } });
    ctx.cloud
        .update_device_state(&device_id, &body)
        .await
        .with_context(|| format!("Failed to update device {}", device_id))?;

    println!("Requested config update for {}: {}", device_id, body);
    Ok(())
}
