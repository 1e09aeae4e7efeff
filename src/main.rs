// src/main.rs
//! Flowgate control binary
//!
//! Operator-facing commands for a running capture proxy. Every command opens
//! the shared flow store, performs one operation and exits.

mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{describe_outcome, render_pending, Cli, Commands};
use flowgate::control::ControlPlane;
use flowgate::observability::init_tracing;
use flowgate::utils::config::EngineConfig;
use flowgate::FlowId;
use std::io::Read;
use std::path::Path;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(store) = &cli.store {
        config.store.path = store.clone();
    }

    init_tracing(&config.logging, cli.verbose)?;
    debug!("Flowgate v{}", flowgate::BuildInfo::current());

    let plane = ControlPlane::open(&config.store)
        .await
        .with_context(|| format!("flow store unreachable at {:?}", config.store.path))?;

    match cli.command {
        Commands::Intercept { state: None } => {
            let enabled = plane
                .intercept_mode()
                .await
                .context("flow store unreachable; intercept mode unknown")?;
            println!("Intercept mode is {}", if enabled { "on" } else { "off" });
        }

        Commands::Intercept { state: Some(toggle) } => {
            plane.set_intercept_mode(toggle.enabled()).await?;
            println!("Intercept mode is {}", if toggle.enabled() { "on" } else { "off" });
        }

        Commands::Pending { json } => {
            let pending = plane
                .list_pending()
                .await
                .context("flow store unreachable; pending flows unknown")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else {
                print!("{}", render_pending(&pending));
            }
        }

        Commands::Forward { flow_id, edited } => {
            let flow_id = FlowId::from(flow_id);
            let edited = match edited {
                Some(path) => Some(read_request(&path)?),
                None => None,
            };
            let outcome = plane.forward(&flow_id, edited.map(Into::into)).await?;
            println!("{}", describe_outcome("forward", &flow_id, outcome));
        }

        Commands::Drop { flow_id } => {
            let flow_id = FlowId::from(flow_id);
            let outcome = plane.drop_flow(&flow_id).await?;
            println!("{}", describe_outcome("drop", &flow_id, outcome));
        }

        Commands::Show { flow_id } => {
            let flow_id = FlowId::from(flow_id);
            match plane.flow(&flow_id).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => bail!("flow {} not found", flow_id),
            }
        }
    }

    Ok(())
}

/// Edited request bytes from a file, or stdin for "-"
fn read_request(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read edited request from stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("failed to read edited request {:?}", path))
}
