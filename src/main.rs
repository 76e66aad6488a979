use std::path::PathBuf;

use anyhow::{bail, Context};
use rfs::common::NodeId;
use rfs::{Config, Master, NodeAgent};
use tokio::net::TcpListener;

const USAGE: &str = "Usage: rfs master [--config <file>] | rfs node <name> [--config <file>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut positional = Vec::new();
    let mut config_path: Option<PathBuf> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                let Some(path) = args.get(i + 1) else {
                    bail!("--config needs a file path\n{USAGE}");
                };
                config_path = Some(PathBuf::from(path));
                i += 2;
            }
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }

    let config = Config::load(config_path.as_deref())
        .with_context(|| format!("failed to load config from {config_path:?}"))?;

    match positional.first().map(|s| s.to_lowercase()).as_deref() {
        Some("master") => run_master(config).await,
        Some("node") => {
            let Some(name) = positional.get(1) else {
                eprintln!("Missing node name.\n{USAGE}");
                std::process::exit(1);
            };
            let name = name.trim().to_lowercase();
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
                eprintln!("Invalid node name, must contain alphanumeric characters only.");
                std::process::exit(2);
            }
            run_node(config, NodeId(name)).await
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }
}

async fn run_master(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.master_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.master_addr))?;

    let master = Master::new(config);
    master.run(listener).await?;
    Ok(())
}

async fn run_node(config: Config, id: NodeId) -> anyhow::Result<()> {
    tracing::info!("Starting node {} under {}", id, config.node_storage(id.as_str()).display());
    let agent = NodeAgent::bootstrap(id, config)
        .await
        .context("node startup failed")?;
    agent.run().await;
    Ok(())
}
