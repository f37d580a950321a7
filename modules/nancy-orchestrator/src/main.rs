use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nancy_common::{config::load_manifests, Config};
use nancy_orchestrator::{connect_brains, nancy_config, FileIngest, Nancy};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("nancy=info".parse()?))
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_default();
    let argument = args.collect::<Vec<_>>().join(" ");

    let config = Config::from_env();
    let brains = connect_brains(&config).await?;
    let nancy = Nancy::new(brains, nancy_config(&config));

    if let Some(path) = &config.plugin_manifest_path {
        let manifests = load_manifests(path)?;
        info!(plugins = manifests.len(), "Launching plugins");
        nancy.launch_plugins(manifests).await;
    } else {
        info!("No plugin manifest configured, running core-only");
    }

    match command.as_str() {
        "ingest" if !argument.is_empty() => {
            match nancy.ingest_file(&argument, None).await? {
                FileIngest::Completed { outcomes, warnings } => {
                    for warning in warnings {
                        eprintln!("warning: {warning}");
                    }
                    for outcome in outcomes {
                        println!("{} {}", outcome.packet_id, outcome.state);
                    }
                }
                FileIngest::Streaming { plugin, .. } => {
                    println!("accepted: {plugin} is streaming packets");
                }
            }
        }
        "query" if !argument.is_empty() => {
            let response = nancy.query(&argument).await?;
            println!("{}", response.answer);
            println!();
            println!("strategy: {}", response.intent.strategy);
            for citation in &response.citations {
                println!("cited: {citation}");
            }
            if response.degraded {
                println!("(degraded: one or more stores were unavailable)");
            }
        }
        "sweep" => {
            let stats = nancy.router().sweep_once(config.sweep_max_attempts).await?;
            println!(
                "scanned {} committed {} pending {}",
                stats.scanned, stats.committed, stats.still_pending
            );
        }
        _ => {
            nancy.shutdown().await;
            bail!("usage: nancy ingest <path> | nancy query <text> | nancy sweep");
        }
    }

    nancy.shutdown().await;
    Ok(())
}
