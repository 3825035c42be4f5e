mod agent;
mod config;
mod memory;
mod pipeline;
mod skills;
mod store;
mod text;
mod types;

use std::sync::Arc;

use agent::{
    prompts::PromptBook,
    provider::{AnthropicClient, build_http_client},
};
use anyhow::Result;
use config::Config;
use memory::store::JsonFileStore;
use pipeline::Coordinator;
use store::bitable::BitableStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Daily recommendation, optionally limited to platform routes.
    Run { routes: Vec<String> },
    /// Regenerate scripts of confirmed pool topics, optionally by title.
    Refresh { titles: Vec<String> },
}

fn parse_command(args: &[String]) -> Command {
    match args.split_first() {
        Some((first, rest)) if first == "refresh" => Command::Refresh {
            titles: rest.to_vec(),
        },
        Some((first, rest)) if first == "run" => Command::Run {
            routes: rest.to_vec(),
        },
        _ => Command::Run {
            routes: args.to_vec(),
        },
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args);

    let config = Config::from_env()?;
    let http = build_http_client(config.http_proxy.as_deref(), config.api_timeout_ms)?;
    let llm = Arc::new(AnthropicClient::new(http.clone(), &config.llm));
    let records = Arc::new(BitableStore::new(http, config.bitable.clone()));
    let memory = Arc::new(JsonFileStore::new(&config.memory_dir));

    let prompts = PromptBook::load(config.prompts_file.as_deref())?;
    if let Err(err) = prompts.sync_fingerprints(memory.as_ref()) {
        warn!("prompt fingerprint check failed, continuing: {err:#}");
    }

    let mut coordinator = Coordinator::new(llm, records, memory, &prompts, config.platforms);

    match command {
        Command::Run { routes } => {
            let summary = coordinator.daily_recommendation(&routes).await?;
            for (platform, err) in &summary.failures {
                error!("[{platform}] {err}");
            }
            info!(
                "processed={} high={} pool_added={} platforms_ok={}",
                summary.processed,
                summary.high,
                summary.pool_added,
                summary.completed.len()
            );
        }
        Command::Refresh { titles } => {
            let summary = coordinator.refresh_confirmed(&titles).await?;
            info!(
                "成功更新 {}/{} 个话题的完整脚本",
                summary.updated, summary.matched
            );
        }
    }
    Ok(())
}
