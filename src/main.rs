use std::io::Read;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod classify;
mod cli;
mod config;
mod context;
mod embeddings;
mod ingest;
mod profile;
mod recommend;
mod taxonomy;
#[cfg(test)]
mod tests;

use cli::{AnalyzeArgs, Command};
use context::{AppContext, AppContextBuilder};

const PROFILE_FIELDS: [&str; 6] = [
    "user_id",
    "total_titles",
    "tags_histogram",
    "flat_subfield_histogram",
    "t0_ranked",
    "t1_ranked",
];

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_titles(args: &AnalyzeArgs) -> anyhow::Result<Vec<String>> {
    let content = if args.titles.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read titles from stdin")?;
        buf
    } else {
        std::fs::read_to_string(&args.titles)
            .with_context(|| format!("failed to read titles from {}", args.titles.display()))?
    };
    Ok(content.lines().map(str::to_string).collect())
}

fn analyze(app: &AppContext, args: AnalyzeArgs) -> anyhow::Result<()> {
    let titles = read_titles(&args)?;

    let mut options = app.analyze_options();
    if let Some(alpha) = args.alpha {
        options.alpha = alpha;
    }
    if let Some(k) = args.topk_parent {
        options.topk_parent = Some(k);
    }

    let histogram = app.classifier().analyze(&args.user_id, &titles, &options)?;

    if let Some(out) = &args.out {
        std::fs::write(out, serde_json::to_string_pretty(&histogram)?)
            .with_context(|| format!("failed to write {}", out.display()))?;
        log::info!("profile written to {}", out.display());
    }

    print_json(&histogram)
}

async fn ingest(app: &AppContext, args: cli::IngestArgs) -> anyhow::Result<()> {
    let client = app.nyt_client()?;
    let total = app.ingestor().run(&client, &args.into()).await?;
    print_json(&serde_json::json!({ "upserted": total }))
}

async fn run(command: Command) -> anyhow::Result<()> {
    let config = context::load_config()?;

    if let Command::Profile = command {
        let store = profile::ProfileStore::new(config.profile_path());
        let profile = store.read()?;
        let fields: serde_json::Map<String, serde_json::Value> = PROFILE_FIELDS
            .iter()
            .filter_map(|k| profile.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect();
        return print_json(&fields);
    }

    let app = AppContextBuilder::new().config(config).build()?;

    let result = match command {
        Command::Analyze(args) => analyze(&app, args),
        Command::Recommend {
            tags,
            use_profile,
            user_id,
        } => {
            let labels = cli::parse_tags(&tags);
            match app.orchestrator().recommend(&user_id, labels, use_profile).await {
                Ok((piece, report)) => print_json(&serde_json::json!({
                    "piece": piece,
                    "report": report,
                })),
                Err(e) => Err(e.into()),
            }
        }
        Command::Ready => print_json(&app.readiness().await),
        Command::Ingest(args) => ingest(&app, args).await,
        Command::Profile => bail!("profile is handled before the context is built"),
    };

    app.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    run(args.command).await
}
