//! `mushroom` command-line entry point.
//!
//! Loads the TOML configuration, installs logging, and dispatches to the
//! chat, serve, download, train and launch commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mushroom_ai::{
    run_training, serve, setup_logging, AppConfig, ChatLoop, Completer, Downloader,
    EngineBuilder, Features, LogConfig, RemoteCompleter, VERSION,
};
use tokio::io::BufReader;

#[derive(Debug, Parser)]
#[command(name = "mushroom", version, about = "Local language model chat, fine-tuning and download")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "MUSHROOM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Chat with the local model, or with a running server
    Chat {
        /// Base URL of a running chat server
        #[arg(long)]
        remote: Option<String>,
    },
    /// Serve the chat HTTP API
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Download model and tokenizer files from the hub
    Download {
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        dest: Option<PathBuf>,
        #[arg(long)]
        token: Option<String>,
    },
    /// Fine-tune the local model on the configured datasets
    Train {
        #[arg(long)]
        model_dir: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        /// Cap on rows fetched per dataset split
        #[arg(long)]
        max_rows: Option<usize>,
    },
    /// Download the model if needed, start the server and chat with it
    Launch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AppConfig::default(),
    }
    .apply_env();
    setup_logging(LogConfig::from(&config.logging)).map_err(anyhow::Error::msg)?;
    tracing::info!("mushroom {VERSION}\n{}", Features::detect());

    match cli.command {
        Command::Chat { remote } => chat(config, remote).await,
        Command::Serve { bind } => serve_api(config, bind).await,
        Command::Download { repo, dest, token } => download(config, repo, dest, token).await,
        Command::Train {
            model_dir,
            epochs,
            max_rows,
        } => train(config, model_dir, epochs, max_rows).await,
        Command::Launch => launch(config).await,
    }
}

async fn chat_on_stdio<C: Completer>(completer: C) -> Result<()> {
    let chat = ChatLoop::new(completer);
    let prompts = chat
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;
    tracing::debug!(prompts, "chat session ended");
    Ok(())
}

async fn chat(config: AppConfig, remote: Option<String>) -> Result<()> {
    match remote {
        Some(url) => {
            let completer = RemoteCompleter::new(&url, config.generation.request_timeout())?;
            chat_on_stdio(completer).await
        }
        None => {
            let engine = EngineBuilder::new().with_config(config).build().await?;
            chat_on_stdio(engine).await
        }
    }
}

async fn serve_api(mut config: AppConfig, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    let bind = config.server.bind.clone();
    let engine = EngineBuilder::new().with_config(config).build().await?;

    let handle = serve(Arc::new(engine), &bind).await?;
    println!("Serving on {bind} (port {}), press ctrl-c to stop", handle.port);

    tokio::signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    handle.shutdown().await?;
    Ok(())
}

async fn download(
    mut config: AppConfig,
    repo: Option<String>,
    dest: Option<PathBuf>,
    token: Option<String>,
) -> Result<()> {
    if let Some(repo) = repo {
        config.hub.repo_id = repo;
    }
    if token.is_some() {
        config.hub.token = token;
    }
    let dest = dest.unwrap_or_else(|| config.paths.model_dir.clone());

    let downloader = Downloader::new(config.hub)?;
    let report = downloader.download_model(&dest).await?;
    println!(
        "Downloaded {} files ({} bytes, {} already present) into {}",
        report.files.len(),
        report.bytes,
        report.skipped,
        dest.display()
    );
    Ok(())
}

async fn train(
    mut config: AppConfig,
    model_dir: Option<PathBuf>,
    epochs: Option<usize>,
    max_rows: Option<usize>,
) -> Result<()> {
    if let Some(dir) = model_dir {
        config.paths.model_dir = dir;
    }
    if let Some(epochs) = epochs {
        config.training.epochs = epochs;
    }
    if max_rows.is_some() {
        config.datasets.max_rows = max_rows;
    }

    let report = run_training(&config).await?;
    println!(
        "Training finished after {} steps, model saved to {}",
        report.global_steps,
        report.model_dir.display()
    );
    if let Some(best) = &report.best_checkpoint {
        println!("Best checkpoint: {}", best.display());
    }
    Ok(())
}

async fn launch(config: AppConfig) -> Result<()> {
    let downloader = Downloader::new(config.hub.clone())?;
    if let Some(report) = downloader.ensure_model(&config.paths.model_dir).await? {
        println!("Downloaded {} model files", report.files.len());
    }

    let timeout = config.generation.request_timeout();
    let bind = config.server.bind.clone();
    let engine = EngineBuilder::new().with_config(config).build().await?;
    let handle = serve(Arc::new(engine), &bind).await?;

    let completer = RemoteCompleter::new(&handle.local_url(), timeout)?;
    let result = chat_on_stdio(completer).await;

    handle.shutdown().await?;
    result
}
