//! CLI entry point for the fulfillment tool.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fulfillment_core::locator::FileLocator;
use fulfillment_core::{
    AcquisitionDescriptor, Book, ContentFormat, DownloadEvent, EngineConfig,
    FulfillmentCoordinator, InMemoryLedger, Ledger, LoanState, StaticAuthenticator,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

mod app_config;
mod cli;

use cli::{Args, Command, FetchArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    match args.command {
        Command::Fetch(fetch) => run_fetch(fetch, args.quiet).await,
    }
}

/// Resolves engine settings: CLI flags > config file > defaults.
fn resolve_config(fetch: &FetchArgs) -> Result<EngineConfig> {
    let file_config = app_config::load_default_file_config()?;
    let mut config = EngineConfig::default();
    file_config.apply_to(&mut config)?;

    if let Some(dir) = &fetch.content_dir {
        config.content_base_dir.clone_from(dir);
    }
    if let Some(account) = &fetch.account {
        config.account_id.clone_from(account);
    }
    if let Some(enabled) = fetch.overdrive {
        config.overdrive_manifests = enabled;
    }
    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}

async fn run_fetch(fetch: FetchArgs, quiet: bool) -> Result<ExitCode> {
    let config = resolve_config(&fetch)?;
    let url = Url::parse(&fetch.url).with_context(|| format!("Invalid URL '{}'", fetch.url))?;

    let mut auth = StaticAuthenticator::new();
    if let Some(token) = &fetch.bearer {
        auth = auth.with_bearer_token(token.clone());
    }
    // No interactive sign-in is available from the command line.
    auth.accept_reauth(false);

    let ledger = Arc::new(InMemoryLedger::new());
    let locator = FileLocator::new(&config.content_base_dir, &config.account_id);
    let coordinator =
        FulfillmentCoordinator::builder(config, ledger.clone(), Arc::new(auth)).build()?;

    let title = fetch.title.clone().unwrap_or_else(|| fetch.id.clone());
    let book = Book::new(
        fetch.id.clone(),
        title,
        ContentFormat::Epub,
        AcquisitionDescriptor::open_access(url),
    );
    let target = locator.planned_path(&book.identifier, book.storage_kind());

    info!(identifier = %book.identifier, url = %fetch.url, "starting fetch");
    let progress = (!quiet).then(|| spinner(&book.title));
    let finished = CancellationToken::new();
    let listener = tokio::spawn(watch_events(
        coordinator.subscribe(),
        book.identifier.clone(),
        progress.clone(),
        finished.clone(),
    ));

    let download = coordinator.start_download(book.clone()).await;
    finished.cancel();
    listener.await.context("Event listener panicked")?;
    download.context("Download task panicked")?;

    let state = ledger.state(&book.identifier);
    if let Some(progress) = progress {
        progress.finish_and_clear();
    }

    if state == LoanState::DownloadSuccessful {
        println!("{}", target.display());
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(state = %state, "fetch did not complete");
        eprintln!("{}: {state}", book.identifier);
        Ok(ExitCode::FAILURE)
    }
}

fn spinner(title: &str) -> ProgressBar {
    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    progress.enable_steady_tick(Duration::from_millis(100));
    progress.set_message(format!("{title} 0%"));
    progress
}

/// Shows events until `finished` fires, then drains what is already queued.
async fn watch_events(
    mut events: broadcast::Receiver<DownloadEvent>,
    identifier: String,
    progress: Option<ProgressBar>,
    finished: CancellationToken,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => show_event(event, &identifier, progress.as_ref()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            () = finished.cancelled() => break,
        }
    }
    loop {
        match events.try_recv() {
            Ok(event) => show_event(event, &identifier, progress.as_ref()),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                debug!(skipped, "event listener lagged");
            }
            Err(_) => break,
        }
    }
}

fn show_event(event: DownloadEvent, identifier: &str, progress: Option<&ProgressBar>) {
    match event {
        DownloadEvent::CenterChanged { progress: snapshot } => {
            if let (Some(bar), Some(fraction)) = (progress, snapshot.get(identifier)) {
                bar.set_message(format!("{identifier} {:.0}%", fraction * 100.0));
            }
        }
        DownloadEvent::DownloadFailed { alert, .. } => {
            if let Some(bar) = progress {
                bar.suspend(|| eprintln!("{}: {}", alert.title, alert.message));
            } else {
                eprintln!("{}: {}", alert.title, alert.message);
            }
        }
        event => debug!(event = %event.description(), "ignoring event"),
    }
}
