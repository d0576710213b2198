use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use sd_updater::{
    backup_save_data, default_candidates, find_install_root, inspect, installed_version,
    looks_like_sd_root, restore_save_data, HttpCdnClient, InstallationState, ProgressEvent,
    RunOutcome, UpdateEngine, UpdateWorker, UpdaterConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the installer
#[derive(Parser, Debug)]
#[clap(version, about = "Install or update CTGP-7 on a 3DS SD card")]
struct Args {
    /// SD card root. Detected from mounted volumes when omitted.
    #[clap(long)]
    root: Option<PathBuf>,

    /// JSON file overriding CDN endpoints, directory names and limits
    #[clap(long)]
    config: Option<PathBuf>,

    /// Wipe and reinstall even if a valid installation is present
    #[clap(long)]
    reinstall: bool,

    /// Answer yes to every question
    #[clap(short, long)]
    yes: bool,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "debug"
    } else {
        "warn,sd_updater=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match &args.config {
        Some(path) => UpdaterConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => UpdaterConfig::default(),
    };

    let root = match args.root.clone() {
        Some(root) => root,
        None => find_install_root(default_candidates())
            .ok_or_else(|| anyhow!("no SD card found, pass --root"))?,
    };
    if !looks_like_sd_root(&root) {
        warn!(root = %root.display(), "this path does not look like a 3DS SD card");
    }

    let state = inspect(&root, &config)?;
    info!(?state, root = %root.display(), "inspected installation");
    let is_install = match state {
        InstallationState::Absent => true,
        state if state.needs_install() => {
            if !confirm(
                &args,
                "This installation is corrupted or flagged for removal. \
                 Continuing will wipe it and install a fresh copy (save data is backed up). Continue?",
            )? {
                return Ok(());
            }
            true
        }
        InstallationState::PendingUpdate => {
            if !args.reinstall
                && !confirm(
                    &args,
                    "A pending update was detected and must be finished first. Continue it?",
                )?
            {
                return Ok(());
            }
            args.reinstall
        }
        _ => args.reinstall,
    };
    if let Some(version) = installed_version(&root, &config) {
        println!("Installed version: {version}");
    }

    let layout = config.layout(&root);
    let backed_up = if is_install {
        backup_save_data(&layout).context("failed to create save backup")?
    } else {
        false
    };
    if backed_up {
        println!("Save data backed up to {}", layout.backup.display());
    }

    let client = HttpCdnClient::builder()
        .user_agent(format!("ctgp7-installer/{}", env!("CARGO_PKG_VERSION")))
        .build()?;
    let mut engine = UpdateEngine::new(is_install)
        .with_config(config)
        .with_fetcher(Arc::new(client));
    engine.set_base_directory(&root);
    let mut worker = UpdateWorker::spawn(engine);

    let token = worker.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping...");
            token.cancel();
        }
    });

    while let Some(event) = worker.next_event().await {
        render(&event);
    }

    match worker.join().await? {
        RunOutcome::Succeeded { version } => {
            println!("Installation finished successfully! (v{version})");
            if backed_up && confirm(&args, "Restore the save backup made earlier?")? {
                restore_save_data(&layout).with_context(|| {
                    format!(
                        "failed to restore save backup, restore {} manually",
                        layout.backup.display()
                    )
                })?;
                println!("Save data restored.");
            }
            Ok(())
        }
        RunOutcome::Cancelled => {
            println!("Cancelled. Run again to continue where it stopped.");
            Ok(())
        }
        RunOutcome::Failed(err) => {
            if let Some(detail) = err.detail() {
                eprintln!("details: {detail}");
            }
            if backed_up {
                eprintln!("Your save backup is in {}", layout.backup.display());
            }
            bail!("an error occurred during the installation: {err}")
        }
    }
}

fn render(event: &ProgressEvent) {
    match event {
        ProgressEvent::Message { text } => println!("{text}"),
        ProgressEvent::Progress { current, total } => {
            let percent = event.percentage().unwrap_or_default();
            print!("\r[{current}/{total}] {percent:5.1}%");
            if current == total {
                println!();
            }
            let _ = io::stdout().flush();
        }
    }
}

fn confirm(args: &Args, question: &str) -> Result<bool> {
    if args.yes {
        return Ok(true);
    }
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse() {
        let args = Args::parse_from(["installer", "--root", "/sd", "--reinstall", "-y"]);
        assert_eq!(args.root, Some(PathBuf::from("/sd")));
        assert!(args.reinstall);
        assert!(args.yes);
        assert!(!args.debug);
        assert!(confirm(&args, "ok?").unwrap());
    }
}
