// Audiobook Offline - Offline downloads for self-hosted audiobook servers
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{bail, Context};
use audiobook_offline::{
    DownloadManager, DownloadOutcome, DownloadRequest, OfflineConfig, ServerCredentials,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "offline-cli")]
#[command(about = "Audiobook Offline CLI - Desktop testing tool", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "AUDIOBOOK_OFFLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Downloads directory (overrides the config file)
    #[arg(short, long, env = "AUDIOBOOK_OFFLINE_DIR")]
    dir: Option<PathBuf>,

    /// Server base URL
    #[arg(long, env = "AUDIOBOOK_SERVER_URL")]
    server: Option<String>,

    /// API token for the server
    #[arg(long, env = "AUDIOBOOK_SERVER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a book by its library item id
    Download {
        book_id: String,
    },
    /// Show the offline status of a book
    Status {
        book_id: String,
    },
    /// List downloaded books
    List,
    /// Delete a downloaded book
    Delete {
        book_id: String,
    },
    /// Delete every downloaded book
    DeleteAll,
    /// Run one healing sweep
    Heal,
    /// Show storage used by downloads
    Size {
        /// Only this book
        book_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => OfflineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => OfflineConfig::default(),
    };
    if let Some(dir) = cli.dir {
        config.downloads_directory = dir;
    }

    let manager = DownloadManager::new(config)?;
    manager.reload_downloaded_books().await;

    if let (Some(server), Some(token)) = (&cli.server, &cli.token) {
        manager
            .set_credentials(Some(ServerCredentials::new(server, token.clone())?))
            .await?;
    }

    let result = run(&manager, cli.command).await;
    manager.shutdown().await;
    result
}

async fn run(manager: &DownloadManager, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Download { book_id } => download(manager, &book_id).await?,
        Commands::Status { book_id } => {
            let status = manager.get_download_status(&book_id).await;
            println!("Book:     {}", book_id);
            println!("Offline:  {:?}", manager.get_offline_status(&book_id).await);
            println!("Progress: {:.0}%", status.progress * 100.0);
            if let Some(message) = status.message {
                println!("Message:  {}", message);
            }
        }
        Commands::List => {
            let books = manager.downloaded_books().await;
            if books.is_empty() {
                println!("No downloaded books");
            }
            for book in books {
                let size = manager.get_book_storage_size(&book.id).await;
                println!(
                    "{}  {}  ({} chapters, {})",
                    book.id,
                    book.title,
                    book.chapters.len(),
                    format_bytes(size)
                );
            }
        }
        Commands::Delete { book_id } => {
            manager.delete_book(&book_id).await?;
            println!("Deleted {}", book_id);
        }
        Commands::DeleteAll => {
            manager.delete_all_books().await?;
            println!("Deleted all downloads");
        }
        Commands::Heal => {
            let report = manager.heal_now().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Size { book_id } => {
            let bytes = match &book_id {
                Some(id) => manager.get_book_storage_size(id).await,
                None => manager.get_total_download_size().await,
            };
            println!("{}", format_bytes(bytes));
        }
    }
    Ok(())
}

async fn download(manager: &DownloadManager, book_id: &str) -> anyhow::Result<()> {
    let mut events = manager.subscribe();

    let mut handle = match manager.download_book_by_id(book_id).await? {
        DownloadRequest::Started(handle) => handle,
        DownloadRequest::AlreadyDownloading => bail!("{} is already downloading", book_id),
        DownloadRequest::AlreadyDownloaded => {
            println!("{} is already downloaded", book_id);
            return Ok(());
        }
    };

    let printer = {
        let book_id = book_id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.book_id == book_id => {
                        println!("[{:>3.0}%] {}", event.progress * 100.0, event.message);
                        if event.stage.is_terminal() {
                            break;
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let outcome = handle.wait().await;
    // Terminal events are published before the outcome; cancellation has none
    let _ = tokio::time::timeout(Duration::from_millis(500), printer).await;

    match outcome {
        DownloadOutcome::Completed => {
            if let Some(path) = manager.get_local_audio_path(book_id, 0).await {
                println!("Saved to {}", path.parent().unwrap_or(&path).display());
            }
            Ok(())
        }
        DownloadOutcome::Failed(message) => bail!(message),
        DownloadOutcome::Cancelled => bail!("download cancelled"),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
