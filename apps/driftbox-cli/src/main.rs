use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use driftbox_engine::{EngineConfig, RecordChange, TransferEngine, config_path};
use driftbox_session::Credentials;
use driftbox_transfer::{Direction, FileSource, TransferId, TransferRecord};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Resumable uploads and downloads for driftbox storage")]
struct Cli {
    /// Config file (defaults to the user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the backend base URL.
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store credentials for later commands.
    Login {
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
    },
    /// Forget stored credentials.
    Logout,
    /// Upload files into a backend folder and wait for them.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value = "/")]
        dest: String,
    },
    /// Download a remote file or folder and wait for it.
    Download {
        file_id: String,
        /// Local root; defaults to the configured download root.
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// List transfers.
    List {
        #[arg(long, value_enum)]
        direction: Option<DirectionArg>,
    },
    /// Pause an idle transfer so it is not picked up again.
    Pause { id: u64 },
    /// Resume a paused transfer, or re-run a pending commit, and wait.
    Resume { id: u64 },
    /// Start a new attempt of a failed transfer and wait.
    Retry { id: u64 },
    /// Cancel a transfer and delete its record.
    Cancel { id: u64 },
    /// Delete completed records.
    Clear {
        #[arg(long, value_enum)]
        direction: DirectionArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    Upload,
    Download,
}

impl From<DirectionArg> for Direction {
    fn from(d: DirectionArg) -> Self {
        match d {
            DirectionArg::Upload => Direction::Upload,
            DirectionArg::Download => Direction::Download,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    };
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    if cli.config.is_none()
        && let Some(path) = config_path()
        && !path.exists()
    {
        if let Err(e) = config.save_to(&path) {
            warn!(path = %path.display(), error = %e, "failed to write default config");
        }
    }

    let (engine, session) =
        TransferEngine::from_config(config).context("failed to initialize transfer engine")?;
    let recovered = engine.recover_interrupted()?;
    if recovered > 0 {
        info!(recovered, "settled transfers left over from a previous run");
    }

    match cli.command {
        Command::Login {
            access_token,
            refresh_token,
        } => {
            session.login(Credentials {
                access_token,
                refresh_token,
            })?;
            println!("logged in");
        }
        Command::Logout => {
            session.logout()?;
            println!("logged out");
        }
        Command::Upload { files, dest } => {
            let mut ids = Vec::with_capacity(files.len());
            for path in files {
                if !path.is_file() {
                    bail!("{} is not a file", path.display());
                }
                ids.push(engine.start_upload(Arc::new(FileSource::new(path)), &dest)?);
            }
            run_to_end(&engine, &ids).await?;
        }
        Command::Download { file_id, dest } => {
            let root = dest.unwrap_or_else(|| engine.config().download_root.clone());
            let ids = engine.start_remote_download(&file_id, &root).await?;
            if ids.is_empty() {
                println!("nothing to download");
            }
            run_to_end(&engine, &ids).await?;
        }
        Command::List { direction } => {
            let records = engine.list(direction.map(Direction::from))?;
            if records.is_empty() {
                println!("no transfers");
            }
            for r in &records {
                println!("{}", describe(r));
            }
        }
        Command::Pause { id } => {
            engine.pause(TransferId(id))?;
            println!("paused {id}");
        }
        Command::Resume { id } => {
            engine.resume(TransferId(id)).await?;
            run_to_end(&engine, &[TransferId(id)]).await?;
        }
        Command::Retry { id } => {
            engine.retry(TransferId(id)).await?;
            run_to_end(&engine, &[TransferId(id)]).await?;
        }
        Command::Cancel { id } => {
            engine.cancel(TransferId(id))?;
            println!("cancelled {id}");
        }
        Command::Clear { direction } => {
            let n = engine.clear_completed(direction.into())?;
            println!("cleared {n} completed {}s", Direction::from(direction));
        }
    }
    Ok(())
}

/// Waits for `ids` while printing progress. Ctrl-C pauses what can be
/// paused and fails the rest, then waits for the workers to settle.
async fn run_to_end(engine: &TransferEngine, ids: &[TransferId]) -> Result<()> {
    let interrupter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping transfers");
                engine.interrupt_all("interrupted by user");
            }
        })
    };
    let printer = {
        let mut changes = engine.subscribe();
        let watched: Vec<TransferId> = ids.to_vec();
        tokio::spawn(async move {
            let mut shown: HashMap<TransferId, (String, u8)> = HashMap::new();
            while let Ok(change) = changes.recv().await {
                let RecordChange::Updated(r) = change else {
                    continue;
                };
                if !watched.contains(&r.id) {
                    continue;
                }
                let label = r.status().label().to_string();
                let step = r.progress / 10;
                if shown.get(&r.id) != Some(&(label.clone(), step)) {
                    println!("{}", describe(&r));
                    shown.insert(r.id, (label, step));
                }
            }
        })
    };

    for id in ids {
        engine.wait(*id).await;
    }
    interrupter.abort();
    printer.abort();

    let mut failed = 0;
    for id in ids {
        match engine.get(*id)? {
            Some(r) => {
                if r.status().is_failed() {
                    failed += 1;
                }
                println!("{}", describe(&r));
            }
            None => println!("{id} removed"),
        }
    }
    if failed > 0 {
        bail!("{failed} transfer(s) failed");
    }
    Ok(())
}

fn describe(r: &TransferRecord) -> String {
    let mut line = format!(
        "{:>4}  {:<8}  {:<24}  {:>3}%  {}",
        r.id,
        r.direction(),
        r.status().label(),
        r.progress,
        r.name
    );
    if let Some(msg) = &r.message {
        line.push_str(&format!("  ({msg})"));
    }
    line
}
