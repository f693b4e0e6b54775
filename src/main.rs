//! # docchat CLI
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the SQLite database and run schema migrations |
//! | `docchat upload <file>` | Store a PDF and register it as a document |
//! | `docchat process <id>` | Extract, chunk and embed a document |
//! | `docchat status <id>` | Show whether a document has been processed |
//! | `docchat chat <id> "<message>"` | Ask a question, streaming the answer |
//! | `docchat transcript <id>` | Print the stored chat history |
//! | `docchat delete <id>` | Remove a document, its chunks and its bytes |
//! | `docchat signed-url <id>` | Print a time-limited preview URL |
//! | `docchat serve` | Start the HTTP server |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use docchat::app::{App, Storage};
use docchat::chat::{ChatRequest, TurnOutcome};
use docchat::config::{self, Config};
use docchat::ingest::UploadRequest;
use docchat::{db, migrate, server};

/// docchat: chat with your PDF documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docchat.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "docchat", version, about = "Retrieval-augmented chat over uploaded PDF documents")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run more than once.
    Init,

    /// Store a PDF and register it as an unprocessed document.
    Upload {
        /// Path to the PDF file.
        file: PathBuf,

        /// Owner of the document.
        #[arg(long)]
        user: String,

        /// Folder the document is filed under.
        #[arg(long, default_value = "default")]
        folder: String,

        /// Display label. Defaults to the file name.
        #[arg(long)]
        label: Option<String>,
    },

    /// Extract, chunk and embed a document, replacing earlier chunks.
    Process {
        /// Document id printed by `upload`.
        id: String,
    },

    /// Show whether a document has been processed.
    Status { id: String },

    /// Ask a question about a document. The answer streams to stdout.
    Chat {
        id: String,

        message: String,

        /// Caller identity; must own the document.
        #[arg(long)]
        user: String,
    },

    /// Print the stored chat history of a document.
    Transcript { id: String },

    /// Delete a document with its chunks, transcript and stored bytes.
    Delete { id: String },

    /// Print a time-limited URL for the document's raw bytes.
    SignedUrl {
        id: String,

        /// Lifetime in seconds. Defaults to `[storage].signed_url_ttl_secs`,
        /// capped at `[storage].max_signed_url_ttl_secs`.
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Upload {
            file,
            user,
            folder,
            label,
        } => run_upload(&cfg, file, user, folder, label).await?,
        Commands::Process { id } => run_process(cfg, &id).await?,
        Commands::Status { id } => run_status(&cfg, &id).await?,
        Commands::Chat { id, message, user } => run_chat(cfg, id, message, user).await?,
        Commands::Transcript { id } => run_transcript(&cfg, &id).await?,
        Commands::Delete { id } => {
            let storage = Storage::open(&cfg).await?;
            storage.library(&cfg).delete(&id).await?;
            println!("Deleted {}.", id);
        }
        Commands::SignedUrl { id, ttl } => {
            let storage = Storage::open(&cfg).await?;
            let doc = storage.library(&cfg).get(&id).await?;
            let ttl = cfg.storage.signed_url_ttl(ttl);
            println!("{}", storage.blobs.signed_url(&doc.storage_key, ttl)?);
        }
        Commands::Serve => {
            let app = App::build(cfg).await?;
            server::run_server(app).await?;
        }
    }

    Ok(())
}

async fn run_init(cfg: &Config) -> Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    std::fs::create_dir_all(&cfg.storage.root).with_context(|| {
        format!(
            "Failed to create storage root: {}",
            cfg.storage.root.display()
        )
    })?;
    println!("Database initialized successfully.");
    Ok(())
}

async fn run_upload(
    cfg: &Config,
    file: PathBuf,
    user: String,
    folder: String,
    label: Option<String>,
) -> Result<()> {
    let bytes = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("upload path has no file name")?;

    let storage = Storage::open(cfg).await?;
    let doc = storage
        .library(cfg)
        .upload(UploadRequest {
            user_id: user,
            folder_id: folder,
            file_name,
            label,
            bytes,
        })
        .await?;

    println!("Uploaded {}", doc.label);
    println!("  id:          {}", doc.id);
    println!("  storage key: {}", doc.storage_key);
    Ok(())
}

async fn run_process(cfg: Config, id: &str) -> Result<()> {
    let app = App::build(cfg).await?;
    let report = app.ingest.process(id).await?;
    println!("Processed {}", report.document_id);
    println!("  pages:    {}", report.pages);
    println!("  chunks:   {}", report.chunks_written);
    if report.chunks_replaced > 0 {
        println!("  replaced: {}", report.chunks_replaced);
    }
    println!("ok");
    Ok(())
}

async fn run_status(cfg: &Config, id: &str) -> Result<()> {
    let storage = Storage::open(cfg).await?;
    let library = storage.library(cfg);
    let doc = library.get(id).await?;
    let chunks = library.chunk_count(id).await?;
    println!("{} ({})", doc.label, doc.id);
    println!("  owner:     {}", doc.user_id);
    println!("  folder:    {}", doc.folder_id);
    println!("  uploaded:  {}", doc.created_at.to_rfc3339());
    println!("  processed: {}", if chunks > 0 { "yes" } else { "no" });
    println!("  chunks:    {}", chunks);
    Ok(())
}

async fn run_chat(cfg: Config, id: String, message: String, user: String) -> Result<()> {
    let app = App::build(cfg).await?;
    let doc = app.library.get(&id).await?;

    let turn = app
        .chat
        .prepare(ChatRequest {
            document_id: doc.id,
            user_id: user,
            file_name: doc.storage_key,
            message,
        })
        .await?;

    let (tx, mut rx) = mpsc::channel::<String>(8);
    let streaming = tokio::spawn(turn.stream_to(tx));

    let mut stdout = std::io::stdout();
    while let Some(fragment) = rx.recv().await {
        stdout.write_all(fragment.as_bytes())?;
        stdout.flush()?;
    }
    println!();

    let report = streaming.await.context("chat task panicked")??;
    if let TurnOutcome::Completed {
        persisted: false, ..
    } = report.outcome
    {
        eprintln!("warning: answer was not saved to the transcript");
    }
    Ok(())
}

async fn run_transcript(cfg: &Config, id: &str) -> Result<()> {
    let storage = Storage::open(cfg).await?;
    let doc = storage.library(cfg).get(id).await?;
    let turns = storage.store.transcript(&doc.id).await?;
    if turns.is_empty() {
        println!("No messages.");
        return Ok(());
    }
    for turn in turns {
        println!(
            "[{}] {}: {}",
            turn.created_at.format("%Y-%m-%d %H:%M:%S"),
            turn.role,
            turn.content
        );
    }
    Ok(())
}
