mod config;
mod db;
mod ingest;
mod plan;
mod remote;
mod search;
mod sync;
mod vcard3;
mod vcard_io;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use config::Config;
use db::Database;
use remote::http::HttpTransport;
use sync::{SyncEngine, SyncResult};

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser, Debug)]
#[command(name = "carddav-mirror", version, about = "Mirror external CardDAV address books into a local contact store")]
struct Cli {
    /// Configuration file (defaults to <config_dir>/carddav-mirror/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull every configured source (or one) into the local store
    Sync(SyncArgs),
    /// Query mirrored contacts for email addresses (mutt/aerc query format)
    Query(QueryArgs),
    /// Show mirrored address books
    Status,
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Only sync the source with this id
    #[arg(long, value_name = "ID")]
    source: Option<String>,

    /// Print one JSON object per source instead of a summary line
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Search term (matches name and email)
    query: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (env_filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(DEFAULT_LOG_LEVEL), false),
    };
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();

    let config = config::load(cli.config.as_deref())?;
    tracing::debug!(path = %config.config_path.display(), "configuration loaded");

    if !from_env {
        if let Some(level) = config.log_level.as_deref() {
            match EnvFilter::try_new(level) {
                Ok(filter) => {
                    if let Err(e) = filter_handle.modify(|current| *current = filter) {
                        tracing::warn!(error = %e, "failed to update log filter from config");
                    }
                }
                Err(_) => tracing::warn!(level, "invalid log level in config, keeping info"),
            }
        }
    }

    let mut db = open_database(&config)?;

    match cli.command {
        Command::Sync(args) => handle_sync(args, &config, &mut db),
        Command::Query(args) => handle_query(args, &db),
        Command::Status => handle_status(&db),
    }
}

fn open_database(config: &Config) -> Result<Database> {
    let path = match &config.db_path {
        Some(path) => path.clone(),
        None => Database::default_path()?,
    };
    Database::open(&path)
}

fn handle_sync(args: SyncArgs, config: &Config, db: &mut Database) -> Result<()> {
    let sources = match args.source.as_deref() {
        Some(id) => match config.source(id) {
            Some(source) => vec![source],
            None => bail!("no source with id `{}` in {}", id, config.config_path.display()),
        },
        None => config.sources.iter().collect(),
    };

    let transport = HttpTransport::new(config.http.connect_timeout, config.http.request_timeout)?;

    let mut failed = 0usize;
    for source in &sources {
        let external = match source.to_external_source() {
            Ok(external) => external,
            Err(err) => {
                failed += 1;
                eprintln!("{}: failed: {:#}", source.id, err);
                continue;
            }
        };

        let result = SyncEngine::new(db, &transport, &external).run();
        if !result.success {
            failed += 1;
        }
        print_result(&result, args.json)?;
    }

    if failed > 0 {
        bail!("{} of {} source(s) failed to sync", failed, sources.len());
    }
    Ok(())
}

fn print_result(result: &SyncResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    if result.success {
        println!(
            "{} ({}): synced {} contact(s)",
            result.source_id, result.source_name, result.contact_count
        );
    } else {
        let phase = result
            .failed_phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "{} ({}): failed during {}: {}",
            result.source_id,
            result.source_name,
            phase,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn handle_query(args: QueryArgs, db: &Database) -> Result<()> {
    let results = db.query_contacts(&args.query)?;

    // Header line (abook-compatible, ignored by mutt/aerc)
    if results.is_empty() {
        println!("No matches for \"{}\"", args.query);
    } else {
        println!(
            "Found {} contact(s) matching \"{}\"",
            results.len(),
            args.query
        );
    }

    // Results: email<TAB>name<TAB>book
    for r in results {
        println!(
            "{}\t{}\t{}",
            r.email,
            r.name,
            r.book_id.as_deref().unwrap_or(" ")
        );
    }

    Ok(())
}

fn handle_status(db: &Database) -> Result<()> {
    let books = db.list_books()?;
    if books.is_empty() {
        println!("No address books mirrored yet.");
        return Ok(());
    }

    for book in books {
        println!(
            "{}\t{}\t{}\tctag={}\t{} contact(s)",
            book.id,
            book.display_name.as_deref().unwrap_or("-"),
            book.url,
            book.ctag.as_deref().unwrap_or("-"),
            book.contact_count
        );
    }
    Ok(())
}
