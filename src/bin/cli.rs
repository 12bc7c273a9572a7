//! AtlasDoc CLI
//!
//! Inspect and maintain the indexes of a data directory.

use std::process;

use atlasdoc::index::{Index, IndexKey};
use atlasdoc::{AtlasError, Config, Database, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// AtlasDoc CLI
#[derive(Parser, Debug)]
#[command(name = "atlasdoc-cli")]
#[command(about = "Inspect and maintain AtlasDoc indexes")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./atlasdoc_data")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every index with its configuration
    List,

    /// Show size and residency of an index
    Stats {
        /// Index name (case-insensitive)
        index: String,
    },

    /// Get the record ids under a key
    Get {
        /// Index name (case-insensitive)
        index: String,

        /// Key as JSON (bare words are read as strings)
        key: String,
    },

    /// List the entries between two keys (inclusive)
    Range {
        /// Index name (case-insensitive)
        index: String,

        /// Lower key as JSON
        from: String,

        /// Upper key as JSON
        to: String,
    },

    /// Flush and evict the resident nodes of an index
    Optimize {
        /// Index name (case-insensitive)
        index: String,

        /// Evict every unpinned node instead of the least recently used half
        #[arg(long)]
        hard: bool,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,atlasdoc=debug"));

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .watchdog_enabled(false)
        .build();

    let db = match Database::open(config) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open data directory {}: {}", args.data_dir, e);
            process::exit(1);
        }
    };

    let result = run(&db, args.command);
    if let Err(e) = db.close() {
        tracing::error!("Failed to close database: {}", e);
    }

    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn run(db: &Database, command: Commands) -> Result<()> {
    match command {
        Commands::List => {
            for index in db.indexes().indexes() {
                let definition = index.definition();
                println!(
                    "{}\t{}\tautomatic={}\tcontainers={}\tkeys={}",
                    definition.name,
                    definition.kind,
                    definition.automatic,
                    definition.containers.join(","),
                    index.size()?
                );
            }
        }

        Commands::Stats { index } => {
            let index = db.indexes().get(&index)?;
            let snapshot = index.snapshot();
            println!("name:             {}", snapshot.name);
            println!("type:             {}", snapshot.kind);
            println!("status:           {:?}", index.status());
            println!("keys:             {}", index.size()?);
            println!("resident nodes:   {}", index.resident_nodes());
            println!("resident entries: {}", index.in_memory_entries());
            if let Some(root) = snapshot.map_root_ref {
                println!("root:             {}", root);
            }
        }

        Commands::Get { index, key } => {
            let index = db.indexes().get(&index)?;
            let key = parse_key(&index, &key)?;
            for rid in index.get(&key)? {
                println!("{}", rid);
            }
        }

        Commands::Range { index, from, to } => {
            let index = db.indexes().get(&index)?;
            let from = parse_key(&index, &from)?;
            let to = parse_key(&index, &to)?;
            for (key, rids) in index.range_entries(&from, &to, true, true)? {
                let rids: Vec<String> = rids.iter().map(|rid| rid.to_string()).collect();
                println!("{}\t[{}]", key, rids.join(","));
            }
        }

        Commands::Optimize { index, hard } => {
            let index = db.indexes().get(&index)?;
            let evicted = index.optimize(hard)?;
            println!("evicted {} nodes", evicted);
        }
    }

    Ok(())
}

/// Parse a command-line key against the index's key type
fn parse_key(index: &Index, text: &str) -> Result<IndexKey> {
    let value = serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()));
    IndexKey::from_json(&value, index.definition().key_type)?
        .ok_or_else(|| AtlasError::KeyType(format!("'{}' is not a valid key", text)))
}
