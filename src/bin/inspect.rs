//! nodestore Inspection Binary
//!
//! Offline diagnostics for a mapped data directory.

use std::process;

use clap::{Parser, Subcommand};
use nodestore::{Config, Db, Index, MappedDb, Recovery, StoreError};
use tracing_subscriber::{fmt, EnvFilter};

/// nodestore inspector
#[derive(Parser, Debug)]
#[command(name = "nodestore-inspect")]
#[command(about = "Inspect, verify and compact a nodestore data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./nodestore_data")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print capacity and per-index key counts
    Stats,

    /// Print the keys and values of one index
    Dump {
        /// Index name (e.g. blocks, ntp1_token_names)
        #[arg(short, long)]
        index: Index,

        /// Maximum number of keys to print
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Check the data file without opening it for writing
    Verify,

    /// Rewrite the data file with only the live state
    Compact,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nodestore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    let config = Config::builder().data_dir(&args.data_dir).build();

    if let Err(e) = run(&config, args.command) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(config: &Config, command: Commands) -> nodestore::Result<()> {
    match command {
        Commands::Verify => {
            let result = Recovery::verify(&config.data_file())?;
            println!(
                "ok: {} records, last txn {}, {} committed bytes{}",
                result.records_replayed,
                result.last_txn_id,
                result.committed_bytes,
                if result.discarded_tail {
                    " (unfinished commit past the pointer)"
                } else {
                    ""
                }
            );
        }
        Commands::Stats => {
            let db = open_existing(config)?;
            let stats = db.stats()?;
            println!("path:            {}", stats.path.display());
            println!("capacity:        {} bytes", stats.capacity);
            println!("committed:       {} bytes", stats.committed_bytes);
            println!("last txn:        {}", stats.last_txn_id);
            for (index, keys) in stats.keys_per_index {
                println!("{:<17}{} keys", format!("{}:", index), keys);
            }
            db.close()?;
        }
        Commands::Dump { index, limit } => {
            let db = open_existing(config)?;
            let all = db.read_all(index)?;
            for (key, values) in all.iter().take(limit.unwrap_or(usize::MAX)) {
                for value in values {
                    println!("{} => {}", hex::encode(key), hex::encode(value));
                }
            }
            db.close()?;
        }
        Commands::Compact => {
            let db = open_existing(config)?;
            let before = db.stats()?.committed_bytes;
            db.compact()?;
            let after = db.stats()?.committed_bytes;
            println!("compacted {} -> {} bytes", before, after);
            db.close()?;
        }
    }
    Ok(())
}

/// Open the store only if its data file is already there
fn open_existing(config: &Config) -> nodestore::Result<MappedDb> {
    let path = config.data_file();
    if !path.exists() {
        return Err(StoreError::Config(format!(
            "no data file at {}",
            path.display()
        )));
    }
    MappedDb::open(config)
}
