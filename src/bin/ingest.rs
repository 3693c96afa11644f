//! Replica Ingest
//!
//! Loads chat-export pairs into the style exemplar collection.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replica::{
    ingest::{self, ChatPair, GLOBAL_SAMPLE_SIZE},
    Config, FastEmbedder, SqliteStorage, GLOBAL_OWNER,
};

#[derive(Parser)]
#[command(name = "replica-ingest")]
#[command(about = "Ingest (trigger, reply) chat pairs as style exemplars")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one JSON chat file
    Chat {
        /// Path to a JSON array of {trigger, reply, context?} pairs
        file: PathBuf,

        /// Owner contact id. Defaults to the file stem.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Ingest every *.json file in a directory, one owner per file
    All {
        dir: PathBuf,

        /// Also sample pairs from all files into the global collection
        #[arg(long)]
        global_style: bool,
    },

    /// Show exemplar counts per owner and history counts per contact
    Stats,

    /// Delete all exemplars for an owner
    Clear { owner: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.ensure_dirs()?;
    let store = SqliteStorage::new(&config)?;

    match cli.command {
        Commands::Chat { file, owner } => {
            let owner = match owner {
                Some(owner) => owner,
                None => {
                    let owner = ingest::owner_from_path(&file)?;
                    println!("No --owner given, using file name: {}", owner);
                    owner
                }
            };
            let embedder = load_embedder(&config).await?;
            let pairs = ingest::load_pairs(&file)?;
            ingest_file(&store, &embedder, &owner, &file, &pairs).await?;
        }
        Commands::All { dir, global_style } => {
            let files = json_files(&dir)?;
            if files.is_empty() {
                anyhow::bail!("no .json files found in {}", dir.display());
            }
            println!("Found {} JSON files in {}", files.len(), dir.display());

            let embedder = load_embedder(&config).await?;
            let mut all_pairs = Vec::new();
            for file in &files {
                let owner = ingest::owner_from_path(file)?;
                let pairs = ingest::load_pairs(file)?;
                ingest_file(&store, &embedder, &owner, file, &pairs).await?;
                if global_style {
                    all_pairs.extend(pairs);
                }
            }

            if global_style && !all_pairs.is_empty() {
                let sampled =
                    ingest::sample_global(all_pairs, GLOBAL_SAMPLE_SIZE, &mut rand::thread_rng());
                let inserted = ingest::ingest_pairs(&store, &embedder, GLOBAL_OWNER, &sampled).await?;
                println!(
                    "Global collection: {} examples from {} files",
                    inserted,
                    files.len()
                );
            }
        }
        Commands::Stats => print_stats(&store)?,
        Commands::Clear { owner } => {
            let deleted = store.clear_exemplars(&owner)?;
            println!("Cleared {} exemplars for '{}'", deleted, owner);
        }
    }

    Ok(())
}

async fn load_embedder(config: &Config) -> anyhow::Result<FastEmbedder> {
    println!("Loading embedding model ({})...", config.embedding_model);
    let config = config.clone();
    Ok(tokio::task::spawn_blocking(move || FastEmbedder::new(&config)).await??)
}

async fn ingest_file(
    store: &SqliteStorage,
    embedder: &FastEmbedder,
    owner: &str,
    file: &Path,
    pairs: &[ChatPair],
) -> anyhow::Result<()> {
    if pairs.is_empty() {
        println!("No pairs found in {}", file.display());
        return Ok(());
    }
    println!("Ingesting {} pairs from {} -> '{}'", pairs.len(), file.display(), owner);
    let inserted = ingest::ingest_pairs(store, embedder, owner, pairs).await?;
    println!("  {} examples ingested for '{}'", inserted, owner);
    Ok(())
}

fn json_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn print_stats(store: &SqliteStorage) -> anyhow::Result<()> {
    let counts = store.exemplar_counts()?;
    if counts.is_empty() {
        println!("No exemplars yet. Run `replica-ingest chat` or `replica-ingest all` first.");
    } else {
        println!("Exemplars:");
        for (owner, count) in &counts {
            let label = if owner == GLOBAL_OWNER { "(global)" } else { "" };
            println!("  {:20} {:>6} {}", owner, count, label);
        }
        println!("  Total: {} across {} owners", counts.values().sum::<u64>(), counts.len());
    }

    let contacts = store.list_contacts()?;
    if contacts.is_empty() {
        println!("\nConversation history: empty");
    } else {
        println!("\nConversation history:");
        for contact in contacts {
            println!("  {:20} {:>6} messages", contact.contact_id, contact.total_messages);
        }
    }
    Ok(())
}
