use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use exn::ResultExt;
use std::path::PathBuf;
use std::process::ExitCode;
use timekeep_backup::progress::Progress;
use timekeep_backup::{Source, Vault};
use timekeep_config::Config;
use timekeep_storage::{ContentHash, HashAlgorithm};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Display, Error)]
enum CliError {
    #[display("could not load configuration")]
    Config,
    #[display("invalid argument: {_0}")]
    Argument(#[error(not(source))] String),
    #[display("operation failed")]
    Backup,
    #[display("could not print result")]
    Output,
}

type Result<T> = std::result::Result<T, exn::Exn<CliError>>;

#[derive(Parser, Debug)]
#[command(name = "timekeep", author, version, about = "Differential backups of session files and folders")]
struct Cli {
    /// Configuration file (`.toml`, `.yaml` or `.json`)
    #[arg(short, long, global = true, env = "TIMEKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up a file or folder
    Backup {
        /// Absolute path of the file or folder
        path: PathBuf,
        /// Session the backup belongs to
        #[arg(short, long)]
        session: String,
        /// Only store what changed since this backup
        #[arg(short, long)]
        parent: Option<String>,
        /// Use the most recent backup of the same path as the parent
        #[arg(long, conflicts_with = "parent")]
        link_previous: bool,
    },
    /// Materialize a backup under the restore root
    Restore {
        /// Backup name
        name: String,
    },
    /// Print a backup's manifest as JSON
    Manifest { name: String },
    /// List the files recorded for a backup
    Contents {
        /// Backup id
        id: String,
    },
    /// Find recorded files by content hash
    Find {
        hash: String,
        /// Group matches by backup
        #[arg(long)]
        grouped: bool,
    },
    /// Percentage of content two backups share
    Similarity { a: String, b: String },
    /// Hash a file or folder without backing it up
    Hash {
        path: PathBuf,
        /// `sha256` or `blake3`; defaults to the configured algorithm
        #[arg(short, long)]
        algorithm: Option<String>,
    },
    /// Re-hash the objects of a backup
    Verify { name: String },
    /// Delete every backup of a session
    DeleteSession { session: String },
    /// Remove backup directories the catalog doesn't know about
    Prune,
}

fn setup_logging(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:?}");
            ExitCode::FAILURE
        },
    }
}

fn progress(update: Progress) {
    tracing::debug!(phase = %update.phase, done = update.done, total = update.total, "{}", update.label);
}

/// Cancel on Ctrl-C, leaving no half-written backup behind.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping");
            cancel.cancel();
        }
    });
    token
}

fn parse_hash(hash: &str) -> Result<ContentHash> {
    hash.parse::<ContentHash>().or_raise(|| CliError::Argument(format!("`{hash}` is not a content hash")))
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| CliError::Config)?;
    if let Command::Hash { path, algorithm } = &cli.command {
        let algorithm = match algorithm {
            Some(name) => name.parse::<HashAlgorithm>().or_raise(|| CliError::Argument(name.clone()))?,
            None => config.hash_algorithm,
        };
        let tree = timekeep_backup::hash_directory(path, algorithm).await.or_raise(|| CliError::Backup)?;
        for entry in &tree.entries {
            println!("{}  {}", entry.hash, entry.relative_path);
        }
        for skipped in &tree.skipped {
            println!("skipped  {}: {}", skipped.path, skipped.reason);
        }
        println!("{}  {} files, {} bytes", tree.hash, tree.file_count, tree.total_size);
        return Ok(());
    }

    let vault = Vault::open(&config).await.or_raise(|| CliError::Backup)?;
    let result = execute(&vault, cli.command).await;
    vault.close().await;
    result
}

async fn execute(vault: &Vault, command: Command) -> Result<()> {
    match command {
        Command::Backup { path, session, parent, link_previous } => {
            let source = Source::open_with(&path, vault.options().follow_symlinks).or_raise(|| CliError::Backup)?;
            let parent = match (parent, link_previous) {
                (Some(id), _) => Some(id),
                (None, true) => {
                    let latest = vault.latest_backup_for_source(&path).await.or_raise(|| CliError::Backup)?;
                    if latest.is_none() {
                        tracing::info!(path = %path.display(), "No previous backup, taking a full one");
                    }
                    latest.map(|b| b.id)
                },
                (None, false) => None,
            };
            let report = vault
                .create_backup_from(&session, &source, parent.as_deref(), &progress, &cancel_on_interrupt())
                .await
                .or_raise(|| CliError::Backup)?;
            let kind = if report.backup.is_full_backup { "full" } else { "differential" };
            println!("{}\t{}\t{kind}", report.backup.id, report.backup.name);
            for skipped in &report.skipped {
                println!("not backed up: {} ({})", skipped.path, skipped.reason);
            }
        },
        Command::Restore { name } => {
            let restored = vault
                .reconstruct_with(&name, &progress, &cancel_on_interrupt())
                .await
                .or_raise(|| CliError::Backup)?;
            println!("{}", restored.path.display());
            for missing in &restored.missing {
                println!("missing: {missing}");
            }
        },
        Command::Manifest { name } => {
            let manifest = vault.read_manifest(&name).await.or_raise(|| CliError::Backup)?;
            let json = serde_json::to_string_pretty(&manifest).or_raise(|| CliError::Output)?;
            println!("{json}");
        },
        Command::Contents { id } => {
            for record in vault.folder_contents(&id).await.or_raise(|| CliError::Backup)? {
                println!("{}\t{}\t{}\t{}", record.change_type, record.content_hash, record.size_bytes, record.relative_path);
            }
        },
        Command::Find { hash, grouped } => {
            let hash = parse_hash(&hash)?;
            if grouped {
                for folder in vault.find_folders_with_file_hash(&hash).await.or_raise(|| CliError::Backup)? {
                    println!("{}\t{}\t{}", folder.backup_name, folder.session_id, folder.paths.join(", "));
                }
            } else {
                for found in vault.find_files_by_hash(&hash).await.or_raise(|| CliError::Backup)? {
                    println!("{}\t{}\t{}", found.backup_name, found.session_id, found.record.relative_path);
                }
            }
        },
        Command::Similarity { a, b } => {
            let similarity = vault.folder_similarity(&a, &b).await.or_raise(|| CliError::Backup)?;
            println!("{similarity:.1}%");
        },
        Command::Verify { name } => {
            let bad = vault.verify_backup(&name).await.or_raise(|| CliError::Backup)?;
            if bad.is_empty() {
                println!("ok");
            } else {
                for hash in &bad {
                    println!("corrupt: {hash}");
                }
                exn::bail!(CliError::Backup);
            }
        },
        Command::DeleteSession { session } => {
            for backup in vault.delete_session_backups(&session).await.or_raise(|| CliError::Backup)? {
                println!("deleted {}", backup.name);
            }
        },
        Command::Prune => {
            for name in vault.prune_orphans().await.or_raise(|| CliError::Backup)? {
                println!("pruned {name}");
            }
        },
        // Handled before the vault is opened.
        Command::Hash { .. } => {},
    }
    Ok(())
}
