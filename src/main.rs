//! ori command line interface

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use ori::transport::ssh::is_remote_path;
use ori::transport::{pull, serve, LocalSource, SshSource};
use ori::{ops, BackrefRole, Error, Hash, ObjectType, Repo, Result};

#[derive(Parser)]
#[command(name = "ori")]
#[command(about = "distributed content-addressed versioning file system")]
#[command(version)]
struct Cli {
    /// working directory (the repository root is found by walking upward)
    #[arg(short, long, default_value = ".")]
    repo: PathBuf,

    /// verbose diagnostics
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new repository
    Init {
        /// directory to create the repository in
        path: Option<PathBuf>,
    },

    /// show repository information
    Show,

    /// commit outstanding changes
    Commit {
        /// commit message
        message: Option<String>,

        /// record the commit as a named snapshot
        #[arg(short, long)]
        snapshot: Option<String>,
    },

    /// list changes against HEAD
    Status,

    /// restore the working directory from HEAD or a commit
    Checkout {
        /// commit hash to check out
        commit: Option<String>,
    },

    /// show commit history
    Log,

    /// clone a repository
    Clone {
        /// source repository (path or [user@]host:path)
        src: String,

        /// destination directory
        dst: Option<PathBuf>,
    },

    /// pull new objects from a repository
    Pull {
        /// source repository (path or [user@]host:path)
        src: String,
    },

    /// verify every object in the repository
    Verify,

    /// find commits unreachable from HEAD
    Findheads,

    /// rebuild the backref indexes from a full walk
    Rebuildrefs,

    /// show reference counts, or the references to one object
    Refcount {
        /// object hash
        hash: Option<String>,
    },

    /// list all objects
    Listobj,

    /// print an object's payload
    Catobj {
        /// object hash
        hash: String,
    },

    /// replace a blob's payload with a tombstone
    Purgeobj {
        /// object hash
        hash: String,
    },

    /// list named snapshots
    Snapshots,

    /// graft a subtree from another repository
    Graft {
        /// source path (inside any repository)
        src_path: PathBuf,

        /// destination path (inside this repository)
        dst_path: PathBuf,
    },

    /// answer the replication protocol on stdin/stdout
    #[command(hide = true)]
    Serve {
        /// speak the protocol on stdin/stdout
        #[arg(long)]
        stdio: bool,

        /// repository root
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {}", e);
            // 2 for I/O failures, 1 for usage and semantic errors
            ExitCode::from(if e.is_io() { 2 } else { 1 })
        }
    }
}

/// route diagnostics into .ori/ori.log when inside a repository
fn init_tracing(cli: &Cli) {
    let filter = if cli.debug { "debug" } else { "info" };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_ansi(false);

    let log_file = cli
        .repo
        .canonicalize()
        .ok()
        .and_then(|start| Repo::find_root(&start))
        .map(|root| root.join(".ori").join("ori.log"))
        .and_then(|path| OpenOptions::new().create(true).append(true).open(path).ok());

    match log_file {
        Some(file) => builder.with_writer(Arc::new(file)).init(),
        None => builder.with_writer(io::stderr).init(),
    }
}

fn open_repo(start: &Path) -> Result<Repo> {
    let start = start.canonicalize().map_err(|source| Error::Io {
        path: start.to_path_buf(),
        source,
    })?;
    let root = Repo::find_root(&start).ok_or_else(|| Error::NoRepo(start.clone()))?;
    Repo::open(&root)
}

fn run(cli: Cli) -> Result<u8> {
    match cli.command {
        Commands::Init { path } => {
            let root = path.unwrap_or(cli.repo);
            let repo = Repo::init(&root)?;
            println!("Initialized repository in {}", repo.root().display());
            Ok(0)
        }

        Commands::Show => {
            let repo = open_repo(&cli.repo)?;
            println!("--- Repository ---");
            println!("Root: {}", repo.root().display());
            println!("UUID: {}", repo.uuid());
            println!("Version: {}", repo.version());
            println!("HEAD: {}", repo.head()?);
            Ok(0)
        }

        Commands::Commit { message, snapshot } => {
            let repo = open_repo(&cli.repo)?;
            let message = message.unwrap_or_else(|| "No message.".to_string());
            let hash = ops::commit(&repo, &message, snapshot.as_deref())?;
            println!("Commit Hash: {}", hash);
            println!("Tree Hash: {}", repo.get_commit(&hash)?.tree);
            Ok(0)
        }

        Commands::Status => {
            let repo = open_repo(&cli.repo)?;
            for (kind, path) in ops::status(&repo)? {
                println!("{}\t{}", kind.label(), path);
            }
            Ok(0)
        }

        Commands::Checkout { commit } => {
            let repo = open_repo(&cli.repo)?;
            let commit = commit.map(|s| Hash::from_hex(&s)).transpose()?;
            let report = ops::checkout(&repo, commit)?;
            for entry in &report.entries {
                println!("{}\t{}", entry.label, entry.path);
            }
            for _ in &report.purged {
                println!("Object has been purged.");
            }
            Ok(0)
        }

        Commands::Log => {
            let repo = open_repo(&cli.repo)?;
            for entry in ops::log(&repo)? {
                println!("{}", entry);
            }
            Ok(0)
        }

        Commands::Clone { src, dst } => {
            let dst = dst.unwrap_or_else(|| {
                let name = src.rsplit('/').next().unwrap_or(&src);
                PathBuf::from(name)
            });
            let repo = Repo::init(&dst)?;
            println!("Cloning from {} to {}", src, dst.display());

            let stats = pull_from(&repo, &src)?;
            println!(
                "Fetched {} objects ({} bytes), {} already present",
                stats.fetched, stats.bytes, stats.skipped
            );
            Ok(0)
        }

        Commands::Pull { src } => {
            let repo = open_repo(&cli.repo)?;
            println!("Pulling from {}", src);
            let stats = pull_from(&repo, &src)?;
            println!(
                "Fetched {} objects ({} bytes), {} already present",
                stats.fetched, stats.bytes, stats.skipped
            );
            Ok(0)
        }

        Commands::Verify => {
            let repo = open_repo(&cli.repo)?;
            let problems = repo.verify()?;
            for (hash, problem) in &problems {
                println!("Object {}", hash);
                println!("{}", problem);
            }
            Ok(if problems.is_empty() { 0 } else { 1 })
        }

        Commands::Findheads => {
            let repo = open_repo(&cli.repo)?;
            for hash in repo.find_lost_heads()? {
                let commit = repo.get_commit(&hash)?;
                println!("commit:  {}", hash);
                println!("parents: {}", commit.parent1);
                println!("{}", commit.message);
            }
            Ok(0)
        }

        Commands::Rebuildrefs => {
            let repo = open_repo(&cli.repo)?;
            repo.rebuild_refs()?;
            Ok(0)
        }

        Commands::Refcount { hash } => {
            let repo = open_repo(&cli.repo)?;
            match hash {
                Some(hex) => {
                    let hash = Hash::from_hex(&hex)?;
                    for (from, role) in repo.get_refs(&hash)? {
                        match role {
                            BackrefRole::Ref => println!("{}", from),
                            BackrefRole::Purged => println!("{} (purged)", from),
                        }
                    }
                }
                None => {
                    println!("{:<64} Count", "Object");
                    for (hash, froms) in repo.compute_ref_counts()? {
                        println!("{} {}", hash, froms.len());
                    }
                }
            }
            Ok(0)
        }

        Commands::Listobj => {
            let repo = open_repo(&cli.repo)?;
            for hash in repo.store().list_objects()? {
                println!("{} # {}", hash, repo.store().type_of(&hash)?);
            }
            Ok(0)
        }

        Commands::Catobj { hash } => {
            let repo = open_repo(&cli.repo)?;
            let hash = Hash::from_hex(&hash)?;
            let payload = repo.store().get_bytes(&hash)?;

            if payload.iter().all(|&b| b >= 1 && b < 0x80) {
                io::stdout()
                    .write_all(&payload)
                    .map_err(|source| Error::Io {
                        path: PathBuf::from("<stdout>"),
                        source,
                    })?;
            } else {
                println!("Hex Dump ({} bytes):", payload.len());
                print_hex(&payload);
            }
            Ok(0)
        }

        Commands::Purgeobj { hash } => {
            let repo = open_repo(&cli.repo)?;
            let hash = Hash::from_hex(&hash)?;
            if repo.store().type_of(&hash)? != ObjectType::Blob {
                println!("Error: You can only purge an object with type Blob.");
                return Ok(1);
            }
            repo.store().purge(&hash)?;
            Ok(0)
        }

        Commands::Snapshots => {
            let repo = open_repo(&cli.repo)?;
            for name in repo.list_snapshots()?.keys() {
                println!("{}", name);
            }
            Ok(0)
        }

        Commands::Graft { src_path, dst_path } => {
            let src_abs = src_path.canonicalize().map_err(|source| Error::Io {
                path: src_path.clone(),
                source,
            })?;
            let dst_abs = dst_path.canonicalize().map_err(|source| Error::Io {
                path: dst_path.clone(),
                source,
            })?;

            let src_repo = open_repo(&src_abs)?;
            let dst_repo = open_repo(&dst_abs)?;

            let src_rel = rel_to_root(&src_abs, src_repo.root())?;
            let dst_rel = rel_to_root(&dst_abs, dst_repo.root())?;

            let hash = dst_repo.graft_subtree(&src_repo, &src_rel, &dst_rel)?;
            println!("Graft Commit: {}", hash);
            Ok(0)
        }

        Commands::Serve { stdio, path } => {
            if !stdio {
                println!("serve requires --stdio");
                return Ok(1);
            }
            let repo = open_repo(&path)?;
            let stdin = io::stdin();
            let stdout = io::stdout();
            serve(&repo, stdin.lock(), stdout.lock())?;
            Ok(0)
        }
    }
}

/// pull from a local path or an ssh remote
fn pull_from(repo: &Repo, src: &str) -> Result<ori::transport::PullStats> {
    if is_remote_path(src) {
        let mut source = SshSource::connect(src)?;
        let (_, stats) = pull(repo, &mut source)?;
        source.close()?;
        Ok(stats)
    } else {
        let src_root = Repo::find_root(Path::new(src))
            .ok_or_else(|| Error::NoRepo(PathBuf::from(src)))?;
        let mut source = LocalSource::new(Repo::open(&src_root)?);
        let (_, stats) = pull(repo, &mut source)?;
        Ok(stats)
    }
}

/// express an absolute path relative to a repository root, slash-prefixed
fn rel_to_root(abs: &Path, root: &Path) -> Result<String> {
    let rel = abs.strip_prefix(root).map_err(|_| {
        Error::InvalidArgument(format!(
            "{} is outside repository {}",
            abs.display(),
            root.display()
        ))
    })?;
    Ok(format!("/{}", rel.display()))
}

fn print_hex(payload: &[u8]) {
    for chunk in payload.chunks(16) {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        println!("{:<48} {}", hex.join(" "), ascii);
    }
}
