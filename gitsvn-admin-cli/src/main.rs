//! GitSvn Administration CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gitsvn_core::{
    path, Branch, CommitBuilder, Error, FileMode, LfsConfig, Repository, RepositoryConfig, User,
};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gitsvn-admin")]
#[command(author = "GitSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "GitSvn repository administration tool")]
struct Cli {
    /// Repository directory
    #[arg(short, long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new repository
    Init {
        /// Branch exposed to clients
        #[arg(short, long, default_value = "master")]
        branch: String,
        /// Enable LFS storage under <repo>/lfs
        #[arg(long)]
        lfs: bool,
    },

    /// Add or replace a file from local disk
    Put {
        /// Repository path of the file
        path: String,
        /// Local file to read
        source: PathBuf,
        #[arg(short, long, default_value = "")]
        message: String,
        #[arg(short, long, default_value = "admin")]
        user: String,
        /// Store as executable
        #[arg(long)]
        executable: bool,
    },

    /// Create a directory (and missing parents)
    Mkdir {
        path: String,
        #[arg(short, long, default_value = "")]
        message: String,
        #[arg(short, long, default_value = "admin")]
        user: String,
    },

    /// Remove a file or directory
    Rm {
        path: String,
        #[arg(short, long, default_value = "")]
        message: String,
        #[arg(short, long, default_value = "admin")]
        user: String,
    },

    /// Print file content
    Cat {
        path: String,
        #[arg(short = 'R', long)]
        revision: Option<u64>,
    },

    /// List a directory with sizes and properties
    Ls {
        #[arg(default_value = "/")]
        path: String,
        #[arg(short = 'R', long)]
        revision: Option<u64>,
    },

    /// Show revision history
    Log {
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Init { branch, lfs } => {
            let config = RepositoryConfig {
                branch,
                lfs: lfs.then(LfsConfig::default),
                ..Default::default()
            };
            let repo = Repository::init(&cli.repo, &config)?;
            println!(
                "Repository initialized at {} (UUID: {})",
                cli.repo.display(),
                repo.uuid()
            );
        }

        Commands::Put {
            path,
            source,
            message,
            user,
            executable,
        } => {
            let content = std::fs::read(&source)
                .with_context(|| format!("failed to read {}", source.display()))?;
            let mode = if executable {
                FileMode::Executable
            } else {
                FileMode::Regular
            };
            let branch = open_branch(&cli.repo).await?;
            let user = User::new(user.clone(), user, "");
            let revision = commit_with_retry(&branch, &user, &message, |mut builder| {
                let path = path.clone();
                let content = content.clone();
                async move {
                    put_file(&mut builder, &path, &content, mode).await?;
                    Ok(builder)
                }
            })
            .await?;
            println!("Committed revision {}.", revision);
        }

        Commands::Mkdir {
            path,
            message,
            user,
        } => {
            let branch = open_branch(&cli.repo).await?;
            let user = User::new(user.clone(), user, "");
            let revision = commit_with_retry(&branch, &user, &message, |mut builder| {
                let path = path.clone();
                async move {
                    let depth = enter_dirs(&mut builder, path::components(&path).collect(), true).await?;
                    close_dirs(&mut builder, depth).await?;
                    Ok(builder)
                }
            })
            .await?;
            println!("Committed revision {}.", revision);
        }

        Commands::Rm {
            path,
            message,
            user,
        } => {
            let branch = open_branch(&cli.repo).await?;
            let user = User::new(user.clone(), user, "");
            let revision = commit_with_retry(&branch, &user, &message, |mut builder| {
                let path = path.clone();
                async move {
                    let Some((parent, name)) = path::split(&path) else {
                        return Err(Error::NotFound(path.clone()));
                    };
                    let depth = enter_dirs(&mut builder, path::components(&parent).collect(), false).await?;
                    builder.delete(name).await?;
                    close_dirs(&mut builder, depth).await?;
                    Ok(builder)
                }
            })
            .await?;
            println!("Committed revision {}.", revision);
        }

        Commands::Cat { path, revision } => {
            let branch = open_branch(&cli.repo).await?;
            let rev = match revision {
                Some(rev) => rev,
                None => branch.latest_revision().await.id,
            };
            let Some(node) = branch.file(rev, &path).await? else {
                bail!("{} not found in r{}", path, rev);
            };
            if node.is_dir() {
                bail!("{} is a directory", path);
            }
            let content = node.read_all().await?;
            std::io::stdout().write_all(&content)?;
        }

        Commands::Ls { path, revision } => {
            let branch = open_branch(&cli.repo).await?;
            let rev = match revision {
                Some(rev) => rev,
                None => branch.latest_revision().await.id,
            };
            let Some(dir) = branch.file(rev, &path).await? else {
                bail!("{} not found in r{}", path, rev);
            };
            for node in dir.entries().await? {
                let changed = node.last_change().await?;
                let name = if node.is_dir() {
                    format!("{}/", node.name())
                } else {
                    node.name().to_string()
                };
                println!(
                    "{:>8} {:>10} {:<12} {}",
                    format!("r{}", changed.id),
                    node.size().await?,
                    changed.author,
                    name
                );
                for (key, value) in node.properties().await? {
                    println!("{:>32}{} = {}", "", key, value.trim_end());
                }
            }
        }

        Commands::Log { limit } => {
            let branch = open_branch(&cli.repo).await?;
            let latest = branch.latest_revision().await.id;
            let count = limit.unwrap_or(usize::MAX);
            for id in (1..=latest).rev().take(count) {
                let revision = branch.revision(id).await?;
                println!("------------------------------------------------------------------------");
                println!(
                    "r{} | {} | {}",
                    revision.id,
                    revision.author,
                    revision.date_string()
                );
                println!();
                println!("{}", revision.message.trim_end());
            }
        }
    }

    Ok(())
}

async fn open_branch(repo_path: &std::path::Path) -> Result<Arc<Branch>> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("failed to open repository at {}", repo_path.display()))?;
    Ok(repo.default_branch().await?)
}

/// Run `edit` in a fresh transaction until the push is not rejected
async fn commit_with_retry<F, Fut>(
    branch: &Arc<Branch>,
    user: &User,
    message: &str,
    mut edit: F,
) -> Result<u64>
where
    F: FnMut(CommitBuilder) -> Fut,
    Fut: std::future::Future<Output = gitsvn_core::Result<CommitBuilder>>,
{
    loop {
        let builder = branch
            .create_commit_builder(user.clone(), BTreeMap::new())
            .await?;
        let builder = edit(builder).await?;
        match builder.commit(user, message).await {
            Ok(revision) => return Ok(revision.id),
            Err(e) if e.is_retryable() => {
                info!("Retry commit: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Open (or with `create`, add) each directory of `dirs`; returns how many
/// were entered
async fn enter_dirs(
    builder: &mut CommitBuilder,
    dirs: Vec<&str>,
    create: bool,
) -> gitsvn_core::Result<usize> {
    let mut depth = 0;
    for dir in dirs {
        match builder.open_dir(dir).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) if create => builder.add_dir(dir).await?,
            Err(e) => return Err(e),
        }
        depth += 1;
    }
    Ok(depth)
}

async fn close_dirs(builder: &mut CommitBuilder, depth: usize) -> gitsvn_core::Result<()> {
    for _ in 0..depth {
        builder.close_dir().await?;
    }
    Ok(())
}

async fn put_file(
    builder: &mut CommitBuilder,
    file_path: &str,
    content: &[u8],
    mode: FileMode,
) -> gitsvn_core::Result<()> {
    let Some((parent, name)) = path::split(file_path) else {
        return Err(Error::NotFound(file_path.to_string()));
    };
    let depth = enter_dirs(builder, path::components(&parent).collect(), true).await?;
    let (mut update, modify) = match builder.modify_file(name) {
        Ok(update) => (update, true),
        Err(Error::NotFound(_)) => (builder.create_file(name)?, false),
        Err(e) => return Err(e),
    };
    let properties = update.derive_properties(mode, content);
    update.set_properties(properties);
    update.write_content(content)?;
    builder.save_file(update, modify).await?;
    close_dirs(builder, depth).await
}
