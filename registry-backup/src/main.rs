//! Command line tool: back up, restore, verify and unlock registry namespaces.

use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use eyre::WrapErr;

use registry_backup::backup::{Backup, BackupOptions};
use registry_backup::config::{Config, DEFAULT_CONFIG_PATH};
use registry_backup::restore::{Restore, RestoreOptions};
use registry_backup::unlock::unlock;
use registry_backup::verify::Verify;

mod cli;

use cli::logging::{self, LogArgs};
use cli::output::{self, Output};

/// Backs up and restores image storage for a registry namespace.
#[derive(Debug, Parser)]
#[command(name = "registry-backup", version)]
struct Cli {
    /// Name of the bucket where backups are stored [default: quaybackup]
    #[arg(long, global = true)]
    bucket_name: Option<String>,

    /// Configuration file
    #[arg(long, global = true, env = "REGISTRY_BACKUP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: Utf8PathBuf,

    #[command(flatten)]
    logging: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct TransferArgs {
    /// Transfer and write blobs even if they already exist at the destination
    #[arg(long)]
    force_blobs: bool,

    /// Number of workers to operate in parallel [default: 5]
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    num_workers: Option<u64>,

    /// Hash blobs while copying and reject copies that do not match their digest
    #[arg(long)]
    verify_digests: bool,
}

impl TransferArgs {
    fn workers(&self, config: &Config) -> usize {
        self.num_workers
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(config.workers)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Back up the blobs of a namespace
    Backup {
        /// Namespace to back up
        namespace: String,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Restore the blobs of a namespace from a backup
    Restore {
        /// Namespace to restore
        namespace: String,

        /// List what would be restored without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Restore a single repository [default: all repositories]
        #[arg(long)]
        repository: Option<String>,

        /// Backup number to restore [default: latest]
        #[arg(long = "from")]
        from: Option<u64>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Verify a backup against the current registry contents
    Verify {
        /// Namespace to verify
        namespace: String,

        /// Backup number to verify [default: latest]
        #[arg(long = "from")]
        from: Option<u64>,
    },

    /// Remove the backup lock of a namespace.
    ///
    /// Removing a lock while a backup is running can corrupt the inventory.
    Unlock {
        /// Namespace to unlock
        namespace: String,
    },
}

impl Command {
    fn operation(&self) -> &'static str {
        match self {
            Command::Backup { .. } => "Backup",
            Command::Restore { .. } => "Restore",
            Command::Verify { .. } => "Verify",
            Command::Unlock { .. } => "Unlock",
        }
    }
}

async fn run(cli: &Cli) -> eyre::Result<Output> {
    let config = Config::from_file(&cli.config)?;
    let (registry, backups) = config
        .buckets(cli.bucket_name.as_deref())
        .wrap_err("opening storage")?;

    match &cli.command {
        Command::Backup {
            namespace,
            transfer,
        } => {
            let catalog = Arc::new(config.catalog().await?);
            let options = BackupOptions {
                workers: transfer.workers(&config),
                force_blobs: transfer.force_blobs,
                verify_digests: transfer.verify_digests,
            };
            let outcome = Backup::new(catalog, registry, backups, options)
                .run(namespace)
                .await?;
            Ok(output::backup(&outcome))
        }
        Command::Restore {
            namespace,
            dry_run,
            repository,
            from,
            transfer,
        } => {
            let options = RestoreOptions {
                workers: transfer.workers(&config),
                force_blobs: transfer.force_blobs,
                dry_run: *dry_run,
                verify_digests: transfer.verify_digests,
                repository: repository.clone(),
                from: *from,
            };
            let outcome = Restore::new(registry, backups, options).run(namespace).await?;
            Ok(output::restore(&outcome))
        }
        Command::Verify { namespace, from } => {
            let report = Verify::new(registry, backups).run(namespace, *from).await?;
            Ok(output::verify(&report))
        }
        Command::Unlock { namespace } => {
            let report = unlock(&backups, namespace).await?;
            Ok(output::unlock(&report))
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(&cli.logging)?;

    let operation = cli.command.operation();
    let output = match run(&cli).await {
        Ok(output) => output,
        Err(error) => {
            tracing::error!("{operation} failed: {error:#}");
            output::failure(operation, &error)
        }
    };

    output.print()?;
    Ok(output.exit_code())
}
