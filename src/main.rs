use anyhow::Result;
use btrfs_sxbackup::configs::GlobalConfiguration;
use btrfs_sxbackup::entities::LocationUrl;
use btrfs_sxbackup::jobs::Job;
use btrfs_sxbackup::logging::{CliLogger, LogOptions};
use btrfs_sxbackup::mail;
use btrfs_sxbackup::retention::RetentionExpression;
use btrfs_sxbackup::shell::{Shell, SystemShell};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const APP_NAME: &str = "btrfs-sxbackup";

#[derive(Parser)]
#[command(name = APP_NAME, version, about = "Incremental btrfs snapshot backups")]
struct Cli {
    /// Do not log to stdout
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Raise verbosity, repeatable (debug, then trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct RetentionArgs {
    /// Source retention expression, e.g. "1d:4/d, 1w:daily, 2m:none"
    #[arg(long = "source-retention", alias = "sr", value_name = "EXPR")]
    source_retention: Option<String>,

    /// Destination retention expression
    #[arg(long = "destination-retention", alias = "dr", value_name = "EXPR")]
    destination_retention: Option<String>,
}

impl RetentionArgs {
    fn source(&self) -> Result<Option<RetentionExpression>> {
        parse_retention(self.source_retention.as_deref())
    }

    fn destination(&self) -> Result<Option<RetentionExpression>> {
        parse_retention(self.destination_retention.as_deref())
    }
}

fn parse_retention(text: Option<&str>) -> Result<Option<RetentionExpression>> {
    match text {
        Some(text) => Ok(Some(RetentionExpression::from_str(text)?)),
        None => Ok(None),
    }
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a backup job
    Init {
        /// Source subvolume to back up, local path or ssh url
        source_subvolume: String,

        /// Destination container subvolume receiving the backups; omit for
        /// a snapshot rotation job without transfer
        destination_container: Option<String>,

        #[command(flatten)]
        retention: RetentionArgs,

        /// Compress the transferred stream (requires lzop on both sides)
        #[arg(short, long)]
        compress: bool,
    },

    /// Update backup job parameters
    Update {
        /// Source or destination subvolumes, local paths or ssh urls
        #[arg(required = true)]
        subvolumes: Vec<String>,

        #[command(flatten)]
        retention: RetentionArgs,

        /// Enable stream compression
        #[arg(short, long)]
        compress: bool,

        /// Disable stream compression
        #[arg(long = "no-compress", alias = "nc", conflicts_with = "compress")]
        no_compress: bool,
    },

    /// Run backup jobs
    Run {
        /// Source or destination subvolumes, local paths or ssh urls
        #[arg(required = true)]
        subvolumes: Vec<String>,

        /// Mail the accumulated log on failure, optionally overriding the
        /// configured recipient
        #[arg(short, long, num_args = 0..=1, default_missing_value = "", value_name = "EMAIL")]
        mail: Option<String>,

        /// Syslog ident
        #[arg(short = 'l', long = "log-ident", alias = "li", value_name = "IDENT")]
        log_ident: Option<String>,
    },

    /// Show backup job information
    Info {
        #[arg(required = true)]
        subvolumes: Vec<String>,
    },

    /// Apply retention to backup jobs
    Purge {
        #[arg(required = true)]
        subvolumes: Vec<String>,

        #[command(flatten)]
        retention: RetentionArgs,
    },

    /// Destroy backup jobs
    Destroy {
        #[arg(required = true)]
        subvolumes: Vec<String>,

        /// Remove all snapshots in addition to the configuration
        #[arg(long)]
        purge: bool,
    },

    /// One-shot transfer of a subvolume snapshot
    Transfer {
        source_subvolume: String,
        destination_container: String,

        /// Compress the transferred stream
        #[arg(short, long)]
        compress: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let global = match GlobalConfiguration::read() {
        Ok(global) => global,
        Err(e) => {
            eprintln!("could not read global configuration: {}", e);
            GlobalConfiguration::default()
        }
    };

    // the run command may override the syslog ident and buffers records to
    // mail them on failure
    let (log_ident, mail_recipient) = match &cli.command {
        Command::Run {
            mail, log_ident, ..
        } => {
            let recipient = mail.as_ref().and_then(|recipient| match recipient.is_empty() {
                false => Some(recipient.clone()),
                true => global.email_recipient.clone(),
            });

            if mail.is_some() && recipient.is_none() {
                eprintln!("mail notification requested but no recipient configured");
            }

            (log_ident.clone(), recipient)
        }
        _ => (None, None),
    };

    let ident = log_ident
        .or_else(|| global.log_ident.clone())
        .unwrap_or_else(|| APP_NAME.to_string());

    let logger = match CliLogger::init(&LogOptions {
        quiet: cli.quiet,
        verbosity: cli.verbose,
        ident,
        buffered: mail_recipient.is_some(),
    }) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("could not initialize logging: {:#}", e);
            std::process::exit(1);
        }
    };

    log::info!("{} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // A terminal interrupt reaches the pipeline children with the rest of
    // the foreground process group and takes them down non-zero; this
    // process only notes the signal and stays alive, so the supervisor
    // observes the children's exit and the run's recovery path executes
    // before exiting non-zero.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        }) {
            eprintln!("could not install interrupt handler: {}", e);
        }
    }

    let verbose = cli.verbose > 0;
    let mut code = match dispatch(cli.command, &global, verbose, &interrupted) {
        Ok(0) => 0,
        Ok(_) => 1,
        Err(e) => {
            log_error(&e, verbose);
            1
        }
    };

    if interrupted.load(Ordering::SeqCst) {
        log::warn!("interrupted");
        code = 1;
    }

    if code != 0 {
        if let Some(recipient) = &mail_recipient {
            if let Some(content) = logger.buffered() {
                if let Err(e) = mail::send(recipient, &format!("{} FAILED", APP_NAME), &content) {
                    log::error!("could not send notification mail: {:#}", e);
                }
            }
        }
    }

    std::process::exit(code);
}

/// Execute the subcommand, returning the number of failed batch elements.
fn dispatch(
    command: Command,
    global: &GlobalConfiguration,
    verbose: bool,
    interrupted: &AtomicBool,
) -> Result<usize> {
    let shell: Arc<dyn Shell> = Arc::new(SystemShell::default());

    match command {
        Command::Init {
            source_subvolume,
            destination_container,
            retention,
            compress,
        } => {
            let source_url = LocationUrl::parse(&source_subvolume)?;
            let dest_url = destination_container
                .as_deref()
                .map(LocationUrl::parse)
                .transpose()?;

            Job::init(
                shell,
                source_url,
                dest_url,
                retention.source()?,
                retention.destination()?,
                compress,
                global,
            )?;

            Ok(0)
        }

        Command::Transfer {
            source_subvolume,
            destination_container,
            compress,
        } => {
            Job::transfer(
                shell,
                LocationUrl::parse(&source_subvolume)?,
                LocationUrl::parse(&destination_container)?,
                compress,
            )?;

            Ok(0)
        }

        Command::Run { subvolumes, .. } => {
            for_each_job(shell, &subvolumes, verbose, interrupted, |job| {
                job.run()?;
                Ok(())
            })
        }

        Command::Update {
            subvolumes,
            retention,
            compress,
            no_compress,
        } => {
            let source_retention = retention.source()?;
            let dest_retention = retention.destination()?;
            let compress = match (compress, no_compress) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };

            for_each_job(shell, &subvolumes, verbose, interrupted, move |job| {
                job.update(source_retention.clone(), dest_retention.clone(), compress)?;
                Ok(())
            })
        }

        Command::Info { subvolumes } => {
            for_each_job(shell, &subvolumes, verbose, interrupted, |job| {
                job.print_info(&mut std::io::stdout())?;
                Ok(())
            })
        }

        Command::Purge {
            subvolumes,
            retention,
        } => {
            let source_retention = retention.source()?;
            let dest_retention = retention.destination()?;

            for_each_job(shell, &subvolumes, verbose, interrupted, move |job| {
                job.purge(source_retention.as_ref(), dest_retention.as_ref())?;
                Ok(())
            })
        }

        Command::Destroy { subvolumes, purge } => {
            for_each_job(shell, &subvolumes, verbose, interrupted, move |job| {
                job.destroy(purge)?;
                Ok(())
            })
        }
    }
}

/// Load and process each subvolume, continuing past individual failures.
fn for_each_job<F>(
    shell: Arc<dyn Shell>,
    subvolumes: &[String],
    verbose: bool,
    interrupted: &AtomicBool,
    mut action: F,
) -> Result<usize>
where
    F: FnMut(&mut Job) -> Result<()>,
{
    let mut failures = 0;

    for subvolume in subvolumes {
        if interrupted.load(Ordering::SeqCst) {
            log::warn!("interrupt received, skipping remaining jobs");
            break;
        }

        let result = LocationUrl::parse(subvolume)
            .map_err(anyhow::Error::from)
            .and_then(|url| Job::load(shell.clone(), url).map_err(anyhow::Error::from))
            .and_then(|mut job| action(&mut job));

        if let Err(e) = result {
            log_error(&e.context(format!("{} failed", subvolume)), verbose);
            failures += 1;
        }
    }

    Ok(failures)
}

fn log_error(error: &anyhow::Error, verbose: bool) {
    // with -v the full error chain is logged
    match verbose {
        true => log::error!("{:?}", error),
        false => log::error!("{:#}", error),
    }
}
