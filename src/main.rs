use clap::{Args, Parser, Subcommand};
use nandroid::engine::bu::BuRequest;
use nandroid::engine::command::SystemSpawner;
use nandroid::engine::config::NandroidConfig;
use nandroid::engine::format::BackupFormat;
use nandroid::engine::pipeline::{Nandroid, RestoreFlags};
use nandroid::engine::result_error::result::Result;
use nandroid::engine::ui::TracingUi;
use nandroid::engine::volume::CommandVolumes;
use std::path::PathBuf;
use std::process::exit;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Back up and restore device partitions
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up every partition
    Backup {
        /// Backup directory, named after the current time when omitted
        path: Option<PathBuf>,
        /// Archive format for this run: tar, tgz or dup
        #[arg(short, long)]
        format: Option<BackupFormat>,
    },
    /// Restore a backup directory
    Restore {
        path: PathBuf,
        #[command(flatten)]
        skip: SkipFlags,
    },
    /// Write one partition to standard output
    Dump { partition: String },
    /// Read one partition from standard input
    Undump { partition: String },
    /// adb backup transport: `bu <fd> backup <partition>` or `bu <fd> restore`
    Bu {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct SkipFlags {
    #[arg(long)]
    skip_boot: bool,
    #[arg(long)]
    skip_system: bool,
    #[arg(long)]
    skip_data: bool,
    #[arg(long)]
    skip_cache: bool,
    #[arg(long)]
    skip_sd_ext: bool,
    /// Restore the WiMAX image too
    #[arg(long)]
    wimax: bool,
}

impl From<SkipFlags> for RestoreFlags {
    fn from(skip: SkipFlags) -> Self {
        RestoreFlags {
            boot: !skip.skip_boot,
            system: !skip.skip_system,
            data: !skip.skip_data,
            cache: !skip.skip_cache,
            sd_ext: !skip.skip_sd_ext,
            wimax: skip.wimax,
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = NandroidConfig::load(&cli.config)?;
    let volumes = CommandVolumes::new(config.clone(), SystemSpawner);
    let mut nandroid = Nandroid::new(config, volumes, TracingUi::default(), SystemSpawner);
    match cli.command {
        Command::Backup { path, format } => {
            let path = path
                .unwrap_or_else(|| nandroid.config().timestamped_backup_path(chrono::Local::now()));
            nandroid.backup(&path, format)
        }
        Command::Restore { path, skip } => nandroid.restore(&path, skip.into()),
        Command::Dump { partition } => nandroid.dump(&partition),
        Command::Undump { partition } => nandroid.undump(&partition),
        Command::Bu { args } => BuRequest::parse(&args).and_then(|request| nandroid.bu(&request)),
    }
}

fn main() {
    // stdout carries dump streams
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{e}");
        exit(match e.status() {
            0 => 1,
            status => status,
        });
    }
}
