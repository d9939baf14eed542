use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// CLI горячего бэкапа
#[derive(Parser, Debug)]
#[command(name = "quiverbackup", version, about = "Hot physical backup of page files and redo log")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Copy data files and the redo log of a running server into a backup
    Backup(BackupArgs),
    /// Apply an incremental backup on top of a full one
    Prepare {
        /// Full backup directory
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        incremental_dir: PathBuf,
        #[arg(long, default_value_t = 16384)]
        page_size: usize,
        #[arg(long)]
        json: bool,
    },
    /// Print cluster/page counts of a .delta file
    InspectDelta {
        file: PathBuf,
        /// Page size; by default taken from the .meta sidecar
        #[arg(long)]
        page_size: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Unpack a backup stream into a directory
    Extract {
        /// Stream file; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        dest: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Server data directory (ibdata*, <db>/*.ibd)
    #[arg(long)]
    pub datadir: PathBuf,
    /// Server redo log file
    #[arg(long)]
    pub log_file: PathBuf,
    /// Backup target directory
    #[arg(long)]
    pub target: PathBuf,
    #[arg(long, default_value_t = 16384)]
    pub page_size: usize,

    /// Incremental backup: copy only pages with lsn above this one
    #[arg(long)]
    pub incremental_lsn: Option<u64>,
    /// Incremental backup on top of this backup (its to_lsn is the cutoff)
    #[arg(long)]
    pub incremental_basedir: Option<PathBuf>,

    #[arg(long)]
    pub parallel: Option<usize>,
    /// none|zstd|gzip
    #[arg(long)]
    pub compress: Option<String>,
    #[arg(long)]
    pub compress_level: Option<i32>,
    /// Write a single stream (to --stream-out or stdout) instead of a directory
    #[arg(long)]
    pub stream: bool,
    #[arg(long)]
    pub stream_out: Option<PathBuf>,
    #[arg(long)]
    pub compact: bool,
    /// IO operations per second, 0 = off
    #[arg(long)]
    pub throttle: Option<u64>,
    /// Regex over "db.table"; repeatable
    #[arg(long = "tables")]
    pub tables: Vec<String>,
    /// File with "db/table" names, one per line
    #[arg(long)]
    pub tables_file: Option<PathBuf>,
    /// Wait for <target>/xtrabackup_suspended to be removed before finishing
    #[arg(long)]
    pub suspend_at_end: bool,
    #[arg(long)]
    pub extra_lsndir: Option<PathBuf>,
    #[arg(long)]
    pub log_copy_interval_ms: Option<u64>,
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,

    /// Print the report and metrics as JSON
    #[arg(long)]
    pub json: bool,
}
