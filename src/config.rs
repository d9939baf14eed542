//! Centralized configuration for a backup run.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - `BackupConfig::from_env()` reads `QB_*` variables; the CLI then overrides
//!   individual fields through the fluent `with_*` setters.
//! - `validate()` rejects option combinations that cannot run together
//!   (ConfigError), before any file is touched.
//!
//! Env:
//! - QB_PARALLEL              - data copy workers (default 1)
//! - QB_THROTTLE              - IO operations per second, 0 = off (default 0)
//! - QB_COMPRESS              - none|zstd|gzip (default none)
//! - QB_COMPRESS_LEVEL        - codec level (default 3 for zstd, 6 for gzip)
//! - QB_STREAM                - 0|1, write a single chunked stream instead of a directory
//! - QB_COMPACT               - 0|1, compact mode (omit pages rejected by the classifier)
//! - QB_LOG_COPY_INTERVAL_MS  - full log pass period in the background copier (default 1000)
//! - QB_LOG_SCAN_WINDOW       - bytes per log read, multiple of 512 (default 64 KiB)
//! - QB_TMPDIR                - directory for temp-file relay (default <target>/.qbtmp)
//! - QB_SUSPEND_AT_END        - 0|1, external suspend-file protocol

use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;

use crate::consts::{
    LOG_BLOCK_SIZE, LOG_COPY_INTERVAL_MS_DEFAULT, LOG_SCAN_WINDOW_DEFAULT, METADATA_FILENAME,
};
use crate::errors::config_err;

/// Codec of the compress datasink node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressKind {
    Zstd,
    Gzip,
}

impl CompressKind {
    pub fn parse(s: &str) -> Result<Option<Self>> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "0" | "off" => Ok(None),
            "zstd" | "1" | "on" => Ok(Some(CompressKind::Zstd)),
            "gzip" | "gz" => Ok(Some(CompressKind::Gzip)),
            other => Err(config_err(format!(
                "invalid compress kind '{}' (supported: none|zstd|gzip)",
                other
            ))),
        }
    }

    pub fn default_level(self) -> i32 {
        match self {
            CompressKind::Zstd => 3,
            CompressKind::Gzip => 6,
        }
    }
}

impl fmt::Display for CompressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressKind::Zstd => write!(f, "zstd"),
            CompressKind::Gzip => write!(f, "gzip"),
        }
    }
}

/// Where the incremental cutoff LSN comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncrementalBase {
    Lsn(u64),
    /// Base backup directory; cutoff = its `to_lsn`.
    Dir(PathBuf),
}

/// Top-level configuration of a backup run.
#[derive(Clone, Debug)]
pub struct BackupConfig {
    /// Backup target directory (also holds the suspend marker when streaming).
    pub target_dir: PathBuf,

    /// Incremental cutoff: an explicit LSN or a base backup dir, never both.
    /// Neither set = full backup; see `incremental()`.
    pub incremental_lsn: Option<u64>,
    pub incremental_basedir: Option<PathBuf>,

    /// Number of parallel data copy workers.
    pub parallel: usize,

    /// Compression of data files (metadata and log are never compressed).
    pub compress: Option<CompressKind>,
    pub compress_level: Option<i32>,

    /// Stream output; None = stdout when `stream` is set.
    pub stream: bool,
    pub stream_out: Option<PathBuf>,

    /// Compact mode.
    pub compact: bool,

    /// IO throttle in operations per second; 0 = disabled.
    pub throttle: u64,

    /// Regexes matched against "db.table".
    pub tables: Vec<String>,
    /// File with exact "db/table" names, one per line.
    pub tables_file: Option<PathBuf>,

    /// External suspend-file protocol.
    pub suspend_at_end: bool,

    /// Extra directory that receives a plain copy of the metadata file.
    pub extra_lsndir: Option<PathBuf>,

    /// Background copier full-pass period, ms.
    pub log_copy_interval_ms: u64,
    /// Log read window, bytes.
    pub log_scan_window: usize,

    /// Temp-file relay directory.
    pub tmpdir: Option<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            target_dir: PathBuf::from("./backup"),
            incremental_lsn: None,
            incremental_basedir: None,
            parallel: 1,
            compress: None,
            compress_level: None,
            stream: false,
            stream_out: None,
            compact: false,
            throttle: 0,
            tables: Vec::new(),
            tables_file: None,
            suspend_at_end: false,
            extra_lsndir: None,
            log_copy_interval_ms: LOG_COPY_INTERVAL_MS_DEFAULT,
            log_scan_window: LOG_SCAN_WINDOW_DEFAULT,
            tmpdir: None,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "yes" || s == "on"
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
}

impl BackupConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<usize>("QB_PARALLEL") {
            cfg.parallel = n;
        }
        if let Some(n) = env_parse::<u64>("QB_THROTTLE") {
            cfg.throttle = n;
        }
        if let Ok(v) = std::env::var("QB_COMPRESS") {
            cfg.compress = CompressKind::parse(&v).context("QB_COMPRESS")?;
        }
        if let Some(n) = env_parse::<i32>("QB_COMPRESS_LEVEL") {
            cfg.compress_level = Some(n);
        }
        if let Some(on) = env_flag("QB_STREAM") {
            cfg.stream = on;
        }
        if let Some(on) = env_flag("QB_COMPACT") {
            cfg.compact = on;
        }
        if let Some(n) = env_parse::<u64>("QB_LOG_COPY_INTERVAL_MS") {
            cfg.log_copy_interval_ms = n;
        }
        if let Some(n) = env_parse::<usize>("QB_LOG_SCAN_WINDOW") {
            cfg.log_scan_window = n;
        }
        if let Ok(v) = std::env::var("QB_TMPDIR") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.tmpdir = Some(PathBuf::from(s));
            }
        }
        if let Some(on) = env_flag("QB_SUSPEND_AT_END") {
            cfg.suspend_at_end = on;
        }

        Ok(cfg)
    }

    pub fn with_target_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.target_dir = dir.into();
        self
    }

    pub fn with_incremental_lsn(mut self, lsn: Option<u64>) -> Self {
        self.incremental_lsn = lsn;
        self
    }

    pub fn with_incremental_basedir<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.incremental_basedir = dir.map(Into::into);
        self
    }

    pub fn with_parallel(mut self, n: usize) -> Self {
        self.parallel = n;
        self
    }

    pub fn with_compress(mut self, kind: Option<CompressKind>) -> Self {
        self.compress = kind;
        self
    }

    pub fn with_compress_level(mut self, level: Option<i32>) -> Self {
        self.compress_level = level;
        self
    }

    pub fn with_stream(mut self, on: bool, out: Option<PathBuf>) -> Self {
        self.stream = on;
        self.stream_out = out;
        self
    }

    pub fn with_compact(mut self, on: bool) -> Self {
        self.compact = on;
        self
    }

    pub fn with_throttle(mut self, ops_per_sec: u64) -> Self {
        self.throttle = ops_per_sec;
        self
    }

    pub fn with_tables(mut self, patterns: Vec<String>) -> Self {
        self.tables = patterns;
        self
    }

    pub fn with_tables_file<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
        self.tables_file = path.map(Into::into);
        self
    }

    pub fn with_suspend_at_end(mut self, on: bool) -> Self {
        self.suspend_at_end = on;
        self
    }

    pub fn with_extra_lsndir<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.extra_lsndir = dir.map(Into::into);
        self
    }

    pub fn with_log_copy_interval_ms(mut self, ms: u64) -> Self {
        self.log_copy_interval_ms = ms;
        self
    }

    pub fn with_log_scan_window(mut self, bytes: usize) -> Self {
        self.log_scan_window = bytes;
        self
    }

    pub fn with_tmpdir<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.tmpdir = dir.map(Into::into);
        self
    }

    /// Check option combinations.
    pub fn validate(self) -> Result<Self> {
        if self.incremental_lsn.is_some() && self.incremental_basedir.is_some() {
            return Err(config_err(
                "incremental LSN and incremental base dir are mutually exclusive",
            ));
        }
        if self.is_incremental() && self.compact {
            return Err(config_err(
                "incremental and compact backups are mutually exclusive",
            ));
        }
        if self.parallel == 0 {
            return Err(config_err("parallel must be >= 1"));
        }
        if self.log_scan_window == 0 || self.log_scan_window % LOG_BLOCK_SIZE != 0 {
            return Err(config_err(format!(
                "log scan window {} is not a positive multiple of {}",
                self.log_scan_window, LOG_BLOCK_SIZE
            )));
        }
        if self.log_copy_interval_ms == 0 {
            return Err(config_err("log copy interval must be > 0"));
        }
        Ok(self)
    }

    /// Incremental base derived from `incremental_lsn` / `incremental_basedir`.
    /// An explicit LSN wins; validate() rejects having both.
    pub fn incremental(&self) -> Option<IncrementalBase> {
        match (self.incremental_lsn, &self.incremental_basedir) {
            (Some(lsn), _) => Some(IncrementalBase::Lsn(lsn)),
            (None, Some(dir)) => Some(IncrementalBase::Dir(dir.clone())),
            (None, None) => None,
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental_lsn.is_some() || self.incremental_basedir.is_some()
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.target_dir.join(METADATA_FILENAME)
    }
}

impl fmt::Display for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackupConfig {{ \
             target_dir: {}, \
             incremental: {}, \
             parallel: {}, \
             compress: {}, \
             stream: {}, \
             compact: {}, \
             throttle: {}, \
             tables: {}, \
             suspend_at_end: {} \
             }}",
            self.target_dir.display(),
            match self.incremental() {
                Some(IncrementalBase::Lsn(l)) => format!("lsn({})", l),
                Some(IncrementalBase::Dir(d)) => format!("basedir({})", d.display()),
                None => "off".to_string(),
            },
            self.parallel,
            self.compress
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string()),
            self.stream,
            self.compact,
            self.throttle,
            self.tables.len(),
            self.suspend_at_end,
        )
    }
}
