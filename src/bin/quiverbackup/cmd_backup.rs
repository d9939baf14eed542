use anyhow::{Context, Result};
use std::sync::Arc;

use QuiverBackup::backup::Backup;
use QuiverBackup::config::{BackupConfig, CompressKind};
use QuiverBackup::metrics;
use QuiverBackup::source::{DirRegistry, FileLogReader};

use crate::cli::BackupArgs;

/// CLI: backup - env (QB_*) как основа, флаги поверх.
pub fn exec(args: BackupArgs) -> Result<()> {
    let mut cfg = BackupConfig::from_env()?
        .with_target_dir(&args.target)
        .with_incremental_lsn(args.incremental_lsn)
        .with_incremental_basedir(args.incremental_basedir.clone())
        .with_tables(args.tables.clone())
        .with_tables_file(args.tables_file.clone())
        .with_extra_lsndir(args.extra_lsndir.clone());
    if let Some(n) = args.parallel {
        cfg = cfg.with_parallel(n);
    }
    if let Some(kind) = &args.compress {
        cfg = cfg.with_compress(CompressKind::parse(kind)?);
    }
    if args.compress_level.is_some() {
        cfg = cfg.with_compress_level(args.compress_level);
    }
    if args.stream {
        cfg = cfg.with_stream(true, args.stream_out.clone());
    }
    if args.compact {
        cfg = cfg.with_compact(true);
    }
    if let Some(t) = args.throttle {
        cfg = cfg.with_throttle(t);
    }
    if args.suspend_at_end {
        cfg = cfg.with_suspend_at_end(true);
    }
    if let Some(ms) = args.log_copy_interval_ms {
        cfg = cfg.with_log_copy_interval_ms(ms);
    }
    if args.tmpdir.is_some() {
        cfg = cfg.with_tmpdir(args.tmpdir.clone());
    }

    let registry = DirRegistry::open(&args.datadir, args.page_size)
        .with_context(|| format!("open data dir {}", args.datadir.display()))?;
    let log = FileLogReader::open(&args.log_file)?;

    let report = Backup::new(cfg, Box::new(registry), Arc::new(log)).run()?;

    if args.json {
        let out = serde_json::json!({
            "report": report,
            "metrics": metrics::metrics_snapshot(),
        });
        // stdout может быть потоком бэкапа - тогда отчёт в stderr
        if args.stream && args.stream_out.is_none() {
            eprintln!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        return Ok(());
    }

    let m = &report.metadata;
    let text = format!(
        "Backup summary:\n  backup_type   = {}\n  from_lsn      = {}\n  to_lsn        = {}\n  last_lsn      = {}\n  filter        = {}\n  files_copied  = {}\n  files_skipped = {}\n  pages_read    = {}\n  elapsed_ms    = {}",
        m.backup_type,
        m.from_lsn,
        m.to_lsn,
        m.last_lsn,
        report.filter,
        report.files_copied,
        report.files_skipped,
        report.pages_read,
        report.elapsed_ms
    );
    if args.stream && args.stream_out.is_none() {
        eprintln!("{}", text);
    } else {
        println!("{}", text);
    }
    Ok(())
}
