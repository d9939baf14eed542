//! backup - оркестратор горячего бэкапа.
//!
//! Ход запуска:
//! 1) стабильное чтение контрольной точки (checkpoint_lsn_start) и заголовка лога;
//! 2) цепочка datasink'ов: data (с компрессией) и meta (лог, метаданные, sidecar-файлы);
//! 3) синхронный проход по логу, затем фоновый копировщик (LogTailer);
//! 4) P воркеров над общим итератором файлов данных;
//! 5) опционально - ожидание внешнего сигнала (файл xtrabackup_suspended);
//! 6) to_lsn = текущая контрольная точка; остановка копировщика (его ошибка фатальна);
//! 7) xtrabackup_checkpoints в meta (и копия в extra_lsndir);
//! 8) teardown цепочки в обратном порядке построения.
//!
//! Фатальная ошибка любого потока выставляет abort в сессии; метаданные при
//! этом не пишутся, возвращается первая ошибка.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub mod iter;
pub mod metadata;
pub mod session;
pub mod suspend;
pub mod tables;
pub mod worker;

pub use iter::DatafilesIter;
pub use metadata::{BackupMetadata, BackupType};
pub use session::{BackupSession, RunState};
pub use tables::TableFilter;
pub use worker::{copy_datafile, CopyContext, FileOutcome, WorkerStats};

use crate::config::{BackupConfig, IncrementalBase};
use crate::consts::{
    CHECKPOINT_READ_ATTEMPTS, COMPRESS_BUFFER_SIZE, LOG_BACKUP_LABEL, LOG_FILENAME,
    METADATA_FILENAME, SUSPEND_POLL_MS, THROTTLE_PERIOD_MS, TMPDIR_NAME,
};
use crate::datasink::{
    write_whole, BufferSink, CompressSink, DatasinkChain, LocalSink, NodeId, StreamSink,
    TmpfileSink,
};
use crate::errors::consistency_err;
use crate::filter::{FilterMode, KeepAll, PageClassifier};
use crate::redo::{spawn_log_copier, LogTailer};
use crate::source::log_file::set_creator_label;
use crate::source::{Checkpoint, LogReader, TablespaceRegistry};
use crate::throttle::IoThrottle;
use crate::util::local_timestamp;

/// Итог успешного запуска.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub metadata: BackupMetadata,
    pub checkpoint_lsn_start: u64,
    pub filter: &'static str,
    pub files_copied: u64,
    pub files_skipped: u64,
    pub pages_read: u64,
    pub elapsed_ms: u64,
}

/// Цепочка и два её входа: данные и метаданные.
pub struct DatasinkSet {
    pub chain: DatasinkChain,
    pub data: NodeId,
    pub meta: NodeId,
}

/// Построить цепочку по конфигурации.
///
/// local                 : data = meta = local
/// compress              : compress -> buffer -> (stream|local); meta = stream|local
/// stream                : data = meta = stream
/// stream + suspend      : meta = tmpfile -> stream
pub fn init_datasinks(
    cfg: &BackupConfig,
    stream_writer: Option<Box<dyn Write + Send>>,
) -> Result<DatasinkSet> {
    let mut chain = DatasinkChain::new();
    let terminal = if cfg.stream {
        let out: Box<dyn Write + Send> = match (stream_writer, &cfg.stream_out) {
            (Some(w), _) => w,
            (None, Some(path)) => Box::new(BufWriter::new(
                File::create(path)
                    .with_context(|| format!("create stream output {}", path.display()))?,
            )),
            (None, None) => Box::new(BufWriter::new(std::io::stdout())),
        };
        chain.add(Box::new(StreamSink::new(out)?))?
    } else {
        chain.add(Box::new(LocalSink::new(&cfg.target_dir)))?
    };

    let mut data = terminal;
    let mut meta = terminal;
    if let Some(kind) = cfg.compress {
        let buffer = chain.add_piped(Box::new(BufferSink::new(COMPRESS_BUFFER_SIZE)), terminal)?;
        data = chain.add_piped(Box::new(CompressSink::new(kind, cfg.compress_level)), buffer)?;
    }
    if cfg.stream && cfg.suspend_at_end {
        let dir = cfg
            .tmpdir
            .clone()
            .unwrap_or_else(|| cfg.target_dir.join(TMPDIR_NAME));
        meta = chain.add_piped(Box::new(TmpfileSink::new(dir)?), terminal)?;
    }
    debug!(
        "datasinks: data={} (depth {}), meta={} (depth {})",
        chain.name(data),
        chain.depth(data),
        chain.name(meta),
        chain.depth(meta)
    );
    Ok(DatasinkSet { chain, data, meta })
}

/// Контрольная точка и заголовок лога, прочитанные согласованно: номер
/// контрольной точки не изменился между двумя чтениями.
pub fn read_stable_checkpoint(log: &dyn LogReader) -> Result<(Checkpoint, Vec<u8>)> {
    let mut cp = log.read_checkpoint().context("read checkpoint")?;
    for _ in 0..CHECKPOINT_READ_ATTEMPTS {
        let header = log.read_header()?;
        let again = log.read_checkpoint().context("re-read checkpoint")?;
        if again.no == cp.no {
            return Ok((again, header));
        }
        debug!("checkpoint moved: no {} -> {}, re-reading", cp.no, again.no);
        cp = again;
    }
    Err(consistency_err(format!(
        "checkpoint number did not settle after {} reads",
        CHECKPOINT_READ_ATTEMPTS
    )))
}

/// Выбрать фильтр запуска.
fn resolve_filter_mode(
    cfg: &BackupConfig,
    classifier: Arc<dyn PageClassifier>,
) -> Result<FilterMode> {
    let cutoff = match cfg.incremental() {
        Some(IncrementalBase::Lsn(lsn)) => Some(lsn),
        Some(IncrementalBase::Dir(dir)) => {
            let base = BackupMetadata::read_from_dir(&dir)
                .with_context(|| format!("incremental base {}", dir.display()))?;
            info!("incremental base {}: to_lsn {}", dir.display(), base.to_lsn);
            Some(base.to_lsn)
        }
        None => None,
    };
    Ok(match cutoff {
        Some(cutoff_lsn) => FilterMode::Incremental { cutoff_lsn },
        None if cfg.compact => FilterMode::Compact { classifier },
        None => FilterMode::WriteThrough,
    })
}

pub struct Backup {
    cfg: BackupConfig,
    registry: Box<dyn TablespaceRegistry>,
    log: Arc<dyn LogReader>,
    classifier: Arc<dyn PageClassifier>,
    stream_writer: Option<Box<dyn Write + Send>>,
    session: Arc<BackupSession>,
}

impl Backup {
    pub fn new(
        cfg: BackupConfig,
        registry: Box<dyn TablespaceRegistry>,
        log: Arc<dyn LogReader>,
    ) -> Self {
        Self {
            cfg,
            registry,
            log,
            classifier: Arc::new(KeepAll),
            stream_writer: None,
            session: Arc::new(BackupSession::new()),
        }
    }

    /// Классификатор страниц для compact-режима.
    pub fn with_classifier(mut self, classifier: Arc<dyn PageClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Куда писать stream вместо stdout/stream_out.
    pub fn with_stream_writer(mut self, w: Box<dyn Write + Send>) -> Self {
        self.stream_writer = Some(w);
        self
    }

    pub fn session(&self) -> Arc<BackupSession> {
        self.session.clone()
    }

    pub fn run(self) -> Result<BackupReport> {
        let started = Instant::now();
        let Backup {
            cfg,
            registry,
            log,
            classifier,
            stream_writer,
            session,
        } = self;
        let cfg = cfg.validate()?;
        info!("backup: {}", cfg);

        let tables = TableFilter::new(&cfg.tables, cfg.tables_file.as_deref())?;
        let mode = resolve_filter_mode(&cfg, classifier)?;
        if !cfg.stream || cfg.suspend_at_end {
            std::fs::create_dir_all(&cfg.target_dir)
                .with_context(|| format!("create target dir {}", cfg.target_dir.display()))?;
        }

        let (cp, header) = read_stable_checkpoint(log.as_ref())?;
        session.set_checkpoint_lsn_start(cp.lsn);
        session.set_scanned_lsn(cp.lsn);
        info!("checkpoint lsn {} (checkpoint no {})", cp.lsn, cp.no);

        let set = init_datasinks(&cfg, stream_writer)?;
        let run = RunCtx {
            cfg: &cfg,
            set: &set,
            registry: registry.as_ref(),
            log: &log,
            session: &session,
            mode: &mode,
            tables: &tables,
        };
        let res = run.copy(cp, header);

        let teardown = set.chain.teardown().context("datasink teardown");
        session.set_state(RunState::Stopped);
        let (metadata, stats) = res?;
        teardown?;

        let report = BackupReport {
            metadata,
            checkpoint_lsn_start: cp.lsn,
            filter: mode.name(),
            files_copied: stats.files_copied,
            files_skipped: stats.files_skipped,
            pages_read: stats.pages_read,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "backup completed: {} from {} to {} (last {}), {} files in {} ms",
            metadata.backup_type,
            metadata.from_lsn,
            metadata.to_lsn,
            metadata.last_lsn,
            report.files_copied,
            report.elapsed_ms
        );
        Ok(report)
    }
}

/// Полный бэкап/инкремент с параметрами по умолчанию.
pub fn run_backup(
    cfg: BackupConfig,
    registry: Box<dyn TablespaceRegistry>,
    log: Arc<dyn LogReader>,
) -> Result<BackupReport> {
    Backup::new(cfg, registry, log).run()
}

struct RunCtx<'a> {
    cfg: &'a BackupConfig,
    set: &'a DatasinkSet,
    registry: &'a dyn TablespaceRegistry,
    log: &'a Arc<dyn LogReader>,
    session: &'a Arc<BackupSession>,
    mode: &'a FilterMode,
    tables: &'a TableFilter,
}

impl<'a> RunCtx<'a> {
    fn copy(&self, cp: Checkpoint, mut header: Vec<u8>) -> Result<(BackupMetadata, WorkerStats)> {
        let session = self.session;
        let mut log_out = self.set.chain.open(self.set.meta, LOG_FILENAME, 0)?;
        set_creator_label(&mut header, &format!("{}{}", LOG_BACKUP_LABEL, local_timestamp()));
        log_out
            .write(&header)
            .with_context(|| format!("write {} header", LOG_FILENAME))?;

        let throttle = Arc::new(IoThrottle::new(self.cfg.throttle));
        session.start_log_copying();
        session.set_state(RunState::Copying);
        let watcher = self.spawn_throttle_watcher(&throttle)?;

        let mut tailer = LogTailer::new(
            self.log.clone(),
            throttle.clone(),
            self.cfg.log_scan_window,
            cp.lsn,
        )?;
        if let Err(e) = tailer.copy_pass(log_out.as_mut(), cp.lsn, false) {
            let _ = log_out.close();
            session.stop_log_copying();
            join_watcher(watcher);
            return Err(e.context("initial log copy"));
        }
        session.set_scanned_lsn(tailer.scanned_lsn());
        let copier = spawn_log_copier(
            tailer,
            log_out,
            session.clone(),
            Duration::from_millis(self.cfg.log_copy_interval_ms),
        );
        let copier = match copier {
            Ok(h) => h,
            Err(e) => {
                session.stop_log_copying();
                join_watcher(watcher);
                return Err(e);
            }
        };

        let phase = self.copy_data(&throttle);

        session.set_state(RunState::Stopping);
        let (stats, to_lsn) = match phase {
            Ok(v) => v,
            Err(e) => {
                if !session.aborted() {
                    session.fail(e);
                }
                session.stop_log_copying();
                let _ = copier.join();
                join_watcher(watcher);
                return Err(session
                    .take_error()
                    .unwrap_or_else(|| anyhow!("backup aborted")));
            }
        };

        session.stop_log_copying();
        let copied = copier
            .join()
            .map_err(|_| anyhow!("log copying thread panicked"))?;
        join_watcher(watcher);
        let last_lsn = copied.context("log copying failed")?;

        if self.cfg.suspend_at_end {
            suspend::create_suspend_file(&suspend::suspend_path(&self.cfg.target_dir))?;
        }

        let metadata = match self.mode {
            FilterMode::Incremental { cutoff_lsn } => BackupMetadata {
                backup_type: BackupType::Incremental,
                from_lsn: *cutoff_lsn,
                to_lsn,
                last_lsn,
            },
            _ => BackupMetadata {
                backup_type: BackupType::FullBackuped,
                from_lsn: 0,
                to_lsn,
                last_lsn,
            },
        };
        write_whole(
            &self.set.chain,
            self.set.meta,
            METADATA_FILENAME,
            metadata.to_text().as_bytes(),
        )?;
        if let Some(dir) = &self.cfg.extra_lsndir {
            metadata.write_to_dir(dir)?;
        }
        Ok((metadata, stats))
    }

    /// Воркеры, ожидание внешнего сигнала, to_lsn.
    fn copy_data(&self, throttle: &IoThrottle) -> Result<(WorkerStats, u64)> {
        let session = self.session;
        let files = DatafilesIter::new(self.registry.list());
        info!(
            "copying {} data files with {} worker(s), filter {}",
            files.len(),
            self.cfg.parallel,
            self.mode.name()
        );
        let ctx = CopyContext {
            chain: &self.set.chain,
            data: self.set.data,
            meta: self.set.meta,
            registry: self.registry,
            mode: self.mode,
            tables: self.tables,
            throttle,
            session: session.as_ref(),
        };

        let per_worker: Vec<WorkerStats> = std::thread::scope(|s| {
            let mut handles = Vec::with_capacity(self.cfg.parallel);
            for n in 0..self.cfg.parallel {
                let ctx = &ctx;
                let files = &files;
                let spawned = std::thread::Builder::new()
                    .name(format!("data-copy-{}", n))
                    .spawn_scoped(s, move || data_copy_worker(ctx, files, n));
                match spawned {
                    Ok(h) => handles.push(h),
                    Err(e) => {
                        session.fail(anyhow::Error::from(e).context("spawn data copy worker"));
                        break;
                    }
                }
            }
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        session.fail(anyhow!("data copy worker panicked"));
                        WorkerStats::default()
                    })
                })
                .collect()
        });
        if session.aborted() {
            return Err(anyhow!("data copy aborted"));
        }
        let mut stats = WorkerStats::default();
        for w in per_worker {
            stats.files_copied += w.files_copied;
            stats.files_skipped += w.files_skipped;
            stats.pages_read += w.pages_read;
        }

        if self.cfg.suspend_at_end {
            session.set_state(RunState::AwaitExternalSignal);
            let marker = suspend::suspend_path(&self.cfg.target_dir);
            suspend::create_suspend_file(&marker)?;
            suspend::wait_while_exists(&marker, Duration::from_millis(SUSPEND_POLL_MS))?;
        }

        let (cp, _) = read_stable_checkpoint(self.log.as_ref()).context("read final checkpoint")?;
        info!("to_lsn {}", cp.lsn);
        Ok((stats, cp.lsn))
    }

    fn spawn_throttle_watcher(&self, throttle: &Arc<IoThrottle>) -> Result<Option<JoinHandle<()>>> {
        if !throttle.is_enabled() {
            return Ok(None);
        }
        let throttle = throttle.clone();
        let session = self.session.clone();
        let h = std::thread::Builder::new()
            .name("io-throttle".into())
            .spawn(move || {
                throttle.watch(Duration::from_millis(THROTTLE_PERIOD_MS), || {
                    session.log_copying_active()
                })
            })
            .context("spawn io throttle watcher")?;
        Ok(Some(h))
    }
}

fn join_watcher(h: Option<JoinHandle<()>>) {
    if let Some(h) = h {
        if h.join().is_err() {
            warn!("io throttle watcher panicked");
        }
    }
}

fn data_copy_worker(ctx: &CopyContext<'_>, files: &DatafilesIter, n: usize) -> WorkerStats {
    let mut stats = WorkerStats::default();
    while let Some(ts) = files.next_file() {
        if ctx.session.aborted() {
            break;
        }
        match copy_datafile(ctx, n, ts) {
            Ok(outcome) => stats.add(outcome),
            Err(e) => {
                ctx.session.fail(e);
                break;
            }
        }
    }
    debug!("[{:02}] data copy thread finished", n);
    stats
}
