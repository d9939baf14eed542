//! backup/worker - копирование одного файла данных.
//!
//! PageSource -> PageFilter -> datasink. Любая ошибка фатальна для всего
//! запуска; контекст ошибки содержит номер воркера и имя файла.

use anyhow::{Context, Result};
use log::{debug, info, warn};

use super::session::BackupSession;
use super::tables::TableFilter;
use crate::datasink::{DatasinkChain, NodeId};
use crate::filter::{FilterMode, MetaSink, PageFilter};
use crate::metrics::{record_data_bytes, record_file_copied, record_file_skipped, record_pages_read};
use crate::source::{TablespaceFile, TablespaceRegistry};
use crate::throttle::IoThrottle;

/// Всё, что нужно воркеру; общее для всех воркеров запуска.
pub struct CopyContext<'a> {
    pub chain: &'a DatasinkChain,
    pub data: NodeId,
    pub meta: NodeId,
    pub registry: &'a dyn TablespaceRegistry,
    pub mode: &'a FilterMode,
    pub tables: &'a TableFilter,
    pub throttle: &'a IoThrottle,
    pub session: &'a BackupSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Copied { pages: u64 },
    Skipped,
    Vanished,
    Aborted,
}

/// Статистика воркера за запуск.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub files_copied: u64,
    pub files_skipped: u64,
    pub pages_read: u64,
}

impl WorkerStats {
    pub fn add(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Copied { pages } => {
                self.files_copied += 1;
                self.pages_read += pages;
            }
            FileOutcome::Skipped | FileOutcome::Vanished => self.files_skipped += 1,
            FileOutcome::Aborted => {}
        }
    }
}

pub fn copy_datafile(ctx: &CopyContext<'_>, worker: usize, ts: &TablespaceFile) -> Result<FileOutcome> {
    if ctx.tables.is_skipped(ts) {
        info!("[{:02}] Skipping {}", worker, ts.name);
        record_file_skipped();
        return Ok(FileOutcome::Skipped);
    }

    let mut src = match ctx
        .registry
        .open_pages(ts)
        .with_context(|| format!("[{:02}] open {}", worker, ts.path.display()))?
    {
        Some(s) => s,
        None => {
            warn!(
                "[{:02}] {} disappeared, assume the table was dropped",
                worker, ts.name
            );
            record_file_skipped();
            return Ok(FileOutcome::Vanished);
        }
    };

    let meta = MetaSink {
        chain: ctx.chain,
        node: ctx.meta,
    };
    let mut filter = PageFilter::new(ctx.mode);
    let mut dst_name = ts.name.clone();
    filter
        .init(ts, &mut dst_name, meta)
        .with_context(|| format!("[{:02}] init {} filter for {}", worker, ctx.mode.name(), ts.name))?;

    let size_hint = std::fs::metadata(&ts.path).map(|m| m.len()).unwrap_or(0);
    let mut out = match ctx.chain.open(ctx.data, &dst_name, size_hint) {
        Ok(f) => f,
        Err(e) => {
            filter.deinit();
            return Err(e.context(format!("[{:02}] open destination {}", worker, dst_name)));
        }
    };
    if dst_name != ts.name {
        info!("[{:02}] Copying {} to {}", worker, ts.name, dst_name);
    } else {
        info!("[{:02}] Copying {}", worker, ts.name);
    }

    let mut pages = 0u64;
    let res = (|| -> Result<bool> {
        loop {
            if ctx.session.aborted() {
                return Ok(false);
            }
            ctx.throttle.acquire();
            let batch = match src.read_batch()? {
                Some(b) => b,
                None => break,
            };
            record_pages_read(batch.len());
            record_data_bytes(batch.data.len());
            pages += batch.len() as u64;
            filter.process(&batch, out.as_mut())?;
        }
        filter.finalize(out.as_mut(), meta)?;
        Ok(true)
    })();
    filter.deinit();

    match res {
        Ok(true) => {
            out.close()
                .with_context(|| format!("[{:02}] close {}", worker, dst_name))?;
            info!("[{:02}]        ...done", worker);
            record_file_copied();
            Ok(FileOutcome::Copied { pages })
        }
        Ok(false) => {
            debug!("[{:02}] abort requested, leaving {}", worker, ts.name);
            drop(out);
            Ok(FileOutcome::Aborted)
        }
        Err(e) => {
            let _ = out.close();
            Err(e.context(format!("[{:02}] copy {}", worker, ts.path.display())))
        }
    }
}
