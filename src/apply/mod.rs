//! apply - перенос delta-файлов инкремента в полный бэкап (prepare).
//!
//! Каталог инкремента: delta системного пространства лежат в корне,
//! delta отдельных таблиц - в подкаталогах баз. Для каждого `*.delta`:
//! `.meta` рядом, выбор файла назначения (resolve.rs), затем кластеры по
//! порядку, страница `page_no` пишется по смещению `page_no * page_size`.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

pub mod resolve;

pub use resolve::{aside_name, resolve_destination, Destination, Resolution};

use crate::backup::{BackupMetadata, BackupType};
use crate::consts::DELTA_SUFFIX;
use crate::delta::{meta_path_for_delta, DeltaMetadata, DeltaReader};
use crate::errors::consistency_err;
use crate::metrics::record_delta_applied;
use crate::page::page_space_id;
use crate::source::{DirRegistry, TablespaceRegistry};
use crate::util::write_at;

#[derive(Debug, Clone, Serialize)]
pub struct DeltaApplied {
    /// Имя файла назначения ("db/t.ibd").
    pub name: String,
    pub pages: u64,
    pub clusters: u64,
    pub resolution: Resolution,
    pub moved_aside: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub deltas: Vec<DeltaApplied>,
}

impl ApplyReport {
    pub fn pages(&self) -> u64 {
        self.deltas.iter().map(|d| d.pages).sum()
    }
}

/// Применить один delta-файл. `name` - логическое имя назначения.
pub fn apply_delta(
    registry: &mut dyn TablespaceRegistry,
    delta_path: &Path,
    name: &str,
) -> Result<DeltaApplied> {
    let meta_path = meta_path_for_delta(delta_path);
    let info = DeltaMetadata::read(&meta_path)?;
    if info.space_id.is_none() {
        warn!(
            "apply: {} has no space_id, matching {} by name",
            meta_path.display(),
            name
        );
    }
    let ps = info.physical_page_size();

    let src = File::open(delta_path)
        .with_context(|| format!("open delta {}", delta_path.display()))?;
    let mut reader = DeltaReader::new(BufReader::new(src), ps)?;

    // первый кластер читается до выбора назначения: id первой страницы нужен,
    // если в .meta его нет
    let mut pages = Vec::new();
    let mut hdr = reader
        .next_cluster_into(&mut pages)
        .with_context(|| format!("read {}", delta_path.display()))?;
    let first_page_space = match &hdr {
        Some(h) if !h.page_nos.is_empty() => Some(page_space_id(&pages[..ps])),
        _ => None,
    };

    let dst = resolve_destination(registry, name, info.space_id, first_page_space, info.zip_size)?;
    info!(
        "apply: {} -> {}",
        delta_path.display(),
        dst.ts.path.display()
    );
    let mut out = OpenOptions::new()
        .write(true)
        .open(&dst.ts.path)
        .with_context(|| format!("open {} for apply", dst.ts.path.display()))?;

    let mut applied = 0u64;
    while let Some(h) = hdr {
        for (i, no) in h.page_nos.iter().enumerate() {
            let page = &pages[i * ps..(i + 1) * ps];
            write_at(&mut out, *no as u64 * ps as u64, page).with_context(|| {
                format!("write page {} to {}", no, dst.ts.path.display())
            })?;
            applied += 1;
        }
        hdr = reader
            .next_cluster_into(&mut pages)
            .with_context(|| format!("read {}", delta_path.display()))?;
    }
    out.sync_all()
        .with_context(|| format!("sync {}", dst.ts.path.display()))?;
    record_delta_applied(applied);

    Ok(DeltaApplied {
        name: name.to_string(),
        pages: applied,
        clusters: reader.clusters_read(),
        resolution: dst.resolution,
        moved_aside: dst.moved_aside,
    })
}

fn delta_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let fname = entry.file_name().to_string_lossy().to_string();
        if fname.len() > DELTA_SUFFIX.len() && fname.ends_with(DELTA_SUFFIX) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Все delta из `incremental_dir`: сначала корень, затем подкаталоги баз.
pub fn apply_deltas(incremental_dir: &Path, registry: &mut dyn TablespaceRegistry) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();

    for path in delta_files_in(incremental_dir)? {
        let name = logical_name(&path, None);
        report.deltas.push(apply_delta(registry, &path, &name)?);
    }

    let mut dbs = Vec::new();
    for entry in fs::read_dir(incremental_dir)
        .with_context(|| format!("read dir {}", incremental_dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dbs.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    dbs.sort();
    for db in dbs {
        for path in delta_files_in(&incremental_dir.join(&db))? {
            let name = logical_name(&path, Some(&db));
            report.deltas.push(apply_delta(registry, &path, &name)?);
        }
    }

    info!(
        "apply: {} delta files, {} pages",
        report.deltas.len(),
        report.pages()
    );
    Ok(report)
}

/// `<inc>/db/t.ibd.delta` -> "db/t.ibd"
fn logical_name(delta_path: &Path, db: Option<&str>) -> String {
    let fname = delta_path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_default();
    let base = fname.strip_suffix(DELTA_SUFFIX).unwrap_or(&fname).to_string();
    match db {
        Some(db) => format!("{}/{}", db, base),
        None => base,
    }
}

/// Итог prepare.
#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub metadata: BackupMetadata,
    pub apply: ApplyReport,
}

/// Наложить инкремент на полный бэкап в `target`.
///
/// Требования: target - full-backuped/full-prepared, инкремент - incremental,
/// `target.to_lsn == inc.from_lsn`. После применения to_lsn/last_lsn target
/// сдвигаются к значениям инкремента.
pub fn prepare_incremental(target: &Path, incremental_dir: &Path, page_size: usize) -> Result<PrepareReport> {
    let base = BackupMetadata::read_from_dir(target)?;
    let inc = BackupMetadata::read_from_dir(incremental_dir)?;
    if base.backup_type == BackupType::Incremental {
        return Err(consistency_err(format!(
            "{} is an incremental backup, expected a full one",
            target.display()
        )));
    }
    if inc.backup_type != BackupType::Incremental {
        return Err(consistency_err(format!(
            "{} is not an incremental backup ({})",
            incremental_dir.display(),
            inc.backup_type
        )));
    }
    if base.to_lsn != inc.from_lsn {
        return Err(consistency_err(format!(
            "incremental starts at lsn {} but the full backup ends at {}",
            inc.from_lsn, base.to_lsn
        )));
    }

    let mut registry = DirRegistry::open(target, page_size)?;
    let apply = apply_deltas(incremental_dir, &mut registry)?;

    let metadata = BackupMetadata {
        to_lsn: inc.to_lsn,
        last_lsn: inc.last_lsn,
        ..base
    };
    metadata.write_to_dir(target)?;
    info!(
        "prepare: {} advanced to lsn {} ({} pages applied)",
        target.display(),
        metadata.to_lsn,
        apply.pages()
    );
    Ok(PrepareReport { metadata, apply })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_names() {
        assert_eq!(
            logical_name(Path::new("/inc/shop/t.ibd.delta"), Some("shop")),
            "shop/t.ibd"
        );
        assert_eq!(logical_name(Path::new("/inc/ibdata1.delta"), None), "ibdata1");
    }
}
