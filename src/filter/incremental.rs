//! filter/incremental - только страницы, изменённые после cutoff LSN.
//!
//! init: sidecar `<dst>.meta` через meta-sink, выходное имя получает `.delta`.
//! process: страницы с lsn > cutoff копятся в кластер; полный кластер уходит
//! с тегом "xtra", когда приходит следующая изменённая страница.
//! finalize: текущий кластер (возможно пустой) уходит с тегом "XTRA".

use anyhow::{anyhow, Context, Result};

use super::MetaSink;
use crate::consts::{DELTA_META_SUFFIX, DELTA_SUFFIX};
use crate::datasink::DsFile;
use crate::delta::{ClusterWriter, DeltaMetadata};
use crate::metrics::record_delta_page_emitted;
use crate::page::page_lsn;
use crate::source::{PageBatch, TablespaceFile};

pub struct IncrementalFilter {
    cutoff_lsn: u64,
    cluster: Option<ClusterWriter>,
    emitted: u64,
}

impl IncrementalFilter {
    pub fn new(cutoff_lsn: u64) -> Self {
        Self {
            cutoff_lsn,
            cluster: None,
            emitted: 0,
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn init(&mut self, ts: &TablespaceFile, dst_name: &mut String, meta: MetaSink<'_>) -> Result<()> {
        self.cluster = Some(ClusterWriter::new(ts.physical_page_size())?);
        let info = DeltaMetadata {
            page_size: ts.page_size,
            zip_size: ts.zip_size,
            space_id: Some(ts.space_id),
        };
        let meta_name = format!("{}{}", dst_name, DELTA_META_SUFFIX);
        meta.write_file(&meta_name, info.to_text().as_bytes())
            .with_context(|| format!("write delta metadata {}", meta_name))?;
        dst_name.push_str(DELTA_SUFFIX);
        Ok(())
    }

    fn cluster(&mut self) -> Result<&mut ClusterWriter> {
        self.cluster
            .as_mut()
            .ok_or_else(|| anyhow!("incremental filter used before init"))
    }

    pub fn process(&mut self, batch: &PageBatch<'_>, out: &mut dyn DsFile) -> Result<()> {
        let cutoff = self.cutoff_lsn;
        let mut emitted = 0;
        let cluster = self.cluster()?;
        for (no, page) in batch.pages() {
            if page_lsn(page) <= cutoff {
                continue;
            }
            if cluster.is_full() {
                out.write(cluster.seal(false))?;
                cluster.reset();
            }
            cluster.push(no as u32, page)?;
            emitted += 1;
            record_delta_page_emitted();
        }
        self.emitted += emitted;
        Ok(())
    }

    pub fn finalize(&mut self, out: &mut dyn DsFile) -> Result<()> {
        let cluster = self.cluster()?;
        out.write(cluster.seal(true))?;
        cluster.reset();
        Ok(())
    }

    pub fn deinit(&mut self) {
        self.cluster = None;
    }
}
