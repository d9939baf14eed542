//! filter/compact - только страницы, которые оставляет классификатор.
//!
//! Системное пространство не компактится (пишется как есть, без карты).
//! Для остальных пишутся все максимальные отрезки сохраняемых страниц, а на
//! finalize через meta-sink - `<dst>.pmap`: пары (first u32 BE, last u32 BE)
//! пропущенных диапазонов страниц, по возрастанию.

use anyhow::{Context, Result};
use std::sync::Arc;

use super::MetaSink;
use crate::consts::PAGE_MAP_SUFFIX;
use crate::datasink::DsFile;
use crate::metrics::record_compact_pages_skipped;
use crate::source::{PageBatch, TablespaceFile};

/// Решает, нужна ли странице копия в компактном бэкапе.
pub trait PageClassifier: Send + Sync {
    fn keep(&self, page_no: u64, page: &[u8]) -> bool;
}

/// Классификатор по умолчанию: сохраняются все страницы.
pub struct KeepAll;

impl PageClassifier for KeepAll {
    fn keep(&self, _page_no: u64, _page: &[u8]) -> bool {
        true
    }
}

pub struct CompactFilter {
    classifier: Arc<dyn PageClassifier>,
    passthrough: bool,
    map_name: String,
    skipped: Vec<(u32, u32)>,
}

impl CompactFilter {
    pub fn new(classifier: Arc<dyn PageClassifier>) -> Self {
        Self {
            classifier,
            passthrough: false,
            map_name: String::new(),
            skipped: Vec::new(),
        }
    }

    pub fn skipped_ranges(&self) -> &[(u32, u32)] {
        &self.skipped
    }

    pub fn init(&mut self, ts: &TablespaceFile, dst_name: &mut String) {
        self.passthrough = ts.is_system();
        self.map_name = format!("{}{}", dst_name, PAGE_MAP_SUFFIX);
    }

    fn note_skipped(&mut self, no: u32) {
        match self.skipped.last_mut() {
            Some((_, last)) if last.wrapping_add(1) == no => *last = no,
            _ => self.skipped.push((no, no)),
        }
    }

    pub fn process(&mut self, batch: &PageBatch<'_>, out: &mut dyn DsFile) -> Result<()> {
        if self.passthrough {
            return out.write(batch.data);
        }
        let ps = batch.page_size;
        let mut run_start: Option<usize> = None;
        let mut skipped = 0usize;
        for i in 0..batch.len() {
            let no = batch.first_page_no + i as u64;
            if self.classifier.keep(no, batch.page(i)) {
                run_start.get_or_insert(i);
                continue;
            }
            if let Some(s) = run_start.take() {
                out.write(&batch.data[s * ps..i * ps])?;
            }
            self.note_skipped(no as u32);
            skipped += 1;
        }
        if let Some(s) = run_start {
            out.write(&batch.data[s * ps..])?;
        }
        if skipped > 0 {
            record_compact_pages_skipped(skipped);
        }
        Ok(())
    }

    pub fn finalize(&mut self, meta: MetaSink<'_>) -> Result<()> {
        if self.passthrough {
            return Ok(());
        }
        let mut map = Vec::with_capacity(self.skipped.len() * 8);
        for (first, last) in &self.skipped {
            map.extend_from_slice(&first.to_be_bytes());
            map.extend_from_slice(&last.to_be_bytes());
        }
        meta.write_file(&self.map_name, &map)
            .with_context(|| format!("write page map {}", self.map_name))
    }
}

/// Разобрать `.pmap` в список пропущенных диапазонов.
pub fn parse_page_map(bytes: &[u8]) -> Vec<(u32, u32)> {
    bytes
        .chunks_exact(8)
        .map(|c| {
            (
                u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                u32::from_be_bytes([c[4], c[5], c[6], c[7]]),
            )
        })
        .collect()
}
