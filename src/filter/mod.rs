//! filter - политика записи страниц файла (write filter).
//!
//! Один вариант на весь запуск:
//! - write_through.rs - страницы как есть;
//! - incremental.rs   - только страницы с lsn > cutoff, в формате delta;
//! - compact.rs       - только страницы, которые оставляет классификатор, + карта пропусков.
//!
//! Каждый вариант владеет только своим состоянием. PageFilter ведёт автомат
//! Init -> Processing -> Finalizing -> Done и не даёт вызвать шаги не по порядку.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::datasink::{write_whole, DatasinkChain, DsFile, NodeId};
use crate::source::{PageBatch, TablespaceFile};

pub mod compact;
pub mod incremental;
pub mod write_through;

pub use compact::{CompactFilter, KeepAll, PageClassifier};
pub use incremental::IncrementalFilter;
pub use write_through::WriteThrough;

/// Выбор варианта для запуска.
#[derive(Clone)]
pub enum FilterMode {
    WriteThrough,
    Incremental { cutoff_lsn: u64 },
    Compact { classifier: Arc<dyn PageClassifier> },
}

impl FilterMode {
    pub fn name(&self) -> &'static str {
        match self {
            FilterMode::WriteThrough => "write-through",
            FilterMode::Incremental { .. } => "incremental",
            FilterMode::Compact { .. } => "compact",
        }
    }
}

/// Куда фильтры пишут sidecar-файлы (.meta, .pmap).
#[derive(Clone, Copy)]
pub struct MetaSink<'a> {
    pub chain: &'a DatasinkChain,
    pub node: NodeId,
}

impl<'a> MetaSink<'a> {
    pub fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        write_whole(self.chain, self.node, path, bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Init,
    Processing,
    Finalizing,
    Done,
}

enum Variant {
    WriteThrough(WriteThrough),
    Incremental(IncrementalFilter),
    Compact(CompactFilter),
}

pub struct PageFilter {
    state: FilterState,
    variant: Variant,
}

impl PageFilter {
    pub fn new(mode: &FilterMode) -> Self {
        let variant = match mode {
            FilterMode::WriteThrough => Variant::WriteThrough(WriteThrough),
            FilterMode::Incremental { cutoff_lsn } => {
                Variant::Incremental(IncrementalFilter::new(*cutoff_lsn))
            }
            FilterMode::Compact { classifier } => {
                Variant::Compact(CompactFilter::new(classifier.clone()))
            }
        };
        Self {
            state: FilterState::Init,
            variant,
        }
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    fn expect(&self, allowed: &[FilterState], op: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(anyhow!("write filter: {} in state {:?}", op, self.state))
        }
    }

    /// Подготовка; может поменять имя выходного файла (`dst_name`).
    pub fn init(&mut self, ts: &TablespaceFile, dst_name: &mut String, meta: MetaSink<'_>) -> Result<()> {
        self.expect(&[FilterState::Init], "init")?;
        match &mut self.variant {
            Variant::WriteThrough(_) => {}
            Variant::Incremental(f) => f.init(ts, dst_name, meta)?,
            Variant::Compact(f) => f.init(ts, dst_name),
        }
        self.state = FilterState::Processing;
        Ok(())
    }

    pub fn process(&mut self, batch: &PageBatch<'_>, out: &mut dyn DsFile) -> Result<()> {
        self.expect(&[FilterState::Processing], "process")?;
        match &mut self.variant {
            Variant::WriteThrough(f) => f.process(batch, out),
            Variant::Incremental(f) => f.process(batch, out),
            Variant::Compact(f) => f.process(batch, out),
        }
    }

    pub fn finalize(&mut self, out: &mut dyn DsFile, meta: MetaSink<'_>) -> Result<()> {
        self.expect(&[FilterState::Processing], "finalize")?;
        self.state = FilterState::Finalizing;
        match &mut self.variant {
            Variant::WriteThrough(_) => Ok(()),
            Variant::Incremental(f) => f.finalize(out),
            Variant::Compact(f) => f.finalize(meta),
        }
    }

    /// Освободить ресурсы варианта; допустимо из любого состояния.
    pub fn deinit(&mut self) {
        if let Variant::Incremental(f) = &mut self.variant {
            f.deinit();
        }
        self.state = FilterState::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasink::LocalSink;
    use std::path::PathBuf;

    #[test]
    fn out_of_order_calls_rejected() -> Result<()> {
        let root = std::env::temp_dir().join(format!(
            "qbtest-filter-order-{}-{}",
            std::process::id(),
            crate::util::now_secs()
        ));
        let mut chain = DatasinkChain::new();
        let local = chain.add(Box::new(LocalSink::new(&root)))?;
        let meta = MetaSink {
            chain: &chain,
            node: local,
        };
        let ts = TablespaceFile {
            name: "db/t.ibd".into(),
            path: PathBuf::from("/nonexistent/db/t.ibd"),
            space_id: 4,
            page_size: 1024,
            zip_size: 0,
            flags: 0,
        };
        let mut f = PageFilter::new(&FilterMode::WriteThrough);
        let mut out = chain.open(local, "db/t.ibd", 0)?;
        assert!(f.finalize(out.as_mut(), meta).is_err());

        let mut name = ts.name.clone();
        f.init(&ts, &mut name, meta)?;
        assert!(f.init(&ts, &mut name, meta).is_err());
        f.finalize(out.as_mut(), meta)?;
        assert_eq!(f.state(), FilterState::Finalizing);
        let data = vec![0u8; 1024];
        let batch = PageBatch {
            first_page_no: 0,
            page_size: 1024,
            data: &data,
        };
        assert!(f.process(&batch, out.as_mut()).is_err());
        f.deinit();
        assert_eq!(f.state(), FilterState::Done);
        out.close()?;
        chain.teardown()?;
        Ok(())
    }
}
