use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use QuiverBackup::datasink::{DatasinkChain, LocalSink};
use QuiverBackup::delta::{DeltaMetadata, DeltaReader};
use QuiverBackup::filter::compact::parse_page_map;
use QuiverBackup::filter::{FilterMode, FilterState, MetaSink, PageClassifier, PageFilter};
use QuiverBackup::page::{build_page, page_lsn};
use QuiverBackup::source::{PageBatch, TablespaceFile};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("qbtest-filters-{prefix}-{pid}-{t}-{id}"))
}

const PS: usize = 1024;

fn ts(name: &str, space_id: u32) -> TablespaceFile {
    TablespaceFile {
        name: name.into(),
        path: PathBuf::from(format!("/nonexistent/{}", name)),
        space_id,
        page_size: PS,
        zip_size: 0,
        flags: 0,
    }
}

/// Прогнать страницы через фильтр батчами по `batch` страниц.
fn run_filter(
    mode: &FilterMode,
    root: &PathBuf,
    t: &TablespaceFile,
    data: &[u8],
    batch: usize,
) -> Result<String> {
    let mut chain = DatasinkChain::new();
    let local = chain.add(Box::new(LocalSink::new(root)))?;
    let meta = MetaSink {
        chain: &chain,
        node: local,
    };
    let mut f = PageFilter::new(mode);
    let mut dst = t.name.clone();
    f.init(t, &mut dst, meta)?;
    let mut out = chain.open(local, &dst, 0)?;
    for (i, chunk) in data.chunks(batch * PS).enumerate() {
        let b = PageBatch {
            first_page_no: (i * batch) as u64,
            page_size: PS,
            data: chunk,
        };
        f.process(&b, out.as_mut())?;
    }
    f.finalize(out.as_mut(), meta)?;
    f.deinit();
    assert_eq!(f.state(), FilterState::Done);
    out.close()?;
    chain.teardown()?;
    Ok(dst)
}

/// В delta попадают ровно страницы с lsn > cutoff, с верными номерами.
#[test]
fn incremental_keeps_exactly_pages_above_cutoff() -> Result<()> {
    let root = unique_root("incr");
    let cutoff = 5_000u64;
    let mut rng = oorandom::Rand64::new(0xC0FFEE);
    let n = 600usize;
    let mut data = Vec::with_capacity(n * PS);
    let mut expected = Vec::new();
    for no in 0..n as u32 {
        let lsn = rng.rand_range(1..10_000);
        let p = build_page(PS, 9, no, lsn, no as u8);
        if lsn > cutoff {
            expected.push((no, p.clone()));
        }
        data.extend(p);
    }

    let t = ts("shop/orders.ibd", 9);
    let dst = run_filter(&FilterMode::Incremental { cutoff_lsn: cutoff }, &root, &t, &data, 64)?;
    assert_eq!(dst, "shop/orders.ibd.delta");

    let meta = DeltaMetadata::read(&root.join("shop/orders.ibd.meta"))?;
    assert_eq!(meta.page_size, PS);
    assert_eq!(meta.space_id, Some(9));

    let bytes = fs::read(root.join(&dst))?;
    let mut rd = DeltaReader::new(&bytes[..], PS)?;
    let mut got = Vec::new();
    while let Some(c) = rd.next_cluster()? {
        got.extend(c.pages);
    }
    assert!(got.iter().all(|(_, p)| page_lsn(p) > cutoff));
    assert_eq!(got, expected);
    let cap = QuiverBackup::delta::cluster_capacity(PS);
    assert_eq!(rd.clusters_read() as usize, ((expected.len() + cap - 1) / cap).max(1));
    assert!(expected.len() > cap);
    Ok(())
}

/// Файл без изменённых страниц даёт delta из одного пустого кластера.
#[test]
fn incremental_untouched_file_has_no_pages() -> Result<()> {
    let root = unique_root("incr-empty");
    let mut data = Vec::new();
    for no in 0..10u32 {
        data.extend(build_page(PS, 3, no, 100, 1));
    }
    let t = ts("db/t.ibd", 3);
    let dst = run_filter(&FilterMode::Incremental { cutoff_lsn: 100 }, &root, &t, &data, 4)?;
    let bytes = fs::read(root.join(dst))?;
    assert_eq!(bytes.len(), PS);
    let mut rd = DeltaReader::new(&bytes[..], PS)?;
    let c = rd.next_cluster()?.expect("final cluster");
    assert!(c.last);
    assert!(c.pages.is_empty());
    Ok(())
}

/// Оставляет страницы с чётным заполнением.
struct EvenFill;

impl PageClassifier for EvenFill {
    fn keep(&self, _page_no: u64, page: &[u8]) -> bool {
        page[PS - 1] % 2 == 0
    }
}

#[test]
fn compact_writes_kept_runs_and_page_map() -> Result<()> {
    let root = unique_root("compact");
    let fills = [0u8, 2, 1, 1, 4, 3, 6, 8, 5, 10];
    let mut data = Vec::new();
    for (no, fill) in fills.iter().enumerate() {
        data.extend(build_page(PS, 12, no as u32, 10, *fill));
    }
    let mode = FilterMode::Compact {
        classifier: Arc::new(EvenFill),
    };
    let t = ts("db/c.ibd", 12);
    let dst = run_filter(&mode, &root, &t, &data, 3)?;
    assert_eq!(dst, "db/c.ibd");

    let out = fs::read(root.join(&dst))?;
    let kept: Vec<u8> = out.chunks(PS).map(|p| p[PS - 1]).collect();
    assert_eq!(kept, vec![0, 2, 4, 6, 8, 10]);

    let map = parse_page_map(&fs::read(root.join("db/c.ibd.pmap"))?);
    assert_eq!(map, vec![(2, 3), (5, 5), (8, 8)]);
    Ok(())
}

#[test]
fn compact_never_touches_system_space() -> Result<()> {
    let root = unique_root("compact-sys");
    let mut data = Vec::new();
    for no in 0..5u32 {
        data.extend(build_page(PS, 0, no, 10, 1));
    }
    let mode = FilterMode::Compact {
        classifier: Arc::new(EvenFill),
    };
    let t = ts("ibdata1", 0);
    run_filter(&mode, &root, &t, &data, 2)?;
    assert_eq!(fs::read(root.join("ibdata1"))?, data);
    assert!(!root.join("ibdata1.pmap").exists());
    Ok(())
}
