use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use QuiverBackup::delta::{meta_path_for_delta, summarize, DeltaMetadata};

/// CLI: inspect-delta - кластеры/страницы delta-файла.
pub fn exec(file: PathBuf, page_size: Option<usize>, json: bool) -> Result<()> {
    let ps = match page_size {
        Some(ps) => ps,
        None => DeltaMetadata::read(&meta_path_for_delta(&file))?.physical_page_size(),
    };
    let f = File::open(&file).with_context(|| format!("open {}", file.display()))?;
    let sum = summarize(BufReader::new(f), ps)?;

    if json {
        println!("{}", serde_json::to_string(&sum)?);
        return Ok(());
    }

    println!("Delta {}:", file.display());
    println!("  page_size = {}", sum.page_size);
    println!("  clusters  = {}", sum.clusters);
    println!("  pages     = {}", sum.pages);
    if let (Some(lo), Some(hi)) = (sum.min_page_no, sum.max_page_no) {
        println!("  page_no   = {}..={}", lo, hi);
    }
    Ok(())
}
