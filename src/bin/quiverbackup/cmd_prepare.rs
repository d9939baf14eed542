use anyhow::Result;
use std::path::PathBuf;

use QuiverBackup::apply::prepare_incremental;

/// CLI: prepare - наложить инкремент на полный бэкап. Вывод - текст/JSON.
pub fn exec(target: PathBuf, incremental_dir: PathBuf, page_size: usize, json: bool) -> Result<()> {
    let rep = prepare_incremental(&target, &incremental_dir, page_size)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rep)?);
        return Ok(());
    }

    println!("Prepare summary:");
    println!("  backup_type = {}", rep.metadata.backup_type);
    println!("  to_lsn      = {}", rep.metadata.to_lsn);
    println!("  last_lsn    = {}", rep.metadata.last_lsn);
    println!("  deltas      = {}", rep.apply.deltas.len());
    println!("  pages       = {}", rep.apply.pages());
    for d in &rep.apply.deltas {
        match &d.moved_aside {
            Some(aside) => println!("  {} ({} pages, {:?}, old file moved to {})", d.name, d.pages, d.resolution, aside),
            None => println!("  {} ({} pages, {:?})", d.name, d.pages, d.resolution),
        }
    }
    Ok(())
}
