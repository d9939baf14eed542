use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use QuiverBackup::datasink::extract_stream;

/// CLI: extract - распаковать поток бэкапа в каталог.
pub fn exec(input: Option<PathBuf>, dest: PathBuf, json: bool) -> Result<()> {
    let reader: Box<dyn Read> = match &input {
        Some(p) => Box::new(BufReader::new(
            File::open(p).with_context(|| format!("open stream {}", p.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };
    let stats = extract_stream(reader, &dest)?;

    if json {
        println!("{}", serde_json::to_string(&stats)?);
        return Ok(());
    }
    println!(
        "Extracted {} files ({} chunks, {} bytes) into {}",
        stats.files,
        stats.chunks,
        stats.bytes,
        dest.display()
    );
    Ok(())
}
