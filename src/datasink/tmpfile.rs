//! datasink/tmpfile - реле через временные файлы.
//!
//! Файлы пишутся во временный каталог; закрытые файлы запоминаются и при
//! deinit переигрываются в pipe (в порядке закрытия), после чего удаляются.
//! Используется при stream + suspend-at-end: метаданные и лог попадают в поток
//! только после остановки копировщика лога.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{Datasink, DsFile, Pipe};
use crate::errors::config_err;

const REPLAY_CHUNK: usize = 1024 * 1024;

struct ClosedTmp {
    tmp_path: PathBuf,
    logical: String,
    len: u64,
}

pub struct TmpfileSink {
    dir: PathBuf,
    closed: Arc<Mutex<Vec<ClosedTmp>>>,
}

impl TmpfileSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("create tmpdir {}", dir.display()))?;
        Ok(Self {
            dir,
            closed: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn pending(&self) -> usize {
        self.closed.lock().unwrap().len()
    }
}

impl Datasink for TmpfileSink {
    fn name(&self) -> &'static str {
        "tmpfile"
    }

    fn needs_pipe(&self) -> bool {
        true
    }

    fn open(&self, path: &str, _size_hint: u64, _pipe: Option<Pipe<'_>>) -> Result<Box<dyn DsFile>> {
        let tmp_path = self
            .dir
            .join(format!("qbtmp-{:016x}", rand::random::<u64>()));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        debug!("tmpfile: {} -> {}", path, tmp_path.display());
        Ok(Box::new(TmpFile {
            logical: path.to_string(),
            tmp_path,
            file,
            len: 0,
            closed: self.closed.clone(),
        }))
    }

    fn deinit(&self, pipe: Option<Pipe<'_>>) -> Result<()> {
        let pipe = pipe.ok_or_else(|| config_err("tmpfile datasink without pipe"))?;
        let entries: Vec<ClosedTmp> = std::mem::take(&mut *self.closed.lock().unwrap());
        let mut buf = vec![0u8; REPLAY_CHUNK];
        for e in entries {
            let mut src = File::open(&e.tmp_path)
                .with_context(|| format!("reopen temp file {}", e.tmp_path.display()))?;
            let mut dst = pipe.open(&e.logical, e.len)?;
            loop {
                let n = src
                    .read(&mut buf)
                    .with_context(|| format!("read temp file {}", e.tmp_path.display()))?;
                if n == 0 {
                    break;
                }
                dst.write(&buf[..n])?;
            }
            dst.close()?;
            fs::remove_file(&e.tmp_path)
                .with_context(|| format!("remove temp file {}", e.tmp_path.display()))?;
            debug!("tmpfile: replayed {} ({} bytes)", e.logical, e.len);
        }
        if let Err(err) = fs::remove_dir(&self.dir) {
            warn!("tmpfile: cannot remove {}: {}", self.dir.display(), err);
        }
        Ok(())
    }
}

struct TmpFile {
    logical: String,
    tmp_path: PathBuf,
    file: File,
    len: u64,
    closed: Arc<Mutex<Vec<ClosedTmp>>>,
}

impl DsFile for TmpFile {
    fn path(&self) -> &str {
        &self.logical
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .with_context(|| format!("write temp file {}", self.tmp_path.display()))?;
        self.len += buf.len() as u64;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let TmpFile {
            logical,
            tmp_path,
            mut file,
            len,
            closed,
        } = *self;
        file.flush()?;
        drop(file);
        closed.lock().unwrap().push(ClosedTmp {
            tmp_path,
            logical,
            len,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasink::{DatasinkChain, LocalSink};

    #[test]
    fn replays_into_pipe_on_teardown() -> Result<()> {
        let root = std::env::temp_dir().join(format!(
            "qbtest-tmpfile-{}-{}",
            std::process::id(),
            crate::util::now_secs()
        ));
        let tmpdir = root.join(".qbtmp");
        let mut chain = DatasinkChain::new();
        let local = chain.add(Box::new(LocalSink::new(root.join("out"))))?;
        let tmp = chain.add_piped(Box::new(TmpfileSink::new(&tmpdir)?), local)?;

        let mut f = chain.open(tmp, "xtrabackup_checkpoints", 0)?;
        f.write(b"backup_type = full-backuped\n")?;
        f.close()?;
        // До teardown в выходе ничего нет
        assert!(!root.join("out/xtrabackup_checkpoints").exists());

        chain.teardown()?;
        assert_eq!(
            fs::read(root.join("out/xtrabackup_checkpoints"))?,
            b"backup_type = full-backuped\n"
        );
        assert!(!tmpdir.exists());
        Ok(())
    }
}
