//! datasink/local - терминальный узел: файлы в целевом каталоге.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{Datasink, DsFile, Pipe};

pub struct LocalSink {
    root: PathBuf,
}

impl LocalSink {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Datasink for LocalSink {
    fn name(&self) -> &'static str {
        "local"
    }

    fn open(&self, path: &str, _size_hint: u64, _pipe: Option<Pipe<'_>>) -> Result<Box<dyn DsFile>> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&full)
            .with_context(|| format!("open {}", full.display()))?;
        Ok(Box::new(LocalFile {
            path: path.to_string(),
            full,
            file,
        }))
    }
}

struct LocalFile {
    path: String,
    full: PathBuf,
    file: File,
}

impl DsFile for LocalFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .with_context(|| format!("write {}", self.full.display()))
    }

    // файл бэкапа считается готовым только после fsync
    fn close(mut self: Box<Self>) -> Result<()> {
        self.file
            .flush()
            .with_context(|| format!("flush {}", self.full.display()))?;
        self.file
            .sync_all()
            .with_context(|| format!("fsync {}", self.full.display()))
    }
}
