//! source/dir - каталог данных сервера как TablespaceRegistry.
//!
//! Раскладка:
//! - <root>/ibdata*          - системное табличное пространство (space 0);
//! - <root>/<db>/<table>.ibd - по файлу на таблицу.
//! space_id и флаги берутся из FSP-заголовка страницы 0.

use anyhow::{Context, Result};
use fs2::FileExt;
use log::{debug, info};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoKind, Read, Write};
use std::path::{Path, PathBuf};

use super::{PageBatch, PageSource, TablespaceFile, TablespaceRegistry};
use crate::consts::{
    FSP_HEADER_OFFSET, FSP_SPACE_FLAGS, READ_BATCH_PAGES, SYSTEM_FILE_PREFIX, TABLESPACE_EXT,
    TABLESPACE_INITIAL_PAGES,
};
use crate::errors::{format_err, io_err};
use crate::page::{flags_to_zip_size, fsp_space_id, init_header_page, validate_page_size, zip_size_to_flags};
use crate::util::AlignedBuffer;

pub struct DirRegistry {
    root: PathBuf,
    page_size: usize,
    index: Vec<TablespaceFile>,
}

impl DirRegistry {
    /// Просканировать каталог данных. `page_size` - логический размер страницы сервера.
    pub fn open<P: AsRef<Path>>(root: P, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let root = root.as_ref().to_path_buf();
        let mut reg = Self {
            root,
            page_size,
            index: Vec::new(),
        };
        reg.rescan()?;
        Ok(reg)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn rescan(&mut self) -> Result<()> {
        let mut found = Vec::new();
        let rd = fs::read_dir(&self.root)
            .with_context(|| format!("read data dir {}", self.root.display()))?;
        for entry in rd {
            let entry = entry?;
            let ft = entry.file_type()?;
            let fname = entry.file_name().to_string_lossy().to_string();
            if ft.is_file() && fname.starts_with(SYSTEM_FILE_PREFIX) {
                found.push(fname);
            } else if ft.is_dir() {
                for sub in fs::read_dir(entry.path())? {
                    let sub = sub?;
                    let sname = sub.file_name().to_string_lossy().to_string();
                    let is_ibd = Path::new(&sname)
                        .extension()
                        .map(|e| e == TABLESPACE_EXT)
                        .unwrap_or(false);
                    if sub.file_type()?.is_file() && is_ibd {
                        found.push(format!("{}/{}", fname, sname));
                    }
                }
            }
        }

        let mut index = Vec::with_capacity(found.len());
        for name in found {
            let path = self.root.join(&name);
            match self.describe(&name, &path)? {
                Some(ts) => index.push(ts),
                None => debug!("registry: {} vanished during scan", name),
            }
        }
        index.sort_by(|a, b| {
            (!a.is_system(), a.name.as_str()).cmp(&(!b.is_system(), b.name.as_str()))
        });
        self.index = index;
        debug!(
            "registry: {} tablespace files under {}",
            self.index.len(),
            self.root.display()
        );
        Ok(())
    }

    /// Прочитать FSP-заголовок; None - файла уже нет.
    fn describe(&self, name: &str, path: &Path) -> Result<Option<TablespaceFile>> {
        let mut f = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == IoKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
        };
        let need = FSP_HEADER_OFFSET + FSP_SPACE_FLAGS + 4;
        let mut hdr = vec![0u8; need];
        f.read_exact(&mut hdr).map_err(|_| {
            format_err(format!("{}: too short for a tablespace header", path.display()))
        })?;
        let space_id = fsp_space_id(&hdr);
        let flags = crate::page::fsp_flags(&hdr);
        let zip_size = flags_to_zip_size(flags);
        Ok(Some(TablespaceFile {
            name: name.to_string(),
            path: path.to_path_buf(),
            space_id,
            page_size: self.page_size,
            zip_size,
            flags,
        }))
    }

    fn replace_entry(&mut self, old_name: &str, ts: TablespaceFile) {
        self.index.retain(|t| t.name != old_name && t.name != ts.name);
        self.index.push(ts);
        self.index.sort_by(|a, b| {
            (!a.is_system(), a.name.as_str()).cmp(&(!b.is_system(), b.name.as_str()))
        });
    }
}

impl TablespaceRegistry for DirRegistry {
    fn list(&self) -> Vec<TablespaceFile> {
        self.index.clone()
    }

    fn find_by_name(&self, name: &str) -> Option<TablespaceFile> {
        self.index.iter().find(|t| t.name == name).cloned()
    }

    fn find_by_id(&self, space_id: u32) -> Option<TablespaceFile> {
        self.index.iter().find(|t| t.space_id == space_id).cloned()
    }

    fn rename(&mut self, ts: &TablespaceFile, new_name: &str) -> Result<TablespaceFile> {
        let dst = self.root.join(new_name);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        fs::rename(&ts.path, &dst).with_context(|| {
            format!("rename {} -> {}", ts.path.display(), dst.display())
        })?;
        info!("registry: renamed {} to {}", ts.name, new_name);
        let moved = TablespaceFile {
            name: new_name.to_string(),
            path: dst,
            ..ts.clone()
        };
        self.replace_entry(&ts.name, moved.clone());
        Ok(moved)
    }

    fn create(&mut self, name: &str, space_id: u32, zip_size: usize) -> Result<TablespaceFile> {
        let flags = zip_size_to_flags(zip_size)?;
        let physical = if zip_size != 0 { zip_size } else { self.page_size };
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let mut f = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("create tablespace {}", path.display()))?;
        let total = physical as u64 * TABLESPACE_INITIAL_PAGES as u64;
        f.allocate(total)
            .with_context(|| format!("preallocate {} bytes for {}", total, path.display()))?;
        f.set_len(total)?;

        let mut page0 = vec![0u8; physical];
        init_header_page(&mut page0, space_id, TABLESPACE_INITIAL_PAGES, flags);
        f.write_all(&page0)
            .with_context(|| format!("write header page of {}", path.display()))?;
        f.sync_all()?;
        info!(
            "registry: created {} (space_id={}, zip_size={})",
            name, space_id, zip_size
        );

        let ts = TablespaceFile {
            name: name.to_string(),
            path,
            space_id,
            page_size: self.page_size,
            zip_size,
            flags,
        };
        self.replace_entry(name, ts.clone());
        Ok(ts)
    }

    fn open_pages(&self, ts: &TablespaceFile) -> Result<Option<Box<dyn PageSource>>> {
        Ok(FilePageSource::open(ts)?.map(|s| Box::new(s) as Box<dyn PageSource>))
    }
}

/// Последовательное чтение файла батчами до READ_BATCH_PAGES страниц.
pub struct FilePageSource {
    file: File,
    path: PathBuf,
    page_size: usize,
    buf: AlignedBuffer,
    next_page: u64,
    eof: bool,
}

impl FilePageSource {
    /// None - файла нет (удалён после листинга).
    pub fn open(ts: &TablespaceFile) -> Result<Option<Self>> {
        let file = match File::open(&ts.path) {
            Ok(f) => f,
            Err(e) if e.kind() == IoKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("open {}", ts.path.display())),
        };
        let ps = ts.physical_page_size();
        Ok(Some(Self {
            file,
            path: ts.path.clone(),
            page_size: ps,
            buf: AlignedBuffer::zeroed(ps, ps * READ_BATCH_PAGES)?,
            next_page: 0,
            eof: false,
        }))
    }
}

impl PageSource for FilePageSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_batch(&mut self) -> Result<Option<PageBatch<'_>>> {
        if self.eof {
            return Ok(None);
        }
        let mut got = 0usize;
        while got < self.buf.len() {
            let n = match self.file.read(&mut self.buf[got..]) {
                Ok(n) => n,
                Err(e) if e.kind() == IoKind::Interrupted => continue,
                Err(e) => {
                    return Err(io_err(format!(
                        "read {} at page {}: {}",
                        self.path.display(),
                        self.next_page,
                        e
                    )))
                }
            };
            if n == 0 {
                self.eof = true;
                break;
            }
            got += n;
        }
        if got % self.page_size != 0 {
            return Err(format_err(format!(
                "{}: trailing partial page ({} bytes) after page {}",
                self.path.display(),
                got % self.page_size,
                self.next_page + (got / self.page_size) as u64
            )));
        }
        if got == 0 {
            return Ok(None);
        }
        let first = self.next_page;
        self.next_page += (got / self.page_size) as u64;
        Ok(Some(PageBatch {
            first_page_no: first,
            page_size: self.page_size,
            data: &self.buf[..got],
        }))
    }
}
