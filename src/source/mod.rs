//! source - узкие интерфейсы к серверу БД и их файловые реализации.
//!
//! Трейты:
//! - PageSource         - батчи страниц табличного пространства;
//! - LogReader          - сырые байты redo log по LSN + контрольная точка;
//! - TablespaceRegistry - поиск/переименование/создание табличных пространств.
//!
//! Реализации:
//! - dir.rs      - DirRegistry (каталог данных) и FilePageSource;
//! - log_file.rs - FileLogReader и LogFile (запись лог-файла: тесты и утилиты).

use anyhow::Result;
use std::path::PathBuf;

use crate::page::is_system_space;

pub mod dir;
pub mod log_file;

pub use dir::{DirRegistry, FilePageSource};
pub use log_file::{FileLogReader, LogFile};

/// Один файл табличного пространства.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablespaceFile {
    /// Логическое имя относительно каталога данных: "ibdata1" или "db/t.ibd".
    pub name: String,
    pub path: PathBuf,
    pub space_id: u32,
    /// Логический размер страницы.
    pub page_size: usize,
    /// Сжатый размер страницы, 0 - не сжато.
    pub zip_size: usize,
    pub flags: u32,
}

impl TablespaceFile {
    pub fn is_system(&self) -> bool {
        is_system_space(self.space_id)
    }

    /// Размер страницы на диске.
    pub fn physical_page_size(&self) -> usize {
        if self.zip_size != 0 {
            self.zip_size
        } else {
            self.page_size
        }
    }

    /// ("db", "table") для "db/table.ibd"; None для системных файлов.
    pub fn db_table(&self) -> Option<(&str, &str)> {
        let (db, file) = self.name.split_once('/')?;
        let table = file.rsplit_once('.').map(|(t, _)| t).unwrap_or(file);
        Some((db, table))
    }
}

/// Батч страниц, прочитанных подряд.
pub struct PageBatch<'a> {
    pub first_page_no: u64,
    pub page_size: usize,
    pub data: &'a [u8],
}

impl<'a> PageBatch<'a> {
    pub fn len(&self) -> usize {
        self.data.len() / self.page_size
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn page(&self, i: usize) -> &'a [u8] {
        &self.data[i * self.page_size..(i + 1) * self.page_size]
    }

    pub fn pages(&self) -> impl Iterator<Item = (u64, &'a [u8])> + '_ {
        let first = self.first_page_no;
        let ps = self.page_size;
        self.data
            .chunks_exact(ps)
            .enumerate()
            .map(move |(i, p)| (first + i as u64, p))
    }
}

pub trait PageSource: Send {
    fn page_size(&self) -> usize;
    /// Следующий батч; None - конец файла.
    fn read_batch(&mut self) -> Result<Option<PageBatch<'_>>>;
}

/// Контрольная точка redo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub no: u64,
    pub lsn: u64,
}

pub trait LogReader: Send + Sync {
    /// Ёмкость области данных (байт, кратно блоку лога).
    fn capacity(&self) -> u64;
    /// Заголовок лог-файла (LOG_FILE_HDR_SIZE байт).
    fn read_header(&self) -> Result<Vec<u8>>;
    fn read_checkpoint(&self) -> Result<Checkpoint>;
    /// Прочитать `buf.len()` байт лога начиная с `start_lsn` (выровнен по блоку).
    fn read_segment(&self, start_lsn: u64, buf: &mut [u8]) -> Result<()>;
}

pub trait TablespaceRegistry: Send + Sync {
    /// Все файлы: системные первыми, затем по имени.
    fn list(&self) -> Vec<TablespaceFile>;
    fn find_by_name(&self, name: &str) -> Option<TablespaceFile>;
    fn find_by_id(&self, space_id: u32) -> Option<TablespaceFile>;
    fn rename(&mut self, ts: &TablespaceFile, new_name: &str) -> Result<TablespaceFile>;
    fn create(&mut self, name: &str, space_id: u32, zip_size: usize) -> Result<TablespaceFile>;
    /// Источник страниц; None - файл исчез после листинга (таблицу удалили).
    fn open_pages(&self, ts: &TablespaceFile) -> Result<Option<Box<dyn PageSource>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        let ts = TablespaceFile {
            name: "shop/orders.ibd".into(),
            path: PathBuf::from("/data/shop/orders.ibd"),
            space_id: 5,
            page_size: 16384,
            zip_size: 8192,
            flags: 0,
        };
        assert_eq!(ts.db_table(), Some(("shop", "orders")));
        assert_eq!(ts.physical_page_size(), 8192);
        assert!(!ts.is_system());
    }

    #[test]
    fn batch_iteration() {
        let data = vec![0u8; 4 * 1024];
        let b = PageBatch {
            first_page_no: 10,
            page_size: 1024,
            data: &data,
        };
        let nos: Vec<u64> = b.pages().map(|(n, _)| n).collect();
        assert_eq!(nos, vec![10, 11, 12, 13]);
        assert_eq!(b.len(), 4);
    }
}
