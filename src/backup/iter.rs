//! backup/iter - общий для воркеров итератор файлов данных.
//!
//! Критическая секция - только сдвиг позиции; каждый файл выдаётся ровно один раз.

use std::sync::Mutex;

use crate::source::TablespaceFile;

pub struct DatafilesIter {
    files: Vec<TablespaceFile>,
    pos: Mutex<usize>,
}

impl DatafilesIter {
    pub fn new(files: Vec<TablespaceFile>) -> Self {
        Self {
            files,
            pos: Mutex::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Следующий файл; None - файлы кончились.
    pub fn next_file(&self) -> Option<&TablespaceFile> {
        let idx = {
            let mut pos = self.pos.lock().unwrap();
            let idx = *pos;
            if idx >= self.files.len() {
                return None;
            }
            *pos += 1;
            idx
        };
        self.files.get(idx)
    }
}
