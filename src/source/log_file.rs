//! source/log_file - redo log в одном файле.
//!
//! Формат:
//! - заголовок LOG_FILE_HDR_SIZE (4 блока): метка создателя @16 (32 байта),
//!   слот контрольной точки в блоке 1: no u64 @512, lsn u64 @520,
//!   CRC32C от [512..528) @528 (всё big-endian);
//! - кольцевая область данных `capacity` байт: блок с LSN `l` лежит по
//!   смещению LOG_FILE_HDR_SIZE + (l % capacity).
//!
//! FileLogReader открывает файл на каждый вызов - потоки копировщика лога и
//! оркестратора читают независимо, без общей блокировки.
//! LogFile - запись (сервер/симулятор в тестах, утилиты).

use anyhow::{Context, Result};
use byteorder::{BigEndian, ByteOrder};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use super::{Checkpoint, LogReader};
use crate::consts::{
    LOG_BLOCK_HDR_SIZE, LOG_BLOCK_SIZE, LOG_CHECKPOINT_CHECKSUM, LOG_CHECKPOINT_LSN,
    LOG_CHECKPOINT_NO, LOG_FILE_CREATOR_LEN, LOG_FILE_HDR_SIZE, LOG_FILE_WAS_CREATED_BY_HOT_BACKUP,
};
use crate::errors::{consistency_err, format_err};
use crate::redo::block;
use crate::util::{align_down, read_at, write_at};

const CHECKPOINT_SLOT_LEN: usize = LOG_CHECKPOINT_CHECKSUM + 4 - LOG_CHECKPOINT_NO;

fn check_capacity(capacity: u64) -> Result<()> {
    if capacity == 0 || capacity % LOG_BLOCK_SIZE as u64 != 0 {
        return Err(format_err(format!(
            "log capacity {} is not a positive multiple of {}",
            capacity, LOG_BLOCK_SIZE
        )));
    }
    Ok(())
}

fn decode_checkpoint(slot: &[u8]) -> Result<Checkpoint> {
    let base = LOG_CHECKPOINT_NO;
    let no = BigEndian::read_u64(&slot[LOG_CHECKPOINT_NO - base..LOG_CHECKPOINT_NO - base + 8]);
    let lsn = BigEndian::read_u64(&slot[LOG_CHECKPOINT_LSN - base..LOG_CHECKPOINT_LSN - base + 8]);
    let stored = BigEndian::read_u32(
        &slot[LOG_CHECKPOINT_CHECKSUM - base..LOG_CHECKPOINT_CHECKSUM - base + 4],
    );
    let calc = crc32c::crc32c(&slot[..LOG_CHECKPOINT_CHECKSUM - base]);
    if stored != calc {
        return Err(consistency_err(format!(
            "checkpoint slot checksum mismatch (stored {:08x}, calculated {:08x})",
            stored, calc
        )));
    }
    Ok(Checkpoint { no, lsn })
}

fn encode_checkpoint(cp: Checkpoint) -> [u8; CHECKPOINT_SLOT_LEN] {
    let base = LOG_CHECKPOINT_NO;
    let mut slot = [0u8; CHECKPOINT_SLOT_LEN];
    BigEndian::write_u64(&mut slot[0..8], cp.no);
    BigEndian::write_u64(&mut slot[LOG_CHECKPOINT_LSN - base..LOG_CHECKPOINT_LSN - base + 8], cp.lsn);
    let crc = crc32c::crc32c(&slot[..LOG_CHECKPOINT_CHECKSUM - base]);
    BigEndian::write_u32(
        &mut slot[LOG_CHECKPOINT_CHECKSUM - base..LOG_CHECKPOINT_CHECKSUM - base + 4],
        crc,
    );
    slot
}

/// Метка создателя из заголовка (до первого нуля).
pub fn creator_label(header: &[u8]) -> String {
    let area = &header[LOG_FILE_WAS_CREATED_BY_HOT_BACKUP
        ..LOG_FILE_WAS_CREATED_BY_HOT_BACKUP + LOG_FILE_CREATOR_LEN];
    let end = area.iter().position(|&b| b == 0).unwrap_or(area.len());
    String::from_utf8_lossy(&area[..end]).to_string()
}

/// Записать метку создателя в заголовок (обрезается до 31 байта).
pub fn set_creator_label(header: &mut [u8], label: &str) {
    let area = &mut header[LOG_FILE_WAS_CREATED_BY_HOT_BACKUP
        ..LOG_FILE_WAS_CREATED_BY_HOT_BACKUP + LOG_FILE_CREATOR_LEN];
    area.fill(0);
    let n = label.len().min(LOG_FILE_CREATOR_LEN - 1);
    area[..n].copy_from_slice(&label.as_bytes()[..n]);
}

pub struct FileLogReader {
    path: PathBuf,
    capacity: u64,
}

impl FileLogReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = std::fs::metadata(&path)
            .with_context(|| format!("stat log file {}", path.display()))?
            .len();
        if len <= LOG_FILE_HDR_SIZE as u64 {
            return Err(format_err(format!(
                "log file {} too short ({} bytes)",
                path.display(),
                len
            )));
        }
        let capacity = len - LOG_FILE_HDR_SIZE as u64;
        check_capacity(capacity)?;
        Ok(Self { path, capacity })
    }

    fn file(&self) -> Result<File> {
        File::open(&self.path).with_context(|| format!("open log file {}", self.path.display()))
    }
}

impl LogReader for FileLogReader {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_header(&self) -> Result<Vec<u8>> {
        let mut hdr = vec![0u8; LOG_FILE_HDR_SIZE];
        read_at(&mut self.file()?, 0, &mut hdr).context("read log file header")?;
        Ok(hdr)
    }

    fn read_checkpoint(&self) -> Result<Checkpoint> {
        let mut slot = [0u8; CHECKPOINT_SLOT_LEN];
        read_at(&mut self.file()?, LOG_CHECKPOINT_NO as u64, &mut slot)
            .context("read checkpoint slot")?;
        decode_checkpoint(&slot)
    }

    fn read_segment(&self, start_lsn: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(start_lsn % LOG_BLOCK_SIZE as u64, 0);
        let mut f = self.file()?;
        let mut done = 0usize;
        let mut lsn = start_lsn;
        while done < buf.len() {
            let off = lsn % self.capacity;
            let n = ((self.capacity - off) as usize).min(buf.len() - done);
            read_at(&mut f, LOG_FILE_HDR_SIZE as u64 + off, &mut buf[done..done + n])
                .with_context(|| format!("read log segment at lsn {}", lsn))?;
            done += n;
            lsn += n as u64;
        }
        Ok(())
    }
}

/// Запись лог-файла: создание, блоки, контрольная точка.
pub struct LogFile {
    file: File,
    capacity: u64,
}

impl LogFile {
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        check_capacity(capacity)?;
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("create log file {}", path.display()))?;
        file.set_len(LOG_FILE_HDR_SIZE as u64 + capacity)?;
        let mut hdr = vec![0u8; LOG_FILE_HDR_SIZE];
        set_creator_label(&mut hdr, "server");
        write_at(&mut file, 0, &hdr)?;
        let mut lf = Self { file, capacity };
        lf.write_checkpoint(Checkpoint { no: 0, lsn: 0 })?;
        Ok(lf)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        let len = file.metadata()?.len();
        let capacity = len.saturating_sub(LOG_FILE_HDR_SIZE as u64);
        check_capacity(capacity)?;
        Ok(Self { file, capacity })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Записать сырой блок по его LSN (для повреждённых блоков в тестах).
    pub fn write_block(&mut self, block_lsn: u64, block_bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(block_bytes.len(), LOG_BLOCK_SIZE);
        let off = LOG_FILE_HDR_SIZE as u64 + align_down(block_lsn, LOG_BLOCK_SIZE as u64) % self.capacity;
        write_at(&mut self.file, off, block_bytes)
    }

    /// Записать блоки, покрывающие [from_lsn, to_lsn): все полные, кроме
    /// последнего, чей data_len доходит ровно до `to_lsn`. Первый блок несёт
    /// флаг flush. `to_lsn % 512` должен быть 0 или >= 12 (заголовок блока).
    pub fn write_range(&mut self, from_lsn: u64, to_lsn: u64, checkpoint_no: u32) -> Result<()> {
        let bs = LOG_BLOCK_SIZE as u64;
        let tail = to_lsn % bs;
        if to_lsn < from_lsn || (tail != 0 && tail < LOG_BLOCK_HDR_SIZE as u64) {
            return Err(format_err(format!(
                "bad log range [{}, {})",
                from_lsn, to_lsn
            )));
        }
        let mut b = align_down(from_lsn, bs);
        let mut first = true;
        while b < to_lsn {
            let len = (to_lsn - b).min(bs) as usize;
            let blk = block::build(b, len, checkpoint_no, first, (b / bs) as u8);
            self.write_block(b, &blk)?;
            first = false;
            b += bs;
        }
        Ok(())
    }

    pub fn write_checkpoint(&mut self, cp: Checkpoint) -> Result<()> {
        let slot = encode_checkpoint(cp);
        write_at(&mut self.file, LOG_CHECKPOINT_NO as u64, &slot)?;
        self.file.sync_data()?;
        Ok(())
    }
}
