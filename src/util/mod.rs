//! util - общие утилиты.
//!
//! Содержит:
//! - AlignedBuffer (util/aligned.rs) - выровненный буфер под страницы/блоки лога;
//! - now_secs(), local_timestamp() - метки времени для логов и метки лог-файла;
//! - align_down/align_up - выравнивание LSN по границе блока;
//! - read_at/write_at - позиционный IO поверх File.

use anyhow::Result;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

pub mod aligned;

pub use aligned::AlignedBuffer;

/// Текущее Unix-время в секундах.
#[inline]
pub fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Метка времени вида "YYMMDD HH:MM:SS" (локальное время) для заголовка лог-файла.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%y%m%d %H:%M:%S").to_string()
}

#[inline]
pub fn align_down(v: u64, align: u64) -> u64 {
    v - v % align
}

#[inline]
pub fn align_up(v: u64, align: u64) -> u64 {
    align_down(v + align - 1, align)
}

pub fn read_at(f: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)?;
    Ok(())
}

pub fn write_at(f: &mut File, offset: u64, buf: &[u8]) -> Result<()> {
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(buf)?;
    Ok(())
}
