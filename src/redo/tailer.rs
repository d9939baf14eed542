//! redo/tailer - копирование redo log, пока идёт копирование данных.
//!
//! Один проход (copy_pass):
//! - стартуем с align_down(from_lsn, 512) и читаем окна `window` байт;
//! - в окне идём по блокам: ожидаемый номер блока считается из scanned_lsn;
//!   * блок с верной контрольной суммой и меньшим номером - старые данные,
//!     лог кончился; с большим номером - фатально (ConsistencyError), с
//!     диагнозом «лог успел завернуться», если разница кратна ёмкости группы;
//!   * неверная контрольная сумма - блок ещё дописывается сервером: проход
//!     заканчивается без ошибки и повторяется позже; на финальном проходе - фатально;
//!   * флаг flush продвигает contiguous_lsn;
//!   * checkpoint_no, ушедший назад больше чем на 0x80000000, - мусор до recovery;
//!   * data_len < 512 - конец данных;
//! - пишем окно целиком или, если скан закончился, до выровненной границы;
//!   не на финальном проходе неполный хвостовой блок не пишется (его допишет
//!   следующий проход, стартующий с этого блока).
//!
//! Фоновый копировщик (spawn_log_copier) опрашивает флаг сессии раз в
//! LOG_COPY_POLL_MS и делает проход раз в `interval`; после остановки - финальный
//! проход. Результат - через JoinHandle.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::block;
use crate::backup::BackupSession;
use crate::consts::{LOG_BLOCK_SIZE, LOG_CHECKPOINT_NO_GARBAGE_GAP, LOG_COPY_POLL_MS};
use crate::datasink::DsFile;
use crate::errors::consistency_err;
use crate::metrics::{record_log_checksum_retry, record_log_pass};
use crate::source::LogReader;
use crate::throttle::IoThrottle;
use crate::util::{align_down, align_up, AlignedBuffer};

/// Итог скана одного окна.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowScan {
    pub scanned_lsn: u64,
    pub contiguous_lsn: u64,
    pub finished: bool,
}

/// Просканировать окно блоков, начинающееся с `start_lsn`.
pub fn scan_window(
    buf: &[u8],
    start_lsn: u64,
    contiguous_lsn: u64,
    group_blocks: u32,
    is_last: bool,
) -> Result<WindowScan> {
    let mut scanned = start_lsn;
    let mut contiguous = contiguous_lsn;
    let mut scanned_cp: u32 = 0;
    let mut finished = false;

    for blk in buf.chunks_exact(LOG_BLOCK_SIZE) {
        if block::is_unwritten(blk) {
            finished = true;
            break;
        }
        let no = block::hdr_no(blk);
        let scanned_no = block::lsn_to_block_no(scanned);
        let ok = block::checksum_ok(blk);

        if no != scanned_no && ok {
            if no < scanned_no {
                // старый блок: новых данных дальше нет
                finished = true;
                break;
            }
            let mut msg = format!(
                "log block numbers mismatch: expected log block no. {}, but got no. {} from the log file (lsn {})",
                scanned_no, no, scanned
            );
            if group_blocks > 0 && (no - scanned_no) % group_blocks == 0 {
                msg.push_str(
                    "; it looks like the log has wrapped around before the backup could process all records: \
                     log copying is too slow or the log files are too small",
                );
            }
            return Err(consistency_err(msg));
        } else if !ok {
            if is_last {
                return Err(consistency_err(format!(
                    "log block checksum mismatch on the final pass (block no {} at lsn {}): stored {:08x}, calculated {:08x}",
                    no,
                    scanned,
                    block::stored_checksum(blk),
                    block::calc_checksum(blk)
                )));
            }
            warn!(
                "log block checksum mismatch (block no {} at lsn {}): stored {:08x}, calculated {:08x}; \
                 the block may not be fully written yet, will retry later",
                no,
                scanned,
                block::stored_checksum(blk),
                block::calc_checksum(blk)
            );
            record_log_checksum_retry();
            finished = true;
            break;
        }

        if block::flush_bit(blk) && scanned > contiguous {
            contiguous = scanned;
        }

        let len = block::data_len(blk);
        if len > LOG_BLOCK_SIZE {
            return Err(consistency_err(format!(
                "log block at lsn {} has data_len {} > {}",
                scanned, len, LOG_BLOCK_SIZE
            )));
        }
        let cp = block::checkpoint_no(blk);
        if scanned_cp > 0 && cp < scanned_cp && scanned_cp - cp > LOG_CHECKPOINT_NO_GARBAGE_GAP {
            // мусор от сброса буфера до последнего recovery
            finished = true;
            break;
        }

        scanned += len as u64;
        scanned_cp = cp;
        if len < LOG_BLOCK_SIZE {
            finished = true;
            break;
        }
    }

    Ok(WindowScan {
        scanned_lsn: scanned,
        contiguous_lsn: contiguous,
        finished,
    })
}

/// Сколько байт окна писать в выходной лог.
pub fn window_write_size(window: usize, start_lsn: u64, scan: &WindowScan, is_last: bool) -> usize {
    if !scan.finished {
        return window;
    }
    let bs = LOG_BLOCK_SIZE as u64;
    let mut size = align_up(scan.scanned_lsn, bs) - start_lsn;
    if !is_last && scan.scanned_lsn % bs != 0 {
        size -= bs;
    }
    size as usize
}

pub struct LogTailer {
    reader: Arc<dyn LogReader>,
    throttle: Arc<IoThrottle>,
    window: usize,
    buf: AlignedBuffer,
    group_blocks: u32,
    scanned_lsn: u64,
}

impl LogTailer {
    /// `start_lsn` - LSN контрольной точки на старте бэкапа.
    pub fn new(
        reader: Arc<dyn LogReader>,
        throttle: Arc<IoThrottle>,
        window: usize,
        start_lsn: u64,
    ) -> Result<Self> {
        let group_blocks = block::group_block_capacity(reader.capacity());
        Ok(Self {
            buf: AlignedBuffer::zeroed(LOG_BLOCK_SIZE, window)?,
            reader,
            throttle,
            window,
            group_blocks,
            scanned_lsn: start_lsn,
        })
    }

    pub fn scanned_lsn(&self) -> u64 {
        self.scanned_lsn
    }

    /// Один проход от `from_lsn` до текущего конца лога. Возвращает scanned_lsn.
    pub fn copy_pass(&mut self, out: &mut dyn DsFile, from_lsn: u64, is_last: bool) -> Result<u64> {
        let bs = LOG_BLOCK_SIZE as u64;
        let mut contiguous = align_down(from_lsn, bs);
        let mut start = contiguous;
        let mut written = 0usize;

        let scanned = loop {
            self.throttle.acquire();
            self.reader
                .read_segment(start, &mut self.buf)
                .with_context(|| format!("read log window at lsn {}", start))?;
            let scan = scan_window(&self.buf, start, contiguous, self.group_blocks, is_last)?;
            contiguous = scan.contiguous_lsn;

            let size = window_write_size(self.window, start, &scan, is_last);
            if size > 0 {
                out.write(&self.buf[..size])
                    .with_context(|| format!("write {} log bytes at lsn {}", size, start))?;
                written += size;
            }
            if scan.finished {
                break scan.scanned_lsn;
            }
            start += self.window as u64;
        };

        self.scanned_lsn = scanned;
        record_log_pass(written);
        debug!(
            "log pass: from {} scanned {} contiguous {} wrote {} bytes{}",
            from_lsn,
            scanned,
            contiguous,
            written,
            if is_last { " (final)" } else { "" }
        );
        info!(">> log scanned up to ({})", scanned);
        Ok(scanned)
    }

    /// Проход от последней просканированной позиции.
    pub fn catch_up(&mut self, out: &mut dyn DsFile, is_last: bool) -> Result<u64> {
        let from = self.scanned_lsn;
        self.copy_pass(out, from, is_last)
    }
}

/// Запустить фоновый копировщик лога. Поток закрывает `out` сам; результат -
/// scanned_lsn финального прохода.
pub fn spawn_log_copier(
    mut tailer: LogTailer,
    mut out: Box<dyn DsFile>,
    session: Arc<BackupSession>,
    interval: Duration,
) -> Result<JoinHandle<Result<u64>>> {
    let poll = Duration::from_millis(LOG_COPY_POLL_MS).min(interval);
    std::thread::Builder::new()
        .name("log-copy".into())
        .spawn(move || {
            let res = (|| -> Result<u64> {
                let mut since = Duration::ZERO;
                while session.log_copying_active() {
                    std::thread::sleep(poll);
                    since += poll;
                    if since >= interval {
                        since = Duration::ZERO;
                        let lsn = tailer.catch_up(out.as_mut(), false)?;
                        session.set_scanned_lsn(lsn);
                    }
                }
                if session.aborted() {
                    debug!("log copier: run aborted, skipping final pass");
                    return Ok(tailer.scanned_lsn());
                }
                let lsn = tailer.catch_up(out.as_mut(), true)?;
                session.set_scanned_lsn(lsn);
                Ok(lsn)
            })();
            match res {
                Ok(lsn) => {
                    out.close().context("close log copy")?;
                    debug!("log copier: stopped at {}", lsn);
                    Ok(lsn)
                }
                Err(e) => {
                    let _ = out.close();
                    Err(e)
                }
            }
        })
        .context("spawn log copier")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{error_kind, ErrorKind};

    fn blocks(from_block: u64, lens: &[usize], cp: u32) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, len) in lens.iter().enumerate() {
            let lsn = (from_block + i as u64) * 512;
            out.extend(block::build(lsn, *len, cp, i == 0, 1));
        }
        out
    }

    #[test]
    fn stops_at_partial_block() -> Result<()> {
        let mut buf = blocks(16, &[512, 512, 100], 1);
        buf.extend(vec![0u8; 512]);
        let s = scan_window(&buf, 16 * 512, 16 * 512, 1000, false)?;
        assert!(s.finished);
        assert_eq!(s.scanned_lsn, 18 * 512 + 100);
        // не финальный проход: неполный блок не пишется
        assert_eq!(window_write_size(buf.len(), 16 * 512, &s, false), 2 * 512);
        assert_eq!(window_write_size(buf.len(), 16 * 512, &s, true), 3 * 512);
        Ok(())
    }

    #[test]
    fn old_block_ends_scan() -> Result<()> {
        let mut buf = blocks(16, &[512], 1);
        // блок от предыдущего круга: номер меньше ожидаемого
        buf.extend(block::build(2 * 512, 512, 1, false, 1));
        let s = scan_window(&buf, 16 * 512, 0, 1000, true)?;
        assert_eq!(s.scanned_lsn, 17 * 512);
        assert_eq!(window_write_size(buf.len(), 16 * 512, &s, true), 512);
        Ok(())
    }

    #[test]
    fn newer_block_is_fatal_and_wrap_is_diagnosed() {
        let mut buf = blocks(16, &[512], 1);
        // ожидали блок 18 (lsn 17*512), пришёл 18+8
        buf.extend(block::build(25 * 512, 512, 1, false, 1));
        let e = scan_window(&buf, 16 * 512, 0, 8, false).unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Consistency));
        assert!(format!("{:#}", e).contains("wrapped"));

        let e = scan_window(&buf, 16 * 512, 0, 7, false).unwrap_err();
        assert!(!format!("{:#}", e).contains("wrapped"));
    }

    #[test]
    fn checksum_failure_retry_or_fatal() -> Result<()> {
        let mut buf = blocks(16, &[512, 200], 1);
        buf[512 + 50] ^= 0xFF;
        let s = scan_window(&buf, 16 * 512, 0, 1000, false)?;
        assert!(s.finished);
        assert_eq!(s.scanned_lsn, 17 * 512);

        let e = scan_window(&buf, 16 * 512, 0, 1000, true).unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Consistency));
        Ok(())
    }

    #[test]
    fn flush_bit_moves_contiguous_and_garbage_stops() -> Result<()> {
        let mut buf = block::build(16 * 512, 512, 0x9000_0000, false, 1);
        buf.extend(block::build(17 * 512, 512, 0x9000_0000, true, 1));
        // checkpoint_no ушёл назад больше чем на 0x80000000
        buf.extend(block::build(18 * 512, 512, 5, false, 1));
        let s = scan_window(&buf, 16 * 512, 16 * 512, 1000, false)?;
        assert_eq!(s.contiguous_lsn, 17 * 512);
        assert_eq!(s.scanned_lsn, 18 * 512);
        assert!(s.finished);
        Ok(())
    }
}
