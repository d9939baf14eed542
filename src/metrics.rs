//! Lightweight global metrics for QuiverBackup.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - копирование data-файлов (воркеры)
//! - redo log tailer
//! - IO throttle
//! - применение delta (prepare)

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Data copy -----
static FILES_COPIED: AtomicU64 = AtomicU64::new(0);
static FILES_SKIPPED: AtomicU64 = AtomicU64::new(0);
static PAGES_READ: AtomicU64 = AtomicU64::new(0);
static DELTA_PAGES_EMITTED: AtomicU64 = AtomicU64::new(0);
static COMPACT_PAGES_SKIPPED: AtomicU64 = AtomicU64::new(0);
static DATA_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);

// ----- Redo log -----
static LOG_PASSES: AtomicU64 = AtomicU64::new(0);
static LOG_BYTES_COPIED: AtomicU64 = AtomicU64::new(0);
static LOG_CHECKSUM_RETRIES: AtomicU64 = AtomicU64::new(0);

// ----- Throttle -----
static THROTTLE_WAITS: AtomicU64 = AtomicU64::new(0);

// ----- Apply -----
static DELTAS_APPLIED: AtomicU64 = AtomicU64::new(0);
static DELTA_PAGES_APPLIED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Data copy
    pub files_copied: u64,
    pub files_skipped: u64,
    pub pages_read: u64,
    pub delta_pages_emitted: u64,
    pub compact_pages_skipped: u64,
    pub data_bytes_written: u64,

    // Redo log
    pub log_passes: u64,
    pub log_bytes_copied: u64,
    pub log_checksum_retries: u64,

    // Throttle
    pub throttle_waits: u64,

    // Apply
    pub deltas_applied: u64,
    pub delta_pages_applied: u64,
}

impl MetricsSnapshot {
    /// Доля страниц, попавших в delta (0.0 для полного бэкапа).
    pub fn delta_ratio(&self) -> f64 {
        if self.pages_read == 0 {
            0.0
        } else {
            self.delta_pages_emitted as f64 / self.pages_read as f64
        }
    }
}

// ----- Recorders (data copy) -----
pub fn record_file_copied() {
    FILES_COPIED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_file_skipped() {
    FILES_SKIPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_pages_read(n: usize) {
    PAGES_READ.fetch_add(n as u64, Ordering::Relaxed);
}
pub fn record_delta_page_emitted() {
    DELTA_PAGES_EMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_compact_pages_skipped(n: usize) {
    COMPACT_PAGES_SKIPPED.fetch_add(n as u64, Ordering::Relaxed);
}
pub fn record_data_bytes(n: usize) {
    DATA_BYTES_WRITTEN.fetch_add(n as u64, Ordering::Relaxed);
}

// ----- Recorders (redo log) -----
pub fn record_log_pass(bytes: usize) {
    LOG_PASSES.fetch_add(1, Ordering::Relaxed);
    LOG_BYTES_COPIED.fetch_add(bytes as u64, Ordering::Relaxed);
}
pub fn record_log_checksum_retry() {
    LOG_CHECKSUM_RETRIES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (throttle) -----
pub fn record_throttle_wait() {
    THROTTLE_WAITS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (apply) -----
pub fn record_delta_applied(pages: u64) {
    DELTAS_APPLIED.fetch_add(1, Ordering::Relaxed);
    DELTA_PAGES_APPLIED.fetch_add(pages, Ordering::Relaxed);
}

pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        files_copied: FILES_COPIED.load(Ordering::Relaxed),
        files_skipped: FILES_SKIPPED.load(Ordering::Relaxed),
        pages_read: PAGES_READ.load(Ordering::Relaxed),
        delta_pages_emitted: DELTA_PAGES_EMITTED.load(Ordering::Relaxed),
        compact_pages_skipped: COMPACT_PAGES_SKIPPED.load(Ordering::Relaxed),
        data_bytes_written: DATA_BYTES_WRITTEN.load(Ordering::Relaxed),

        log_passes: LOG_PASSES.load(Ordering::Relaxed),
        log_bytes_copied: LOG_BYTES_COPIED.load(Ordering::Relaxed),
        log_checksum_retries: LOG_CHECKSUM_RETRIES.load(Ordering::Relaxed),

        throttle_waits: THROTTLE_WAITS.load(Ordering::Relaxed),

        deltas_applied: DELTAS_APPLIED.load(Ordering::Relaxed),
        delta_pages_applied: DELTA_PAGES_APPLIED.load(Ordering::Relaxed),
    }
}

/// Сбросить все счётчики (тесты/бенчи).
pub fn metrics_reset() {
    for c in [
        &FILES_COPIED,
        &FILES_SKIPPED,
        &PAGES_READ,
        &DELTA_PAGES_EMITTED,
        &COMPACT_PAGES_SKIPPED,
        &DATA_BYTES_WRITTEN,
        &LOG_PASSES,
        &LOG_BYTES_COPIED,
        &LOG_CHECKSUM_RETRIES,
        &THROTTLE_WAITS,
        &DELTAS_APPLIED,
        &DELTA_PAGES_APPLIED,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}
