//! redo - работа с redo log сервера.
//!
//! - block.rs  - поля 512-байтного блока лога, номера блоков, контрольные суммы;
//! - tailer.rs - LogTailer (проходы копирования) и фоновый копировщик.

pub mod block;
pub mod tailer;

pub use tailer::{scan_window, spawn_log_copier, window_write_size, LogTailer, WindowScan};
