//! backup/session - общее состояние одного запуска бэкапа.
//!
//! Передаётся всем потокам (Arc): флаг копирования лога, флаг аварийной
//! остановки, LSN контрольной точки на старте и последний просканированный LSN.
//! Первая фатальная ошибка воркера сохраняется здесь; остальные воркеры видят
//! abort и останавливаются на границе батча.

use log::{debug, error};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Стадии оркестратора.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Copying,
    AwaitExternalSignal,
    Stopping,
    Stopped,
}

pub struct BackupSession {
    state: Mutex<RunState>,
    log_copying: AtomicBool,
    abort: AtomicBool,
    checkpoint_lsn_start: AtomicU64,
    scanned_lsn: AtomicU64,
    first_error: Mutex<Option<anyhow::Error>>,
}

impl Default for BackupSession {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupSession {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Init),
            log_copying: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            checkpoint_lsn_start: AtomicU64::new(0),
            scanned_lsn: AtomicU64::new(0),
            first_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, s: RunState) {
        let mut st = self.state.lock().unwrap();
        debug!("backup: {:?} -> {:?}", *st, s);
        *st = s;
    }

    pub fn start_log_copying(&self) {
        self.log_copying.store(true, Ordering::SeqCst);
    }

    pub fn stop_log_copying(&self) {
        self.log_copying.store(false, Ordering::SeqCst);
    }

    pub fn log_copying_active(&self) -> bool {
        self.log_copying.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Зафиксировать фатальную ошибку; сохраняется только первая.
    pub fn fail(&self, err: anyhow::Error) {
        error!("{:#}", err);
        self.abort.store(true, Ordering::SeqCst);
        let mut slot = self.first_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take_error(&self) -> Option<anyhow::Error> {
        self.first_error.lock().unwrap().take()
    }

    pub fn set_checkpoint_lsn_start(&self, lsn: u64) {
        self.checkpoint_lsn_start.store(lsn, Ordering::SeqCst);
    }

    pub fn checkpoint_lsn_start(&self) -> u64 {
        self.checkpoint_lsn_start.load(Ordering::SeqCst)
    }

    pub fn set_scanned_lsn(&self, lsn: u64) {
        self.scanned_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn scanned_lsn(&self) -> u64 {
        self.scanned_lsn.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn keeps_first_error() {
        let s = BackupSession::new();
        assert!(!s.aborted());
        s.fail(anyhow!("first"));
        s.fail(anyhow!("second"));
        assert!(s.aborted());
        assert_eq!(s.take_error().map(|e| e.to_string()), Some("first".into()));
        assert!(s.take_error().is_none());
    }
}
