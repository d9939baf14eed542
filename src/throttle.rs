//! throttle - грубое ограничение IO по «талонам».
//!
//! Один наблюдатель раз в секунду сбрасывает счётчик талонов в `rate` и будит
//! ждущих; каждая дросселируемая операция (чтение батча страниц, чтение окна
//! лога) уменьшает счётчик и, уйдя в минус, ждёт следующего сброса.
//! При остановке (disable) все ждущие отпускаются немедленно.
//!
//! Блокировка - только на Condvar, IO под мьютексом не выполняется.

use log::debug;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::metrics::record_throttle_wait;

struct TicketState {
    tickets: i64,
    /// Номер «эпохи» сброса - ждущий просыпается, когда эпоха сменилась.
    epoch: u64,
    enabled: bool,
}

pub struct IoThrottle {
    rate: u64,
    state: Mutex<TicketState>,
    cv: Condvar,
}

impl IoThrottle {
    /// rate == 0 - дросселирование выключено.
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            state: Mutex::new(TicketState {
                tickets: rate as i64,
                epoch: 0,
                enabled: rate > 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    /// Взять один талон; при исчерпании ждать сброса или выключения.
    pub fn acquire(&self) {
        let mut st = self.state.lock().unwrap();
        if !st.enabled {
            return;
        }
        st.tickets -= 1;
        if st.tickets >= 0 {
            return;
        }
        record_throttle_wait();
        let epoch = st.epoch;
        while st.enabled && st.epoch == epoch {
            st = self.cv.wait(st).unwrap();
        }
    }

    /// Сброс счётчика (вызывается наблюдателем раз в период).
    pub fn refill(&self) {
        let mut st = self.state.lock().unwrap();
        st.tickets = self.rate as i64;
        st.epoch = st.epoch.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Выключить дросселирование и отпустить всех ждущих.
    pub fn disable(&self) {
        let mut st = self.state.lock().unwrap();
        st.enabled = false;
        self.cv.notify_all();
    }

    /// Цикл наблюдателя: сбрасывает талоны каждые `period`, пока `active()`.
    /// По выходу выключает дросселирование.
    pub fn watch<F: Fn() -> bool>(&self, period: Duration, active: F) {
        debug!("throttle: watcher started, rate={}/s", self.rate);
        while active() {
            std::thread::sleep(period);
            self.refill();
        }
        self.disable();
        debug!("throttle: watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn disabled_never_blocks() {
        let t = IoThrottle::disabled();
        for _ in 0..10_000 {
            t.acquire();
        }
        assert!(!t.is_enabled());
    }

    #[test]
    fn blocks_until_refill() {
        let t = Arc::new(IoThrottle::new(2));
        let done = Arc::new(AtomicUsize::new(0));
        let h = {
            let t = t.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                for _ in 0..3 {
                    t.acquire();
                    done.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        // Два талона прошли, третий ждёт
        assert_eq!(done.load(Ordering::SeqCst), 2);
        t.refill();
        h.join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn disable_releases_waiters() {
        let t = Arc::new(IoThrottle::new(1));
        t.acquire();
        let h = {
            let t = t.clone();
            std::thread::spawn(move || t.acquire())
        };
        std::thread::sleep(Duration::from_millis(50));
        t.disable();
        h.join().unwrap();
    }

    #[test]
    fn watcher_refills_and_stops() {
        let t = Arc::new(IoThrottle::new(1));
        let active = Arc::new(AtomicBool::new(true));
        let w = {
            let t = t.clone();
            let active = active.clone();
            std::thread::spawn(move || {
                t.watch(Duration::from_millis(20), || active.load(Ordering::SeqCst))
            })
        };
        let start = Instant::now();
        for _ in 0..4 {
            t.acquire();
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
        active.store(false, Ordering::SeqCst);
        w.join().unwrap();
        assert!(!t.is_enabled());
    }
}
