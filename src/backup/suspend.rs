//! backup/suspend - протокол внешней синхронизации через файл-маркер.
//!
//! После копирования данных создаётся `<target>/xtrabackup_suspended`, и бэкап
//! ждёт (опрос раз в 200 мс), пока внешний процесс его не удалит. После
//! остановки копировщика лога маркер создаётся снова: внешний процесс может
//! снимать блокировки.

use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::io::ErrorKind as IoKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::consts::SUSPEND_FILENAME;

pub fn suspend_path(target_dir: &Path) -> PathBuf {
    target_dir.join(SUSPEND_FILENAME)
}

pub fn create_suspend_file(path: &Path) -> Result<()> {
    fs::File::create(path).with_context(|| format!("create suspend file {}", path.display()))?;
    Ok(())
}

/// Ждать, пока файл существует.
pub fn wait_while_exists(path: &Path, poll: Duration) -> Result<()> {
    info!("suspended: waiting for {} to be removed", path.display());
    loop {
        std::thread::sleep(poll);
        match fs::metadata(path) {
            Ok(_) => continue,
            Err(e) if e.kind() == IoKind::NotFound => break,
            Err(e) => {
                return Err(e).with_context(|| format!("stat suspend file {}", path.display()))
            }
        }
    }
    info!("suspended: resumed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn waits_for_removal() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "qbtest-suspend-{}-{}",
            std::process::id(),
            crate::util::now_secs()
        ));
        fs::create_dir_all(&dir)?;
        let p = suspend_path(&dir);
        create_suspend_file(&p)?;
        let remover = {
            let p = p.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(60));
                fs::remove_file(p)
            })
        };
        let start = Instant::now();
        wait_while_exists(&p, Duration::from_millis(10))?;
        assert!(start.elapsed() >= Duration::from_millis(60));
        remover.join().unwrap()?;
        Ok(())
    }
}
