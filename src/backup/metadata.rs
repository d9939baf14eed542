//! backup/metadata - файл `xtrabackup_checkpoints`.
//!
//!   backup_type = full-backuped | incremental | full-prepared
//!   from_lsn = N
//!   to_lsn = N
//!   last_lsn = N

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::consts::{BACKUP_TYPE_FULL, BACKUP_TYPE_INCREMENTAL, BACKUP_TYPE_PREPARED, METADATA_FILENAME};
use crate::errors::format_err;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupType {
    FullBackuped,
    Incremental,
    FullPrepared,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::FullBackuped => BACKUP_TYPE_FULL,
            BackupType::Incremental => BACKUP_TYPE_INCREMENTAL,
            BackupType::FullPrepared => BACKUP_TYPE_PREPARED,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            BACKUP_TYPE_FULL => Ok(BackupType::FullBackuped),
            BACKUP_TYPE_INCREMENTAL => Ok(BackupType::Incremental),
            BACKUP_TYPE_PREPARED => Ok(BackupType::FullPrepared),
            other => Err(format_err(format!("unknown backup_type '{}'", other))),
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackupMetadata {
    pub backup_type: BackupType,
    pub from_lsn: u64,
    pub to_lsn: u64,
    pub last_lsn: u64,
}

impl BackupMetadata {
    pub fn to_text(&self) -> String {
        format!(
            "backup_type = {}\nfrom_lsn = {}\nto_lsn = {}\nlast_lsn = {}\n",
            self.backup_type, self.from_lsn, self.to_lsn, self.last_lsn
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut backup_type = None;
        let mut from_lsn = None;
        let mut to_lsn = None;
        let mut last_lsn = None;
        for line in text.lines() {
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            let (k, v) = (k.trim(), v.trim());
            let num = || -> Result<u64> {
                v.parse()
                    .map_err(|_| format_err(format!("bad value for '{}': {:?}", k, v)))
            };
            match k {
                "backup_type" => backup_type = Some(BackupType::parse(v)?),
                "from_lsn" => from_lsn = Some(num()?),
                "to_lsn" => to_lsn = Some(num()?),
                "last_lsn" => last_lsn = Some(num()?),
                _ => {}
            }
        }
        let missing = |k: &str| format_err(format!("backup metadata has no {}", k));
        Ok(Self {
            backup_type: backup_type.ok_or_else(|| missing("backup_type"))?,
            from_lsn: from_lsn.ok_or_else(|| missing("from_lsn"))?,
            to_lsn: to_lsn.ok_or_else(|| missing("to_lsn"))?,
            last_lsn: last_lsn.ok_or_else(|| missing("last_lsn"))?,
        })
    }

    /// Прочитать `<dir>/xtrabackup_checkpoints`.
    pub fn read_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILENAME);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse {}", path.display()))
    }

    /// Записать `<dir>/xtrabackup_checkpoints` обычным файлом.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
        let path = dir.join(METADATA_FILENAME);
        std::fs::write(&path, self.to_text()).with_context(|| format!("write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{error_kind, ErrorKind};

    #[test]
    fn text_form() -> Result<()> {
        let m = BackupMetadata {
            backup_type: BackupType::Incremental,
            from_lsn: 1000,
            to_lsn: 2000,
            last_lsn: 2100,
        };
        let text = m.to_text();
        assert_eq!(
            text,
            "backup_type = incremental\nfrom_lsn = 1000\nto_lsn = 2000\nlast_lsn = 2100\n"
        );
        assert_eq!(BackupMetadata::parse(&text)?, m);
        Ok(())
    }

    #[test]
    fn missing_or_bad_fields() {
        let e = BackupMetadata::parse("backup_type = full-backuped\nfrom_lsn = 0\n").unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
        let e = BackupMetadata::parse("backup_type = weird\n").unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
    }
}
