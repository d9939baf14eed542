//! delta/meta - sidecar `<file>.meta` рядом с delta-файлом.
//!
//! Формат - строки `key = value`:
//!   page_size = 16384
//!   zip_size = 0
//!   space_id = 12
//! page_size обязателен; space_id может отсутствовать (старые бэкапы) -
//! тогда сопоставление при apply идёт только по имени.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::consts::{DELTA_META_SUFFIX, DELTA_SUFFIX};
use crate::errors::format_err;
use crate::page::validate_page_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaMetadata {
    pub page_size: usize,
    /// 0 - пространство не сжато.
    pub zip_size: usize,
    pub space_id: Option<u32>,
}

impl DeltaMetadata {
    /// Физический размер страницы в delta-файле.
    pub fn physical_page_size(&self) -> usize {
        if self.zip_size != 0 {
            self.zip_size
        } else {
            self.page_size
        }
    }

    pub fn to_text(&self) -> String {
        let mut s = format!(
            "page_size = {}\nzip_size = {}\n",
            self.page_size, self.zip_size
        );
        if let Some(id) = self.space_id {
            s.push_str(&format!("space_id = {}\n", id));
        }
        s
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut page_size: Option<usize> = None;
        let mut zip_size: usize = 0;
        let mut space_id: Option<u32> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((k, v)) = line.split_once('=') else {
                return Err(format_err(format!("malformed delta metadata line {:?}", line)));
            };
            let (k, v) = (k.trim(), v.trim());
            let bad = || format_err(format!("bad value for '{}' in delta metadata: {:?}", k, v));
            match k {
                "page_size" => page_size = Some(v.parse().map_err(|_| bad())?),
                "zip_size" => zip_size = v.parse().map_err(|_| bad())?,
                "space_id" => space_id = Some(v.parse().map_err(|_| bad())?),
                _ => {}
            }
        }

        let page_size =
            page_size.ok_or_else(|| format_err("delta metadata has no page_size"))?;
        validate_page_size(page_size)?;
        if zip_size != 0 {
            validate_page_size(zip_size)?;
        }
        Ok(Self {
            page_size,
            zip_size,
            space_id,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read delta metadata {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse {}", path.display()))
    }
}

/// `db/t.ibd.delta` -> `db/t.ibd.meta`
pub fn meta_path_for_delta(delta: &Path) -> PathBuf {
    let s = delta.to_string_lossy();
    match s.strip_suffix(DELTA_SUFFIX) {
        Some(base) => PathBuf::from(format!("{}{}", base, DELTA_META_SUFFIX)),
        None => PathBuf::from(format!("{}{}", s, DELTA_META_SUFFIX)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{error_kind, ErrorKind};

    #[test]
    fn text_form() -> Result<()> {
        let m = DeltaMetadata {
            page_size: 16384,
            zip_size: 8192,
            space_id: Some(12),
        };
        assert_eq!(m.to_text(), "page_size = 16384\nzip_size = 8192\nspace_id = 12\n");
        assert_eq!(DeltaMetadata::parse(&m.to_text())?, m);
        assert_eq!(m.physical_page_size(), 8192);
        Ok(())
    }

    #[test]
    fn legacy_without_space_id() -> Result<()> {
        let m = DeltaMetadata::parse("page_size = 4096\nzip_size = 0\n")?;
        assert_eq!(m.space_id, None);
        assert_eq!(m.physical_page_size(), 4096);
        Ok(())
    }

    #[test]
    fn page_size_is_mandatory() {
        let e = DeltaMetadata::parse("zip_size = 0\nspace_id = 3\n").unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
        let e = DeltaMetadata::parse("page_size = 3000\n").unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
    }

    #[test]
    fn sidecar_path() {
        assert_eq!(
            meta_path_for_delta(Path::new("inc/db/t1.ibd.delta")),
            PathBuf::from("inc/db/t1.ibd.meta")
        );
    }
}
