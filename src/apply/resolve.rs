//! apply/resolve - какой файл табличного пространства получит страницы delta.
//!
//! Порядок:
//! 1) системное пространство - только по имени;
//! 2) совпало имя и id (или id неизвестен) - этот файл;
//! 3) совпало имя, id другой - файл уходит в `<db>/xtrabackup_tmp_#<old_id>.ibd`;
//! 4) совпал id под другим именем - файл переименовывается в ожидаемое имя;
//! 5) иначе - создаётся новый файл (zip_size из метаданных).

use anyhow::Result;
use log::info;
use serde::Serialize;

use crate::consts::{APPLY_TMP_PREFIX, TABLESPACE_EXT};
use crate::errors::{format_err, io_err};
use crate::page::is_system_space;
use crate::source::{TablespaceFile, TablespaceRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Existing,
    RenamedFrom(String),
    Created,
}

#[derive(Debug, Clone)]
pub struct Destination {
    pub ts: TablespaceFile,
    pub resolution: Resolution,
    /// Куда был отодвинут файл с тем же именем и чужим id.
    pub moved_aside: Option<String>,
}

/// Имя, под которое отодвигается файл `name` с id `old_id`.
pub fn aside_name(name: &str, old_id: u32) -> String {
    match name.rsplit_once('/') {
        Some((db, _)) => format!("{}/{}{}.{}", db, APPLY_TMP_PREFIX, old_id, TABLESPACE_EXT),
        None => format!("{}{}.{}", APPLY_TMP_PREFIX, old_id, TABLESPACE_EXT),
    }
}

/// `space_id` - из .meta; `first_page_space` - id первой страницы delta
/// (используется, когда в .meta id нет и имя не нашлось).
pub fn resolve_destination(
    registry: &mut dyn TablespaceRegistry,
    name: &str,
    space_id: Option<u32>,
    first_page_space: Option<u32>,
    zip_size: usize,
) -> Result<Destination> {
    let by_name = registry.find_by_name(name);

    if space_id.map_or(false, is_system_space) {
        return match by_name {
            Some(ts) => Ok(Destination {
                ts,
                resolution: Resolution::Existing,
                moved_aside: None,
            }),
            None => Err(io_err(format!("system tablespace file {} not found", name))),
        };
    }

    let mut moved_aside = None;
    if let Some(ts) = by_name {
        match space_id {
            None => {
                return Ok(Destination {
                    ts,
                    resolution: Resolution::Existing,
                    moved_aside: None,
                })
            }
            Some(id) if id == ts.space_id => {
                return Ok(Destination {
                    ts,
                    resolution: Resolution::Existing,
                    moved_aside: None,
                })
            }
            Some(_) => {
                let aside = aside_name(name, ts.space_id);
                info!("apply: renaming {} to {}", ts.name, aside);
                registry.rename(&ts, &aside)?;
                moved_aside = Some(aside);
            }
        }
    }

    let id = space_id.or(first_page_space).ok_or_else(|| {
        format_err(format!(
            "{}: delta has no space_id and no pages to take it from",
            name
        ))
    })?;
    if is_system_space(id) {
        return Err(format_err(format!(
            "{}: system space pages under a per-table name",
            name
        )));
    }

    if let Some(ts) = registry.find_by_id(id) {
        info!("apply: renaming {} to {}", ts.name, name);
        let from = ts.name.clone();
        let ts = registry.rename(&ts, name)?;
        return Ok(Destination {
            ts,
            resolution: Resolution::RenamedFrom(from),
            moved_aside,
        });
    }

    let ts = registry.create(name, id, zip_size)?;
    Ok(Destination {
        ts,
        resolution: Resolution::Created,
        moved_aside,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aside_names() {
        assert_eq!(aside_name("shop/orders.ibd", 7), "shop/xtrabackup_tmp_#7.ibd");
        assert_eq!(aside_name("t.ibd", 9), "xtrabackup_tmp_#9.ibd");
    }
}
