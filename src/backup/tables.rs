//! backup/tables - фильтр таблиц по имени.
//!
//! - regex-шаблоны (--tables) ищутся в "db.table"; файл проходит, если совпал хотя бы один;
//! - файл со списком (--tables-file): точные имена "db/table", по одному в строке.
//! Если заданы оба - файл должен пройти оба. Системное пространство не фильтруется.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

use crate::errors::config_err;
use crate::source::TablespaceFile;

#[derive(Default)]
pub struct TableFilter {
    patterns: Vec<Regex>,
    names: Option<HashSet<String>>,
}

impl TableFilter {
    pub fn new(patterns: &[String], tables_file: Option<&Path>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for p in patterns {
            let re = Regex::new(p)
                .map_err(|e| config_err(format!("invalid table regex '{}': {}", p, e)))?;
            compiled.push(re);
        }
        let names = match tables_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read tables file {}", path.display()))?;
                Some(
                    text.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect(),
                )
            }
            None => None,
        };
        Ok(Self {
            patterns: compiled,
            names,
        })
    }

    pub fn is_active(&self) -> bool {
        !self.patterns.is_empty() || self.names.is_some()
    }

    pub fn is_skipped(&self, ts: &TablespaceFile) -> bool {
        if !self.is_active() || ts.is_system() {
            return false;
        }
        let Some((db, table)) = ts.db_table() else {
            return false;
        };
        if !self.patterns.is_empty() {
            let dotted = format!("{}.{}", db, table);
            if !self.patterns.iter().any(|re| re.is_match(&dotted)) {
                return true;
            }
        }
        if let Some(names) = &self.names {
            if !names.contains(&format!("{}/{}", db, table)) {
                return true;
            }
        }
        false
    }
}
