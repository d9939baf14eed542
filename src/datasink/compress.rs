//! datasink/compress - потоковое сжатие файла (zstd или gzip) в pipe.
//!
//! К логическому пути добавляется суффикс кодека (.zst / .gz).

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

use super::{Datasink, DsFile, DsWriter, Pipe};
use crate::config::CompressKind;
use crate::consts::{GZIP_SUFFIX, ZSTD_SUFFIX};
use crate::errors::config_err;

pub struct CompressSink {
    kind: CompressKind,
    level: i32,
}

impl CompressSink {
    pub fn new(kind: CompressKind, level: Option<i32>) -> Self {
        Self {
            kind,
            level: level.unwrap_or_else(|| kind.default_level()),
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self.kind {
            CompressKind::Zstd => ZSTD_SUFFIX,
            CompressKind::Gzip => GZIP_SUFFIX,
        }
    }
}

impl Datasink for CompressSink {
    fn name(&self) -> &'static str {
        "compress"
    }

    fn needs_pipe(&self) -> bool {
        true
    }

    fn open(&self, path: &str, size_hint: u64, pipe: Option<Pipe<'_>>) -> Result<Box<dyn DsFile>> {
        let pipe = pipe.ok_or_else(|| config_err("compress datasink without pipe"))?;
        let dest = pipe.open(&format!("{}{}", path, self.suffix()), size_hint)?;
        let writer = DsWriter::new(dest);
        let enc = match self.kind {
            CompressKind::Zstd => Encoder::Zstd(
                zstd::stream::write::Encoder::new(writer, self.level)
                    .with_context(|| format!("zstd encoder for {}", path))?,
            ),
            CompressKind::Gzip => {
                let lvl = self.level.clamp(0, 9) as u32;
                Encoder::Gzip(GzEncoder::new(writer, Compression::new(lvl)))
            }
        };
        Ok(Box::new(CompressFile {
            path: path.to_string(),
            enc,
        }))
    }
}

enum Encoder {
    Zstd(zstd::stream::write::Encoder<'static, DsWriter>),
    Gzip(GzEncoder<DsWriter>),
}

struct CompressFile {
    path: String,
    enc: Encoder,
}

impl DsFile for CompressFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let r = match &mut self.enc {
            Encoder::Zstd(e) => e.write_all(buf),
            Encoder::Gzip(e) => e.write_all(buf),
        };
        r.with_context(|| format!("compress {}", self.path))
    }

    fn close(self: Box<Self>) -> Result<()> {
        let CompressFile { path, enc } = *self;
        let inner = match enc {
            Encoder::Zstd(e) => e.finish(),
            Encoder::Gzip(e) => e.finish(),
        }
        .with_context(|| format!("finish compression of {}", path))?;
        inner.into_inner().close()
    }
}
