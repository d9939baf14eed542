//! datasink/buffer - накопление записей до фиксированного размера перед pipe.

use anyhow::Result;

use super::{Datasink, DsFile, Pipe};
use crate::errors::config_err;

pub struct BufferSink {
    size: usize,
}

impl BufferSink {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }
}

impl Datasink for BufferSink {
    fn name(&self) -> &'static str {
        "buffer"
    }

    fn needs_pipe(&self) -> bool {
        true
    }

    fn open(&self, path: &str, size_hint: u64, pipe: Option<Pipe<'_>>) -> Result<Box<dyn DsFile>> {
        let pipe = pipe.ok_or_else(|| config_err("buffer datasink without pipe"))?;
        let dest = pipe.open(path, size_hint)?;
        Ok(Box::new(BufferFile {
            path: path.to_string(),
            dest,
            buf: Vec::with_capacity(self.size),
            cap: self.size,
        }))
    }
}

struct BufferFile {
    path: String,
    dest: Box<dyn DsFile>,
    buf: Vec<u8>,
    cap: usize,
}

impl BufferFile {
    fn flush_buf(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.dest.write(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

impl DsFile for BufferFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.buf.len() + data.len() > self.cap {
            self.flush_buf()?;
        }
        // Крупная запись уходит мимо буфера
        if data.len() >= self.cap {
            return self.dest.write(data);
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let flushed = self.flush_buf();
        let closed = self.dest.close();
        flushed.and(closed)
    }
}
