//! datasink - композиционная цепочка выходных узлов бэкапа.
//!
//! Разделение:
//! - local.rs    - запись файлов в целевой каталог (терминальный узел);
//! - stream.rs   - один выходной поток из чанков (терминальный узел) + распаковка потока;
//! - compress.rs - сжатие zstd/gzip, результат уходит в pipe;
//! - buffer.rs   - буфер фиксированного размера перед pipe;
//! - tmpfile.rs  - реле через временные файлы: пишет локально, переигрывает в pipe при teardown.
//!
//! Модель владения:
//! - DatasinkChain - единственный владелец всех узлов; узлы добавляются снизу вверх
//!   (сначала терминальные), pipe - это NodeId уже добавленного узла, поэтому граф
//!   ацикличен по построению.
//! - Файлы (DsFile) узла с pipe владеют файлом downstream-узла (хэндл, не узел).
//! - teardown() обходит узлы в порядке, обратном построению: источники раньше стоков,
//!   так что буферизующие узлы успевают дописать всё в ещё живой downstream.

use anyhow::Result;
use log::{debug, warn};
use std::io;

use crate::errors::config_err;

pub mod buffer;
pub mod compress;
pub mod local;
pub mod stream;
pub mod tmpfile;

pub use buffer::BufferSink;
pub use compress::CompressSink;
pub use local::LocalSink;
pub use stream::{extract_stream, StreamSink};
pub use tmpfile::TmpfileSink;

/// Открытый файл узла цепочки.
pub trait DsFile: Send {
    /// Логический путь (относительно корня бэкапа), с которым файл был открыт.
    fn path(&self) -> &str;
    fn write(&mut self, buf: &[u8]) -> Result<()>;
    /// Закрыть файл; буферизующие узлы обязаны дописать всё в downstream.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Узел цепочки.
pub trait Datasink: Send + Sync {
    fn name(&self) -> &'static str;

    /// true - узел пишет только через pipe (compress, buffer, tmpfile).
    fn needs_pipe(&self) -> bool {
        false
    }

    fn open(&self, path: &str, size_hint: u64, pipe: Option<Pipe<'_>>) -> Result<Box<dyn DsFile>>;

    /// Освобождение узла; вызывается ровно один раз из DatasinkChain::teardown.
    fn deinit(&self, _pipe: Option<Pipe<'_>>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Невладеющая ссылка на downstream-узел.
#[derive(Clone, Copy)]
pub struct Pipe<'a> {
    chain: &'a DatasinkChain,
    id: NodeId,
}

impl<'a> Pipe<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn open(&self, path: &str, size_hint: u64) -> Result<Box<dyn DsFile>> {
        self.chain.open(self.id, path, size_hint)
    }
}

struct Node {
    sink: Box<dyn Datasink>,
    pipe: Option<NodeId>,
}

pub struct DatasinkChain {
    nodes: Vec<Node>,
    torn_down: bool,
}

impl Default for DatasinkChain {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasinkChain {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            torn_down: false,
        }
    }

    /// Добавить терминальный узел.
    pub fn add(&mut self, sink: Box<dyn Datasink>) -> Result<NodeId> {
        if sink.needs_pipe() {
            return Err(config_err(format!(
                "datasink '{}' requires a downstream pipe",
                sink.name()
            )));
        }
        self.nodes.push(Node { sink, pipe: None });
        Ok(NodeId(self.nodes.len() - 1))
    }

    /// Добавить узел, пишущий в уже существующий `pipe`.
    pub fn add_piped(&mut self, sink: Box<dyn Datasink>, pipe: NodeId) -> Result<NodeId> {
        if pipe.0 >= self.nodes.len() {
            return Err(config_err(format!(
                "datasink '{}': pipe node #{} does not exist",
                sink.name(),
                pipe.0
            )));
        }
        self.nodes.push(Node {
            sink,
            pipe: Some(pipe),
        });
        Ok(NodeId(self.nodes.len() - 1))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn name(&self, id: NodeId) -> &'static str {
        self.nodes[id.0].sink.name()
    }

    /// Число узлов от `id` до терминального включительно.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut d = 1;
        let mut cur = self.nodes[id.0].pipe;
        while let Some(next) = cur {
            d += 1;
            cur = self.nodes[next.0].pipe;
        }
        d
    }

    fn pipe_of(&self, id: NodeId) -> Option<Pipe<'_>> {
        self.nodes[id.0].pipe.map(|p| Pipe { chain: self, id: p })
    }

    pub fn open(&self, id: NodeId, path: &str, size_hint: u64) -> Result<Box<dyn DsFile>> {
        let node = &self.nodes[id.0];
        debug!("datasink[{}]: open {}", node.sink.name(), path);
        node.sink.open(path, size_hint, self.pipe_of(id))
    }

    /// Разобрать цепочку: от источников к стокам. Возвращает первую ошибку,
    /// но остальные узлы всё равно освобождаются.
    pub fn teardown(mut self) -> Result<()> {
        self.teardown_inner()
    }

    fn teardown_inner(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let mut first_err: Option<anyhow::Error> = None;
        for idx in (0..self.nodes.len()).rev() {
            let id = NodeId(idx);
            let name = self.nodes[idx].sink.name();
            debug!("datasink[{}]: deinit", name);
            if let Err(e) = self.nodes[idx].sink.deinit(self.pipe_of(id)) {
                warn!("datasink[{}]: deinit failed: {:#}", name, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for DatasinkChain {
    fn drop(&mut self) {
        if !self.torn_down {
            if let Err(e) = self.teardown_inner() {
                warn!("datasink chain dropped without teardown: {:#}", e);
            }
        }
    }
}

/// io::Write поверх DsFile - для кодеков (zstd/flate2), пишущих в downstream.
pub struct DsWriter {
    inner: Box<dyn DsFile>,
}

impl DsWriter {
    pub fn new(inner: Box<dyn DsFile>) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> Box<dyn DsFile> {
        self.inner
    }
}

impl io::Write for DsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .write(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:#}", e)))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Записать весь буфер и закрыть файл (метаданные, sidecar'ы).
pub fn write_whole(chain: &DatasinkChain, id: NodeId, path: &str, bytes: &[u8]) -> Result<()> {
    let mut f = chain.open(id, path, bytes.len() as u64)?;
    if let Err(e) = f.write(bytes) {
        let _ = f.close();
        return Err(e);
    }
    f.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{error_kind, ErrorKind};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    fn unique_root(prefix: &str) -> PathBuf {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "qbtest-ds-{prefix}-{}-{}-{id}",
            std::process::id(),
            crate::util::now_secs()
        ))
    }

    #[test]
    fn pipe_required_nodes_rejected_as_terminal() {
        let mut chain = DatasinkChain::new();
        let e = chain.add(Box::new(BufferSink::new(16))).unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Config));
        let e = chain
            .add_piped(Box::new(BufferSink::new(16)), NodeId(5))
            .unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Config));
    }

    #[test]
    fn depth_follows_pipes() -> Result<()> {
        let root = unique_root("depth");
        let mut chain = DatasinkChain::new();
        let local = chain.add(Box::new(LocalSink::new(&root)))?;
        let buf = chain.add_piped(Box::new(BufferSink::new(64)), local)?;
        let buf2 = chain.add_piped(Box::new(BufferSink::new(32)), buf)?;
        assert_eq!(chain.depth(local), 1);
        assert_eq!(chain.depth(buf2), 3);
        chain.teardown()?;
        Ok(())
    }

    #[test]
    fn write_whole_lands_on_disk() -> Result<()> {
        let root = unique_root("whole");
        let mut chain = DatasinkChain::new();
        let local = chain.add(Box::new(LocalSink::new(&root)))?;
        write_whole(&chain, local, "a/b/meta.txt", b"k = v\n")?;
        chain.teardown()?;
        assert_eq!(std::fs::read(root.join("a/b/meta.txt"))?, b"k = v\n");
        Ok(())
    }
}
