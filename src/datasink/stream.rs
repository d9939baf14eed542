//! datasink/stream - все файлы бэкапа в одном выходном потоке чанков.
//!
//! Формат чанка (LE):
//! - magic "QBSTCK01" (8), flags u8, type u8 ('P' payload | 'E' eof),
//!   path_len u32, path;
//! - только для 'P': payload_len u64, offset u64, crc32 (crc32fast) u32, payload.
//!
//! Запись: каждый открытый файл кодирует чанки у себя и отдаёт их в ограниченную
//! очередь (sync_channel); единственный поток-писатель последовательно пишет их
//! в выход. Полная очередь блокирует производителя (backpressure), мьютексов на
//! пути IO нет. deinit закрывает очередь и дожидается писателя.
//!
//! Чтение: extract_stream() раскладывает поток по каталогу.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Mutex;
use std::thread::JoinHandle;

use super::{Datasink, DsFile, Pipe};
use crate::consts::{
    STREAM_CHUNK_MAGIC, STREAM_CHUNK_TYPE_EOF, STREAM_CHUNK_TYPE_PAYLOAD, STREAM_FLAG_IGNORABLE,
    STREAM_QUEUE_DEPTH,
};
use crate::errors::{format_err, io_err};

pub struct StreamSink {
    tx: Mutex<Option<SyncSender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<Result<u64>>>>,
}

impl StreamSink {
    pub fn new(out: Box<dyn Write + Send>) -> Result<Self> {
        let (tx, rx) = sync_channel::<Vec<u8>>(STREAM_QUEUE_DEPTH);
        let writer = std::thread::Builder::new()
            .name("qb-stream-writer".into())
            .spawn(move || writer_loop(out, rx))
            .context("spawn stream writer")?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }
}

fn writer_loop(mut out: Box<dyn Write + Send>, rx: Receiver<Vec<u8>>) -> Result<u64> {
    let mut total = 0u64;
    for chunk in rx {
        out.write_all(&chunk).context("write stream chunk")?;
        total += chunk.len() as u64;
    }
    out.flush().context("flush stream")?;
    debug!("stream: writer done, {} bytes", total);
    Ok(total)
}

impl Datasink for StreamSink {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn open(&self, path: &str, _size_hint: u64, _pipe: Option<Pipe<'_>>) -> Result<Box<dyn DsFile>> {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| io_err(format!("stream already closed, cannot open {}", path)))?;
        Ok(Box::new(StreamFile {
            path: path.to_string(),
            tx,
            offset: 0,
        }))
    }

    fn deinit(&self, _pipe: Option<Pipe<'_>>) -> Result<()> {
        drop(self.tx.lock().unwrap().take());
        let handle = self.writer.lock().unwrap().take();
        match handle {
            Some(h) => match h.join() {
                Ok(r) => r.map(|_| ()),
                Err(_) => Err(io_err("stream writer panicked")),
            },
            None => Ok(()),
        }
    }
}

struct StreamFile {
    path: String,
    tx: SyncSender<Vec<u8>>,
    offset: u64,
}

impl StreamFile {
    fn send(&self, chunk: Vec<u8>) -> Result<()> {
        self.tx
            .send(chunk)
            .map_err(|_| io_err(format!("stream writer is gone while writing {}", self.path)))
    }
}

impl DsFile for StreamFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let chunk = encode_payload_chunk(&self.path, self.offset, buf)?;
        self.send(chunk)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let chunk = encode_eof_chunk(&self.path)?;
        self.send(chunk)
    }
}

fn encode_head(out: &mut Vec<u8>, ty: u8, path: &str) -> io::Result<()> {
    out.extend_from_slice(STREAM_CHUNK_MAGIC);
    out.write_u8(0)?;
    out.write_u8(ty)?;
    out.write_u32::<LittleEndian>(path.len() as u32)?;
    out.extend_from_slice(path.as_bytes());
    Ok(())
}

pub fn encode_payload_chunk(path: &str, offset: u64, payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(8 + 2 + 4 + path.len() + 20 + payload.len());
    encode_head(&mut out, STREAM_CHUNK_TYPE_PAYLOAD, path)?;
    out.write_u64::<LittleEndian>(payload.len() as u64)?;
    out.write_u64::<LittleEndian>(offset)?;
    out.write_u32::<LittleEndian>(crc32fast::hash(payload))?;
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_eof_chunk(path: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(8 + 2 + 4 + path.len());
    encode_head(&mut out, STREAM_CHUNK_TYPE_EOF, path)?;
    Ok(out)
}

// -------- Extraction --------

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractStats {
    pub files: u64,
    pub chunks: u64,
    pub bytes: u64,
}

/// Прочитать magic; false - чистый конец потока на границе чанка.
fn read_magic<R: Read>(r: &mut R) -> Result<bool> {
    let mut magic = [0u8; 8];
    let mut got = 0;
    while got < magic.len() {
        let n = r.read(&mut magic[got..]).context("read stream")?;
        if n == 0 {
            if got == 0 {
                return Ok(false);
            }
            return Err(format_err("stream truncated inside chunk magic"));
        }
        got += n;
    }
    if &magic != STREAM_CHUNK_MAGIC {
        return Err(format_err("bad stream chunk magic"));
    }
    Ok(true)
}

/// Прочитать ровно `len` байт. Длина из заголовка чанка не доверенная:
/// буфер растёт по мере чтения, короткий поток - FormatError.
fn read_bounded<R: Read>(r: &mut R, len: u64, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.by_ref().take(len).read_to_end(&mut buf).context("read stream")?;
    if (buf.len() as u64) != len {
        return Err(format_err(format!(
            "stream truncated: chunk {} declares {} bytes, got {}",
            what,
            len,
            buf.len()
        )));
    }
    Ok(buf)
}

fn safe_relative(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !ok {
        return Err(format_err(format!("unsafe path in stream: {:?}", path)));
    }
    Ok(p)
}

/// Развернуть поток чанков в каталог `dest`.
pub fn extract_stream<R: Read>(mut input: R, dest: &Path) -> Result<ExtractStats> {
    let mut stats = ExtractStats::default();
    let mut open: HashMap<String, File> = HashMap::new();

    while read_magic(&mut input)? {
        let flags = input.read_u8()?;
        let ty = input.read_u8()?;
        let plen = input.read_u32::<LittleEndian>()?;
        let pbuf = read_bounded(&mut input, plen as u64, "path")?;
        let path =
            String::from_utf8(pbuf).map_err(|_| format_err("non-utf8 path in stream chunk"))?;
        stats.chunks += 1;

        match ty {
            STREAM_CHUNK_TYPE_EOF => {
                if open.remove(&path).is_none() {
                    // пустой файл: payload-чанков не было
                    create_file(dest, &path)?;
                }
                stats.files += 1;
            }
            _ => {
                let len = input.read_u64::<LittleEndian>()?;
                let offset = input.read_u64::<LittleEndian>()?;
                let crc = input.read_u32::<LittleEndian>()?;
                let payload = read_bounded(&mut input, len, "payload")
                    .with_context(|| format!("read payload of {}", path))?;
                if ty != STREAM_CHUNK_TYPE_PAYLOAD {
                    if flags & STREAM_FLAG_IGNORABLE != 0 {
                        continue;
                    }
                    return Err(format_err(format!(
                        "unknown stream chunk type 0x{:02x} for {}",
                        ty, path
                    )));
                }
                if crc32fast::hash(&payload) != crc {
                    return Err(format_err(format!(
                        "stream chunk checksum mismatch for {} at offset {}",
                        path, offset
                    )));
                }
                if !open.contains_key(&path) {
                    let f = create_file(dest, &path)?;
                    open.insert(path.clone(), f);
                }
                if let Some(f) = open.get_mut(&path) {
                    f.seek(SeekFrom::Start(offset))?;
                    f.write_all(&payload)
                        .with_context(|| format!("write {}", path))?;
                }
                stats.bytes += len;
            }
        }
    }

    if !open.is_empty() {
        let mut names: Vec<_> = open.keys().cloned().collect();
        names.sort();
        return Err(format_err(format!(
            "stream ended without eof for: {}",
            names.join(", ")
        )));
    }
    Ok(stats)
}

fn create_file(dest: &Path, path: &str) -> Result<File> {
    let full = dest.join(safe_relative(path)?);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&full)
        .with_context(|| format!("create {}", full.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasink::DatasinkChain;
    use crate::errors::{error_kind, ErrorKind};
    use std::sync::Arc;

    /// Write в общий Vec - чтобы забрать поток после teardown.
    #[derive(Clone, Default)]
    struct SharedVec(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedVec {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn tmp_root(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "qbtest-stream-{tag}-{}-{}",
            std::process::id(),
            crate::util::now_secs()
        ))
    }

    #[test]
    fn interleaved_files_extract_back() -> Result<()> {
        let out = SharedVec::default();
        let mut chain = DatasinkChain::new();
        let s = chain.add(Box::new(StreamSink::new(Box::new(out.clone()))?))?;

        let mut a = chain.open(s, "ibdata1", 0)?;
        let mut b = chain.open(s, "db/t1.ibd", 0)?;
        let empty = chain.open(s, "db/empty.ibd", 0)?;
        a.write(b"hello ")?;
        b.write(&[7u8; 3000])?;
        a.write(b"world")?;
        b.write(&[9u8; 10])?;
        empty.close()?;
        a.close()?;
        b.close()?;
        chain.teardown()?;

        let bytes = out.0.lock().unwrap().clone();
        let dest = tmp_root("extract");
        let st = extract_stream(&bytes[..], &dest)?;
        assert_eq!(st.files, 3);
        assert_eq!(st.bytes, 11 + 3010);
        assert_eq!(fs::read(dest.join("ibdata1"))?, b"hello world");
        let t1 = fs::read(dest.join("db/t1.ibd"))?;
        assert_eq!(t1.len(), 3010);
        assert_eq!(&t1[3000..], &[9u8; 10]);
        assert_eq!(fs::metadata(dest.join("db/empty.ibd"))?.len(), 0);
        Ok(())
    }

    #[test]
    fn corrupted_payload_is_format_error() -> Result<()> {
        let mut bytes = encode_payload_chunk("f", 0, b"abcdef")?;
        bytes.extend(encode_eof_chunk("f")?);
        let last_payload = bytes.len() - encode_eof_chunk("f")?.len() - 1;
        bytes[last_payload] ^= 0xFF;
        let e = extract_stream(&bytes[..], &tmp_root("crc")).unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
        Ok(())
    }

    #[test]
    fn rejects_escaping_paths() -> Result<()> {
        let mut bytes = encode_payload_chunk("../evil", 0, b"x")?;
        bytes.extend(encode_eof_chunk("../evil")?);
        let e = extract_stream(&bytes[..], &tmp_root("evil")).unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
        Ok(())
    }

    /// Заголовок чанка с огромной длиной: ошибка формата, а не попытка
    /// выделить память под заявленный размер.
    #[test]
    fn oversized_lengths_are_format_errors() -> Result<()> {
        let mut bytes = encode_payload_chunk("big", 0, b"tail")?;
        // payload_len стоит сразу за magic, flags, type, path_len и path
        let at = 8 + 2 + 4 + 3;
        bytes[at..at + 8].copy_from_slice(&(1u64 << 46).to_le_bytes());
        let e = extract_stream(&bytes[..], &tmp_root("hugelen")).unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
        assert!(format!("{:#}", e).contains("truncated"));

        let mut bytes = encode_eof_chunk("p")?;
        bytes[10..14].copy_from_slice(&u32::MAX.to_le_bytes());
        let e = extract_stream(&bytes[..], &tmp_root("hugepath")).unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
        Ok(())
    }

    #[test]
    fn stats_serialize_as_json() -> Result<()> {
        let st = ExtractStats {
            files: 2,
            chunks: 5,
            bytes: 4096,
        };
        assert_eq!(
            serde_json::to_string(&st)?,
            r#"{"files":2,"chunks":5,"bytes":4096}"#
        );
        Ok(())
    }

    #[test]
    fn missing_eof_is_reported() -> Result<()> {
        let bytes = encode_payload_chunk("half", 0, b"data")?;
        let e = extract_stream(&bytes[..], &tmp_root("noeof")).unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
        Ok(())
    }
}
