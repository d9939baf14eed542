//! delta - бинарный формат инкрементальных delta-файлов.
//!
//! Delta-файл - последовательность кластеров без выравнивания между ними.
//! Кластер:
//! - заголовочная страница (page_size байт): тег u32 BE ("xtra" - дальше есть
//!   кластеры, "XTRA" - последний), затем C = page_size/4 - 1 слотов u32 BE с
//!   номерами страниц; неиспользуемые слоты = 0xFFFFFFFF;
//! - затем сами страницы кластера подряд (ровно C для "xtra", n <= C для "XTRA").
//!
//! Кластер "xtra" всегда полон; терминатор (sentinel) встречается только в
//! последнем кластере. Поток из 0 страниц - один пустой кластер "XTRA".
//!
//! Запись - ClusterWriter (буфер на C+1 страниц, используется фильтром),
//! чтение - DeltaReader (потоково, по кластеру).

use anyhow::{Context, Result};
use byteorder::{BigEndian, ByteOrder};
use std::io::Read;

use crate::consts::{DELTA_SENTINEL, DELTA_TAG_LAST, DELTA_TAG_MORE};
use crate::errors::format_err;
use crate::page::validate_page_size;
use crate::util::AlignedBuffer;

pub mod meta;

pub use meta::{meta_path_for_delta, DeltaMetadata};

/// Число слотов карты страниц в кластере.
#[inline]
pub fn cluster_capacity(page_size: usize) -> usize {
    page_size / 4 - 1
}

/// Декодированный кластер.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaCluster {
    pub last: bool,
    pub pages: Vec<(u32, Vec<u8>)>,
}

fn write_header(header: &mut [u8], last: bool, page_nos: &[u32]) {
    let tag = if last { DELTA_TAG_LAST } else { DELTA_TAG_MORE };
    BigEndian::write_u32(&mut header[0..4], tag);
    let cap = cluster_capacity(header.len());
    for slot in 0..cap {
        let v = page_nos.get(slot).copied().unwrap_or(DELTA_SENTINEL);
        BigEndian::write_u32(&mut header[4 + slot * 4..8 + slot * 4], v);
    }
}

/// Заголовок кластера: тег + номера страниц до терминатора.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHeader {
    pub last: bool,
    pub page_nos: Vec<u32>,
}

/// Разобрать заголовочную страницу кластера.
pub fn parse_header(header: &[u8]) -> Result<ClusterHeader> {
    let page_size = header.len();
    let cap = cluster_capacity(page_size);
    let last = match BigEndian::read_u32(&header[0..4]) {
        DELTA_TAG_MORE => false,
        DELTA_TAG_LAST => true,
        other => {
            return Err(format_err(format!(
                "unrecognized delta cluster tag 0x{:08x}",
                other
            )))
        }
    };
    let mut page_nos = Vec::new();
    for slot in 0..cap {
        let v = BigEndian::read_u32(&header[4 + slot * 4..8 + slot * 4]);
        if v == DELTA_SENTINEL {
            break;
        }
        page_nos.push(v);
    }
    if !last && page_nos.len() != cap {
        return Err(format_err(format!(
            "non-final delta cluster holds {} of {} pages",
            page_nos.len(),
            cap
        )));
    }
    Ok(ClusterHeader { last, page_nos })
}

/// Закодировать кластер целиком.
pub fn encode_cluster(page_size: usize, cluster: &DeltaCluster) -> Result<Vec<u8>> {
    validate_page_size(page_size)?;
    let cap = cluster_capacity(page_size);
    let n = cluster.pages.len();
    if n > cap {
        return Err(format_err(format!(
            "delta cluster overflow: {} pages, capacity {}",
            n, cap
        )));
    }
    if !cluster.last && n != cap {
        return Err(format_err("non-final delta cluster must be full"));
    }
    let mut out = vec![0u8; (n + 1) * page_size];
    let nos: Vec<u32> = cluster.pages.iter().map(|(no, _)| *no).collect();
    write_header(&mut out[..page_size], cluster.last, &nos);
    for (i, (no, bytes)) in cluster.pages.iter().enumerate() {
        if bytes.len() != page_size {
            return Err(format_err(format!(
                "page {} has {} bytes, expected {}",
                no,
                bytes.len(),
                page_size
            )));
        }
        out[(i + 1) * page_size..(i + 2) * page_size].copy_from_slice(bytes);
    }
    Ok(out)
}

/// Декодировать один кластер из начала `bytes`; возвращает кластер и число
/// прочитанных байт.
pub fn decode_cluster(page_size: usize, bytes: &[u8]) -> Result<(DeltaCluster, usize)> {
    validate_page_size(page_size)?;
    if bytes.len() < page_size {
        return Err(format_err("delta truncated inside cluster header"));
    }
    let hdr = parse_header(&bytes[..page_size])?;
    let used = (hdr.page_nos.len() + 1) * page_size;
    if bytes.len() < used {
        return Err(format_err("delta truncated inside cluster pages"));
    }
    let pages = hdr
        .page_nos
        .iter()
        .enumerate()
        .map(|(i, no)| (*no, bytes[(i + 1) * page_size..(i + 2) * page_size].to_vec()))
        .collect();
    Ok((
        DeltaCluster {
            last: hdr.last,
            pages,
        },
        used,
    ))
}

/// Закодировать поток страниц целиком (кластеры "xtra"... + "XTRA").
/// Раскладка та же, что у ClusterWriter: ровно полный хвост сам становится
/// "XTRA", пустой "XTRA" бывает только у пустого потока.
pub fn encode_stream(page_size: usize, pages: &[(u32, Vec<u8>)]) -> Result<Vec<u8>> {
    let cap = cluster_capacity(page_size);
    let mut out = Vec::new();
    let mut rest = pages;
    loop {
        let take = rest.len().min(cap);
        let last = rest.len() <= cap;
        let cluster = DeltaCluster {
            last,
            pages: rest[..take].to_vec(),
        };
        out.extend(encode_cluster(page_size, &cluster)?);
        rest = &rest[take..];
        if last {
            return Ok(out);
        }
    }
}

/// Накопитель кластера для записи: буфер на заголовок + C страниц.
pub struct ClusterWriter {
    page_size: usize,
    cap: usize,
    buf: AlignedBuffer,
    page_nos: Vec<u32>,
}

impl ClusterWriter {
    pub fn new(page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let cap = cluster_capacity(page_size);
        let buf = AlignedBuffer::zeroed(page_size, (cap + 1) * page_size)?;
        Ok(Self {
            page_size,
            cap,
            buf,
            page_nos: Vec::with_capacity(cap),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.page_nos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.page_nos.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.page_nos.len() == self.cap
    }

    /// Добавить страницу; кластер не должен быть полным.
    pub fn push(&mut self, page_no: u32, page: &[u8]) -> Result<()> {
        if self.is_full() {
            return Err(format_err("delta cluster overflow"));
        }
        let i = self.page_nos.len() + 1;
        self.buf[i * self.page_size..(i + 1) * self.page_size].copy_from_slice(page);
        self.page_nos.push(page_no);
        Ok(())
    }

    /// Проставить тег и карту страниц; вернуть готовые байты кластера.
    pub fn seal(&mut self, last: bool) -> &[u8] {
        let ps = self.page_size;
        write_header(&mut self.buf[..ps], last, &self.page_nos);
        &self.buf[..(self.page_nos.len() + 1) * ps]
    }

    pub fn reset(&mut self) {
        self.page_nos.clear();
    }
}

/// Потоковое чтение delta-файла по кластерам.
pub struct DeltaReader<R: Read> {
    inner: R,
    page_size: usize,
    header: Vec<u8>,
    done: bool,
    clusters: u64,
}

impl<R: Read> DeltaReader<R> {
    pub fn new(inner: R, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self {
            inner,
            page_size,
            header: vec![0u8; page_size],
            done: false,
            clusters: 0,
        })
    }

    pub fn clusters_read(&self) -> u64 {
        self.clusters
    }

    /// Прочитать следующий кластер: заголовок возвращается, страницы кладутся
    /// подряд в `pages`. None - после кластера "XTRA".
    pub fn next_cluster_into(&mut self, pages: &mut Vec<u8>) -> Result<Option<ClusterHeader>> {
        if self.done {
            return Ok(None);
        }
        self.inner.read_exact(&mut self.header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                format_err(format!(
                    "delta ended after {} clusters without a final cluster",
                    self.clusters
                ))
            } else {
                anyhow::Error::new(e).context("read delta cluster header")
            }
        })?;
        let hdr = parse_header(&self.header)?;
        pages.resize(hdr.page_nos.len() * self.page_size, 0);
        self.inner.read_exact(pages).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                format_err("delta truncated inside cluster pages")
            } else {
                anyhow::Error::new(e).context("read delta cluster pages")
            }
        })?;
        self.clusters += 1;
        if hdr.last {
            self.done = true;
        }
        Ok(Some(hdr))
    }

    pub fn next_cluster(&mut self) -> Result<Option<DeltaCluster>> {
        let mut pages = Vec::new();
        let ps = self.page_size;
        Ok(self.next_cluster_into(&mut pages)?.map(|hdr| DeltaCluster {
            last: hdr.last,
            pages: hdr
                .page_nos
                .iter()
                .enumerate()
                .map(|(i, no)| (*no, pages[i * ps..(i + 1) * ps].to_vec()))
                .collect(),
        }))
    }
}

/// Сводка по delta-файлу (inspect-delta).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeltaSummary {
    pub page_size: usize,
    pub clusters: u64,
    pub pages: u64,
    pub min_page_no: Option<u32>,
    pub max_page_no: Option<u32>,
}

pub fn summarize<R: Read>(input: R, page_size: usize) -> Result<DeltaSummary> {
    let mut rd = DeltaReader::new(input, page_size)?;
    let mut sum = DeltaSummary {
        page_size,
        ..Default::default()
    };
    let mut pages = Vec::new();
    while let Some(hdr) = rd.next_cluster_into(&mut pages).context("scan delta")? {
        sum.clusters += 1;
        sum.pages += hdr.page_nos.len() as u64;
        for no in hdr.page_nos {
            sum.min_page_no = Some(sum.min_page_no.map_or(no, |m| m.min(no)));
            sum.max_page_no = Some(sum.max_page_no.map_or(no, |m| m.max(no)));
        }
    }
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{error_kind, ErrorKind};

    const PS: usize = 1024;

    fn page(no: u32) -> Vec<u8> {
        crate::page::build_page(PS, 7, no, 100 + no as u64, (no % 200) as u8)
    }

    #[test]
    fn capacity() {
        assert_eq!(cluster_capacity(16384), 4095);
        assert_eq!(cluster_capacity(PS), 255);
    }

    #[test]
    fn empty_stream_is_single_last_cluster() -> Result<()> {
        let bytes = encode_stream(PS, &[])?;
        assert_eq!(bytes.len(), PS);
        assert_eq!(BigEndian::read_u32(&bytes[0..4]), DELTA_TAG_LAST);
        assert_eq!(BigEndian::read_u32(&bytes[4..8]), DELTA_SENTINEL);
        Ok(())
    }

    #[test]
    fn exactly_full_stream_is_one_last_cluster() -> Result<()> {
        let cap = cluster_capacity(PS) as u32;
        let pages: Vec<_> = (0..cap).map(|n| (n, page(n))).collect();
        let bytes = encode_stream(PS, &pages)?;
        assert_eq!(bytes.len(), (cap as usize + 1) * PS);
        let mut rd = DeltaReader::new(&bytes[..], PS)?;
        let c1 = rd.next_cluster()?.unwrap();
        assert!(c1.last);
        assert_eq!(c1.pages.len(), cap as usize);
        assert!(rd.next_cluster()?.is_none());

        // байт в байт как у ClusterWriter
        let mut w = ClusterWriter::new(PS)?;
        for (no, p) in &pages {
            w.push(*no, p)?;
        }
        assert_eq!(w.seal(true), &bytes[..]);
        Ok(())
    }

    #[test]
    fn writer_matches_encoder() -> Result<()> {
        let mut w = ClusterWriter::new(PS)?;
        w.push(3, &page(3))?;
        w.push(9, &page(9))?;
        let sealed = w.seal(true).to_vec();
        let expected = encode_cluster(
            PS,
            &DeltaCluster {
                last: true,
                pages: vec![(3, page(3)), (9, page(9))],
            },
        )?;
        assert_eq!(sealed, expected);
        let (c, used) = decode_cluster(PS, &sealed)?;
        assert_eq!(used, 3 * PS);
        assert_eq!(c.pages[1].0, 9);
        Ok(())
    }

    #[test]
    fn bad_tag_and_short_more_cluster() -> Result<()> {
        let mut bytes = encode_stream(PS, &[(1, page(1))])?;
        BigEndian::write_u32(&mut bytes[0..4], 0xDEAD_BEEF);
        let e = decode_cluster(PS, &bytes).unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));

        BigEndian::write_u32(&mut bytes[0..4], DELTA_TAG_MORE);
        let e = DeltaReader::new(&bytes[..], PS)?.next_cluster().unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
        Ok(())
    }

    #[test]
    fn missing_final_cluster_is_format_error() -> Result<()> {
        let cap = cluster_capacity(PS) as u32;
        let pages: Vec<_> = (0..cap + 1).map(|n| (n, page(n))).collect();
        let mut bytes = encode_stream(PS, &pages)?;
        // полный "xtra" без хвостового "XTRA" с одной страницей
        bytes.truncate((cap as usize + 1) * PS);
        let mut rd = DeltaReader::new(&bytes[..], PS)?;
        assert!(rd.next_cluster()?.is_some());
        let e = rd.next_cluster().unwrap_err();
        assert_eq!(error_kind(&e), Some(ErrorKind::Format));
        Ok(())
    }

    #[test]
    fn summary_counts() -> Result<()> {
        let pages: Vec<_> = [5u32, 2, 40].iter().map(|n| (*n, page(*n))).collect();
        let bytes = encode_stream(PS, &pages)?;
        let s = summarize(&bytes[..], PS)?;
        assert_eq!((s.clusters, s.pages), (1, 3));
        assert_eq!((s.min_page_no, s.max_page_no), (Some(2), Some(40)));
        Ok(())
    }
}
