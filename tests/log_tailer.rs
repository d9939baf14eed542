use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use QuiverBackup::backup::BackupSession;
use QuiverBackup::datasink::DsFile;
use QuiverBackup::errors::{error_kind, ErrorKind};
use QuiverBackup::redo::block;
use QuiverBackup::redo::{spawn_log_copier, LogTailer};
use QuiverBackup::source::log_file::LogFile;
use QuiverBackup::source::{FileLogReader, LogReader};
use QuiverBackup::throttle::IoThrottle;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("qbtest-tailer-{prefix}-{pid}-{t}-{id}"))
}

/// Выходной файл в памяти.
struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
}

impl DsFile for MemFile {
    fn path(&self) -> &str {
        "xtrabackup_logfile"
    }
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Ok(())
    }
    fn close(self: Box<Self>) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

fn mem_file() -> (MemFile, Arc<Mutex<Vec<u8>>>, Arc<Mutex<bool>>) {
    let data = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Mutex::new(false));
    (
        MemFile {
            data: data.clone(),
            closed: closed.clone(),
        },
        data,
        closed,
    )
}

const CAPACITY: u64 = 64 * 1024;
const START: u64 = 8192;

fn setup(prefix: &str) -> Result<(PathBuf, LogFile)> {
    let root = unique_root(prefix);
    std::fs::create_dir_all(&root)?;
    let path = root.join("ib_logfile0");
    let lf = LogFile::create(&path, CAPACITY)?;
    Ok((path, lf))
}

fn tailer(path: &PathBuf) -> Result<(LogTailer, Arc<dyn LogReader>)> {
    let reader: Arc<dyn LogReader> = Arc::new(FileLogReader::open(path)?);
    let t = LogTailer::new(reader.clone(), Arc::new(IoThrottle::disabled()), 4096, START)?;
    Ok((t, reader))
}

/// Недописанный блок: обычный проход останавливается перед ним, финальный
/// падает; после того как сервер дописал блок, проход продолжается с него.
#[test]
fn broken_tail_block_is_retried() -> Result<()> {
    let (path, mut lf) = setup("retry")?;
    lf.write_range(START, 10240, 1)?;
    let mut torn = block::build(10240, 512, 1, false, 0xAB);
    torn[100] ^= 0xFF;
    lf.write_block(10240, &torn)?;

    let (mut t, reader) = tailer(&path)?;
    let (mut out, data, _) = mem_file();

    assert_eq!(t.copy_pass(&mut out, START, false)?, 10240);
    assert_eq!(data.lock().unwrap().len(), 2048);
    let mut expect = vec![0u8; 2048];
    reader.read_segment(START, &mut expect)?;
    assert_eq!(*data.lock().unwrap(), expect);

    let e = t.catch_up(&mut out, true).unwrap_err();
    assert_eq!(error_kind(&e), Some(ErrorKind::Consistency));
    assert_eq!(data.lock().unwrap().len(), 2048);

    lf.write_range(10240, 10540, 1)?;
    assert_eq!(t.catch_up(&mut out, true)?, 10540);
    assert_eq!(t.scanned_lsn(), 10540);
    assert_eq!(data.lock().unwrap().len(), 2048 + 512);
    Ok(())
}

/// Блок с верной суммой, но номером из будущего - фатально даже не на
/// финальном проходе.
#[test]
fn block_sequence_mismatch_is_fatal() -> Result<()> {
    let (path, mut lf) = setup("seq")?;
    lf.write_range(START, 9216, 1)?;
    let future = block::build(9216 + 3 * 512, 512, 1, false, 0x11);
    lf.write_block(9216, &future)?;

    let (mut t, _) = tailer(&path)?;
    let (mut out, _, _) = mem_file();
    let e = t.copy_pass(&mut out, START, false).unwrap_err();
    assert_eq!(error_kind(&e), Some(ErrorKind::Consistency));
    assert!(format!("{:#}", e).contains("mismatch"));
    Ok(())
}

/// Неполный последний блок пишется только финальным проходом.
#[test]
fn partial_block_written_on_final_pass_only() -> Result<()> {
    let (path, mut lf) = setup("partial")?;
    lf.write_range(START, 9000, 1)?;

    let (mut t, _) = tailer(&path)?;
    let (mut out, data, _) = mem_file();
    assert_eq!(t.copy_pass(&mut out, START, false)?, 9000);
    assert_eq!(data.lock().unwrap().len(), 512);

    assert_eq!(t.copy_pass(&mut out, 9000, true)?, 9000);
    // повтор с начала блока 8704: блок целиком
    assert_eq!(data.lock().unwrap().len(), 1024);
    Ok(())
}

/// Фоновый копировщик догоняет лог, пока идёт бэкап, и после остановки
/// делает финальный проход и закрывает выход.
#[test]
fn background_copier_follows_the_log() -> Result<()> {
    let (path, mut lf) = setup("copier")?;
    lf.write_range(START, 9216, 1)?;

    let (t, _) = tailer(&path)?;
    let (out, data, closed) = mem_file();
    let session = Arc::new(BackupSession::new());
    session.start_log_copying();
    let h = spawn_log_copier(t, Box::new(out), session.clone(), Duration::from_millis(10))?;

    std::thread::sleep(Duration::from_millis(50));
    lf.write_range(9216, 11000, 1)?;
    std::thread::sleep(Duration::from_millis(50));
    session.stop_log_copying();

    let lsn = h.join().expect("log copier panicked")?;
    assert_eq!(lsn, 11000);
    assert_eq!(session.scanned_lsn(), 11000);
    assert!(*closed.lock().unwrap());
    // [8192, 11264): блоки подряд, последний неполный
    let bytes = data.lock().unwrap().clone();
    assert_eq!(bytes.len(), 11264 - 8192);
    for (i, blk) in bytes.chunks(512).enumerate() {
        assert_eq!(block::hdr_no(blk), block::lsn_to_block_no(START + i as u64 * 512));
    }
    Ok(())
}

/// Прерванный бэкап: финального прохода нет, выход всё равно закрыт.
#[test]
fn aborted_session_skips_final_pass() -> Result<()> {
    let (path, mut lf) = setup("abort")?;
    lf.write_range(START, 9216, 1)?;

    let (t, _) = tailer(&path)?;
    let (out, data, closed) = mem_file();
    let session = Arc::new(BackupSession::new());
    session.start_log_copying();
    let h = spawn_log_copier(t, Box::new(out), session.clone(), Duration::from_secs(3600))?;
    session.fail(anyhow::anyhow!("worker failed"));
    session.stop_log_copying();

    assert_eq!(h.join().expect("log copier panicked")?, START);
    assert!(data.lock().unwrap().is_empty());
    assert!(*closed.lock().unwrap());
    Ok(())
}
