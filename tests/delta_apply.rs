use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use QuiverBackup::apply::{apply_deltas, Resolution};
use QuiverBackup::delta::{encode_stream, DeltaMetadata};
use QuiverBackup::errors::{error_kind, ErrorKind};
use QuiverBackup::page::{build_page, init_header_page, page_lsn, page_space_id};
use QuiverBackup::{prepare_incremental, BackupMetadata, BackupType, DirRegistry, TablespaceRegistry};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("qbtest-apply-{prefix}-{pid}-{t}-{id}"))
}

const PS: usize = 1024;

fn write_space(path: &Path, space_id: u32, pages: u32, lsn: u64) -> Result<()> {
    let mut bytes = Vec::new();
    for n in 0..pages {
        let mut p = build_page(PS, space_id, n, lsn, 0x11);
        if n == 0 {
            init_header_page(&mut p, space_id, pages, 0);
        }
        bytes.extend(p);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

fn write_delta(inc: &Path, name: &str, space_id: Option<u32>, pages: &[(u32, Vec<u8>)]) -> Result<()> {
    let delta = inc.join(format!("{}.delta", name));
    if let Some(parent) = delta.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&delta, encode_stream(PS, pages)?)?;
    let meta = DeltaMetadata {
        page_size: PS,
        zip_size: 0,
        space_id,
    };
    fs::write(inc.join(format!("{}.meta", name)), meta.to_text())?;
    Ok(())
}

fn page_at(path: &Path, no: u32) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    let off = no as usize * PS;
    Ok(bytes[off..off + PS].to_vec())
}

/// Без space_id в .meta файл ищется по имени; страницы ложатся по номерам.
#[test]
fn missing_space_id_matches_by_name() -> Result<()> {
    let root = unique_root("noid");
    let (full, inc) = (root.join("full"), root.join("inc"));
    write_space(&full.join("ibdata1"), 0, 4, 10)?;
    write_space(&full.join("shop/t.ibd"), 5, 8, 10)?;

    let p2 = build_page(PS, 5, 2, 500, 0x22);
    let p7 = build_page(PS, 5, 7, 600, 0x77);
    write_delta(&inc, "shop/t.ibd", None, &[(2, p2.clone()), (7, p7.clone())])?;
    let sys = build_page(PS, 0, 1, 700, 0x33);
    write_delta(&inc, "ibdata1", Some(0), &[(1, sys.clone())])?;

    let mut reg = DirRegistry::open(&full, PS)?;
    let report = apply_deltas(&inc, &mut reg)?;
    assert_eq!(report.deltas.len(), 2);
    assert_eq!(report.pages(), 3);
    // системное пространство - первым
    assert_eq!(report.deltas[0].name, "ibdata1");
    assert_eq!(report.deltas[1].resolution, Resolution::Existing);

    let t = full.join("shop/t.ibd");
    assert_eq!(page_at(&t, 2)?, p2);
    assert_eq!(page_at(&t, 7)?, p7);
    assert_eq!(page_lsn(&page_at(&t, 3)?), 10);
    assert_eq!(page_at(&full.join("ibdata1"), 1)?, sys);
    Ok(())
}

/// Имя совпало, id другой (таблицу пересоздали): старый файл уходит в
/// xtrabackup_tmp_#<old>.ibd, под именем создаётся новый.
#[test]
fn space_id_collision_moves_old_file_aside() -> Result<()> {
    let root = unique_root("collide");
    let (full, inc) = (root.join("full"), root.join("inc"));
    write_space(&full.join("shop/a.ibd"), 5, 4, 10)?;
    let old = fs::read(full.join("shop/a.ibd"))?;

    let mut p0 = build_page(PS, 9, 0, 900, 0);
    init_header_page(&mut p0, 9, 6, 0);
    let p5 = build_page(PS, 9, 5, 900, 0x55);
    write_delta(&inc, "shop/a.ibd", Some(9), &[(0, p0.clone()), (5, p5.clone())])?;

    let mut reg = DirRegistry::open(&full, PS)?;
    let report = apply_deltas(&inc, &mut reg)?;
    let d = &report.deltas[0];
    assert_eq!(d.resolution, Resolution::Created);
    assert_eq!(d.moved_aside.as_deref(), Some("shop/xtrabackup_tmp_#5.ibd"));

    assert_eq!(fs::read(full.join("shop/xtrabackup_tmp_#5.ibd"))?, old);
    let a = full.join("shop/a.ibd");
    assert_eq!(page_at(&a, 5)?, p5);
    assert_eq!(page_space_id(&page_at(&a, 0)?), 9);
    assert_eq!(reg.find_by_id(9).map(|t| t.name), Some("shop/a.ibd".to_string()));
    assert_eq!(reg.find_by_id(5).map(|t| t.name), Some("shop/xtrabackup_tmp_#5.ibd".to_string()));
    Ok(())
}

/// Тот же id под другим именем (RENAME TABLE): файл переименовывается.
#[test]
fn known_space_id_under_new_name_is_renamed() -> Result<()> {
    let root = unique_root("rename");
    let (full, inc) = (root.join("full"), root.join("inc"));
    write_space(&full.join("shop/old.ibd"), 11, 4, 10)?;

    let p1 = build_page(PS, 11, 1, 800, 0x01);
    write_delta(&inc, "sales/new.ibd", Some(11), &[(1, p1.clone())])?;

    let mut reg = DirRegistry::open(&full, PS)?;
    let report = apply_deltas(&inc, &mut reg)?;
    assert_eq!(
        report.deltas[0].resolution,
        Resolution::RenamedFrom("shop/old.ibd".to_string())
    );
    assert!(!full.join("shop/old.ibd").exists());
    assert_eq!(page_at(&full.join("sales/new.ibd"), 1)?, p1);
    Ok(())
}

/// Нет ни id, ни файла с таким именем: id берётся из первой страницы.
#[test]
fn unknown_file_created_from_first_page_id() -> Result<()> {
    let root = unique_root("create");
    let (full, inc) = (root.join("full"), root.join("inc"));
    fs::create_dir_all(&full)?;

    let p3 = build_page(PS, 21, 3, 100, 0x03);
    write_delta(&inc, "db/fresh.ibd", None, &[(3, p3.clone())])?;

    let mut reg = DirRegistry::open(&full, PS)?;
    let report = apply_deltas(&inc, &mut reg)?;
    assert_eq!(report.deltas[0].resolution, Resolution::Created);
    assert_eq!(reg.find_by_id(21).map(|t| t.name), Some("db/fresh.ibd".to_string()));
    assert_eq!(page_at(&full.join("db/fresh.ibd"), 3)?, p3);

    // пустой delta без id: сопоставить не с чем
    write_delta(&inc, "db/ghost.ibd", None, &[])?;
    let mut reg = DirRegistry::open(&full, PS)?;
    let e = apply_deltas(&inc, &mut reg).unwrap_err();
    assert_eq!(error_kind(&e), Some(ErrorKind::Format));
    Ok(())
}

#[test]
fn prepare_rejects_lsn_gap_and_wrong_types() -> Result<()> {
    let root = unique_root("prepare");
    let (full, inc) = (root.join("full"), root.join("inc"));
    fs::create_dir_all(&full)?;
    fs::create_dir_all(&inc)?;

    BackupMetadata {
        backup_type: BackupType::FullBackuped,
        from_lsn: 0,
        to_lsn: 1000,
        last_lsn: 1100,
    }
    .write_to_dir(&full)?;
    BackupMetadata {
        backup_type: BackupType::Incremental,
        from_lsn: 900,
        to_lsn: 2000,
        last_lsn: 2100,
    }
    .write_to_dir(&inc)?;
    let e = prepare_incremental(&full, &inc, PS).unwrap_err();
    assert_eq!(error_kind(&e), Some(ErrorKind::Consistency));

    // инкремент поверх инкремента
    let e = prepare_incremental(&inc, &inc, PS).unwrap_err();
    assert_eq!(error_kind(&e), Some(ErrorKind::Consistency));

    BackupMetadata {
        backup_type: BackupType::Incremental,
        from_lsn: 1000,
        to_lsn: 2000,
        last_lsn: 2100,
    }
    .write_to_dir(&inc)?;
    let rep = prepare_incremental(&full, &inc, PS)?;
    assert_eq!(rep.metadata.backup_type, BackupType::FullBackuped);
    assert_eq!(rep.metadata.from_lsn, 0);
    assert_eq!(rep.metadata.to_lsn, 2000);
    assert_eq!(BackupMetadata::read_from_dir(&full)?, rep.metadata);
    Ok(())
}
