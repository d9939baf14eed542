//! Общие константы форматов (страницы, delta-файлы, redo log, метаданные бэкапа, stream).

// -------- Pages --------
// Все поля страницы - big-endian, смещения фиксированы.
pub const FIL_PAGE_OFFSET: usize = 4; // u32 page_no
pub const FIL_PAGE_LSN: usize = 16; // u64 lsn
pub const FIL_PAGE_SPACE_ID: usize = 34; // u32 space_id
pub const FIL_PAGE_DATA: usize = 38;

// FSP header (только на странице 0)
pub const FSP_HEADER_OFFSET: usize = FIL_PAGE_DATA;
pub const FSP_SPACE_ID: usize = 0;
pub const FSP_SIZE: usize = 8;
pub const FSP_SPACE_FLAGS: usize = 16;

// Флаги табличного пространства
pub const DICT_TF_COMPACT: u32 = 1;
pub const DICT_TF_ZSSIZE_SHIFT: u32 = 1;
pub const DICT_TF_ZSSIZE_MASK: u32 = 0xF << DICT_TF_ZSSIZE_SHIFT;
pub const DICT_TF_FORMAT_SHIFT: u32 = 5;
pub const DICT_TF_FORMAT_ZIP: u32 = 1;
pub const PAGE_ZIP_MIN_SIZE: usize = 512;

pub const PAGE_SIZE_SHIFT_MIN: u32 = 10; // 1 KiB
pub const PAGE_SIZE_SHIFT_MAX: u32 = 16; // 64 KiB
pub const PAGE_SIZE_MAX: usize = 1 << PAGE_SIZE_SHIFT_MAX;
pub const PAGE_SIZE_DEFAULT: usize = 16 * 1024;

/// Системное табличное пространство: никогда не фильтруется и не компактится.
pub const SYSTEM_SPACE_ID: u32 = 0;

/// Начальный размер нового табличного пространства (страниц).
pub const TABLESPACE_INITIAL_PAGES: u32 = 4;

/// Сколько страниц читает FilePageSource за один батч.
pub const READ_BATCH_PAGES: usize = 64;

pub const SYSTEM_FILE_PREFIX: &str = "ibdata";
pub const TABLESPACE_EXT: &str = "ibd";

// -------- Delta (incremental) --------
pub const DELTA_SUFFIX: &str = ".delta";
pub const DELTA_META_SUFFIX: &str = ".meta";
pub const PAGE_MAP_SUFFIX: &str = ".pmap";

/// Тег кластера: "xtra" - дальше будут ещё кластеры.
pub const DELTA_TAG_MORE: u32 = 0x7874_7261;
/// Тег кластера: "XTRA" - последний кластер потока.
pub const DELTA_TAG_LAST: u32 = 0x5854_5241;
/// Терминатор карты страниц в последнем (неполном) кластере.
pub const DELTA_SENTINEL: u32 = 0xFFFF_FFFF;

/// Префикс имени, под которое отодвигается файл с совпавшим именем и чужим space_id.
pub const APPLY_TMP_PREFIX: &str = "xtrabackup_tmp_#";

// -------- Redo log --------
pub const LOG_BLOCK_SIZE: usize = 512;
pub const LOG_BLOCK_HDR_NO: usize = 0;
pub const LOG_BLOCK_HDR_DATA_LEN: usize = 4;
pub const LOG_BLOCK_FIRST_REC_GROUP: usize = 6;
pub const LOG_BLOCK_CHECKPOINT_NO: usize = 8;
pub const LOG_BLOCK_HDR_SIZE: usize = 12;
pub const LOG_BLOCK_TRL_SIZE: usize = 4;
pub const LOG_BLOCK_CHECKSUM: usize = LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE;
pub const LOG_BLOCK_FLUSH_BIT_MASK: u32 = 0x8000_0000;
pub const LOG_BLOCK_NO_MASK: u64 = 0x3FFF_FFFF;

pub const LOG_FILE_HDR_SIZE: usize = 4 * LOG_BLOCK_SIZE;
// Метка создателя в заголовке лог-файла (перезаписывается при бэкапе)
pub const LOG_FILE_WAS_CREATED_BY_HOT_BACKUP: usize = 16;
pub const LOG_FILE_CREATOR_LEN: usize = 32;
pub const LOG_BACKUP_LABEL: &str = "qbackup ";

// Слот контрольной точки (блок 1 заголовка)
pub const LOG_CHECKPOINT_NO: usize = LOG_BLOCK_SIZE;
pub const LOG_CHECKPOINT_LSN: usize = LOG_BLOCK_SIZE + 8;
pub const LOG_CHECKPOINT_CHECKSUM: usize = LOG_BLOCK_SIZE + 16;

/// Окно сканирования лога за один read_segment.
pub const LOG_SCAN_WINDOW_DEFAULT: usize = 4 * PAGE_SIZE_DEFAULT;

/// Граница «мусора» по checkpoint_no (блоки до последнего recovery).
pub const LOG_CHECKPOINT_NO_GARBAGE_GAP: u32 = 0x8000_0000;

// -------- Backup target --------
pub const METADATA_FILENAME: &str = "xtrabackup_checkpoints";
pub const LOG_FILENAME: &str = "xtrabackup_logfile";
pub const SUSPEND_FILENAME: &str = "xtrabackup_suspended";

pub const BACKUP_TYPE_FULL: &str = "full-backuped";
pub const BACKUP_TYPE_INCREMENTAL: &str = "incremental";
pub const BACKUP_TYPE_PREPARED: &str = "full-prepared";

// -------- Datasinks --------
/// Буфер между компрессором и его downstream (1 MiB).
pub const COMPRESS_BUFFER_SIZE: usize = 1024 * 1024;
pub const ZSTD_SUFFIX: &str = ".zst";
pub const GZIP_SUFFIX: &str = ".gz";

// -------- Stream format --------
pub const STREAM_CHUNK_MAGIC: &[u8; 8] = b"QBSTCK01";
pub const STREAM_CHUNK_TYPE_PAYLOAD: u8 = b'P';
pub const STREAM_CHUNK_TYPE_EOF: u8 = b'E';
pub const STREAM_FLAG_IGNORABLE: u8 = 0x01;
/// Глубина очереди к писателю stream (чанков).
pub const STREAM_QUEUE_DEPTH: usize = 64;

// -------- Timing --------
pub const LOG_COPY_POLL_MS: u64 = 200;
pub const LOG_COPY_INTERVAL_MS_DEFAULT: u64 = 1000;
pub const THROTTLE_PERIOD_MS: u64 = 1000;
pub const SUSPEND_POLL_MS: u64 = 200;
/// Сколько раз перечитывать контрольную точку, пока её номер не стабилизируется.
pub const CHECKPOINT_READ_ATTEMPTS: usize = 100;
pub const TMPDIR_NAME: &str = ".qbtmp";
