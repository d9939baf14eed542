#![allow(non_snake_case)]

// Базовые модули
pub mod consts;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod page;
pub mod throttle;

// Утилиты (now_secs, local_timestamp, AlignedBuffer, ...)
pub mod util;   // src/util/{mod,aligned}.rs

// Модульная раскладка (папки с mod.rs)
pub mod source;   // src/source/{mod,dir,log_file}.rs
pub mod datasink; // src/datasink/{mod,local,buffer,compress,stream,tmpfile}.rs
pub mod delta;    // src/delta/{mod,meta}.rs
pub mod filter;   // src/filter/{mod,write_through,incremental,compact}.rs
pub mod redo;     // src/redo/{mod,block,tailer}.rs
pub mod backup;   // src/backup/{mod,session,iter,tables,worker,suspend,metadata}.rs
pub mod apply;    // src/apply/{mod,resolve}.rs

// Удобные реэкспорты
pub use apply::{apply_deltas, prepare_incremental, ApplyReport, PrepareReport};
pub use backup::{run_backup, Backup, BackupMetadata, BackupReport, BackupType};
pub use config::{BackupConfig, CompressKind};
pub use errors::{error_kind, BackupError, ErrorKind};
pub use source::{DirRegistry, FileLogReader, LogReader, TablespaceRegistry};
