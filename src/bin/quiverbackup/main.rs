use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod cmd_backup;
mod cmd_extract;
mod cmd_inspect;
mod cmd_prepare;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт - info.
    // Логи идут в stderr: stdout может быть занят потоком бэкапа.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Backup(args) => cmd_backup::exec(args),

        cli::Cmd::Prepare { target, incremental_dir, page_size, json } =>
            cmd_prepare::exec(target, incremental_dir, page_size, json),

        cli::Cmd::InspectDelta { file, page_size, json } =>
            cmd_inspect::exec(file, page_size, json),

        cli::Cmd::Extract { input, dest, json } =>
            cmd_extract::exec(input, dest, json),
    }
}
