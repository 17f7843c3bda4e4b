//! Standalone plugin scanner.
//!
//! Emits one JSON record per line: good records on stdout, broken ones on
//! stderr (see `record`). Exit code 0 on success, 1 on unrecoverable
//! error.

use anyhow::{Context, Result};
use clap::Parser;
use soundproof_scan::record::ScanRecord;
use soundproof_scan::scan::{RecordSink, scan_file, scan_system};
use std::io::Write;
use std::path::PathBuf;

/// Scans the system for installed CLAP/VST plugins
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Plugin file to scan (single-file mode)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// List of additional search paths, separated by ';'
    #[arg(short, long)]
    search_paths: Option<String>,
}

/// Prints records to the process's stdio, splitting by severity.
struct StdioSink;

impl RecordSink for StdioSink {
    fn emit(&mut self, record: ScanRecord) {
        if record.is_broken() {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", record.to_line());
        } else {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{}", record.to_line());
            let _ = out.flush();
        }
    }
}

fn main() -> Result<()> {
    // The machine-readable channel must stay clean; diagnostics are opt-in
    // and go to stderr.
    if std::env::var_os("SOUNDPROOF_SCANNER_LOG").is_some() {
        tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    }

    let args = Args::parse();
    let mut sink = StdioSink;

    if let Some(file) = args.file {
        scan_file(&file, &mut sink);
        return Ok(());
    }

    let additional: Vec<PathBuf> = args
        .search_paths
        .as_deref()
        .map(|raw| raw.split(';').filter(|p| !p.is_empty()).map(PathBuf::from).collect())
        .unwrap_or_default();
    let env_clap_path = std::env::var("CLAP_PATH").ok();
    let self_exe = std::env::current_exe().context("cannot locate scanner executable")?;
    scan_system(&self_exe, env_clap_path.as_deref(), &additional, &mut sink)?;
    Ok(())
}
