//! The two scan modes.
//!
//! Single-file mode does the dangerous work: load the file, enumerate the
//! factory, and `init`/`activate` each plugin with its stdout/stderr
//! pointed at the null device so misbehaving plugins cannot pollute the
//! record channel. Full-system mode never loads plugin code at all; it
//! walks the search paths and spawns one single-file child per candidate,
//! forwarding the child's record lines verbatim.

use crate::ScanError;
use crate::paths::{Candidate, find_candidates, search_paths};
use crate::record::ScanRecord;
use soundproof_clap::ClapBundle;
use soundproof_core::PluginFormat;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Where finished records go. Stdout/stderr in the binary, a vector in
/// tests.
pub trait RecordSink {
    fn emit(&mut self, record: ScanRecord);
}

impl RecordSink for Vec<ScanRecord> {
    fn emit(&mut self, record: ScanRecord) {
        self.push(record);
    }
}

/// Redirects a stdio stream to the null device for the current process,
/// restoring it on drop.
struct StreamRedirect {
    fd: libc::c_int,
    saved: libc::c_int,
}

impl StreamRedirect {
    fn to_null(fd: libc::c_int) -> Option<Self> {
        unsafe {
            let saved = libc::dup(fd);
            if saved < 0 {
                return None;
            }
            let null = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
            if null < 0 {
                libc::close(saved);
                return None;
            }
            libc::dup2(null, fd);
            libc::close(null);
            Some(Self { fd, saved })
        }
    }
}

impl Drop for StreamRedirect {
    fn drop(&mut self) {
        unsafe {
            libc::dup2(self.saved, self.fd);
            libc::close(self.saved);
        }
    }
}

/// Run `f` with the process's stdout and stderr pointed at `/dev/null`.
fn with_silenced_stdio<R>(f: impl FnOnce() -> R) -> R {
    let _out = StreamRedirect::to_null(libc::STDOUT_FILENO);
    let _err = StreamRedirect::to_null(libc::STDERR_FILENO);
    f()
}

/// Scan one plugin file in-process. This is the call that can take the
/// whole process down, which is why it only ever runs in a child.
pub fn scan_file(path: &Path, sink: &mut dyn RecordSink) {
    let Some(candidate) = crate::paths::classify(path) else {
        sink.emit(ScanRecord::BrokenPlugfile {
            plugfile_type: PluginFormat::Unknown.as_str().to_string(),
            path: path.display().to_string(),
            error: "this doesn't look like a plugin file".to_string(),
        });
        return;
    };
    match candidate.format {
        PluginFormat::Clap => scan_clap_file(&candidate, sink),
        PluginFormat::Vst3 => {
            sink.emit(ScanRecord::BrokenPlugfile {
                plugfile_type: candidate.format.as_str().to_string(),
                path: candidate.path.display().to_string(),
                error: "vst3 scanning is not implemented".to_string(),
            });
        }
        PluginFormat::Unknown => {}
    }
}

fn scan_clap_file(candidate: &Candidate, sink: &mut dyn RecordSink) {
    let path_str = candidate.path.display().to_string();
    let bundle = match with_silenced_stdio(|| ClapBundle::load(&candidate.path)) {
        Ok(bundle) => bundle,
        Err(err) => {
            sink.emit(ScanRecord::BrokenPlugfile {
                plugfile_type: "clap".to_string(),
                path: path_str,
                error: err.to_string(),
            });
            return;
        }
    };
    let metas = match bundle.descriptors() {
        Ok(metas) => metas,
        Err(err) => {
            sink.emit(ScanRecord::BrokenPlugfile {
                plugfile_type: "clap".to_string(),
                path: path_str,
                error: err.to_string(),
            });
            return;
        }
    };
    for meta in metas {
        match with_silenced_stdio(|| bundle.probe(&meta.id)) {
            Ok(caps) => sink.emit(ScanRecord::Plugin {
                plugfile_type: "clap".to_string(),
                path: path_str.clone(),
                name: meta.name,
                id: meta.id,
                vendor: meta.vendor,
                version: meta.version,
                url: meta.url,
                features: meta.features,
                has_gui: caps.has_gui,
                has_params: caps.has_params,
            }),
            Err(err) => sink.emit(ScanRecord::BrokenPlugin {
                plugfile_type: "clap".to_string(),
                path: path_str.clone(),
                name: meta.name,
                id: meta.id,
                vendor: meta.vendor,
                version: meta.version,
                error: err.to_string(),
            }),
        }
    }
}

/// Walk the search paths, report every candidate, and scan each one in an
/// isolated child process.
pub fn scan_system(
    self_exe: &Path,
    env_clap_path: Option<&str>,
    additional: &[PathBuf],
    sink: &mut dyn RecordSink,
) -> Result<(), ScanError> {
    for root in search_paths(env_clap_path, additional) {
        for candidate in find_candidates(&root) {
            sink.emit(ScanRecord::Plugfile {
                plugfile_type: candidate.format.as_str().to_string(),
                path: candidate.path.display().to_string(),
            });
            scan_candidate_isolated(self_exe, &candidate, sink);
        }
    }
    Ok(())
}

/// Spawn ourselves in `--file` mode for one candidate and forward the
/// child's records. A child that dies mid-scan becomes a broken-plugfile
/// record instead of ending the whole scan.
fn scan_candidate_isolated(self_exe: &Path, candidate: &Candidate, sink: &mut dyn RecordSink) {
    let path_str = candidate.path.display().to_string();
    let spawned = Command::new(self_exe)
        .arg("--file")
        .arg(&candidate.path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            sink.emit(ScanRecord::BrokenPlugfile {
                plugfile_type: candidate.format.as_str().to_string(),
                path: path_str,
                error: format!("failed to spawn scanner child: {err}"),
            });
            return;
        }
    };

    // Stderr is drained on a helper thread so a chatty child can't
    // deadlock us against a full pipe.
    let stderr = child.stderr.take().map(|stderr| {
        std::thread::spawn(move || {
            let mut lines = Vec::new();
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                lines.push(line);
            }
            lines
        })
    });

    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            forward_line(&line, sink);
        }
    }
    if let Some(handle) = stderr {
        for line in handle.join().unwrap_or_default() {
            forward_line(&line, sink);
        }
    }

    match child.wait() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            sink.emit(ScanRecord::BrokenPlugfile {
                plugfile_type: candidate.format.as_str().to_string(),
                path: path_str,
                error: format!("scanner child exited abnormally: {status}"),
            });
        }
        Err(err) => {
            sink.emit(ScanRecord::BrokenPlugfile {
                plugfile_type: candidate.format.as_str().to_string(),
                path: path_str,
                error: format!("failed to wait for scanner child: {err}"),
            });
        }
    }
}

fn forward_line(line: &str, sink: &mut dyn RecordSink) {
    if line.is_empty() {
        return;
    }
    match ScanRecord::parse(line) {
        Ok(record) => sink.emit(record),
        Err(err) => tracing::warn!("discarding malformed scanner output line: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_file_rejects_non_plugin_paths() {
        let mut records = Vec::new();
        scan_file(Path::new("/tmp/readme.txt"), &mut records);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_broken());
    }

    #[test]
    fn test_scan_file_reports_unloadable_clap() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("broken.clap");
        std::fs::write(&bogus, b"this is not a shared library").unwrap();
        let mut records = Vec::new();
        scan_file(&bogus, &mut records);
        match &records[0] {
            ScanRecord::BrokenPlugfile { plugfile_type, path, .. } => {
                assert_eq!(plugfile_type, "clap");
                assert_eq!(*path, bogus.display().to_string());
            }
            other => panic!("expected broken-plugfile, got {other:?}"),
        }
    }

    #[test]
    fn test_forward_line_drops_garbage() {
        let mut records = Vec::new();
        forward_line("", &mut records);
        forward_line("garbage", &mut records);
        forward_line(
            r#"{"type":"plugfile","plugfile-type":"clap","path":"/x.clap"}"#,
            &mut records,
        );
        assert_eq!(records.len(), 1);
    }
}
