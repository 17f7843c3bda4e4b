//! Plugin search path assembly and candidate discovery.

use soundproof_core::{CLAP_EXT, PluginFormat, VST3_EXT};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Platform delimiter for the `CLAP_PATH` environment variable.
#[cfg(windows)]
pub const ENV_PATH_DELIMITER: char = ';';
#[cfg(not(windows))]
pub const ENV_PATH_DELIMITER: char = ':';

/// A candidate plugin file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub format: PluginFormat,
    pub path: PathBuf,
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Standard system locations for CLAP plugins.
#[cfg(target_os = "macos")]
fn system_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/Library/Audio/Plug-Ins/CLAP")];
    if let Some(home) = home_dir() {
        paths.push(home.join("Library/Audio/Plug-Ins/CLAP"));
    }
    paths
}

#[cfg(not(target_os = "macos"))]
fn system_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/usr/lib/clap")];
    if let Some(home) = home_dir() {
        paths.push(home.join(".clap"));
    }
    paths
}

/// Full, deduplicated search path list: system paths, `CLAP_PATH`, and any
/// extra roots from the command line.
pub fn search_paths(env_clap_path: Option<&str>, additional: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = system_search_paths();
    if let Some(env) = env_clap_path {
        paths.extend(
            env.split(ENV_PATH_DELIMITER).filter(|p| !p.is_empty()).map(PathBuf::from),
        );
    }
    paths.extend_from_slice(additional);
    let unique: BTreeSet<PathBuf> = paths.into_iter().collect();
    unique.into_iter().collect()
}

/// Classify a path by extension.
pub fn classify(path: &Path) -> Option<Candidate> {
    let ext = path.extension()?.to_str()?;
    let format = if ext.eq_ignore_ascii_case(CLAP_EXT) {
        PluginFormat::Clap
    } else if ext.eq_ignore_ascii_case(VST3_EXT) {
        PluginFormat::Vst3
    } else {
        return None;
    };
    Some(Candidate { format, path: path.to_path_buf() })
}

/// Recursively collect candidates under `root`. Unreadable directories are
/// skipped, not fatal.
pub fn find_candidates(root: &Path) -> Vec<Candidate> {
    let mut out = Vec::new();
    walk(root, &mut out, 0);
    out
}

fn walk(dir: &Path, out: &mut Vec<Candidate>, depth: usize) {
    // Defense against symlink loops.
    if depth > 16 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(candidate) = classify(&path) {
            out.push(candidate);
        } else if path.is_dir() {
            walk(&path, out, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_extension() {
        assert_eq!(classify(Path::new("/p/a.clap")).unwrap().format, PluginFormat::Clap);
        assert_eq!(classify(Path::new("/p/a.vst3")).unwrap().format, PluginFormat::Vst3);
        assert!(classify(Path::new("/p/a.so")).is_none());
        assert!(classify(Path::new("/p/noext")).is_none());
    }

    #[test]
    fn test_search_paths_dedup_and_env_split() {
        let extra = vec![PathBuf::from("/opt/plugs")];
        let paths = search_paths(Some("/opt/plugs:/home/u/clap"), &extra);
        let dupes = paths.iter().filter(|p| **p == PathBuf::from("/opt/plugs")).count();
        assert_eq!(dupes, 1);
        assert!(paths.contains(&PathBuf::from("/home/u/clap")));
    }

    #[test]
    fn test_find_candidates_walks_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("vendor");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("a.clap"), b"x").unwrap();
        std::fs::write(nested.join("b.clap"), b"x").unwrap();
        std::fs::write(nested.join("ignore.txt"), b"x").unwrap();
        let mut found = find_candidates(dir.path());
        found.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.format == PluginFormat::Clap));
    }
}
