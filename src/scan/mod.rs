//! Directory scanning: walks a root, hashes every regular file with MD5,
//! and yields the `{rel_path -> md5}` map the rest of the engine reasons
//! about. See design doc §4.1.

pub mod ignore;
pub mod md5;

use crate::config::PathRedirect;
use ignore::IgnoreSet;
use indexmap::IndexMap;
use std::path::Path;
use std::time::SystemTime;

/// One file (or directory) observed by a scan. Transient — never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDigest {
    pub rel_path: String,
    pub md5: String,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub is_dir: bool,
}

/// Result of walking a directory: files in scan order plus the directory
/// shape (needed by mirror mode to find stale local directories).
#[derive(Debug, Default, Clone)]
pub struct ScanResult {
    pub files: IndexMap<String, FileDigest>,
    /// Directory relative paths, deepest-last order is NOT guaranteed here;
    /// callers that need depth-first deletion order should sort themselves.
    pub dirs: Vec<String>,
    pub ignored_count: u64,
}

impl ScanResult {
    /// The `{rel_path -> md5}` map as sent over the wire.
    pub fn md5_map(&self) -> IndexMap<String, String> {
        self.files
            .iter()
            .map(|(k, v)| (k.clone(), v.md5.clone()))
            .collect()
    }
}

fn to_forward_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk `root`, honoring `ignore`, optionally rewriting every emitted key
/// from its client-local prefix to server-canonical form via `redirect`
/// ("local-to-canonical" mode, §4.1). A root that does not exist yields an
/// empty result, not an error. A root that is a single regular file yields
/// a one-entry result keyed by its basename.
pub fn scan(root: &Path, ignore: &IgnoreSet, redirect: Option<&[PathRedirect]>) -> ScanResult {
    let mut result = ScanResult::default();

    if !root.exists() {
        return result;
    }

    if root.is_file() {
        let rel_path = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if ignore.is_ignored(&rel_path) {
            result.ignored_count += 1;
            return result;
        }
        match md5::hash_file(root) {
            Ok(hash) => {
                let size = std::fs::metadata(root).map(|m| m.len()).unwrap_or(0);
                let mtime = std::fs::metadata(root).and_then(|m| m.modified()).ok();
                let key = apply_redirect(redirect, &rel_path);
                result.files.insert(
                    key.clone(),
                    FileDigest {
                        rel_path: key,
                        md5: hash,
                        size,
                        mtime,
                        is_dir: false,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(path = %root.display(), error = %e, "failed to hash file, skipping");
            }
        }
        return result;
    }

    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "scan walk error, skipping entry");
                continue;
            }
        };
        if entry.path() == root {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let rel_str = to_forward_slash(rel);

        if entry.file_type().is_dir() {
            if ignore.is_ignored(&rel_str) {
                result.ignored_count += 1;
                continue;
            }
            result.dirs.push(apply_redirect(redirect, &rel_str));
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }

        if ignore.is_ignored(&rel_str) {
            result.ignored_count += 1;
            continue;
        }

        match md5::hash_file(entry.path()) {
            Ok(hash) => {
                let meta = entry.metadata().ok();
                let size = meta.as_ref().map(|m| m.len()).unwrap_or(0);
                let mtime = meta.and_then(|m| m.modified().ok());
                let key = apply_redirect(redirect, &rel_str);
                result.files.insert(
                    key.clone(),
                    FileDigest {
                        rel_path: key,
                        md5: hash,
                        size,
                        mtime,
                        is_dir: false,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "failed to read file, skipping");
            }
        }
    }

    result
}

fn apply_redirect(redirect: Option<&[PathRedirect]>, path: &str) -> String {
    match redirect {
        Some(table) => crate::config::redirect_to_server(table, path),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn empty_ignore() -> IgnoreSet {
        IgnoreSet::new(&[])
    }

    #[test]
    fn missing_root_yields_empty_map() {
        let result = scan(Path::new("/does/not/exist"), &empty_ignore(), None);
        assert!(result.files.is_empty());
    }

    #[test]
    fn single_file_root_keys_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "hello\n").unwrap();
        let result = scan(&path, &empty_ignore(), None);
        assert_eq!(result.files.len(), 1);
        assert!(result.files.contains_key("a.txt"));
    }

    #[test]
    fn scan_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), "b").unwrap();

        let first = scan(dir.path(), &empty_ignore(), None).md5_map();
        let second = scan(dir.path(), &empty_ignore(), None).md5_map();
        assert_eq!(first, second);
    }

    #[test]
    fn ignored_paths_never_appear() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        fs::write(dir.path().join("skip.tmp"), "skip").unwrap();
        let ignore = IgnoreSet::new(&["*.tmp".to_string()]);
        let result = scan(dir.path(), &ignore, None);
        assert!(result.files.contains_key("keep.txt"));
        assert!(!result.files.contains_key("skip.tmp"));
        assert_eq!(result.ignored_count, 1);
    }

    #[test]
    fn paths_use_forward_slashes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), "b").unwrap();
        let result = scan(dir.path(), &empty_ignore(), None);
        assert!(result.files.keys().any(|k| k == "sub/b.txt"));
    }

    #[test]
    fn redirect_rewrites_keys_to_canonical() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("mods")).unwrap();
        fs::write(dir.path().join("mods/x.cfg"), "v1").unwrap();
        let redirects = vec![PathRedirect {
            server_prefix: "clientmods".into(),
            client_prefix: "mods".into(),
        }];
        let result = scan(dir.path(), &empty_ignore(), Some(&redirects));
        assert!(result.files.contains_key("clientmods/x.cfg"));
    }

    #[test]
    fn equal_md5_regardless_of_mtime() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        fs::write(dir1.path().join("a.txt"), "same").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(dir2.path().join("a.txt"), "same").unwrap();

        let m1 = scan(dir1.path(), &empty_ignore(), None).md5_map();
        let m2 = scan(dir2.path(), &empty_ignore(), None).md5_map();
        assert_eq!(m1["a.txt"], m2["a.txt"]);
    }
}
