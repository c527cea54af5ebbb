//! Tar entry stream: building from source paths, extracting and listing
//!
//! Both directions work on plain `io::Write`/`io::Read` and run on the
//! blocking stage of a pipeline. Cancellation is checked and progress is
//! reported once per entry.

use crate::cancel::{CancellationToken, ConfirmFn};
use crate::error::{IoContext, Result, STarError};
use crate::progress::{ProgressEvent, ProgressSender};
use crate::stats::OperationStats;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;
use tar::EntryType;
use walkdir::WalkDir;

/// What to do when an extracted file already exists at the destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverwritePolicy {
    #[default]
    Overwrite,
    /// Keep the existing file and skip the entry
    Skip,
    /// Fail with `DestinationExists`
    Error,
}

impl FromStr for OverwritePolicy {
    type Err = STarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" => Ok(OverwritePolicy::Overwrite),
            "skip" => Ok(OverwritePolicy::Skip),
            "error" | "fail" => Ok(OverwritePolicy::Error),
            other => Err(STarError::InvalidOptions(format!(
                "unknown overwrite policy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Socket, FIFO or device; not archived
    Special,
}

/// A file or directory found while scanning the sources
#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// Location on disk
    pub path: PathBuf,
    /// Name inside the archive
    pub name: PathBuf,
    pub kind: EntryKind,
    /// Content size; zero for anything but regular files
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub mode: Option<u32>,
}

/// One row of [`crate::list_contents`]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ListedEntry {
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
}

/// Per-entry hooks shared by the builder and the extractor
pub(crate) struct EntryHooks<'a> {
    pub token: &'a CancellationToken,
    pub confirm: &'a ConfirmFn,
    pub progress: &'a ProgressSender,
}

impl EntryHooks<'_> {
    fn entry_done(&self, name: String, size: u64) -> Result<()> {
        self.progress
            .emit(ProgressEvent::Entry { name, size });
        self.token.checkpoint(self.confirm)
    }

    fn skipped(&self, name: String, reason: &str) {
        tracing::warn!(entry = %name, reason, "entry skipped");
        self.progress.emit(ProgressEvent::Skipped {
            name,
            reason: reason.to_string(),
        });
    }
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn mode_of(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

/// Walk the sources in the order given, each directory in lexical order
///
/// A directory keeps its own name as the top of its subtree; a file is
/// stored under its file name. Symlinks are recorded, never followed.
pub fn scan_sources<P: AsRef<Path>>(sources: &[P]) -> Result<Vec<SourceEntry>> {
    if sources.is_empty() {
        return Err(STarError::InvalidOptions("no source paths given".to_string()));
    }

    let mut entries = Vec::new();
    for root in sources {
        let root = root.as_ref();
        std::fs::symlink_metadata(root).io_ctx("scan source", root)?;

        // "." and "/" have no name of their own; their children go at the top
        let base = match root.file_name() {
            Some(_) => root.parent().map(Path::to_path_buf).unwrap_or_default(),
            None => root.to_path_buf(),
        };

        for item in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let item = item.map_err(|e| {
                let path = e.path().map(Path::to_path_buf);
                STarError::Io {
                    op: "walk source",
                    path,
                    source: e.into(),
                }
            })?;
            let name = item
                .path()
                .strip_prefix(&base)
                .unwrap_or(item.path())
                .to_path_buf();
            if name.as_os_str().is_empty() {
                continue;
            }

            let metadata = item.metadata().map_err(|e| STarError::Io {
                op: "stat source",
                path: Some(item.path().to_path_buf()),
                source: e.into(),
            })?;
            let file_type = item.file_type();
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Special
            };

            entries.push(SourceEntry {
                path: item.path().to_path_buf(),
                name,
                kind,
                size: if kind == EntryKind::File { metadata.len() } else { 0 },
                modified: metadata.modified().ok(),
                mode: mode_of(&metadata),
            });
        }
    }
    Ok(entries)
}

/// Totals announced in the `Started` event
pub fn totals(entries: &[SourceEntry]) -> (u64, u64) {
    entries
        .iter()
        .filter(|e| e.kind == EntryKind::File)
        .fold((0, 0), |(files, bytes), e| (files + 1, bytes + e.size))
}

/// Append every scanned entry to `builder`
///
/// Special files are skipped with a warning. File content is streamed from
/// disk straight into the builder's writer.
pub(crate) fn append_entries<W: Write>(
    builder: &mut tar::Builder<W>,
    entries: &[SourceEntry],
    hooks: &EntryHooks<'_>,
) -> Result<OperationStats> {
    let mut stats = OperationStats::default();
    builder.follow_symlinks(false);

    let (total_files, total_bytes) = totals(entries);
    hooks.progress.emit(ProgressEvent::Started {
        total_files,
        total_bytes,
    });
    hooks.token.checkpoint(hooks.confirm)?;

    for entry in entries {
        let shown = entry.name.to_string_lossy().into_owned();
        match entry.kind {
            EntryKind::Directory => {
                builder
                    .append_dir(&entry.name, &entry.path)
                    .io_ctx("archive directory", &entry.path)?;
                stats.directories += 1;
            }
            EntryKind::File => {
                let mut file = File::open(&entry.path).io_ctx("open source file", &entry.path)?;
                builder
                    .append_file(&entry.name, &mut file)
                    .io_ctx("archive file", &entry.path)?;
                stats.record_file(entry.size);
            }
            EntryKind::Symlink => {
                builder
                    .append_path_with_name(&entry.path, &entry.name)
                    .io_ctx("archive symlink", &entry.path)?;
                stats.symlinks += 1;
            }
            EntryKind::Special => {
                stats.skipped += 1;
                hooks.skipped(shown, "special file");
                continue;
            }
        }
        tracing::trace!(entry = %shown, size = entry.size, "archived");
        hooks.entry_done(shown, entry.size)?;
    }
    Ok(stats)
}

/// Options for [`extract_entries`]
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtractSettings {
    pub overwrite: OverwritePolicy,
    pub preserve_permissions: bool,
}

fn header_error(e: io::Error) -> STarError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => STarError::Io {
            op: "read archive",
            path: None,
            source: e,
        },
        _ => STarError::InvalidFormat(format!("malformed archive stream: {e}")),
    }
}

/// Unpack every entry of the tar stream under `dest`
///
/// Entries whose path would leave `dest` are skipped with a warning. The
/// reader is handed back so the caller can drain the rest of the stream.
pub(crate) fn extract_entries<R: Read>(
    reader: R,
    dest: &Path,
    settings: ExtractSettings,
    hooks: &EntryHooks<'_>,
) -> Result<(OperationStats, R)> {
    std::fs::create_dir_all(dest).io_ctx("create output directory", dest)?;

    let mut archive = tar::Archive::new(reader);
    archive.set_overwrite(settings.overwrite == OverwritePolicy::Overwrite);
    archive.set_preserve_permissions(settings.preserve_permissions);

    let mut stats = OperationStats::default();
    for entry in archive.entries().map_err(header_error)? {
        let mut entry = entry.map_err(header_error)?;
        let name = entry.path().map_err(header_error)?.into_owned();
        let shown = name.to_string_lossy().into_owned();
        let entry_type = entry.header().entry_type();
        let size = entry.size();

        if !entry_type.is_dir() && settings.overwrite != OverwritePolicy::Overwrite {
            let target = dest.join(&name);
            if target.symlink_metadata().is_ok() {
                if settings.overwrite == OverwritePolicy::Error {
                    return Err(STarError::DestinationExists(target));
                }
                stats.skipped += 1;
                hooks.skipped(shown, "destination exists");
                hooks.token.checkpoint(hooks.confirm)?;
                continue;
            }
        }

        let unpacked = match entry.unpack_in(dest) {
            Ok(unpacked) => unpacked,
            Err(e) => {
                if !entry_type.is_dir() {
                    remove_partial(dest, &name);
                }
                return Err(STarError::io("extract entry", dest.join(&name), e));
            }
        };
        if !unpacked {
            stats.skipped += 1;
            hooks.skipped(shown, "path escapes the output directory");
            hooks.token.checkpoint(hooks.confirm)?;
            continue;
        }

        match entry_type {
            t if t.is_dir() => stats.directories += 1,
            t if t.is_symlink() || t.is_hard_link() => stats.symlinks += 1,
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                stats.record_file(size)
            }
            _ => {}
        }
        tracing::trace!(entry = %shown, size, "extracted");
        hooks.entry_done(shown, size)?;
    }

    Ok((stats, archive.into_inner()))
}

/// Remove what a failed unpack left at `dest/name`
///
/// Only names that stay below `dest` are touched.
fn remove_partial(dest: &Path, name: &Path) {
    let contained = name
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !contained {
        return;
    }
    let target = dest.join(name);
    match target.symlink_metadata() {
        Ok(meta) if !meta.is_dir() => {
            if let Err(e) = std::fs::remove_file(&target) {
                tracing::warn!(path = %target.display(), error = %e, "failed to remove partial entry");
            } else {
                tracing::debug!(path = %target.display(), "removed partial entry");
            }
        }
        _ => {}
    }
}

/// Read entry headers, skipping bodies
pub(crate) fn list_entries<R: Read>(
    reader: R,
    hooks: &EntryHooks<'_>,
) -> Result<(Vec<ListedEntry>, R)> {
    let mut archive = tar::Archive::new(reader);
    let mut listed = Vec::new();
    for entry in archive.entries().map_err(header_error)? {
        let entry = entry.map_err(header_error)?;
        let name = entry.path().map_err(header_error)?;
        listed.push(ListedEntry {
            name: name.to_string_lossy().into_owned(),
            size: entry.size(),
            is_directory: entry.header().entry_type().is_dir(),
        });
        hooks.token.checkpoint(hooks.confirm)?;
    }
    Ok((listed, archive.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::always_confirm;
    use std::fs;
    use tempfile::tempdir;

    fn build(entries: &[SourceEntry]) -> (Vec<u8>, OperationStats) {
        let token = CancellationToken::new();
        let confirm = always_confirm();
        let progress = ProgressSender::disabled();
        let hooks = EntryHooks {
            token: &token,
            confirm: &confirm,
            progress: &progress,
        };
        let mut builder = tar::Builder::new(Vec::new());
        let stats = append_entries(&mut builder, entries, &hooks).unwrap();
        (builder.into_inner().unwrap(), stats)
    }

    fn extract(data: &[u8], dest: &Path, overwrite: OverwritePolicy) -> Result<OperationStats> {
        let token = CancellationToken::new();
        let confirm = always_confirm();
        let progress = ProgressSender::disabled();
        let hooks = EntryHooks {
            token: &token,
            confirm: &confirm,
            progress: &progress,
        };
        let settings = ExtractSettings {
            overwrite,
            preserve_permissions: true,
        };
        extract_entries(data, dest, settings, &hooks).map(|(stats, _)| stats)
    }

    fn sample_tree(root: &Path) -> PathBuf {
        let docs = root.join("docs");
        fs::create_dir_all(docs.join("sub")).unwrap();
        fs::create_dir_all(docs.join("empty")).unwrap();
        fs::write(docs.join("b.txt"), "bravo").unwrap();
        fs::write(docs.join("a.txt"), "alpha").unwrap();
        fs::write(docs.join("sub/c.txt"), "charlie").unwrap();
        docs
    }

    #[test]
    fn test_scan_names_and_order() {
        let dir = tempdir().unwrap();
        let docs = sample_tree(dir.path());
        let single = dir.path().join("single.bin");
        fs::write(&single, [0u8; 16]).unwrap();

        let entries = scan_sources(&[docs, single]).unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "docs",
                "docs/a.txt",
                "docs/b.txt",
                "docs/empty",
                "docs/sub",
                "docs/sub/c.txt",
                "single.bin"
            ]
        );
        assert_eq!(totals(&entries), (4, 5 + 5 + 7 + 16));
    }

    #[test]
    fn test_missing_source() {
        let dir = tempdir().unwrap();
        let err = scan_sources(&[dir.path().join("nope")]).unwrap_err();
        assert!(matches!(err, STarError::Io { .. }));
    }

    #[test]
    fn test_build_extract_and_list() {
        let src = tempdir().unwrap();
        let docs = sample_tree(src.path());
        let entries = scan_sources(&[docs]).unwrap();
        let (tar_bytes, stats) = build(&entries);
        assert_eq!(stats.files, 3);
        assert_eq!(stats.directories, 3);

        let out = tempdir().unwrap();
        let extracted = extract(&tar_bytes, out.path(), OverwritePolicy::Overwrite).unwrap();
        assert_eq!(extracted.files, 3);
        assert_eq!(fs::read_to_string(out.path().join("docs/sub/c.txt")).unwrap(), "charlie");
        assert!(out.path().join("docs/empty").is_dir());

        let token = CancellationToken::new();
        let confirm = always_confirm();
        let progress = ProgressSender::disabled();
        let hooks = EntryHooks {
            token: &token,
            confirm: &confirm,
            progress: &progress,
        };
        let (listed, _) = list_entries(&tar_bytes[..], &hooks).unwrap();
        assert_eq!(listed.len(), 6);
        assert!(listed.iter().any(|e| e.name == "docs/sub/c.txt" && e.size == 7));
        assert!(listed.iter().any(|e| e.name.trim_end_matches('/') == "docs/sub" && e.is_directory));
    }

    #[test]
    fn test_overwrite_policies() {
        let src = tempdir().unwrap();
        let docs = sample_tree(src.path());
        let (tar_bytes, _) = build(&scan_sources(&[docs]).unwrap());

        let out = tempdir().unwrap();
        fs::create_dir_all(out.path().join("docs")).unwrap();
        fs::write(out.path().join("docs/a.txt"), "local edit").unwrap();

        let err = extract(&tar_bytes, out.path(), OverwritePolicy::Error).unwrap_err();
        assert!(matches!(err, STarError::DestinationExists(_)));

        let stats = extract(&tar_bytes, out.path(), OverwritePolicy::Skip).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(fs::read_to_string(out.path().join("docs/a.txt")).unwrap(), "local edit");

        extract(&tar_bytes, out.path(), OverwritePolicy::Overwrite).unwrap();
        assert_eq!(fs::read_to_string(out.path().join("docs/a.txt")).unwrap(), "alpha");
    }

    #[test]
    fn test_escaping_entry_is_skipped() {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"not allowed";
        let mut header = tar::Header::new_gnu();
        let name = b"../evil.txt";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let root = tempdir().unwrap();
        let out = root.path().join("out");
        let stats = extract(&tar_bytes, &out, OverwritePolicy::Overwrite).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.files, 0);
        assert!(!root.path().join("evil.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_special_files_are_skipped() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("mixed");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("plain.txt"), "x").unwrap();
        let _socket = std::os::unix::net::UnixListener::bind(root.join("sock")).unwrap();
        std::os::unix::fs::symlink("plain.txt", root.join("link")).unwrap();

        let entries = scan_sources(&[&root]).unwrap();
        let (tar_bytes, stats) = build(&entries);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.symlinks, 1);

        let out = tempdir().unwrap();
        extract(&tar_bytes, out.path(), OverwritePolicy::Overwrite).unwrap();
        let link = out.path().join("mixed/link");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert!(!out.path().join("mixed/sock").exists());
    }

    #[test]
    fn test_cancel_between_entries() {
        let src = tempdir().unwrap();
        let docs = sample_tree(src.path());
        let entries = scan_sources(&[docs]).unwrap();

        let token = CancellationToken::new();
        token.interrupt();
        let confirm = always_confirm();
        let progress = ProgressSender::disabled();
        let hooks = EntryHooks {
            token: &token,
            confirm: &confirm,
            progress: &progress,
        };
        let mut builder = tar::Builder::new(Vec::new());
        let err = append_entries(&mut builder, &entries, &hooks).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_listing_resolves_interrupt() {
        let src = tempdir().unwrap();
        let (tar_bytes, _) = build(&scan_sources(&[sample_tree(src.path())]).unwrap());

        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        let decline: ConfirmFn = std::sync::Arc::new(move || {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            false
        });
        let token = CancellationToken::new();
        let progress = ProgressSender::disabled();
        token.interrupt();
        let hooks = EntryHooks {
            token: &token,
            confirm: &decline,
            progress: &progress,
        };
        let (listed, _) = list_entries(&tar_bytes[..], &hooks).unwrap();
        assert_eq!(listed.len(), 6);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(token.state(), crate::cancel::CancellationState::Running);

        token.interrupt();
        let confirm = always_confirm();
        let hooks = EntryHooks {
            token: &token,
            confirm: &confirm,
            progress: &progress,
        };
        let err = list_entries(&tar_bytes[..], &hooks).unwrap_err();
        assert!(err.is_cancelled());
    }

    /// Yields `left` bytes of `inner`, then fails
    struct FailAfter<'a> {
        inner: &'a [u8],
        left: usize,
    }

    impl Read for FailAfter<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.left == 0 {
                return Err(io::Error::other("source went away"));
            }
            let n = buf.len().min(self.left).min(self.inner.len());
            buf[..n].copy_from_slice(&self.inner[..n]);
            self.inner = &self.inner[n..];
            self.left -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_failed_entry_leaves_no_partial_file() {
        let src = tempdir().unwrap();
        let big = src.path().join("big.bin");
        fs::write(&big, vec![7u8; 64 * 1024]).unwrap();
        let (tar_bytes, _) = build(&scan_sources(&[&big]).unwrap());

        let token = CancellationToken::new();
        let confirm = always_confirm();
        let progress = ProgressSender::disabled();
        let hooks = EntryHooks {
            token: &token,
            confirm: &confirm,
            progress: &progress,
        };
        let settings = ExtractSettings {
            overwrite: OverwritePolicy::Overwrite,
            preserve_permissions: true,
        };
        // header plus half of the body, then a read error
        let reader = FailAfter {
            inner: &tar_bytes,
            left: 512 + 32 * 1024,
        };
        let out = tempdir().unwrap();
        let err = extract_entries(reader, out.path(), settings, &hooks).err();
        assert!(matches!(err, Some(STarError::Io { .. })));
        assert!(!out.path().join("big.bin").exists());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("skip".parse::<OverwritePolicy>().unwrap(), OverwritePolicy::Skip);
        assert!("maybe".parse::<OverwritePolicy>().is_err());
    }
}
