//! Served root, request-path resolution and directory enumeration.

use chrono::{DateTime, Local};
use percent_encoding::percent_decode_str;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

use crate::atomic::is_temp_file_name;

/// Absolute path produced by [`resolve_request_path`]; always at or below the served root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath(PathBuf);

impl ResolvedPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Joins one already-sanitized segment.
    pub fn child(&self, segment: &str) -> ResolvedPath {
        ResolvedPath(self.0.join(segment))
    }
}

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, request_path: &str) -> ResolvedPath {
        resolve_request_path(request_path, &self.root)
    }

    /// Enumerates a directory, sorted case-insensitively by name.
    pub async fn list_dir(&self, dir: &ResolvedPath) -> Result<Vec<DirectoryEntry>, StorageError> {
        let mut read_dir = fs::read_dir(dir.as_path()).await?;
        let mut entries = Vec::new();

        while let Some(entry) = read_dir.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy().into_owned();
            // In-progress uploads.
            if is_temp_file_name(&name) {
                continue;
            }
            let path = entry.path();
            // Follows symlinks; a dangling link falls back to the link itself.
            let metadata = match fs::metadata(&path).await {
                Ok(metadata) => Some(metadata),
                Err(_) => fs::symlink_metadata(&path).await.ok(),
            };
            let is_symlink = fs::symlink_metadata(&path)
                .await
                .map(|metadata| metadata.file_type().is_symlink())
                .unwrap_or(false);
            let is_directory = metadata.as_ref().is_some_and(|metadata| metadata.is_dir());

            let (size_bytes, created_at) = match metadata {
                Some(metadata) if !is_directory => (
                    Some(metadata.len()),
                    metadata.created().ok().map(format_timestamp),
                ),
                _ => (None, None),
            };

            entries.push(DirectoryEntry {
                raw_name: name_bytes(&file_name),
                name,
                is_directory,
                is_symlink,
                size_bytes,
                created_at,
            });
        }

        entries.sort_by_key(|entry| entry.name.to_lowercase());
        Ok(entries)
    }
}

/// Maps an untrusted request path onto `root`.
///
/// Query and fragment are dropped, the rest is percent-decoded and
/// normalized, and every surviving segment is reduced to a plain file name
/// before being joined. Never fails; existence is the caller's concern.
pub fn resolve_request_path(request_path: &str, root: &Path) -> ResolvedPath {
    let path = request_path.split('?').next().unwrap_or_default();
    let path = path.split('#').next().unwrap_or_default();
    let decoded: Vec<u8> = percent_decode_str(path).collect();

    let mut resolved = root.to_path_buf();
    for segment in normalize(&decoded) {
        push_segment(&mut resolved, segment);
    }
    ResolvedPath(resolved)
}

/// Collapses `.`, `..` and repeated separators; `..` never climbs above the start.
fn normalize(path: &[u8]) -> Vec<&[u8]> {
    let mut segments: Vec<&[u8]> = Vec::new();
    for segment in path.split(|&byte| byte == b'/') {
        match segment {
            b"" | b"." => continue,
            b".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments
}

fn push_segment(resolved: &mut PathBuf, segment: &[u8]) {
    match std::str::from_utf8(segment) {
        Ok(segment) => {
            if let Some(segment) = sanitize_segment(segment) {
                resolved.push(segment);
            }
        }
        Err(_) => push_raw_segment(resolved, segment),
    }
}

/// Non-UTF-8 file names are kept byte for byte so listed links resolve again.
/// The segment holds no `/`, and `.`/`..` are valid UTF-8.
#[cfg(unix)]
fn push_raw_segment(resolved: &mut PathBuf, segment: &[u8]) {
    use std::os::unix::ffi::OsStrExt;
    resolved.push(OsStr::from_bytes(segment));
}

#[cfg(not(unix))]
fn push_raw_segment(resolved: &mut PathBuf, segment: &[u8]) {
    let segment = String::from_utf8_lossy(segment);
    if let Some(segment) = sanitize_segment(&segment) {
        resolved.push(segment);
    }
}

#[cfg(unix)]
fn name_bytes(name: &OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn name_bytes(name: &OsStr) -> Vec<u8> {
    name.to_string_lossy().into_owned().into_bytes()
}

/// Reduces one segment to a base name that is safe to join.
///
/// Returns `None` when nothing usable is left (empty, `.` or `..`).
pub fn sanitize_segment(segment: &str) -> Option<&str> {
    let segment = strip_drive(segment);
    let base = segment
        .rsplit(std::path::is_separator)
        .next()
        .unwrap_or_default();
    match base {
        "" | "." | ".." => None,
        other => Some(other),
    }
}

#[cfg(windows)]
fn strip_drive(segment: &str) -> &str {
    let bytes = segment.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        &segment[2..]
    } else {
        segment
    }
}

#[cfg(not(windows))]
fn strip_drive(segment: &str) -> &str {
    segment
}

fn format_timestamp(timestamp: SystemTime) -> String {
    let datetime: DateTime<Local> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    /// Display name; lossy for names that are not UTF-8.
    pub name: String,
    /// Name as stored on disk, used for link targets.
    pub raw_name: Vec<u8>,
    pub is_directory: bool,
    pub is_symlink: bool,
    pub size_bytes: Option<u64>,
    pub created_at: Option<String>,
}
