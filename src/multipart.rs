//! Streaming `multipart/form-data` upload parser.
//!
//! The body is consumed line by line straight off the request stream and each
//! `file` field is written to disk as it arrives. `Content-Length` is the only
//! termination authority: every read is capped by the remaining byte count, so
//! the parser never reads past the declared body.

use memchr::memmem;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::debug;

use crate::atomic::AtomicFile;
use crate::storage::sanitize_segment;

/// Longest single read; longer lines are handled as consecutive fragments.
pub const MAX_LINE_LEN: u64 = 64 * 1024;

const FILENAME_MARKER: &[u8] = b"name=\"file\"; filename=\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    Protocol,
    Io,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Content-Type header doesn't contain boundary")]
    MissingBoundary,
    #[error("Content-Length header is missing or invalid")]
    InvalidContentLength,
    #[error("content does not begin with boundary")]
    MissingLeadingBoundary,
    #[error("cannot determine file name")]
    MissingFileName,
    #[error("invalid file name `{0}`")]
    InvalidFileName(String),
    #[error("request body ended before the closing boundary")]
    TruncatedBody,
    #[error("cannot create file, check write permission: {0}")]
    CreateFile(#[source] io::Error),
    #[error("failed to write uploaded file: {0}")]
    WriteFile(#[source] io::Error),
    #[error("failed to read request body: {0}")]
    ReadBody(#[source] io::Error),
}

impl UploadError {
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::CreateFile(_) | UploadError::WriteFile(_) | UploadError::ReadBody(_) => {
                UploadErrorKind::Io
            }
            _ => UploadErrorKind::Protocol,
        }
    }
}

/// Outcome of one POST; built once and never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub success: bool,
    pub message: String,
    /// Files written, in order of appearance. On failure these are the
    /// fields finalized before the error; they are not rolled back.
    pub saved_paths: Vec<PathBuf>,
    pub error_kind: Option<UploadErrorKind>,
}

impl UploadResult {
    fn succeeded(saved_paths: Vec<PathBuf>) -> Self {
        let joined = saved_paths
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            success: true,
            message: format!("File '{joined}' upload success!"),
            saved_paths,
            error_kind: None,
        }
    }

    pub fn failed(error: &UploadError, saved_paths: Vec<PathBuf>) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            saved_paths,
            error_kind: Some(error.kind()),
        }
    }
}

/// Extracts the boundary token: everything after the first `=`.
pub fn boundary_from_content_type(content_type: Option<&str>) -> Result<Vec<u8>, UploadError> {
    let (_, boundary) = content_type
        .and_then(|value| value.split_once('='))
        .ok_or(UploadError::MissingBoundary)?;
    let boundary = boundary.trim().trim_matches('"');
    if boundary.is_empty() {
        return Err(UploadError::MissingBoundary);
    }
    Ok(boundary.as_bytes().to_vec())
}

/// Parses an upload body into `destination` and reports the outcome.
///
/// Parsing stops at the first error; the rest of the body is left unread.
pub async fn parse<R>(
    body: R,
    content_type: Option<&str>,
    content_length: u64,
    destination: &Path,
) -> UploadResult
where
    R: AsyncBufRead + Unpin,
{
    let boundary = match boundary_from_content_type(content_type) {
        Ok(boundary) => boundary,
        Err(err) => return UploadResult::failed(&err, Vec::new()),
    };
    let mut parser = MultipartStreamParser::new(body, &boundary, content_length, destination);
    let outcome = parser.run().await;
    let saved_paths = parser.saved_paths().to_vec();
    match outcome {
        Ok(()) => UploadResult::succeeded(saved_paths),
        Err(err) => {
            debug!(kind = ?err.kind(), error = %err, "multipart parse aborted");
            UploadResult::failed(&err, saved_paths)
        }
    }
}

/// One `file` field being streamed to disk.
struct MultipartField {
    file: AtomicFile,
    /// Previous line, held back until we know whether it ends the content.
    held: Option<Vec<u8>>,
}

enum State {
    AwaitingFirstBoundary,
    AwaitingFieldHeader,
    AwaitingFieldHeaderTail { target: PathBuf },
    StreamingFieldBody(MultipartField),
    Finished,
}

pub struct MultipartStreamParser<'a, R> {
    reader: R,
    delimiter: Vec<u8>,
    remaining: u64,
    destination: &'a Path,
    saved: Vec<PathBuf>,
}

impl<'a, R> MultipartStreamParser<'a, R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R, boundary: &[u8], content_length: u64, destination: &'a Path) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary);
        Self {
            reader,
            delimiter,
            remaining: content_length,
            destination,
            saved: Vec::new(),
        }
    }

    pub fn saved_paths(&self) -> &[PathBuf] {
        &self.saved
    }

    pub async fn run(&mut self) -> Result<(), UploadError> {
        let mut line = Vec::new();
        let mut state = State::AwaitingFirstBoundary;

        loop {
            state = match state {
                State::AwaitingFirstBoundary => {
                    self.read_line(&mut line).await?;
                    if !self.is_boundary(&line) {
                        return Err(UploadError::MissingLeadingBoundary);
                    }
                    self.after_boundary(&line)
                }
                State::AwaitingFieldHeader => {
                    if self.remaining == 0 {
                        State::Finished
                    } else {
                        self.read_line(&mut line).await?;
                        let target = self.field_target(&line)?;
                        State::AwaitingFieldHeaderTail { target }
                    }
                }
                State::AwaitingFieldHeaderTail { target } => {
                    if self.remaining == 0 {
                        return Err(UploadError::TruncatedBody);
                    }
                    self.read_line(&mut line).await?;
                    if is_blank(&line) {
                        let file = AtomicFile::create(&target)
                            .await
                            .map_err(UploadError::CreateFile)?;
                        State::StreamingFieldBody(MultipartField { file, held: None })
                    } else {
                        State::AwaitingFieldHeaderTail { target }
                    }
                }
                State::StreamingFieldBody(field) => self.stream_field(field, &mut line).await?,
                State::Finished => return Ok(()),
            };
        }
    }

    /// Advances one line inside a field body.
    async fn stream_field(
        &mut self,
        mut field: MultipartField,
        line: &mut Vec<u8>,
    ) -> Result<State, UploadError> {
        if self.remaining == 0 {
            field.file.cleanup().await;
            return Err(UploadError::TruncatedBody);
        }
        if let Err(err) = self.read_line(line).await {
            field.file.cleanup().await;
            return Err(err);
        }

        if self.is_boundary(line) {
            if let Some(mut last) = field.held.take() {
                strip_line_terminator(&mut last);
                if let Err(err) = field.file.write_all(&last).await {
                    field.file.cleanup().await;
                    return Err(UploadError::WriteFile(err));
                }
            }
            let saved = field.file.finalize().await.map_err(UploadError::WriteFile)?;
            debug!(path = ?saved, "upload field saved");
            self.saved.push(saved);
            return Ok(self.after_boundary(line));
        }

        let current = std::mem::take(line);
        if let Some(mut previous) = field.held.replace(current) {
            // A fragment cut right after `\r` may be the first half of the
            // terminator before the boundary; carry the `\r` forward.
            if previous.last() == Some(&b'\r') {
                previous.pop();
                if let Some(held) = field.held.as_mut() {
                    held.insert(0, b'\r');
                }
            }
            if let Err(err) = field.file.write_all(&previous).await {
                field.file.cleanup().await;
                return Err(UploadError::WriteFile(err));
            }
            *line = previous;
        }
        Ok(State::StreamingFieldBody(field))
    }

    /// Reads at most one line, never past the remaining byte count.
    async fn read_line(&mut self, line: &mut Vec<u8>) -> Result<usize, UploadError> {
        line.clear();
        let limit = self.remaining.min(MAX_LINE_LEN);
        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', line)
            .await
            .map_err(UploadError::ReadBody)?;
        if read == 0 && self.remaining > 0 {
            return Err(UploadError::TruncatedBody);
        }
        self.remaining -= read as u64;
        Ok(read)
    }

    fn is_boundary(&self, line: &[u8]) -> bool {
        memmem::find(line, &self.delimiter).is_some()
    }

    fn after_boundary(&self, line: &[u8]) -> State {
        if is_closing_delimiter(line, &self.delimiter) {
            State::Finished
        } else {
            State::AwaitingFieldHeader
        }
    }

    fn field_target(&self, header: &[u8]) -> Result<PathBuf, UploadError> {
        let raw = extract_filename(header).ok_or(UploadError::MissingFileName)?;
        let name = String::from_utf8_lossy(raw);
        let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
        let segment =
            sanitize_segment(base).ok_or_else(|| UploadError::InvalidFileName(name.to_string()))?;
        Ok(self.destination.join(segment))
    }
}

/// Captures the quoted filename of the `file` field, up to the last quote on the line.
fn extract_filename(header: &[u8]) -> Option<&[u8]> {
    let start = memmem::find(header, FILENAME_MARKER)? + FILENAME_MARKER.len();
    let rest = &header[start..];
    let end = memchr::memrchr(b'"', rest)?;
    Some(&rest[..end])
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn is_closing_delimiter(line: &[u8], delimiter: &[u8]) -> bool {
    let trimmed = line.trim_ascii_end();
    trimmed.len() >= delimiter.len() + 2
        && trimmed.ends_with(b"--")
        && trimmed[..trimmed.len() - 2].ends_with(delimiter)
}

fn strip_line_terminator(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BOUNDARY: &str = "----WebKitFormBoundary7MA4YWxkTrZu0gW";

    fn content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    fn part(filename: &str, content: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        out.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        out.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        out.extend_from_slice(content);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn body(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, content) in parts {
            out.extend(part(name, content));
        }
        out.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        out
    }

    async fn run(body: &[u8], dir: &Path) -> UploadResult {
        parse(body, Some(&content_type()), body.len() as u64, dir).await
    }

    #[tokio::test]
    async fn single_field_is_written_exactly() {
        let temp = tempdir().expect("tempdir");
        let result = run(&body(&[("x.txt", b"hello")]), temp.path()).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(result.error_kind, None);
        assert_eq!(result.saved_paths, vec![temp.path().join("x.txt")]);
        assert_eq!(std::fs::read(temp.path().join("x.txt")).expect("read"), b"hello");
        assert!(result.message.contains("x.txt"));
    }

    #[tokio::test]
    async fn two_fields_are_saved_in_order() {
        let temp = tempdir().expect("tempdir");
        let result = run(
            &body(&[("b.txt", b"second\nline"), ("a.txt", b"first")]),
            temp.path(),
        )
        .await;

        assert!(result.success, "{}", result.message);
        assert_eq!(
            result.saved_paths,
            vec![temp.path().join("b.txt"), temp.path().join("a.txt")]
        );
        assert_eq!(
            std::fs::read(temp.path().join("b.txt")).expect("read b"),
            b"second\nline"
        );
        assert_eq!(std::fs::read(temp.path().join("a.txt")).expect("read a"), b"first");
    }

    #[tokio::test]
    async fn binary_content_with_line_breaks_survives() {
        let temp = tempdir().expect("tempdir");
        let content: Vec<u8> = (0u8..=255).chain(b"\r\n\r\n\n\r".iter().copied()).collect();
        let result = run(&body(&[("blob.bin", &content)]), temp.path()).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(std::fs::read(temp.path().join("blob.bin")).expect("read"), content);
    }

    #[tokio::test]
    async fn empty_file_content_creates_empty_file() {
        let temp = tempdir().expect("tempdir");
        let result = run(&body(&[("empty.txt", b"")]), temp.path()).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(std::fs::read(temp.path().join("empty.txt")).expect("read"), b"");
    }

    #[tokio::test]
    async fn lines_longer_than_one_read_are_reassembled() {
        let temp = tempdir().expect("tempdir");
        let content = vec![b'z'; (MAX_LINE_LEN as usize) * 2 + 17];
        let result = run(&body(&[("long.txt", &content)]), temp.path()).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(std::fs::read(temp.path().join("long.txt")).expect("read"), content);
    }

    #[tokio::test]
    async fn terminator_split_across_reads_is_stripped() {
        let temp = tempdir().expect("tempdir");
        for len in [MAX_LINE_LEN as usize - 1, 2 * MAX_LINE_LEN as usize - 1] {
            let content = vec![b'z'; len];
            let result = run(&body(&[("split.txt", &content)]), temp.path()).await;

            assert!(result.success, "{}", result.message);
            let written = std::fs::read(temp.path().join("split.txt")).expect("read");
            assert_eq!(written.len(), len);
            assert_eq!(written, content);
        }
    }

    #[tokio::test]
    async fn carriage_return_at_read_edge_inside_content_is_kept() {
        let temp = tempdir().expect("tempdir");
        let mut content = vec![b'z'; MAX_LINE_LEN as usize - 1];
        content.push(b'\r');
        content.extend_from_slice(b"tail\nmore");
        let result = run(&body(&[("cr.bin", &content)]), temp.path()).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(std::fs::read(temp.path().join("cr.bin")).expect("read"), content);
    }

    #[tokio::test]
    async fn missing_boundary_fails_without_touching_disk() {
        let temp = tempdir().expect("tempdir");
        let data = body(&[("x.txt", b"hello")]);
        let result = parse(&data[..], Some("text/plain"), data.len() as u64, temp.path()).await;

        assert!(!result.success);
        assert_eq!(result.message, "Content-Type header doesn't contain boundary");
        assert_eq!(result.error_kind, Some(UploadErrorKind::Protocol));
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);

        let result = parse(&data[..], None, data.len() as u64, temp.path()).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn body_not_starting_with_boundary_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let mut data = b"garbage\r\n".to_vec();
        data.extend(body(&[("x.txt", b"hello")]));
        let result = run(&data, temp.path()).await;

        assert!(!result.success);
        assert_eq!(result.message, "content does not begin with boundary");
    }

    #[tokio::test]
    async fn non_file_field_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let data = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"comment\"\r\n\r\nhi\r\n--{BOUNDARY}--\r\n"
        );
        let result = run(data.as_bytes(), temp.path()).await;

        assert!(!result.success);
        assert_eq!(result.message, "cannot determine file name");
    }

    #[tokio::test]
    async fn traversal_in_filename_stays_in_destination() {
        let temp = tempdir().expect("tempdir");
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest).expect("create dest");
        let result = run(
            &body(&[("../../escape.txt", b"x"), ("C:\\Users\\me\\win.txt", b"y")]),
            &dest,
        )
        .await;

        assert!(result.success, "{}", result.message);
        assert_eq!(
            result.saved_paths,
            vec![dest.join("escape.txt"), dest.join("win.txt")]
        );
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn dot_dot_filename_is_invalid() {
        let temp = tempdir().expect("tempdir");
        let result = run(&body(&[("..", b"x")]), temp.path()).await;

        assert!(!result.success);
        assert!(result.message.starts_with("invalid file name"));
    }

    #[tokio::test]
    async fn truncated_body_keeps_earlier_fields_only() {
        let temp = tempdir().expect("tempdir");
        let mut data = part("first.txt", b"one");
        data.extend(part("second.txt", b"two and more"));
        // Cut inside the second field's content.
        data.truncate(data.len() - 6);
        let result = run(&data, temp.path()).await;

        assert!(!result.success);
        assert_eq!(result.message, "request body ended before the closing boundary");
        assert_eq!(result.saved_paths, vec![temp.path().join("first.txt")]);
        assert!(!temp.path().join("second.txt").exists());
        let names: Vec<_> = std::fs::read_dir(temp.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("first.txt")]);
    }

    #[tokio::test]
    async fn never_reads_past_content_length() {
        let temp = tempdir().expect("tempdir");
        let data = body(&[("x.txt", b"hello")]);
        let mut stream = data.clone();
        stream.extend_from_slice(b"NEXT REQUEST BYTES");
        let mut reader = &stream[..];

        let mut parser =
            MultipartStreamParser::new(&mut reader, BOUNDARY.as_bytes(), data.len() as u64, temp.path());
        parser.run().await.expect("parse");

        assert_eq!(parser.saved_paths(), [temp.path().join("x.txt")]);
        assert_eq!(reader, b"NEXT REQUEST BYTES");
    }

    #[tokio::test]
    async fn stream_closing_early_is_truncation() {
        let temp = tempdir().expect("tempdir");
        let data = body(&[("x.txt", b"hello")]);
        let result = parse(
            &data[..],
            Some(&content_type()),
            data.len() as u64 + 100,
            temp.path(),
        )
        .await;

        // Closing delimiter ends the body even though the counter is still positive.
        assert!(result.success, "{}", result.message);

        let cut = &data[..data.len() - format!("--{BOUNDARY}--\r\n").len()];
        let result = parse(cut, Some(&content_type()), data.len() as u64, temp.path()).await;
        assert!(!result.success);
        assert_eq!(
            UploadError::TruncatedBody.to_string(),
            result.message
        );
    }

    #[tokio::test]
    async fn unwritable_destination_reports_io_error() {
        let temp = tempdir().expect("tempdir");
        let missing = temp.path().join("does-not-exist");
        let result = run(&body(&[("x.txt", b"hello")]), &missing).await;

        assert!(!result.success);
        assert!(result.message.starts_with("cannot create file"));
        assert_eq!(result.error_kind, Some(UploadErrorKind::Io));
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            boundary_from_content_type(Some("multipart/form-data; boundary=abc")).expect("boundary"),
            b"abc"
        );
        assert_eq!(
            boundary_from_content_type(Some("multipart/form-data; boundary=\"q q\"")).expect("boundary"),
            b"q q"
        );
        assert!(boundary_from_content_type(Some("multipart/form-data; boundary=")).is_err());
        assert!(boundary_from_content_type(Some("multipart/form-data")).is_err());
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(UploadError::MissingBoundary.kind(), UploadErrorKind::Protocol);
        assert_eq!(UploadError::MissingFileName.kind(), UploadErrorKind::Protocol);
        assert_eq!(
            UploadError::CreateFile(io::Error::from(io::ErrorKind::PermissionDenied)).kind(),
            UploadErrorKind::Io
        );
    }

    #[test]
    fn filename_capture_is_greedy_to_last_quote() {
        let header = b"Content-Disposition: form-data; name=\"file\"; filename=\"a \"b\".txt\"\r\n";
        assert_eq!(extract_filename(header), Some(&b"a \"b\".txt"[..]));
        assert_eq!(extract_filename(b"Content-Disposition: form-data; name=\"file\"\r\n"), None);
    }
}
