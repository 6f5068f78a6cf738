//! HTML directory listing with an embedded upload form.

use axum::body::Body as AxumBody;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use htmlescape::encode_minimal;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, percent_encode};
use std::fmt::Write as _;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::storage::{DirectoryEntry, ResolvedPath, Storage};

/// Characters left unescaped in link targets: unreserved plus `/`.
const LINK_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

const SIZE_UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

/// Renders the listing page for `dir`, or `NotFound` if it cannot be enumerated.
pub async fn list_directory(
    storage: &Storage,
    dir: &ResolvedPath,
    request_path: &str,
) -> Result<Response, ApiError> {
    let entries = match storage.list_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = request_path, error = %err, "cannot list directory");
            return Err(err.into());
        }
    };
    let page = render_listing(request_path, &entries);
    info!(path = request_path, count = entries.len(), "list directory");
    html_response(page)
}

/// Builds a 200 `text/html` response with an explicit `Content-Length`.
pub fn html_response(page: String) -> Result<Response, ApiError> {
    let length = HeaderValue::from_str(&page.len().to_string())
        .map_err(|_| ApiError::Internal("响应头构建失败".into()))?;
    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            ),
            (header::CONTENT_LENGTH, length),
        ],
        AxumBody::from(page),
    )
        .into_response())
}

pub fn render_listing(request_path: &str, entries: &[DirectoryEntry]) -> String {
    let display_path = encode_minimal(&percent_decode_str(request_path).decode_utf8_lossy());
    let mut page = String::with_capacity(1024 + entries.len() * 128);

    page.push_str("<!DOCTYPE html PUBLIC \"-//W3C//DTD HTML 3.2 Final//EN\">\n");
    let _ = writeln!(page, "<html>\n<title>Directory listing for {display_path}</title>");
    page.push_str(concat!(
        "<style type=\"text/css\">\n",
        "a { text-decoration: none; font-weight: bold; color: #0000ff; }\n",
        "a:hover { color: #ff0000; }\n",
        "td { padding: 0 1em 0 0; }\n",
        "td.size, td.date { text-align: right; }\n",
        "</style>\n",
    ));
    let _ = writeln!(page, "<body>\n<h2>Directory listing for {display_path}</h2>");
    page.push_str("<hr>\n");
    page.push_str(concat!(
        "<form ENCTYPE=\"multipart/form-data\" method=\"post\">",
        "<input name=\"file\" type=\"file\" multiple/>",
        "<input type=\"submit\" value=\"upload\"/></form>\n",
    ));
    page.push_str("<hr>\n<table>\n");
    page.push_str("<tr><th>Name</th><th>Size</th><th>Created</th></tr>\n");

    if request_path != "/" {
        page.push_str(
            "<tr><td><a href=\"../\">Parent Directory</a></td><td class=\"size\"></td><td class=\"date\"></td></tr>\n",
        );
    }

    for entry in entries {
        let mut display_name = entry.name.clone();
        let mut link_name = percent_encode(&entry.raw_name, LINK_ENCODE_SET).to_string();
        if entry.is_directory {
            display_name.push('/');
            link_name.push('/');
        }
        // A symlinked directory shows `@` but still links with `/`.
        if entry.is_symlink {
            if entry.is_directory {
                display_name.pop();
            }
            display_name.push('@');
        }
        let size = entry.size_bytes.map(format_size).unwrap_or_default();
        let created = entry.created_at.as_deref().unwrap_or_default();
        let _ = writeln!(
            page,
            "<tr><td><a href=\"{}\">{}</a></td><td class=\"size\">{}</td><td class=\"date\">{}</td></tr>",
            encode_minimal(&link_name),
            encode_minimal(&display_name),
            size,
            encode_minimal(created),
        );
    }

    page.push_str("</table>\n<hr>\n</body>\n</html>\n");
    page
}

/// Human-readable size: plain bytes below 1 KiB, two decimals above.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} Bytes");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = SIZE_UNITS[0];
    for next in &SIZE_UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.2} {unit}")
}
