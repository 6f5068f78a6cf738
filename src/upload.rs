//! POST 上传处理与结果页渲染。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, Request, header};
use axum::response::Response;
use futures_util::TryStreamExt;
use htmlescape::encode_minimal;
use http_body_util::BodyExt;
use std::io;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::listing::html_response;
use crate::multipart::{self, UploadError, UploadResult};
use crate::storage::Storage;

/// 解析上传体并始终以 200 结果页响应；失败原因写在页面中。
pub async fn handle_upload(storage: &Storage, req: Request<AxumBody>) -> Result<Response, ApiError> {
    let (parts, body) = req.into_parts();
    let request_path = parts.uri.path().to_string();
    let destination = storage.resolve(&request_path);

    let result = match content_length(&parts.headers) {
        Some(length) => {
            let stream = BodyExt::into_data_stream(body).map_err(io::Error::other);
            let reader = StreamReader::new(stream);
            multipart::parse(
                reader,
                header_str(&parts.headers, header::CONTENT_TYPE),
                length,
                destination.as_path(),
            )
            .await
        }
        None => UploadResult::failed(&UploadError::InvalidContentLength, Vec::new()),
    };

    if result.success {
        info!(path = %request_path, saved = ?result.saved_paths, "upload complete");
    } else {
        warn!(
            path = %request_path,
            error = %result.message,
            kind = ?result.error_kind,
            saved = ?result.saved_paths,
            "upload failed"
        );
    }

    let back = header_str(&parts.headers, header::REFERER).unwrap_or(&request_path);
    html_response(render_result_page(&result, back))
}

pub fn render_result_page(result: &UploadResult, back_link: &str) -> String {
    let label = if result.success { "Success:" } else { "Failed:" };
    format!(
        concat!(
            "<!DOCTYPE html PUBLIC \"-//W3C//DTD HTML 3.2 Final//EN\">\n",
            "<html>\n<title>Upload Result Page</title>\n",
            "<body>\n<h2>Upload Result Page</h2>\n",
            "<hr>\n",
            "<strong>{label}</strong>{message}",
            "<br><a href=\"{back}\">back</a>\n",
            "<hr>\n</body>\n</html>\n",
        ),
        label = label,
        message = encode_minimal(&result.message),
        back = encode_minimal(back_link),
    )
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_LENGTH)?.trim().parse().ok()
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
