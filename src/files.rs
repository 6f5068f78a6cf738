//! 请求分发：GET/HEAD 文件与目录服务，POST 交给上传处理。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::listing::list_directory;
use crate::mime::MimeTable;
use crate::storage::{ResolvedPath, Storage};
use crate::upload::handle_upload;

const INDEX_FILES: [&str; 2] = ["index.html", "index.htm"];

/// 所有路径的统一入口。
pub async fn dispatch(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(mime_table): Extension<Arc<MimeTable>>,
    req: Request<AxumBody>,
) -> Response {
    let method = req.method().clone();
    let result = match method {
        Method::GET => serve_path(&storage, &mime_table, req.uri()).await,
        Method::HEAD => serve_path(&storage, &mime_table, req.uri())
            .await
            .map(strip_body),
        Method::POST => handle_upload(&storage, req).await,
        _ => Err(ApiError::NotImplemented("Unsupported method".into())),
    };
    result.unwrap_or_else(|err| err.into_response())
}

/// GET/HEAD 共用逻辑：重定向、索引文件、目录列表或文件内容。
async fn serve_path(
    storage: &Storage,
    mime_table: &MimeTable,
    uri: &Uri,
) -> Result<Response, ApiError> {
    let request_path = uri.path();
    let mut target = storage.resolve(request_path);

    if is_dir(&target).await {
        if !request_path.ends_with('/') {
            return redirect_to_directory(uri);
        }
        match find_index(&target).await {
            Some(index) => target = index,
            None => return list_directory(storage, &target, request_path).await,
        }
    }

    serve_file(mime_table, &target, request_path).await
}

async fn serve_file(
    mime_table: &MimeTable,
    target: &ResolvedPath,
    request_path: &str,
) -> Result<Response, ApiError> {
    let file = match File::open(target.as_path()).await {
        Ok(file) => file,
        Err(err) => {
            warn!(path = request_path, error = %err, "file not found");
            return Err(ApiError::NotFound("File not found".into()));
        }
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::NotFound("File not found".into()))?;
    let file_size = metadata.len();
    let mime = mime_table.guess_type(target.as_path());

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&mime).map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    if let Ok(modified) = metadata.modified() {
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
        );
    }

    info!(path = request_path, size = file_size, "serve file");
    let stream = ReaderStream::new(file);
    Ok((StatusCode::OK, headers, AxumBody::from_stream(stream)).into_response())
}

/// 目录缺少结尾斜杠时 301 到 `path/`，保留查询串。
fn redirect_to_directory(uri: &Uri) -> Result<Response, ApiError> {
    let mut location = format!("{}/", uri.path());
    if let Some(query) = uri.query() {
        location.push('?');
        location.push_str(query);
    }
    info!(location = %location, "redirect to directory");
    let location = HeaderValue::from_str(&location)
        .map_err(|_| ApiError::Internal("响应头构建失败".into()))?;
    Ok((StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response())
}

async fn find_index(dir: &ResolvedPath) -> Option<ResolvedPath> {
    for name in INDEX_FILES {
        let candidate = dir.child(name);
        if let Ok(metadata) = fs::metadata(candidate.as_path()).await
            && metadata.is_file()
        {
            return Some(candidate);
        }
    }
    None
}

async fn is_dir(path: &ResolvedPath) -> bool {
    fs::metadata(path.as_path())
        .await
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false)
}

/// HEAD 只保留响应头。
fn strip_body(response: Response) -> Response {
    let (parts, _) = response.into_parts();
    Response::from_parts(parts, AxumBody::empty())
}
