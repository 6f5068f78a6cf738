//! 扩展名到 Content-Type 的查询表（启动时构建，之后只读）。

use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const BUILTIN_OVERRIDES: &[(&str, &str)] = &[
    ("py", "text/plain"),
    ("c", "text/plain"),
    ("h", "text/plain"),
];

#[derive(Debug, Clone)]
pub struct MimeTable {
    overrides: HashMap<String, String>,
}

impl Default for MimeTable {
    fn default() -> Self {
        Self::with_overrides(std::iter::empty())
    }
}

impl MimeTable {
    /// 内置覆盖项之上叠加调用方提供的 `扩展名 -> 类型`。
    pub fn with_overrides(extra: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut overrides: HashMap<String, String> = BUILTIN_OVERRIDES
            .iter()
            .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
            .collect();
        for (ext, mime) in extra {
            overrides.insert(ext.trim_start_matches('.').to_string(), mime);
        }
        Self { overrides }
    }

    /// 先区分大小写、再忽略大小写查询覆盖表，最后回退到 mime_guess。
    pub fn guess_type(&self, path: &Path) -> String {
        let Some(ext) = path.extension().map(|ext| ext.to_string_lossy()) else {
            return DEFAULT_MIME_TYPE.to_string();
        };
        if let Some(mime) = self.overrides.get(ext.as_ref()) {
            return mime.clone();
        }
        let lower = ext.to_lowercase();
        if let Some(mime) = self.overrides.get(&lower) {
            return mime.clone();
        }
        mime_guess::from_ext(&lower)
            .first()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
    }
}

/// 解析命令行的 `EXT=TYPE` 覆盖项。
pub fn parse_mime_override(value: &str) -> Result<(String, String), String> {
    let (ext, mime) = value
        .split_once('=')
        .ok_or_else(|| format!("expected EXT=TYPE, got `{value}`"))?;
    let ext = ext.trim().trim_start_matches('.');
    let mime = mime.trim();
    if ext.is_empty() || !mime.contains('/') {
        return Err(format!("expected EXT=TYPE, got `{value}`"));
    }
    Ok((ext.to_string(), mime.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_overrides_win_over_database() {
        let table = MimeTable::default();
        assert_eq!(table.guess_type(Path::new("/x/script.py")), "text/plain");
        assert_eq!(table.guess_type(Path::new("main.C")), "text/plain");
    }

    #[test]
    fn database_lookup_is_case_insensitive() {
        let table = MimeTable::default();
        assert_eq!(table.guess_type(Path::new("index.html")), "text/html");
        assert_eq!(table.guess_type(Path::new("PHOTO.PNG")), "image/png");
    }

    #[test]
    fn unknown_or_missing_extension_defaults_to_octet_stream() {
        let table = MimeTable::default();
        assert_eq!(table.guess_type(Path::new("blob.zzzunknown")), DEFAULT_MIME_TYPE);
        assert_eq!(table.guess_type(Path::new("Makefile")), DEFAULT_MIME_TYPE);
    }

    #[test]
    fn exact_case_override_is_checked_first() {
        let table = MimeTable::with_overrides([
            ("MD".to_string(), "text/x-shouting".to_string()),
            ("md".to_string(), "text/markdown".to_string()),
        ]);
        assert_eq!(table.guess_type(Path::new("README.MD")), "text/x-shouting");
        assert_eq!(table.guess_type(Path::new("notes.Md")), "text/markdown");
    }

    #[test]
    fn parse_mime_override_accepts_and_rejects() {
        assert_eq!(
            parse_mime_override(".md=text/markdown"),
            Ok(("md".to_string(), "text/markdown".to_string()))
        );
        assert!(parse_mime_override("md").is_err());
        assert!(parse_mime_override("=text/plain").is_err());
        assert!(parse_mime_override("md=plain").is_err());
    }
}
