//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

const TEMP_MARKER: &str = ".tmp.";

/// 是否为 [`AtomicFile`] 生成的临时文件名（`.<name>.tmp.<uuid>`）。
pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with('.')
        && name
            .rsplit_once(TEMP_MARKER)
            .is_some_and(|(_, suffix)| Uuid::parse_str(suffix).is_ok())
}

/// 目标同目录下的隐藏临时文件，完成后重命名为目标。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    writer: BufWriter<File>,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn create(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}{TEMP_MARKER}{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            writer: BufWriter::new(file),
        })
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.writer);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 刷新、同步并替换目标文件。
    pub async fn finalize(mut self) -> io::Result<PathBuf> {
        let result = async {
            self.writer.flush().await?;
            self.writer.get_ref().sync_all().await
        }
        .await;
        if let Err(err) = result {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        drop(self.writer);

        if let Err(err) = replace_target(&self.temp_path, &self.target).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        Ok(self.target)
    }
}

/// 重命名到目标；Windows 上目标已存在时先删除再重试。
async fn replace_target(temp_path: &Path, target: &Path) -> io::Result<()> {
    let err = match fs::rename(temp_path, target).await {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    #[cfg(windows)]
    {
        if fs::remove_file(target).await.is_ok() {
            return fs::rename(temp_path, target).await;
        }
    }
    Err(err)
}
