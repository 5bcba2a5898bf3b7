use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::warn;

/// 已保存的上传文件
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// 生成的唯一文件名
    pub filename: String,
    /// 完整路径
    pub path: String,
}

/// 上传图片的文件存储
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 以唯一文件名保存图片
    pub async fn save(&self, original_filename: &str, data: &[u8]) -> std::io::Result<StoredFile> {
        tokio::fs::create_dir_all(&self.root).await?;
        let filename = unique_filename(original_filename);
        let path = self.root.join(&filename);
        tokio::fs::write(&path, data).await?;
        Ok(StoredFile { filename, path: path.to_string_lossy().into_owned() })
    }

    pub async fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    /// 删除文件，文件不存在或删除失败时只记录日志
    pub async fn remove(&self, path: &str) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("删除文件 {path} 失败: {e}"),
        }
    }
}

/// 生成 `<8 位随机前缀>_<处理后的文件名><扩展名>` 形式的文件名
pub fn unique_filename(original: &str) -> String {
    let base = Path::new(original).file_name().map(|s| s.to_string_lossy()).unwrap_or_default();
    let (name, ext) = match base.rfind('.') {
        Some(pos) if pos > 0 => (&base[..pos], &base[pos..]),
        _ => (&*base, ""),
    };
    let name = name.replace(' ', "_").replace("..", "_");
    let prefix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}{}", &prefix[..8], name, ext.to_ascii_lowercase())
}
