use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use futures::{StreamExt, TryStreamExt, stream};
use log::info;
use regex::Regex;
use tokio::time::Instant;
use walkdir::WalkDir;

use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::{ImageInput, ImageRagBuilder};

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    /// 图片所在目录，也可以是单张图片
    pub path: PathBuf,
    /// 新建记录的名称，未指定 `--record` 时必填
    #[arg(short, long)]
    pub name: Option<String>,
    /// 新建记录的描述
    #[arg(long)]
    pub description: Option<String>,
    /// 添加到已有的记录，而不是新建记录
    #[arg(short, long, value_name = "ID", conflicts_with_all = ["name", "description"])]
    pub record: Option<i64>,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png,webp")]
    pub suffix: String,
    /// 整个批次的截止时间（秒），超时后尚未开始的图片不再添加
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<u64>,
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let re_suf = format!("(?i)^({})$", self.suffix.replace(',', "|"));
        let re_suf = Regex::new(&re_suf)?;

        let files = scan_images(&self.path, &re_suf);
        if files.is_empty() {
            bail!("{} 中没有找到图片", self.path.display());
        }
        info!("找到 {} 张图片", files.len());

        let inputs = stream::iter(files.clone())
            .map(|file| async move {
                let data = tokio::fs::read(&file).await?;
                anyhow::Ok(ImageInput::new(file.to_string_lossy(), data))
            })
            .buffered(opts.runtime.max_concurrency as usize)
            .try_collect::<Vec<_>>()
            .await?;

        let rag = ImageRagBuilder::from_opts(opts).open().await?;
        let deadline = self.deadline.map(|secs| Instant::now() + Duration::from_secs(secs));

        let (record_id, outcome) = match (self.record, &self.name) {
            (Some(id), _) => {
                rag.get_record(id).await?;
                (id, rag.add_images(id, inputs, deadline).await)
            }
            (None, Some(name)) => {
                let (record, outcome) = rag
                    .create_record_with_images(name, self.description.as_deref(), inputs, deadline)
                    .await?;
                println!("[OK] 创建记录 {} ({})", record.id, record.name);
                (record.id, outcome)
            }
            (None, None) => bail!("需要指定 --name 或 --record"),
        };

        for (file, result) in files.iter().zip(&outcome.results) {
            if let Some(image) = result {
                println!("[OK] Add {} -> 图片 {}", file.display(), image.id);
            }
        }
        if let Some(err) = &outcome.error {
            for failure in &err.failures {
                eprintln!("[ERR] {}: {}", failure.filename, failure.error);
            }
        }
        println!("记录 {record_id}: 成功 {}，共 {}", outcome.succeeded().count(), files.len());

        Ok(())
    }
}

/// 扫描目录中后缀匹配的文件，按路径排序
fn scan_images(path: &Path, re_suf: &Regex) -> Vec<PathBuf> {
    let mut files = WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension().map(|ext| re_suf.is_match(&ext.to_string_lossy())) == Some(true)
        })
        .collect::<Vec<_>>();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_run_future_is_send() {
        let opts = Opts::try_parse_from(["imrag", "-d", "/tmp/imrag", "list"]).unwrap();
        let cmd = AddCommand::try_parse_from(["add", "/tmp/images", "-n", "猫"]).unwrap();
        let fut = cmd.run(&opts);
        assert_send(&fut);
    }

    #[test]
    fn test_scan_images() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        for name in ["b.JPG", "a.png", "sub/c.webp", "note.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let re = Regex::new("(?i)^(jpg|png|webp)$").unwrap();
        let files = scan_images(dir.path(), &re);
        let names = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, ["a.png", "b.JPG", "sub/c.webp"]);
    }
}
