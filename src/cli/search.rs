use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Instant;

use crate::ImageRagBuilder;
use crate::cli::{OutputFormat, SubCommandExtend};
use crate::config::Opts;
use crate::embedding::ImageFormat;
use crate::search::{RankedMatch, SearchFilter, clamp_top_k};

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    /// 被搜索的图片路径
    pub image: PathBuf,
    /// 返回结果数量，范围 1-100
    #[arg(short = 'k', long, default_value_t = 10)]
    pub top_k: i64,
    /// 在记录名称和描述中查找的文本
    #[arg(short, long)]
    pub query: Option<String>,
    /// 在记录名称中查找的文本
    #[arg(long)]
    pub record_name: Option<String>,
    /// 最小距离
    #[arg(long)]
    pub min_distance: Option<f32>,
    /// 最大距离
    #[arg(long)]
    pub max_distance: Option<f32>,
    /// 搜索的截止时间（秒）
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<u64>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let filename = self.image.to_string_lossy();
        let format = ImageFormat::from_filename(&filename)
            .with_context(|| format!("不支持的图片格式: {filename}"))?;
        let data = tokio::fs::read(&self.image).await?;

        let filter = SearchFilter {
            text: self.query.clone(),
            record_name: self.record_name.clone(),
            min_distance: self.min_distance,
            max_distance: self.max_distance,
        };

        let rag = ImageRagBuilder::from_opts(opts).open().await?;
        let deadline = self.deadline.map(|secs| Instant::now() + Duration::from_secs(secs));
        let top_k = clamp_top_k(Some(self.top_k));
        let result = rag.search(&data, format, top_k, &filter, deadline).await?;

        print_result(&result, self.output_format)
    }
}

fn print_result(result: &[RankedMatch], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for m in result {
                println!("{:.4}\t{}\t{}\t{}", m.distance, m.record_id, m.record_name, m.filename);
            }
        }
    }
    Ok(())
}
