use anyhow::Result;
use clap::Parser;

use crate::ImageRagBuilder;
use crate::cli::{OutputFormat, SubCommandExtend};
use crate::config::Opts;

#[derive(Parser, Debug, Clone)]
pub struct ListCommand {
    /// 页码，从 1 开始
    #[arg(short, long, default_value_t = 1)]
    pub page: i64,
    /// 每页数量，范围 1-100
    #[arg(short, long, default_value_t = 10)]
    pub limit: i64,
    /// 显示指定记录的详细信息
    #[arg(short, long, value_name = "ID")]
    pub record: Option<i64>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for ListCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let rag = ImageRagBuilder::from_opts(opts).open().await?;

        if let Some(id) = self.record {
            let detail = rag.get_record(id).await?;
            match self.output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&detail)?),
                OutputFormat::Table => {
                    let record = &detail.record;
                    let description = record.description.as_deref().unwrap_or("-");
                    println!("{}\t{}\t{}", record.id, record.name, description);
                    for image in &detail.images {
                        println!("  {}\t{}\t{}", image.id, image.vector_id, image.path);
                    }
                }
            }
            return Ok(());
        }

        let page = rag.list_records(Some(self.page), Some(self.limit)).await?;
        match self.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&page)?),
            OutputFormat::Table => {
                let stats = rag.stats().await?;
                println!(
                    "记录 {} 条（今日 {}），图片 {} 张（今日 {}），向量 {} 个",
                    stats.dashboard.total_records,
                    stats.dashboard.today_records,
                    stats.dashboard.total_images,
                    stats.dashboard.today_images,
                    stats.total_vectors,
                );
                for record in &page.records {
                    println!(
                        "{}\t{}\t{}\t{}",
                        record.id,
                        record.created_at.format("%Y-%m-%d %H:%M:%S"),
                        record.name,
                        record.description.as_deref().unwrap_or("-")
                    );
                }
                println!("第 {} 页，每页 {} 条，共 {} 条", page.page, page.limit, page.total);
            }
        }
        Ok(())
    }
}
