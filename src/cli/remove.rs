use anyhow::Result;
use clap::Parser;

use crate::ImageRagBuilder;
use crate::cli::SubCommandExtend;
use crate::config::Opts;

#[derive(Parser, Debug, Clone)]
pub struct RemoveCommand {
    /// 记录 ID，指定 `--image` 时为图片 ID
    pub id: i64,
    /// 只删除一张图片
    #[arg(long)]
    pub image: bool,
}

impl SubCommandExtend for RemoveCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let rag = ImageRagBuilder::from_opts(opts).open().await?;
        if self.image {
            let image = rag.delete_image(self.id).await?;
            println!("[OK] 删除图片 {} ({})", image.id, image.filename);
        } else {
            let detail = rag.delete_record(self.id).await?;
            println!(
                "[OK] 删除记录 {} ({})，以及 {} 张图片",
                detail.record.id,
                detail.record.name,
                detail.images.len()
            );
        }
        Ok(())
    }
}
