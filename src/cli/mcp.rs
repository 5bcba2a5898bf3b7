use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::io::BufReader;

use crate::ImageRagBuilder;
use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::mcp::{McpServer, TOOL_NAME};

#[derive(Parser, Debug, Clone)]
pub struct McpCommand {
    /// 单次检索的截止时间（秒）
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,
}

impl SubCommandExtend for McpCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let rag = ImageRagBuilder::from_opts(opts).open().await?;
        let server = McpServer::new(rag, Duration::from_secs(self.timeout));
        info!("MCP 服务已启动，提供工具 {TOOL_NAME}");
        server.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
    }
}
