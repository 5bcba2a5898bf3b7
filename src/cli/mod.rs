mod add;
mod list;
mod mcp;
mod remove;
mod search;
pub mod server;

pub use add::*;
pub use list::*;
pub use mcp::*;
pub use remove::*;
pub use search::*;
pub use server::*;

use clap::ValueEnum;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}
