use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;

use crate::cli::*;

static DATA_DIR: LazyLock<String> = LazyLock::new(|| {
    ProjectDirs::from("", "imrag", "imrag")
        .map(|dirs| dirs.data_dir().to_string_lossy().into_owned())
        .unwrap_or_else(|| "./data".to_string())
});

#[derive(Parser, Debug, Clone)]
#[command(name = "imrag", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 数据目录，存放数据库、上传的图片和本地索引
    #[arg(short, long, env = "IMRAG_DATA_DIR", default_value = DATA_DIR.as_str())]
    pub data_dir: DataDir,
    #[command(flatten)]
    pub embedding: EmbeddingOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub runtime: RuntimeOptions,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 启动 HTTP 服务
    Server(ServerCommand),
    /// 创建记录并添加目录中的图片
    Add(AddCommand),
    /// 搜索与图片最相似的记录
    Search(SearchCommand),
    /// 列出记录
    List(ListCommand),
    /// 删除记录及其图片
    Remove(RemoveCommand),
    /// 通过标准输入输出提供 MCP 图片检索工具
    Mcp(McpCommand),
}

#[derive(Args, Debug, Clone)]
pub struct EmbeddingOptions {
    /// 豆包 API Key
    #[arg(long, env = "DOUBAO_API_KEY", hide_env_values = true)]
    pub doubao_api_key: Option<String>,
    /// 豆包向量模型
    #[arg(long, env = "DOUBAO_MODEL", default_value = "doubao-embedding-vision-250615")]
    pub doubao_model: String,
    /// 豆包向量接口地址
    #[arg(
        long,
        env = "DOUBAO_API_URL",
        default_value = "https://ark.cn-beijing.volces.com/api/v3/embeddings/multimodal"
    )]
    pub doubao_url: String,
    /// 向量维度，必须与模型输出和索引一致
    #[arg(long, env = "EMBEDDING_DIM", default_value_t = 1024)]
    pub dimension: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackend {
    /// 进程内索引，保存在数据目录下
    Local,
    /// Milvus 向量数据库
    Milvus,
}

#[derive(Args, Debug, Clone)]
pub struct IndexOptions {
    /// 向量索引后端
    #[arg(long, env = "VECTOR_INDEX", value_enum, default_value_t = IndexBackend::Local)]
    pub index: IndexBackend,
    /// Milvus 地址
    #[arg(long, env = "MILVUS_URL", default_value = "http://localhost:19530")]
    pub milvus_url: String,
    /// Milvus 认证 token
    #[arg(long, env = "MILVUS_TOKEN", hide_env_values = true)]
    pub milvus_token: Option<String>,
    /// Milvus 数据库
    #[arg(long, env = "MILVUS_DATABASE", default_value = "image_rag")]
    pub milvus_database: String,
    /// Milvus 集合
    #[arg(long, env = "MILVUS_COLLECTION", default_value = "image_embeddings")]
    pub milvus_collection: String,
}

#[derive(Args, Debug, Clone)]
pub struct RuntimeOptions {
    /// 向量生成超时（秒）
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub embed_timeout: u64,
    /// 向量索引请求超时（秒）
    #[arg(long, value_name = "SECS", default_value_t = 3)]
    pub index_timeout: u64,
    /// 数据库操作超时（秒）
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub store_timeout: u64,
    /// 补偿删除超时（秒），与请求自身的截止时间无关
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub compensation_timeout: u64,
    /// 批量添加图片时的最大并发数
    #[arg(long, value_name = "N", default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..=64))]
    pub max_concurrency: u32,
}

/// 各外部调用的超时时间
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub embed: Duration,
    pub index: Duration,
    pub store: Duration,
    pub compensation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            embed: Duration::from_secs(30),
            index: Duration::from_secs(3),
            store: Duration::from_secs(5),
            compensation: Duration::from_secs(5),
        }
    }
}

impl From<&RuntimeOptions> for Timeouts {
    fn from(opts: &RuntimeOptions) -> Self {
        Self {
            embed: Duration::from_secs(opts.embed_timeout),
            index: Duration::from_secs(opts.index_timeout),
            store: Duration::from_secs(opts.store_timeout),
            compensation: Duration::from_secs(opts.compensation_timeout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回数据库文件的路径
    pub fn database(&self) -> PathBuf {
        self.path.join("imrag.db")
    }

    /// 返回上传图片目录
    pub fn uploads(&self) -> PathBuf {
        self.path.join("uploads")
    }

    /// 返回本地索引文件的路径
    pub fn index(&self) -> PathBuf {
        self.path.join("index.bin")
    }
}

impl FromStr for DataDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}
