pub mod batch;
pub mod cli;
pub mod config;
pub mod db;
mod deadline;
pub mod embedding;
pub mod error;
pub mod image_rag;
pub mod ingest;
pub mod mcp;
mod metrics;
pub mod search;
mod server;
pub mod storage;
pub mod vector;

pub use config::Opts;
pub use error::{Error, Result};
pub use image_rag::{ImageRag, ImageRagBuilder};
pub use ingest::ImageInput;
