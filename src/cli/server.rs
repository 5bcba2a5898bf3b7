use anyhow::Context;
use clap::Parser;
use log::{error, info};
use prometheus::{BasicAuthentication, labels};
use tokio::net::TcpListener;
use tokio::task::spawn_blocking;
use tokio::time::{Duration, sleep};

use crate::cli::SubCommandExtend;
use crate::{ImageRagBuilder, Opts, server};

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    /// 监听地址
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:8080")]
    pub addr: String,
    /// 请求体大小上限，单位为 MB
    #[arg(long, env = "MAX_UPLOAD_SIZE_MB", default_value_t = 10)]
    pub max_upload_size: usize,
    /// prometheus 主动推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME")]
    pub prometheus_instance: Option<String>,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH")]
    pub prometheus_auth: Option<String>,
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let rag = ImageRagBuilder::from_opts(opts).open().await?;

        // 创建应用
        let state = server::AppState::new(rag);
        let app = server::create_app(state, self.max_upload_size * 1024 * 1024);

        if let Some(url) = self.prometheus_push.clone() {
            let instance = self.prometheus_instance.clone().unwrap_or_else(|| self.addr.clone());
            let auth = self
                .prometheus_auth
                .as_deref()
                .map(|s| {
                    s.split_once(':')
                        .map(|(username, password)| (username.to_string(), password.to_string()))
                        .context("prometheus 认证信息格式应为 username:password")
                })
                .transpose()?;
            tokio::spawn(push_metrics_loop(url, instance, auth));
        }

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        info!("接口文档：http://{}/docs", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn push_metrics_loop(url: String, instance: String, auth: Option<(String, String)>) {
    loop {
        let metric_families = prometheus::gather();
        let url = url.clone();
        let instance = instance.clone();
        let auth = auth.clone();
        let r = spawn_blocking(move || {
            prometheus::push_metrics(
                "imrag",
                labels! {
                    "instance".to_string() => instance,
                },
                &url,
                metric_families,
                auth.map(|(username, password)| BasicAuthentication { username, password }),
            )
        })
        .await;
        match r {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("推送指标失败: {e}"),
            Err(e) => error!("推送指标的任务异常退出: {e}"),
        }
        sleep(Duration::from_secs(30)).await;
    }
}
