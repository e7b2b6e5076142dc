// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/main.rs - 服务主程序
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

mod args;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xinhao::{
  detect::DetectionAggregator,
  lifecycle::{LifecycleManager, StateKind},
  model::backend_loader,
  server::{self, AppState},
  service::{BackendLifecycle, DetectionService},
};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();
  let settings = args.settings()?;

  info!("Xinhao 信号灯检测服务");
  let model = settings
    .loader
    .model
    .clone()
    .context("未配置模型地址, 请使用 --model 或配置文件 [loader] model")?;
  info!("模型地址: {}", model);
  for mirror in &settings.loader.mirrors {
    info!("下载镜像: {}", mirror);
  }
  if std::env::var_os("K_SERVICE").is_some() {
    info!("运行于 Cloud Run, 模型下载与加载可能需要数分钟");
  } else if Path::new("/.dockerenv").exists() {
    info!("运行于 Docker 容器, 模型下载可能较慢");
  }

  let loader = backend_loader(&model, &settings.loader)?;
  let lifecycle: BackendLifecycle = LifecycleManager::new(loader, settings.loader.retry_policy());
  let aggregator = DetectionAggregator::new(settings.decision.to_config());
  let service = Arc::new(DetectionService::new(lifecycle.clone(), aggregator));

  // 服务不等待模型，加载在后台进行
  lifecycle.begin_load()?;
  spawn_startup_probe(lifecycle, settings.loader.startup_probe());

  let state = AppState::new(service, &settings.server)?;
  let app = server::router(state, settings.server.body_limit());

  let listener = tokio::net::TcpListener::bind(settings.server.bind)
    .await
    .with_context(|| format!("无法监听 {}", settings.server.bind))?;
  info!("HTTP 服务监听于 http://{}", listener.local_addr()?);

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  info!("服务已退出");
  Ok(())
}

/// 启动后短暂观察加载进度，只输出日志
fn spawn_startup_probe(lifecycle: BackendLifecycle, probe: std::time::Duration) {
  tokio::task::spawn_blocking(move || {
    let status = lifecycle.wait_until_settled(probe);
    match status.state {
      StateKind::Ready => info!("模型已就绪"),
      StateKind::Failed => warn!(
        "模型加载失败: {}",
        status.last_error.as_deref().unwrap_or("未知错误")
      ),
      StateKind::Loading | StateKind::Unloaded => {
        info!("模型仍在后台加载 (尝试 {}/{})", status.attempt, status.max_attempts)
      }
    }
  });
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到退出信号, 正在关闭服务"),
    Err(e) => {
      warn!("无法监听退出信号: {}", e);
      std::future::pending::<()>().await
    }
  }
}
