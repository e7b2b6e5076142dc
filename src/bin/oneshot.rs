// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/bin/oneshot.rs - 单张图像判定
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

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use xinhao::{
  FromUrl,
  config::Settings,
  detect::DetectionAggregator,
  input::ImageFileInput,
  lifecycle::{LifecycleManager, StateKind},
  model::backend_loader,
  service::{BackendLifecycle, DetectionService},
};

/// 对一张图像做通行判定，结果以 JSON 输出到标准输出
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// TOML 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 模型地址
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// 输入图像，例如 image:///tmp/crossing.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 等待模型就绪的最长时间（秒）
  #[arg(long, default_value = "300", value_name = "SECS")]
  pub timeout: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();
  let mut settings = match &args.config {
    Some(path) => Settings::from_file(path)?,
    None => Settings::default(),
  };
  if let Some(model) = &args.model {
    settings.loader.model = Some(model.clone());
  }
  let model = settings.loader.model.clone().context("未配置模型地址")?;

  info!("模型地址: {}", model);
  info!("输入来源: {}", args.input);

  let input = ImageFileInput::from_url(&args.input)?;

  let lifecycle: BackendLifecycle = LifecycleManager::new(
    backend_loader(&model, &settings.loader)?,
    settings.loader.retry_policy(),
  );
  let service = DetectionService::new(
    lifecycle.clone(),
    DetectionAggregator::new(settings.decision.to_config()),
  );

  lifecycle.begin_load()?;
  let status = lifecycle.wait_until_settled(Duration::from_secs(args.timeout));
  match status.state {
    StateKind::Ready => {}
    StateKind::Failed => bail!(
      "模型加载失败: {}",
      status.last_error.as_deref().unwrap_or("未知错误")
    ),
    StateKind::Loading | StateKind::Unloaded => bail!("等待模型就绪超时 ({} 秒)", args.timeout),
  }

  info!("开始推理...");
  let now = std::time::Instant::now();
  for image in input {
    let verdict = service.detect(&image)?;
    info!("判定完成，耗时: {:.2?}", now.elapsed());
    println!("{}", serde_json::to_string_pretty(&verdict)?);
  }

  Ok(())
}
