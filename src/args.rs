// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/args.rs - 服务命令行参数
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

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use url::Url;

use xinhao::config::{ConfigError, Settings};

/// Xinhao 信号灯检测服务
///
/// 命令行参数优先于配置文件
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// TOML 配置文件
  #[arg(long, env = "XINHAO_CONFIG", value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 模型地址，例如 yolo26:///var/lib/xinhao/yolo26n.rknn
  #[arg(long, env = "XINHAO_MODEL", value_name = "MODEL")]
  pub model: Option<Url>,

  /// 模型下载镜像，可重复指定，按顺序尝试
  #[arg(long = "mirror", value_name = "URL")]
  pub mirrors: Vec<Url>,

  /// 监听地址
  #[arg(long, value_name = "ADDR")]
  pub bind: Option<SocketAddr>,

  /// 只替换监听端口
  #[arg(long, env = "PORT", value_name = "PORT")]
  pub port: Option<u16>,

  /// 静态页面目录
  #[arg(long, value_name = "DIR")]
  pub static_dir: Option<PathBuf>,

  /// 单次加载的最大尝试次数
  #[arg(long, value_name = "COUNT")]
  pub max_retries: Option<u32>,

  /// 两次尝试之间的等待时间（秒）
  #[arg(long, value_name = "SECS")]
  pub retry_backoff: Option<u64>,
}

impl Args {
  pub fn settings(&self) -> Result<Settings, ConfigError> {
    let mut settings = match &self.config {
      Some(path) => Settings::from_file(path)?,
      None => Settings::default(),
    };

    if let Some(model) = &self.model {
      settings.loader.model = Some(model.clone());
    }
    if !self.mirrors.is_empty() {
      settings.loader.mirrors = self.mirrors.clone();
    }
    if let Some(bind) = self.bind {
      settings.server.bind = bind;
    }
    if let Some(port) = self.port {
      settings.server.bind.set_port(port);
    }
    if let Some(dir) = &self.static_dir {
      settings.server.static_dir = dir.clone();
    }
    if let Some(max_retries) = self.max_retries {
      settings.loader.max_retries = max_retries;
    }
    if let Some(backoff) = self.retry_backoff {
      settings.loader.retry_backoff_secs = backoff;
    }

    Ok(settings)
  }
}
