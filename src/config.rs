// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/config.rs - 服务配置
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

use std::{
  net::{Ipv4Addr, SocketAddr},
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
  artifact::DEFAULT_DOWNLOAD_TIMEOUT,
  detect::{
    CANONICAL_CROP_HEIGHT, CANONICAL_CROP_WIDTH, ColorMaskConfig, DEFAULT_COLOR_RATE_THRESHOLD,
    DEFAULT_MAX_CANDIDATES, DEFAULT_MIN_SCORE_THRESHOLD, DEFAULT_TRAFFIC_LIGHT_CLASS_ID,
    DecisionConfig,
  },
  lifecycle::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF, RetryPolicy},
};

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件 {0}: {1}")]
  IoError(PathBuf, std::io::Error),
  #[error("配置文件格式错误: {0}")]
  ParseError(#[from] toml::de::Error),
}

/// 完整配置，所有字段都有默认值，配置文件只需写出要修改的部分
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
  pub server: ServerSettings,
  pub decision: DecisionSettings,
  pub loader: LoaderSettings,
}

impl Settings {
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content =
      std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
    Self::from_toml_str(&content)
  }

  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    Ok(toml::from_str(content)?)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
  pub bind: SocketAddr,
  /// 静态页面目录，不存在时不挂载 `/static`
  pub static_dir: PathBuf,
  /// 请求体上限（MB）
  pub body_limit_mb: usize,
  /// `/detect-url` 拉取图像的超时（秒）
  pub fetch_timeout_secs: u64,
}

impl Default for ServerSettings {
  fn default() -> Self {
    ServerSettings {
      bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
      static_dir: PathBuf::from("static"),
      body_limit_mb: 20,
      fetch_timeout_secs: 30,
    }
  }
}

impl ServerSettings {
  pub fn body_limit(&self) -> usize {
    self.body_limit_mb.saturating_mul(1024 * 1024)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecisionSettings {
  pub max_candidates: usize,
  pub min_score_threshold: f32,
  pub traffic_light_class_id: i32,
  pub color_rate_threshold: f32,
  pub crop_width: u32,
  pub crop_height: u32,
}

impl Default for DecisionSettings {
  fn default() -> Self {
    DecisionSettings {
      max_candidates: DEFAULT_MAX_CANDIDATES,
      min_score_threshold: DEFAULT_MIN_SCORE_THRESHOLD,
      traffic_light_class_id: DEFAULT_TRAFFIC_LIGHT_CLASS_ID,
      color_rate_threshold: DEFAULT_COLOR_RATE_THRESHOLD,
      crop_width: CANONICAL_CROP_WIDTH,
      crop_height: CANONICAL_CROP_HEIGHT,
    }
  }
}

impl DecisionSettings {
  pub fn to_config(&self) -> DecisionConfig {
    DecisionConfig {
      max_candidates: self.max_candidates,
      min_score_threshold: self.min_score_threshold,
      traffic_light_class_id: self.traffic_light_class_id,
      color: ColorMaskConfig {
        crop_width: self.crop_width,
        crop_height: self.crop_height,
        rate_threshold: self.color_rate_threshold,
      },
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderSettings {
  /// 例如 `yolo26:///var/lib/xinhao/yolo26n.rknn`
  pub model: Option<Url>,
  /// 本地缓存缺失时依次尝试的下载地址（`http`、`https` 或 `file`）
  pub mirrors: Vec<Url>,
  pub max_retries: u32,
  pub retry_backoff_secs: u64,
  pub download_timeout_secs: u64,
  /// 启动后等待模型就绪的时间（秒），只影响启动日志，不阻塞服务
  pub startup_probe_secs: u64,
}

impl Default for LoaderSettings {
  fn default() -> Self {
    LoaderSettings {
      model: None,
      mirrors: Vec::new(),
      max_retries: DEFAULT_MAX_ATTEMPTS,
      retry_backoff_secs: DEFAULT_RETRY_BACKOFF.as_secs(),
      download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT.as_secs(),
      startup_probe_secs: 5,
    }
  }
}

impl LoaderSettings {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(self.max_retries, Duration::from_secs(self.retry_backoff_secs))
  }

  pub fn download_timeout(&self) -> Duration {
    Duration::from_secs(self.download_timeout_secs)
  }

  pub fn startup_probe(&self) -> Duration {
    Duration::from_secs(self.startup_probe_secs)
  }
}
