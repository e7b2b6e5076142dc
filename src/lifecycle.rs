// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/lifecycle.rs - 推理资源生命周期管理
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

//! 推理资源在后台线程中加载，失败按固定间隔重试；
//! 请求线程只通过 [`LifecycleManager::ensure_ready`] 这一道闸门拿到资源，
//! 资源未就绪时立即失败，从不等待。

use std::{
  any::Any,
  fmt,
  panic::{self, AssertUnwindSafe},
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::artifact::ArtifactError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// 单次加载内的重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    RetryPolicy {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      backoff: DEFAULT_RETRY_BACKOFF,
    }
  }
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, backoff: Duration) -> Self {
    RetryPolicy {
      max_attempts,
      backoff,
    }
  }

  /// 至少尝试一次
  fn attempts(&self) -> u32 {
    self.max_attempts.max(1)
  }
}

#[derive(Error, Debug)]
pub enum LoadError {
  #[error("模型文件获取失败: {0}")]
  ArtifactError(#[from] ArtifactError),
  #[error("推理资源构建失败: {0}")]
  BuildError(Box<dyn std::error::Error + Send + Sync>),
  #[error("加载过程异常中止: {0}")]
  Panicked(String),
}

impl LoadError {
  pub fn build<E: Into<Box<dyn std::error::Error + Send + Sync>>>(err: E) -> Self {
    LoadError::BuildError(err.into())
  }
}

/// 推理资源的完整加载过程（获取模型文件、构建推理上下文）
pub trait ResourceLoader: Send + Sync + 'static {
  type Resource: ?Sized + Send + Sync + 'static;

  fn load(&self) -> Result<Arc<Self::Resource>, LoadError>;
}

impl<L: ResourceLoader + ?Sized> ResourceLoader for Box<L> {
  type Resource = L::Resource;

  fn load(&self) -> Result<Arc<Self::Resource>, LoadError> {
    (**self).load()
  }
}

/// 用闭包实现的加载器
pub struct FnLoader<F>(F);

pub fn loader_fn<R, F>(f: F) -> FnLoader<F>
where
  R: ?Sized + Send + Sync + 'static,
  F: Fn() -> Result<Arc<R>, LoadError> + Send + Sync + 'static,
{
  FnLoader(f)
}

impl<R, F> ResourceLoader for FnLoader<F>
where
  R: ?Sized + Send + Sync + 'static,
  F: Fn() -> Result<Arc<R>, LoadError> + Send + Sync + 'static,
{
  type Resource = R;

  fn load(&self) -> Result<Arc<R>, LoadError> {
    (self.0)()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
  Unloaded,
  Loading,
  Ready,
  Failed(String),
}

impl LifecycleState {
  pub fn kind(&self) -> StateKind {
    match self {
      LifecycleState::Unloaded => StateKind::Unloaded,
      LifecycleState::Loading => StateKind::Loading,
      LifecycleState::Ready => StateKind::Ready,
      LifecycleState::Failed(_) => StateKind::Failed,
    }
  }
}

/// 不带失败原因的状态标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
  Unloaded,
  Loading,
  Ready,
  Failed,
}

impl fmt::Display for StateKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      StateKind::Unloaded => "unloaded",
      StateKind::Loading => "loading",
      StateKind::Ready => "ready",
      StateKind::Failed => "failed",
    };
    f.write_str(name)
  }
}

/// 供健康检查使用的只读状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleStatus {
  pub state: StateKind,
  pub last_error: Option<String>,
  /// 当前（或最近一次）加载中的尝试序号
  pub attempt: u32,
  pub max_attempts: u32,
  pub loads_started: u64,
  pub loaded_at: Option<DateTime<Utc>>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("推理资源尚未就绪, 当前状态: {state}")]
pub struct NotReadyError {
  pub state: StateKind,
  pub reason: Option<String>,
}

#[derive(Error, Debug)]
pub enum LifecycleError {
  #[error("当前状态 {0} 下不能开始加载")]
  InvalidTransition(StateKind),
  #[error("无法启动加载线程: {0}")]
  SpawnError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
  AlreadyReady,
  AlreadyLoading,
  Started,
}

pub enum Readiness<R: ?Sized> {
  Ready(Arc<R>),
  NotReady(NotReadyError),
}

struct Slot<R: ?Sized> {
  state: LifecycleState,
  resource: Option<Arc<R>>,
  last_error: Option<String>,
  attempt: u32,
  loads_started: u64,
  loaded_at: Option<DateTime<Utc>>,
}

impl<R: ?Sized> Slot<R> {
  fn status(&self, max_attempts: u32) -> LifecycleStatus {
    LifecycleStatus {
      state: self.state.kind(),
      last_error: self.last_error.clone(),
      attempt: self.attempt,
      max_attempts,
      loads_started: self.loads_started,
      loaded_at: self.loaded_at,
    }
  }
}

struct Shared<R: ?Sized + Send + Sync + 'static> {
  loader: Box<dyn ResourceLoader<Resource = R>>,
  policy: RetryPolicy,
  slot: Mutex<Slot<R>>,
  settled: Condvar,
}

/// 推理资源及其就绪状态的唯一持有者。克隆得到的是同一个管理器的句柄。
pub struct LifecycleManager<R: ?Sized + Send + Sync + 'static> {
  shared: Arc<Shared<R>>,
}

impl<R: ?Sized + Send + Sync + 'static> Clone for LifecycleManager<R> {
  fn clone(&self) -> Self {
    LifecycleManager {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<R: ?Sized + Send + Sync + 'static> LifecycleManager<R> {
  pub fn new<L>(loader: L, policy: RetryPolicy) -> Self
  where
    L: ResourceLoader<Resource = R>,
  {
    LifecycleManager {
      shared: Arc::new(Shared {
        loader: Box::new(loader),
        policy,
        slot: Mutex::new(Slot {
          state: LifecycleState::Unloaded,
          resource: None,
          last_error: None,
          attempt: 0,
          loads_started: 0,
          loaded_at: None,
        }),
        settled: Condvar::new(),
      }),
    }
  }

  pub fn policy(&self) -> RetryPolicy {
    self.shared.policy
  }

  /// 仅允许从 `Unloaded` 或 `Failed` 开始；切换到 `Loading` 后在后台线程中加载，立即返回
  pub fn begin_load(&self) -> Result<(), LifecycleError> {
    let generation = {
      let mut slot = self.shared.slot.lock();
      match slot.state {
        LifecycleState::Unloaded | LifecycleState::Failed(_) => {}
        ref other => return Err(LifecycleError::InvalidTransition(other.kind())),
      }
      slot.state = LifecycleState::Loading;
      slot.last_error = None;
      slot.attempt = 0;
      slot.loads_started += 1;
      slot.loads_started
    };

    info!("开始在后台加载推理资源 (第 {} 轮)", generation);
    let shared = Arc::clone(&self.shared);
    let spawned = thread::Builder::new()
      .name(format!("xinhao-loader-{}", generation))
      .spawn(move || shared.run_load());

    if let Err(e) = spawned {
      error!("无法启动加载线程: {}", e);
      self.shared.publish_failed(format!("无法启动加载线程: {}", e));
      return Err(LifecycleError::SpawnError(e));
    }
    Ok(())
  }

  pub fn is_ready(&self) -> bool {
    self.shared.slot.lock().state == LifecycleState::Ready
  }

  pub fn state(&self) -> LifecycleState {
    self.shared.slot.lock().state.clone()
  }

  pub fn readiness(&self) -> Readiness<R> {
    let slot = self.shared.slot.lock();
    match (&slot.state, &slot.resource) {
      (LifecycleState::Ready, Some(resource)) => Readiness::Ready(Arc::clone(resource)),
      (state, _) => Readiness::NotReady(NotReadyError {
        state: state.kind(),
        reason: slot.last_error.clone(),
      }),
    }
  }

  /// 请求推理前必须经过的闸门，不阻塞
  pub fn ensure_ready(&self) -> Result<Arc<R>, NotReadyError> {
    match self.readiness() {
      Readiness::Ready(resource) => Ok(resource),
      Readiness::NotReady(e) => Err(e),
    }
  }

  /// 已就绪或正在加载时什么也不做，否则重新开始加载
  pub fn request_reload(&self) -> Result<ReloadOutcome, LifecycleError> {
    match self.begin_load() {
      Ok(()) => Ok(ReloadOutcome::Started),
      Err(LifecycleError::InvalidTransition(StateKind::Ready)) => Ok(ReloadOutcome::AlreadyReady),
      Err(LifecycleError::InvalidTransition(StateKind::Loading)) => {
        Ok(ReloadOutcome::AlreadyLoading)
      }
      Err(e) => Err(e),
    }
  }

  pub fn status(&self) -> LifecycleStatus {
    self.shared.slot.lock().status(self.shared.policy.max_attempts)
  }

  /// 阻塞直到状态离开 `Loading` 或超时，返回当时的状态快照。
  /// 只给命令行工具和测试使用，请求处理路径不要调用。
  pub fn wait_until_settled(&self, timeout: Duration) -> LifecycleStatus {
    let deadline = Instant::now() + timeout;
    let mut slot = self.shared.slot.lock();
    while slot.state == LifecycleState::Loading {
      if self
        .shared
        .settled
        .wait_until(&mut slot, deadline)
        .timed_out()
      {
        break;
      }
    }
    slot.status(self.shared.policy.max_attempts)
  }
}

impl<R: ?Sized + Send + Sync + 'static> Shared<R> {
  fn run_load(&self) {
    let attempts = self.policy.attempts();
    let mut last_reason = String::new();

    for attempt in 1..=attempts {
      self.slot.lock().attempt = attempt;
      info!("推理资源加载尝试 {}/{}", attempt, attempts);
      let now = Instant::now();

      match self.try_load() {
        Ok(resource) => {
          info!("推理资源加载完成，耗时: {:.2?}", now.elapsed());
          self.publish_ready(resource);
          return;
        }
        Err(e) => {
          warn!("第 {} 次加载失败: {}", attempt, e);
          last_reason = e.to_string();
          self.slot.lock().last_error = Some(last_reason.clone());
          if attempt < attempts {
            info!("{:.2?} 后重试", self.policy.backoff);
            thread::sleep(self.policy.backoff);
          }
        }
      }
    }

    error!("全部 {} 次加载尝试均失败: {}", attempts, last_reason);
    self.publish_failed(last_reason);
  }

  fn try_load(&self) -> Result<Arc<R>, LoadError> {
    panic::catch_unwind(AssertUnwindSafe(|| self.loader.load()))
      .unwrap_or_else(|payload| Err(LoadError::Panicked(panic_message(payload.as_ref()))))
  }

  fn publish_ready(&self, resource: Arc<R>) {
    let mut slot = self.slot.lock();
    slot.resource = Some(resource);
    slot.state = LifecycleState::Ready;
    slot.last_error = None;
    slot.loaded_at = Some(Utc::now());
    self.settled.notify_all();
  }

  fn publish_failed(&self, reason: String) {
    let mut slot = self.slot.lock();
    slot.resource = None;
    slot.last_error = Some(reason.clone());
    slot.state = LifecycleState::Failed(reason);
    self.settled.notify_all();
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    msg.to_string()
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.clone()
  } else {
    "未知错误".to_string()
  }
}
