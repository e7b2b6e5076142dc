// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/service.rs - 检测服务：就绪检查、推理与判定
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

use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::{
  detect::{Candidate, DetectionAggregator, Verdict},
  lifecycle::{LifecycleManager, NotReadyError},
  model::{BackendError, InferenceBackend},
};

pub type BackendLifecycle = LifecycleManager<dyn InferenceBackend>;

#[derive(Error, Debug)]
pub enum DetectError {
  #[error(transparent)]
  NotReady(#[from] NotReadyError),
  #[error(transparent)]
  Backend(#[from] BackendError),
}

pub struct DetectionService {
  lifecycle: BackendLifecycle,
  aggregator: DetectionAggregator,
}

impl DetectionService {
  pub fn new(lifecycle: BackendLifecycle, aggregator: DetectionAggregator) -> Self {
    DetectionService {
      lifecycle,
      aggregator,
    }
  }

  pub fn lifecycle(&self) -> &BackendLifecycle {
    &self.lifecycle
  }

  pub fn aggregator(&self) -> &DetectionAggregator {
    &self.aggregator
  }

  /// 同步执行，会占用当前线程直到推理结束
  pub fn detect(&self, image: &RgbImage) -> Result<Verdict, DetectError> {
    let backend = self.lifecycle.ensure_ready()?;

    let now = std::time::Instant::now();
    let raw = backend.run(image)?;
    debug!("推理完成，耗时: {:.2?}, 候选框 {} 个", now.elapsed(), raw.len());

    let candidates: Vec<Candidate> = raw.candidates().collect();
    let verdict = self.aggregator.decide(image, &candidates);
    debug!("判定结果: {:?}", verdict.command);
    Ok(verdict)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    detect::{Command, NormalizedBox, RawDetections},
    lifecycle::{RetryPolicy, StateKind, loader_fn},
    model::Model,
  };
  use image::Rgb;
  use std::{convert::Infallible, sync::Arc, time::Duration};

  struct AlwaysLight;

  impl Model for AlwaysLight {
    type Input = RgbImage;
    type Output = RawDetections;
    type Error = Infallible;

    fn infer(&self, _input: &RgbImage) -> Result<RawDetections, Infallible> {
      Ok(RawDetections {
        boxes: vec![NormalizedBox::FULL],
        scores: vec![0.9],
        classes: vec![10],
        count: Some(1),
      })
    }
  }

  fn service() -> DetectionService {
    let lifecycle = LifecycleManager::new(
      loader_fn(|| Ok(Arc::new(AlwaysLight) as Arc<dyn InferenceBackend>)),
      RetryPolicy::new(1, Duration::ZERO),
    );
    DetectionService::new(lifecycle, DetectionAggregator::default())
  }

  #[test]
  fn refuses_before_load() {
    let service = service();
    match service.detect(&RgbImage::new(8, 8)) {
      Err(DetectError::NotReady(e)) => assert_eq!(e.state, StateKind::Unloaded),
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[test]
  fn red_light_means_stop_once_ready() {
    let service = service();
    service.lifecycle().begin_load().unwrap();
    let status = service.lifecycle().wait_until_settled(Duration::from_secs(5));
    assert_eq!(status.state, StateKind::Ready);

    let red = RgbImage::from_pixel(20, 40, Rgb([255, 0, 0]));
    let verdict = service.detect(&red).unwrap();
    assert_eq!(verdict.command, Command::Stop);
    assert!(verdict.traffic_light_detected);
    assert_eq!(verdict.confidence, 0.9);
  }
}
