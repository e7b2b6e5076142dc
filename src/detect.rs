// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/detect.rs - 检测结果聚合与通行判定
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

use image::{RgbImage, imageops};
use serde::Serialize;
use tracing::debug;

mod color;
mod localize;

pub use self::color::{
  CANONICAL_CROP_HEIGHT, CANONICAL_CROP_WIDTH, ColorMaskConfig, DEFAULT_COLOR_RATE_THRESHOLD,
  is_stop_color, rgb_to_hsv, stop_color_rate,
};
pub use self::localize::{DegenerateBoxError, PixelRect, to_pixel_rect};

pub const DEFAULT_MAX_CANDIDATES: usize = 20;
pub const DEFAULT_MIN_SCORE_THRESHOLD: f32 = 0.5;
/// COCO 类别编号中的 traffic light
pub const DEFAULT_TRAFFIC_LIGHT_CLASS_ID: i32 = 10;

const STOP_MESSAGE: &str = "Traffic light detected: Red or Yellow signal (Stop)";
const GO_MESSAGE: &str = "Traffic light detected: Green signal or no traffic light (Go)";

/// 归一化边界框，坐标相对于图像的高和宽
///
/// 后端按惯例保证 `min <= max`，但这里不做校验，由定位步骤负责裁剪。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedBox {
  pub y_min: f32,
  pub x_min: f32,
  pub y_max: f32,
  pub x_max: f32,
}

impl NormalizedBox {
  /// 覆盖整幅图像的边界框
  pub const FULL: NormalizedBox = NormalizedBox::new(0.0, 0.0, 1.0, 1.0);

  pub const fn new(y_min: f32, x_min: f32, y_max: f32, x_max: f32) -> Self {
    NormalizedBox {
      y_min,
      x_min,
      y_max,
      x_max,
    }
  }
}

impl From<[f32; 4]> for NormalizedBox {
  /// `[y_min, x_min, y_max, x_max]`
  fn from([y_min, x_min, y_max, x_max]: [f32; 4]) -> Self {
    NormalizedBox::new(y_min, x_min, y_max, x_max)
  }
}

/// 单个候选检测框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub bbox: NormalizedBox,
  pub score: f32,
  pub class_id: i32,
}

/// 推理后端的原始输出：并列的边界框、分数与类别序列
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDetections {
  pub boxes: Vec<NormalizedBox>,
  pub scores: Vec<f32>,
  pub classes: Vec<i32>,
  /// 有效检测数，`None` 表示以序列长度为准
  pub count: Option<usize>,
}

impl RawDetections {
  /// 有效候选数：受 `count` 和最短序列两者约束
  pub fn len(&self) -> usize {
    let available = self
      .boxes
      .len()
      .min(self.scores.len())
      .min(self.classes.len());
    self.count.map_or(available, |count| count.min(available))
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 按后端原始顺序产出候选框
  pub fn candidates(&self) -> impl Iterator<Item = Candidate> + '_ {
    self
      .boxes
      .iter()
      .zip(&self.scores)
      .zip(&self.classes)
      .take(self.len())
      .map(|((&bbox, &score), &class_id)| Candidate {
        bbox,
        score,
        class_id,
      })
  }
}

impl FromIterator<Candidate> for RawDetections {
  fn from_iter<I: IntoIterator<Item = Candidate>>(iter: I) -> Self {
    let mut raw = RawDetections::default();
    for candidate in iter {
      raw.boxes.push(candidate.bbox);
      raw.scores.push(candidate.score);
      raw.classes.push(candidate.class_id);
    }
    raw.count = Some(raw.boxes.len());
    raw
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Command {
  Go,
  Stop,
}

impl Command {
  pub fn message(self) -> &'static str {
    match self {
      Command::Go => GO_MESSAGE,
      Command::Stop => STOP_MESSAGE,
    }
  }
}

/// 单次请求的最终判定
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
  pub command: Command,
  /// 全部候选框中的最高分数，与是否为信号灯无关
  pub confidence: f32,
  pub traffic_light_detected: bool,
  pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionConfig {
  pub max_candidates: usize,
  pub min_score_threshold: f32,
  pub traffic_light_class_id: i32,
  pub color: ColorMaskConfig,
}

impl Default for DecisionConfig {
  fn default() -> Self {
    DecisionConfig {
      max_candidates: DEFAULT_MAX_CANDIDATES,
      min_score_threshold: DEFAULT_MIN_SCORE_THRESHOLD,
      traffic_light_class_id: DEFAULT_TRAFFIC_LIGHT_CLASS_ID,
      color: ColorMaskConfig::default(),
    }
  }
}

/// 把一张图像的全部候选框汇总为一个通行判定
#[derive(Debug, Clone, Default)]
pub struct DetectionAggregator {
  config: DecisionConfig,
}

impl DetectionAggregator {
  pub fn new(config: DecisionConfig) -> Self {
    DetectionAggregator { config }
  }

  pub fn config(&self) -> &DecisionConfig {
    &self.config
  }

  fn is_traffic_light(&self, candidate: &Candidate) -> bool {
    candidate.score > self.config.min_score_threshold
      && candidate.class_id == self.config.traffic_light_class_id
  }

  /// 只检查前 `max_candidates` 个候选框；任意一个合格信号灯呈红/黄色即判定为停止。
  /// 单个候选框的异常只会跳过该候选框。
  pub fn decide(&self, image: &RgbImage, candidates: &[Candidate]) -> Verdict {
    let (width, height) = image.dimensions();
    let mut stop_flag = false;
    let mut any_detected = false;

    for (idx, candidate) in candidates
      .iter()
      .take(self.config.max_candidates)
      .enumerate()
    {
      if !self.is_traffic_light(candidate) {
        continue;
      }
      any_detected = true;

      let rect = match to_pixel_rect(&candidate.bbox, width, height) {
        Ok(rect) => rect,
        Err(e) => {
          debug!("跳过第 {} 个候选框: {}", idx, e);
          continue;
        }
      };

      let region =
        imageops::crop_imm(image, rect.left, rect.top, rect.width(), rect.height()).to_image();
      if is_stop_color(&region, &self.config.color) {
        debug!(
          "第 {} 个候选框 (分数 {:.3}) 呈红/黄色: {:?}",
          idx, candidate.score, rect
        );
        stop_flag = true;
      }
    }

    let confidence = candidates
      .iter()
      .map(|c| c.score)
      .reduce(f32::max)
      .unwrap_or(0.0);

    let command = if stop_flag {
      Command::Stop
    } else {
      Command::Go
    };

    Verdict {
      command,
      confidence,
      traffic_light_detected: any_detected,
      message: command.message().to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  const RED: Rgb<u8> = Rgb([255, 0, 0]);
  const GREEN: Rgb<u8> = Rgb([0, 255, 0]);

  fn candidate(score: f32, class_id: i32, bbox: NormalizedBox) -> Candidate {
    Candidate {
      bbox,
      score,
      class_id,
    }
  }

  fn uniform(width: u32, height: u32, color: Rgb<u8>) -> RgbImage {
    RgbImage::from_pixel(width, height, color)
  }

  /// 左半红色、右半绿色
  fn split_red_green(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, _| if x < width / 2 { RED } else { GREEN })
  }

  const LEFT_HALF: NormalizedBox = NormalizedBox::new(0.0, 0.0, 1.0, 0.5);
  const RIGHT_HALF: NormalizedBox = NormalizedBox::new(0.0, 0.5, 1.0, 1.0);

  #[test]
  fn empty_candidates_go_with_zero_confidence() {
    let verdict = DetectionAggregator::default().decide(&uniform(64, 64, RED), &[]);
    assert_eq!(verdict.command, Command::Go);
    assert_eq!(verdict.confidence, 0.0);
    assert!(!verdict.traffic_light_detected);
    assert_eq!(verdict.message, GO_MESSAGE);
  }

  #[test]
  fn green_light_is_go_but_detected() {
    let image = uniform(60, 120, GREEN);
    let verdict =
      DetectionAggregator::default().decide(&image, &[candidate(0.9, 10, NormalizedBox::FULL)]);
    assert_eq!(verdict.command, Command::Go);
    assert!(verdict.traffic_light_detected);
    assert_eq!(verdict.confidence, 0.9);
  }

  #[test]
  fn red_light_is_stop() {
    let image = uniform(100, 100, RED);
    let verdict =
      DetectionAggregator::default().decide(&image, &[candidate(0.8, 10, NormalizedBox::FULL)]);
    assert_eq!(verdict.command, Command::Stop);
    assert!(verdict.traffic_light_detected);
    assert_eq!(verdict.message, STOP_MESSAGE);
  }

  #[test]
  fn below_threshold_is_not_detected_but_sets_confidence() {
    let image = uniform(100, 100, RED);
    let verdict =
      DetectionAggregator::default().decide(&image, &[candidate(0.3, 10, NormalizedBox::FULL)]);
    assert_eq!(verdict.command, Command::Go);
    assert!(!verdict.traffic_light_detected);
    assert_eq!(verdict.confidence, 0.3);
  }

  #[test]
  fn score_equal_to_threshold_does_not_qualify() {
    let image = uniform(100, 100, RED);
    let verdict =
      DetectionAggregator::default().decide(&image, &[candidate(0.5, 10, NormalizedBox::FULL)]);
    assert!(!verdict.traffic_light_detected);
    assert_eq!(verdict.command, Command::Go);
  }

  #[test]
  fn confidence_covers_other_classes() {
    let image = uniform(100, 100, GREEN);
    let verdict = DetectionAggregator::default().decide(
      &image,
      &[
        candidate(0.6, 10, NormalizedBox::FULL),
        candidate(0.97, 3, NormalizedBox::FULL),
      ],
    );
    assert_eq!(verdict.confidence, 0.97);
    assert_eq!(verdict.command, Command::Go);
  }

  #[test]
  fn any_red_light_wins_over_green_ones() {
    let image = split_red_green(200, 100);
    let verdict = DetectionAggregator::default().decide(
      &image,
      &[
        candidate(0.95, 10, RIGHT_HALF),
        candidate(0.9, 10, RIGHT_HALF),
        candidate(0.7, 10, LEFT_HALF),
      ],
    );
    assert_eq!(verdict.command, Command::Stop);
  }

  #[test]
  fn red_region_of_other_class_is_ignored() {
    let image = split_red_green(200, 100);
    let verdict = DetectionAggregator::default().decide(
      &image,
      &[
        candidate(0.95, 13, LEFT_HALF),
        candidate(0.9, 10, RIGHT_HALF),
      ],
    );
    assert_eq!(verdict.command, Command::Go);
    assert!(verdict.traffic_light_detected);
  }

  #[test]
  fn candidates_past_the_limit_are_not_examined() {
    let image = split_red_green(200, 100);
    let mut candidates = vec![candidate(0.9, 10, RIGHT_HALF); DEFAULT_MAX_CANDIDATES];
    candidates.push(candidate(0.99, 10, LEFT_HALF));

    let verdict = DetectionAggregator::default().decide(&image, &candidates);
    assert_eq!(verdict.command, Command::Go);
    // 置信度仍然统计全部候选框
    assert_eq!(verdict.confidence, 0.99);

    let config = DecisionConfig {
      max_candidates: DEFAULT_MAX_CANDIDATES + 1,
      ..DecisionConfig::default()
    };
    let verdict = DetectionAggregator::new(config).decide(&image, &candidates);
    assert_eq!(verdict.command, Command::Stop);
  }

  #[test]
  fn degenerate_box_is_skipped() {
    let image = uniform(100, 100, RED);
    let inverted = NormalizedBox::new(0.8, 0.9, 0.2, 0.1);
    let verdict = DetectionAggregator::default().decide(&image, &[candidate(0.9, 10, inverted)]);
    assert_eq!(verdict.command, Command::Go);
    assert!(verdict.traffic_light_detected);

    let verdict = DetectionAggregator::default().decide(
      &image,
      &[
        candidate(0.9, 10, inverted),
        candidate(0.8, 10, NormalizedBox::FULL),
      ],
    );
    assert_eq!(verdict.command, Command::Stop);
  }

  #[test]
  fn custom_class_id_is_respected() {
    let image = uniform(100, 100, RED);
    let config = DecisionConfig {
      traffic_light_class_id: 9,
      ..DecisionConfig::default()
    };
    let aggregator = DetectionAggregator::new(config);
    let verdict = aggregator.decide(&image, &[candidate(0.9, 10, NormalizedBox::FULL)]);
    assert!(!verdict.traffic_light_detected);
    let verdict = aggregator.decide(&image, &[candidate(0.9, 9, NormalizedBox::FULL)]);
    assert_eq!(verdict.command, Command::Stop);
  }

  #[test]
  fn raw_detections_respect_count_and_shortest_sequence() {
    let raw = RawDetections {
      boxes: vec![NormalizedBox::FULL; 4],
      scores: vec![0.9, 0.8, 0.7],
      classes: vec![10, 1, 10, 2],
      count: None,
    };
    assert_eq!(raw.len(), 3);

    let raw = RawDetections {
      count: Some(2),
      ..raw
    };
    let candidates: Vec<_> = raw.candidates().collect();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[1].class_id, 1);
    assert_eq!(candidates[1].score, 0.8);
  }

  #[test]
  fn raw_detections_collect_from_candidates() {
    let raw: RawDetections = [
      candidate(0.9, 10, NormalizedBox::FULL),
      candidate(0.4, 3, LEFT_HALF),
    ]
    .into_iter()
    .collect();
    assert_eq!(raw.count, Some(2));
    assert_eq!(raw.classes, vec![10, 3]);
    assert_eq!(raw.boxes[1], LEFT_HALF);
  }

  #[test]
  fn verdict_serializes_with_wire_names() {
    let verdict = DetectionAggregator::default().decide(&uniform(8, 8, GREEN), &[]);
    let value = serde_json::to_value(&verdict).unwrap();
    assert_eq!(value["command"], "Go");
    assert_eq!(value["traffic_light_detected"], false);
    assert_eq!(value["confidence"], 0.0);
  }
}
