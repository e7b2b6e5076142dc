// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/model.rs - 模型与推理后端
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
use url::Url;

use crate::{
  config::LoaderSettings,
  detect::RawDetections,
  lifecycle::ResourceLoader,
};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 单次推理调用失败，不影响资源的就绪状态
#[derive(Error, Debug)]
#[error("推理失败: {0}")]
pub struct BackendError(Box<dyn std::error::Error + Send + Sync>);

impl BackendError {
  pub fn new<E: Into<Box<dyn std::error::Error + Send + Sync>>>(err: E) -> Self {
    BackendError(err.into())
  }
}

/// 生命周期管理器持有的推理资源：输入整幅 RGB 图像，输出原始检测结果
pub trait InferenceBackend: Send + Sync {
  fn run(&self, image: &RgbImage) -> Result<RawDetections, BackendError>;
}

impl<M> InferenceBackend for M
where
  M: Model<Input = RgbImage, Output = RawDetections> + Send + Sync,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  fn run(&self, image: &RgbImage) -> Result<RawDetections, BackendError> {
    self.infer(image).map_err(BackendError::new)
  }
}

pub type BackendLoader = Box<dyn ResourceLoader<Resource = dyn InferenceBackend>>;

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("不支持的模型方案: {0}")]
  UnsupportedScheme(String),
  #[error("模型方案 {scheme} 需要启用 {feature} 功能后重新编译")]
  FeatureDisabled {
    scheme: &'static str,
    feature: &'static str,
  },
  #[cfg(feature = "model_yolo26")]
  #[error("YOLO26 模型错误: {0}")]
  Yolo26Error(#[from] Yolo26Error),
}

#[cfg(not(feature = "model_yolo26"))]
const YOLO26_SCHEME: &str = "yolo26";

/// 根据模型地址的方案选择后端，例如 `yolo26:///var/lib/xinhao/yolo26n.rknn`
#[cfg_attr(not(feature = "model_yolo26"), allow(unused_variables))]
pub fn backend_loader(model: &Url, settings: &LoaderSettings) -> Result<BackendLoader, ModelError> {
  match model.scheme() {
    #[cfg(feature = "model_yolo26")]
    <Yolo26Builder as crate::FromUrlWithScheme>::SCHEME => {
      use crate::FromUrl;

      let builder = Yolo26Builder::from_url(model)?;
      let artifact = crate::artifact::ArtifactSource::new(builder.model_path())
        .mirrors(settings.mirrors.clone())
        .timeout(settings.download_timeout());
      Ok(Box::new(Yolo26Loader::new(artifact)))
    }
    #[cfg(not(feature = "model_yolo26"))]
    YOLO26_SCHEME => Err(ModelError::FeatureDisabled {
      scheme: YOLO26_SCHEME,
      feature: "model_yolo26",
    }),
    other => Err(ModelError::UnsupportedScheme(other.to_string())),
  }
}

/// COCO 数据集 80 类名称，按 YOLO 输出的类别下标排列
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 80 类下标对应的 COCO 官方类别编号（1 起，共 90 个编号，有空缺）
const COCO_CATEGORY_IDS: [i32; 80] = [
  1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 27, 28,
  31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55,
  56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 67, 70, 72, 73, 74, 75, 76, 77, 78, 79, 80, 81, 82, 84,
  85, 86, 87, 88, 89, 90,
];

pub fn coco_category_id(class_index: usize) -> Option<i32> {
  COCO_CATEGORY_IDS.get(class_index).copied()
}

pub fn coco_label(category_id: i32) -> Option<&'static str> {
  COCO_CATEGORY_IDS
    .iter()
    .position(|&id| id == category_id)
    .map(|idx| COCO_CLASSES[idx])
}

#[cfg(feature = "model_yolo26")]
mod yolo26;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{Yolo26, Yolo26Builder, Yolo26Error, Yolo26Loader};

#[cfg(test)]
mod tests {
  use super::*;
  use crate::detect::{Candidate, DEFAULT_TRAFFIC_LIGHT_CLASS_ID, NormalizedBox};
  use std::convert::Infallible;

  struct Fixed(RawDetections);

  impl Model for Fixed {
    type Input = RgbImage;
    type Output = RawDetections;
    type Error = Infallible;

    fn infer(&self, _input: &RgbImage) -> Result<RawDetections, Infallible> {
      Ok(self.0.clone())
    }
  }

  #[derive(Debug, Error)]
  #[error("npu timeout")]
  struct Timeout;

  struct Broken;

  impl Model for Broken {
    type Input = RgbImage;
    type Output = RawDetections;
    type Error = Timeout;

    fn infer(&self, _input: &RgbImage) -> Result<RawDetections, Timeout> {
      Err(Timeout)
    }
  }

  #[test]
  fn traffic_light_maps_to_coco_category_ten() {
    let idx = COCO_CLASSES
      .iter()
      .position(|&name| name == "traffic light")
      .unwrap();
    assert_eq!(coco_category_id(idx), Some(DEFAULT_TRAFFIC_LIGHT_CLASS_ID));
    assert_eq!(coco_label(DEFAULT_TRAFFIC_LIGHT_CLASS_ID), Some("traffic light"));
    assert_eq!(coco_label(13), Some("stop sign"));
    assert_eq!(coco_label(12), None);
    assert_eq!(coco_category_id(80), None);
  }

  #[test]
  fn models_are_inference_backends() {
    let raw: RawDetections = [Candidate {
      bbox: NormalizedBox::FULL,
      score: 0.7,
      class_id: 10,
    }]
    .into_iter()
    .collect();
    let backend: Box<dyn InferenceBackend> = Box::new(Fixed(raw.clone()));
    assert_eq!(backend.run(&RgbImage::new(4, 4)).unwrap(), raw);

    let backend: Box<dyn InferenceBackend> = Box::new(Broken);
    let err = backend.run(&RgbImage::new(4, 4)).unwrap_err();
    assert!(err.to_string().contains("npu timeout"));
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("onnx:///models/ssd.onnx").unwrap();
    match backend_loader(&url, &LoaderSettings::default()) {
      Err(ModelError::UnsupportedScheme(scheme)) => assert_eq!(scheme, "onnx"),
      Err(e) => panic!("unexpected error: {e}"),
      Ok(_) => panic!("onnx backend should not exist"),
    }
  }

  #[cfg(not(feature = "model_yolo26"))]
  #[test]
  fn yolo26_without_feature_names_the_feature() {
    let url = Url::parse("yolo26:///models/yolo26n.rknn").unwrap();
    match backend_loader(&url, &LoaderSettings::default()) {
      Err(e @ ModelError::FeatureDisabled { .. }) => {
        assert!(e.to_string().contains("model_yolo26"));
      }
      Err(e) => panic!("unexpected error: {e}"),
      Ok(_) => panic!("yolo26 backend is compiled out"),
    }
  }
}
