// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/detect/localize.rs - 归一化边界框到像素矩形
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

use thiserror::Error;

use super::NormalizedBox;

/// 像素坐标矩形，右、下边界不包含在内
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
  pub left: u32,
  pub top: u32,
  pub right: u32,
  pub bottom: u32,
}

impl PixelRect {
  pub fn width(&self) -> u32 {
    self.right - self.left
  }

  pub fn height(&self) -> u32 {
    self.bottom - self.top
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("退化的边界框: 左 {left}, 上 {top}, 右 {right}, 下 {bottom}")]
pub struct DegenerateBoxError {
  pub left: i64,
  pub top: i64,
  pub right: i64,
  pub bottom: i64,
}

fn scale(coord: f32, extent: u32) -> i64 {
  // `as` 向零截断，NaN 得到 0
  (coord * extent as f32) as i64
}

/// 先截断为整数再裁剪到图像范围内；宽或高不为正时返回错误
pub fn to_pixel_rect(
  bbox: &NormalizedBox,
  width: u32,
  height: u32,
) -> Result<PixelRect, DegenerateBoxError> {
  let (w, h) = (i64::from(width), i64::from(height));

  let left = scale(bbox.x_min, width).clamp(0, w);
  let right = scale(bbox.x_max, width).clamp(0, w);
  let top = scale(bbox.y_min, height).clamp(0, h);
  let bottom = scale(bbox.y_max, height).clamp(0, h);

  if right <= left || bottom <= top {
    return Err(DegenerateBoxError {
      left,
      top,
      right,
      bottom,
    });
  }

  // 已裁剪到 [0, u32] 范围内
  Ok(PixelRect {
    left: left as u32,
    top: top as u32,
    right: right as u32,
    bottom: bottom as u32,
  })
}
