// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/detect/color.rs - 红/黄色掩码判别
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

use image::{Rgb, RgbImage, imageops};

/// 颜色统计前裁剪区域被缩放到的固定尺寸（宽 30，高 90）。
/// 该尺寸决定了阈值与面积的权重关系，修改会改变判定结果。
pub const CANONICAL_CROP_WIDTH: u32 = 30;
pub const CANONICAL_CROP_HEIGHT: u32 = 90;
pub const DEFAULT_COLOR_RATE_THRESHOLD: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMaskConfig {
  pub crop_width: u32,
  pub crop_height: u32,
  /// 命中像素比例需严格大于该值
  pub rate_threshold: f32,
}

impl Default for ColorMaskConfig {
  fn default() -> Self {
    ColorMaskConfig {
      crop_width: CANONICAL_CROP_WIDTH,
      crop_height: CANONICAL_CROP_HEIGHT,
      rate_threshold: DEFAULT_COLOR_RATE_THRESHOLD,
    }
  }
}

/// 8 位 HSV 空间中的一个闭区间色带，H 取值 `[0, 180]`
#[derive(Debug, Clone, Copy)]
struct HsvBand {
  hue_min: u8,
  hue_max: u8,
  sat_min: u8,
  val_min: u8,
}

impl HsvBand {
  fn contains(&self, [h, s, v]: [u8; 3]) -> bool {
    (self.hue_min..=self.hue_max).contains(&h) && s >= self.sat_min && v >= self.val_min
  }
}

const STOP_BANDS: [HsvBand; 3] = [
  // 红色，低端
  HsvBand {
    hue_min: 0,
    hue_max: 10,
    sat_min: 70,
    val_min: 50,
  },
  // 红色，高端（色相在 180 处回绕）
  HsvBand {
    hue_min: 170,
    hue_max: 180,
    sat_min: 70,
    val_min: 50,
  },
  // 黄色
  HsvBand {
    hue_min: 21,
    hue_max: 40,
    sat_min: 39,
    val_min: 64,
  },
];

/// RGB 转 8 位 HSV：H 为角度的一半，S、V 缩放到 `[0, 255]`
pub fn rgb_to_hsv(pixel: &Rgb<u8>) -> [u8; 3] {
  let [r, g, b] = pixel.0.map(f32::from);
  let max = r.max(g).max(b);
  let min = r.min(g).min(b);
  let delta = max - min;

  let sat = if max > 0.0 {
    (delta * 255.0 / max).round()
  } else {
    0.0
  };

  let hue = if delta == 0.0 {
    0.0
  } else if max == r {
    60.0 * (g - b) / delta
  } else if max == g {
    120.0 + 60.0 * (b - r) / delta
  } else {
    240.0 + 60.0 * (r - g) / delta
  };
  let hue = if hue < 0.0 { hue + 360.0 } else { hue };

  [(hue / 2.0).round() as u8, sat as u8, max as u8]
}

/// 双线性缩放：目标像素中心映射回源图像 `(d + 0.5) * scale - 0.5`，越界时取边缘像素。
/// 每个轴只混合相邻的两个源像素，缩小时也是如此。
fn resize_linear(region: &RgbImage, width: u32, height: u32) -> RgbImage {
  let (src_w, src_h) = region.dimensions();
  let scale_x = src_w as f32 / width as f32;
  let scale_y = src_h as f32 / height as f32;
  let max_x = (src_w - 1) as f32;
  let max_y = (src_h - 1) as f32;

  RgbImage::from_fn(width, height, |dx, dy| {
    let x = ((dx as f32 + 0.5) * scale_x - 0.5).clamp(0.0, max_x);
    let y = ((dy as f32 + 0.5) * scale_y - 0.5).clamp(0.0, max_y);
    imageops::interpolate_bilinear(region, x, y)
      .unwrap_or_else(|| *region.get_pixel(x as u32, y as u32))
  })
}

/// 区域缩放到固定尺寸后，落入任一红/黄色带的像素比例
pub fn stop_color_rate(region: &RgbImage, config: &ColorMaskConfig) -> f32 {
  let canonical_area = config.crop_width as usize * config.crop_height as usize;
  if region.width() == 0 || region.height() == 0 || canonical_area == 0 {
    return 0.0;
  }

  let resized = resize_linear(region, config.crop_width, config.crop_height);

  let masked = resized
    .pixels()
    .map(rgb_to_hsv)
    .filter(|&hsv| STOP_BANDS.iter().any(|band| band.contains(hsv)))
    .count();

  masked as f32 / canonical_area as f32
}

/// 区域是否以红/黄色为主（信号灯需要停止）
pub fn is_stop_color(region: &RgbImage, config: &ColorMaskConfig) -> bool {
  stop_color_rate(region, config) > config.rate_threshold
}

#[cfg(test)]
mod tests {
  use super::*;

  fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(rgb))
  }

  #[test]
  fn hsv_of_primaries() {
    assert_eq!(rgb_to_hsv(&Rgb([255, 0, 0])), [0, 255, 255]);
    assert_eq!(rgb_to_hsv(&Rgb([0, 255, 0])), [60, 255, 255]);
    assert_eq!(rgb_to_hsv(&Rgb([0, 0, 255])), [120, 255, 255]);
    assert_eq!(rgb_to_hsv(&Rgb([0, 0, 0])), [0, 0, 0]);
    assert_eq!(rgb_to_hsv(&Rgb([128, 128, 128])), [0, 0, 128]);
  }

  #[test]
  fn hsv_wraps_red_near_180() {
    let [h, s, v] = rgb_to_hsv(&Rgb([255, 0, 10]));
    assert_eq!(h, 179);
    assert_eq!(s, 255);
    assert_eq!(v, 255);
  }

  #[test]
  fn pure_red_region_is_stop() {
    let region = solid(100, 100, [255, 0, 0]);
    let config = ColorMaskConfig::default();
    assert!((stop_color_rate(&region, &config) - 1.0).abs() < f32::EPSILON);
    assert!(is_stop_color(&region, &config));
  }

  #[test]
  fn magenta_red_and_amber_are_stop() {
    let config = ColorMaskConfig::default();
    assert!(is_stop_color(&solid(20, 40, [255, 0, 10]), &config));
    assert!(is_stop_color(&solid(20, 40, [255, 200, 0]), &config));
  }

  #[test]
  fn green_blue_and_grey_are_not_stop() {
    let config = ColorMaskConfig::default();
    assert!(!is_stop_color(&solid(30, 90, [0, 255, 0]), &config));
    assert!(!is_stop_color(&solid(30, 90, [0, 0, 255]), &config));
    assert!(!is_stop_color(&solid(30, 90, [90, 90, 90]), &config));
  }

  #[test]
  fn dark_or_washed_out_red_is_not_stop() {
    let config = ColorMaskConfig::default();
    // V 低于 50
    assert!(!is_stop_color(&solid(30, 90, [40, 0, 0]), &config));
    // S 低于 70
    assert!(!is_stop_color(&solid(30, 90, [255, 220, 220]), &config));
  }

  #[test]
  fn rate_must_exceed_threshold() {
    // 30x90 的画布中恰好 27 个红色像素，比例正好 1%
    let mut region = solid(30, 90, [0, 255, 0]);
    for x in 0..27 {
      region.put_pixel(x, 0, Rgb([255, 0, 0]));
    }
    let config = ColorMaskConfig::default();
    let rate = stop_color_rate(&region, &config);
    assert!((rate - 0.01).abs() < 1e-6);
    assert!(!is_stop_color(&region, &config));

    region.put_pixel(27, 0, Rgb([255, 0, 0]));
    assert!(is_stop_color(&region, &config));
  }

  #[test]
  fn thin_lit_stripes_survive_downscale() {
    // 300x90 黑底，每 10 列中只有第 5 列是红色
    let region = RgbImage::from_fn(300, 90, |x, _| {
      if x % 10 == 5 {
        Rgb([255, 0, 0])
      } else {
        Rgb([0, 0, 0])
      }
    });
    let config = ColorMaskConfig::default();

    let resized = resize_linear(&region, config.crop_width, config.crop_height);
    assert_eq!(resized.dimensions(), (30, 90));
    // 源坐标 10 * dx + 4.5，黑与红各占一半
    assert!(
      resized
        .pixels()
        .all(|px| px[0].abs_diff(128) <= 1 && px[1] == 0 && px[2] == 0)
    );

    assert!((stop_color_rate(&region, &config) - 1.0).abs() < f32::EPSILON);
    assert!(is_stop_color(&region, &config));
  }

  #[test]
  fn canonical_sized_region_is_sampled_verbatim() {
    let region = RgbImage::from_fn(30, 90, |x, y| Rgb([x as u8, y as u8, 7]));
    assert_eq!(resize_linear(&region, 30, 90), region);
  }

  #[test]
  fn upscale_clamps_at_edges() {
    let region = RgbImage::from_fn(2, 1, |x, _| {
      if x == 0 {
        Rgb([255, 0, 0])
      } else {
        Rgb([0, 0, 255])
      }
    });
    let resized = resize_linear(&region, 8, 3);
    assert_eq!(resized.get_pixel(0, 0), &Rgb([255, 0, 0]));
    assert_eq!(resized.get_pixel(7, 2), &Rgb([0, 0, 255]));
  }

  #[test]
  fn empty_region_is_not_stop() {
    let region = RgbImage::new(0, 0);
    assert_eq!(stop_color_rate(&region, &ColorMaskConfig::default()), 0.0);
    assert!(!is_stop_color(&region, &ColorMaskConfig::default()));
  }

  #[test]
  fn classification_is_deterministic() {
    let region = RgbImage::from_fn(17, 53, |x, y| Rgb([(x * 15) as u8, (y * 4) as u8, 40]));
    let config = ColorMaskConfig::default();
    let first = stop_color_rate(&region, &config);
    let second = stop_color_rate(&region, &config);
    assert_eq!(first, second);
    assert_eq!(
      is_stop_color(&region, &config),
      is_stop_color(&region, &config)
    );
  }
}
