// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/input.rs - 图像输入：上传数据、base64、远程地址与本地文件
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

use base64::{Engine, engine::general_purpose::STANDARD};
use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::debug;
use url::Url;

mod read_image_file;

pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

/// 错误信息会原样返回给客户端
#[derive(Error, Debug)]
pub enum InputError {
  #[error("cannot identify image file: {0}")]
  DecodeError(#[from] image::ImageError),
  #[error("invalid base64 data: {0}")]
  Base64Error(#[from] base64::DecodeError),
  #[error("invalid image url: {0}")]
  InvalidUrl(#[from] url::ParseError),
  #[error("unsupported url scheme: {0}")]
  UnsupportedScheme(String),
  #[error("failed to fetch image: {0}")]
  FetchError(#[from] reqwest::Error),
  #[error("empty image data")]
  EmptyImage,
}

/// 解码任意支持格式的图像并转为 RGB，不做其他预处理
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, InputError> {
  decode_image_with_hint(bytes, None)
}

/// 优先按内容识别格式，识别失败时再按 `hint`（如 `"jpeg"`、`"png"`）解码
pub fn decode_image_with_hint(bytes: &[u8], hint: Option<&str>) -> Result<RgbImage, InputError> {
  if bytes.is_empty() {
    return Err(InputError::EmptyImage);
  }

  let image = match image::load_from_memory(bytes) {
    Ok(image) => image,
    Err(e) => match hint.and_then(ImageFormat::from_extension) {
      Some(format) => {
        debug!("按内容识别图像格式失败 ({}), 改用 {:?}", e, format);
        image::load_from_memory_with_format(bytes, format)?
      }
      None => return Err(e.into()),
    },
  };

  debug!("图像解码完成: {}x{}", image.width(), image.height());
  Ok(image.into_rgb8())
}

/// 接受纯 base64 或 `data:image/...;base64,` 形式，忽略其中的空白字符
pub fn decode_base64_image(data: &str, format: Option<&str>) -> Result<RgbImage, InputError> {
  let payload = match data.strip_prefix("data:image") {
    Some(rest) => rest.split_once(',').map(|(_, body)| body).unwrap_or(""),
    None => data,
  };
  let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
  let bytes = STANDARD.decode(compact)?;
  decode_image_with_hint(&bytes, format)
}

/// 只允许 `http` 与 `https`
pub async fn fetch_image(
  client: &reqwest::Client,
  image_url: &str,
) -> Result<RgbImage, InputError> {
  let url = Url::parse(image_url)?;
  match url.scheme() {
    "http" | "https" => {}
    other => return Err(InputError::UnsupportedScheme(other.to_string())),
  }

  debug!("拉取远程图像: {}", url);
  let bytes = client
    .get(url)
    .send()
    .await?
    .error_for_status()?
    .bytes()
    .await?;
  decode_image(&bytes)
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;
  use std::io::Cursor;

  fn png_bytes() -> Vec<u8> {
    let image = RgbImage::from_pixel(3, 2, Rgb([255, 0, 0]));
    let mut bytes = Vec::new();
    image
      .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
      .unwrap();
    bytes
  }

  #[test]
  fn decodes_png_bytes() {
    let image = decode_image(&png_bytes()).unwrap();
    assert_eq!(image.dimensions(), (3, 2));
    assert_eq!(image.get_pixel(0, 0), &Rgb([255, 0, 0]));
  }

  #[test]
  fn rejects_garbage_and_empty_input() {
    assert!(matches!(decode_image(b""), Err(InputError::EmptyImage)));
    assert!(matches!(
      decode_image(b"not an image"),
      Err(InputError::DecodeError(_))
    ));
  }

  #[test]
  fn base64_accepts_data_url_prefix_and_line_breaks() {
    let encoded = STANDARD.encode(png_bytes());
    let (head, tail) = encoded.split_at(encoded.len() / 2);

    let plain = decode_base64_image(&encoded, Some("png")).unwrap();
    let data_url = format!("data:image/png;base64,{}\n{}", head, tail);
    let prefixed = decode_base64_image(&data_url, None).unwrap();
    assert_eq!(plain, prefixed);
  }

  #[test]
  fn base64_rejects_invalid_alphabet() {
    assert!(matches!(
      decode_base64_image("@@@@", Some("jpeg")),
      Err(InputError::Base64Error(_))
    ));
  }

  #[tokio::test]
  async fn fetch_rejects_non_http_urls() {
    let client = reqwest::Client::new();
    assert!(matches!(
      fetch_image(&client, "file:///etc/passwd").await,
      Err(InputError::UnsupportedScheme(scheme)) if scheme == "file"
    ));
    assert!(matches!(
      fetch_image(&client, "not a url").await,
      Err(InputError::InvalidUrl(_))
    ));
  }
}
