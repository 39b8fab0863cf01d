// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/input/read_image_file.rs - 静态图片输入
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

use std::path::Path;

use image::ImageReader;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, decode_url_path, frame::RgbFrame, input::InputError};

/// 已解码的静态图片
#[derive(Debug, Clone)]
pub struct StaticImage {
  frame: RgbFrame,
}

impl StaticImage {
  /// 从内存中的图片文件内容解码（格式自动识别）
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, InputError> {
    let image = image::load_from_memory(bytes).map_err(|e| {
      error!("图片解码失败: {}", e);
      InputError::DecodeError(e)
    })?;
    let image = image.to_rgb8();
    info!("图片已解码: {}x{}", image.width(), image.height());

    Ok(Self {
      frame: RgbFrame::from(image),
    })
  }

  pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, InputError> {
    let path = path.as_ref();
    info!("读取图片文件: {}", path.display());
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;

    Ok(Self {
      frame: RgbFrame::from(image.to_rgb8()),
    })
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.frame.dimensions()
  }

  pub fn frame(&self) -> RgbFrame {
    self.frame.clone()
  }
}

impl FromUrlWithScheme for StaticImage {
  const SCHEME: &'static str = "image";
}

impl FromUrl for StaticImage {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch(url.scheme().to_string()));
    }

    Self::from_path(decode_url_path(url))
  }
}
