// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/frame.rs - 帧定义
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

use std::{sync::Arc, time::Duration};

use image::RgbImage;

/// RGB 帧句柄
///
/// 图像数据以 `Arc` 共享，克隆只增加引用计数。检测器拿到的是当前帧的快照，
/// 输入源随后替换最新帧不会影响正在进行的推理。
#[derive(Debug, Clone)]
pub struct RgbFrame {
  image: Arc<RgbImage>,
  index: u64,
  timestamp: Duration,
}

impl RgbFrame {
  pub fn new(image: RgbImage, index: u64, timestamp: Duration) -> Self {
    Self {
      image: Arc::new(image),
      index,
      timestamp,
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.image.dimensions()
  }

  /// 帧序号，静态图片恒为 0
  pub fn index(&self) -> u64 {
    self.index
  }

  /// 相对输入源启动时刻的时间戳
  pub fn timestamp(&self) -> Duration {
    self.timestamp
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  /// 以 NHWC 排列返回原始像素
  pub fn as_nhwc(&self) -> &[u8] {
    self.image.as_raw()
  }
}

impl From<RgbImage> for RgbFrame {
  fn from(image: RgbImage) -> Self {
    RgbFrame::new(image, 0, Duration::ZERO)
  }
}

impl AsRef<RgbImage> for RgbFrame {
  fn as_ref(&self) -> &RgbImage {
    &self.image
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clone_shares_pixels() {
    let frame = RgbFrame::new(RgbImage::new(4, 3), 7, Duration::from_millis(40));
    let copy = frame.clone();
    assert_eq!(copy.dimensions(), (4, 3));
    assert_eq!(copy.index(), 7);
    assert!(std::ptr::eq(frame.as_nhwc(), copy.as_nhwc()));
  }

  #[test]
  fn still_image_is_frame_zero() {
    let frame = RgbFrame::from(RgbImage::new(2, 2));
    assert_eq!(frame.index(), 0);
    assert_eq!(frame.timestamp(), Duration::ZERO);
    assert_eq!(frame.as_nhwc().len(), 2 * 2 * 3);
  }
}
