// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/input.rs - 视频/图像输入源
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
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::RgbFrame};

mod pattern;
mod read_image_file;

pub use self::pattern::{PatternStream, PatternStreamBuilder};
pub use self::read_image_file::StaticImage;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerCamera, GStreamerCameraBuilder};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("摄像头访问被拒绝: {0}")]
  PermissionDenied(String),
  #[error("设备不可用: {0}")]
  DeviceUnavailable(String),
  #[error("图像解码失败: {0}")]
  DecodeError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 连续更新的实时视频流
///
/// 实现者在后台持续接收帧，`current_frame` 只返回最新一帧。
pub trait LiveStream: Send {
  /// 当前帧尺寸，首帧到达前为 (0, 0)
  fn dimensions(&self) -> (u32, u32);

  fn current_frame(&self) -> Option<RgbFrame>;

  /// 停止底层硬件或管道，可重复调用
  fn stop(&mut self);

  /// 启动后出现的致命错误（设备断开、流结束），出现后不再产生新帧
  fn failure(&self) -> Option<String> {
    None
  }
}

/// 打开实时视频流的能力（摄像头权限申请在此发生）
pub trait CameraProvider: Send + Sync + 'static {
  fn open(&self) -> Result<Box<dyn LiveStream>, InputError>;
}

/// 按 URL 方案分发的摄像头
///
/// - `pattern://?width=640&height=480&fps=30` 合成测试图案
/// - `gst://camera/dev/video0?width=640&height=480&fps=30` V4L2 摄像头（需 `gstreamer_input` 特性）
/// - `gst://file/path/to/video.mp4` 视频文件按实时流播放
#[derive(Debug, Clone)]
pub struct UrlCamera(pub Url);

impl CameraProvider for UrlCamera {
  fn open(&self) -> Result<Box<dyn LiveStream>, InputError> {
    let url = &self.0;
    info!("打开实时输入源: {}", url);

    if url.scheme() == PatternStreamBuilder::SCHEME {
      let stream = PatternStreamBuilder::from_url(url)?.build();
      return Ok(Box::new(stream));
    }

    #[cfg(feature = "gstreamer_input")]
    {
      if url.scheme() == GStreamerCameraBuilder::SCHEME {
        let camera = GStreamerCameraBuilder::from_url(url)?.build()?;
        return Ok(Box::new(camera));
      }
    }

    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

/// 持有实时流的输入源，析构时自动释放
pub struct LiveSource {
  stream: Box<dyn LiveStream>,
  released: bool,
}

impl LiveSource {
  pub fn new(stream: Box<dyn LiveStream>) -> Self {
    Self {
      stream,
      released: false,
    }
  }

  pub fn is_released(&self) -> bool {
    self.released
  }

  fn release(&mut self) {
    if !self.released {
      self.stream.stop();
      self.released = true;
      info!("实时输入源已释放");
    }
  }
}

impl Drop for LiveSource {
  fn drop(&mut self) {
    self.release();
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
  Live,
  Static,
}

/// 当前帧提供者：实时流或静态图片
pub enum MediaSource {
  Live(LiveSource),
  Static(StaticImage),
}

impl MediaSource {
  pub fn kind(&self) -> SourceKind {
    match self {
      MediaSource::Live(_) => SourceKind::Live,
      MediaSource::Static(_) => SourceKind::Static,
    }
  }

  pub fn dimensions(&self) -> (u32, u32) {
    match self {
      MediaSource::Live(source) if source.released => (0, 0),
      MediaSource::Live(source) => source.stream.dimensions(),
      MediaSource::Static(image) => image.dimensions(),
    }
  }

  /// 宽高均非零时才可用于计算显示几何
  pub fn is_ready(&self) -> bool {
    let (w, h) = self.dimensions();
    w > 0 && h > 0
  }

  pub fn current_frame(&self) -> Option<RgbFrame> {
    match self {
      MediaSource::Live(source) if source.released => None,
      MediaSource::Live(source) => source.stream.current_frame(),
      MediaSource::Static(image) => Some(image.frame()),
    }
  }

  /// 实时流运行中的致命错误；静态图片与已释放的输入源没有错误
  pub fn failure(&self) -> Option<String> {
    match self {
      MediaSource::Live(source) if source.released => None,
      MediaSource::Live(source) => source.stream.failure(),
      MediaSource::Static(_) => None,
    }
  }

  /// 释放底层资源，可重复调用；静态图片无需释放
  pub fn release(&mut self) {
    match self {
      MediaSource::Live(source) => source.release(),
      MediaSource::Static(_) => debug!("静态图片无需释放"),
    }
  }
}

impl From<Box<dyn LiveStream>> for MediaSource {
  fn from(stream: Box<dyn LiveStream>) -> Self {
    MediaSource::Live(LiveSource::new(stream))
  }
}

impl From<StaticImage> for MediaSource {
  fn from(image: StaticImage) -> Self {
    MediaSource::Static(image)
  }
}
