// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/output.rs - 输出定义
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

use image::Rgba;
use thiserror::Error;

use crate::geometry::{BBox, GeometryError};

pub mod draw;
mod raster;
mod recording;
mod save_image_file;

pub use self::draw::{OverlayRenderer, OverlayStyle, confident};
pub use self::raster::RasterSurface;
pub use self::recording::{DrawOp, RecordingSurface};
pub use self::save_image_file::SaveImageFileOutput;

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("几何计算错误: {0}")]
  GeometryError(#[from] GeometryError),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体加载失败: {0}")]
  FontError(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 二维绘图表面
///
/// 语义与浏览器 canvas 的 2D 上下文一致：坐标原点在左上角，文字以顶部为基线，
/// `resize` 会清空已有内容。
pub trait Surface: Send + 'static {
  fn resize(&mut self, width: u32, height: u32);

  fn size(&self) -> (u32, u32);

  fn clear(&mut self);

  fn stroke_rect(&mut self, rect: &BBox, color: Rgba<u8>, line_width: f32);

  fn fill_rect(&mut self, rect: &BBox, color: Rgba<u8>);

  /// 文字渲染宽度（像素）
  fn measure_text(&self, text: &str, font_size: f32) -> f32;

  fn fill_text(&mut self, text: &str, x: f32, y: f32, font_size: f32, color: Rgba<u8>);

  /// 自上次清空以来没有绘制任何内容
  fn is_blank(&self) -> bool;
}
