// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/output/draw.rs - 检测结果叠加绘制
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
use tracing::trace;

use crate::{
  geometry::{BBox, DisplayGeometry, map_box},
  model::Detection,
  output::Surface,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_PADDING: f32 = 4.0;
const LINE_WIDTH: f32 = 3.0;
const OVERLAY_COLOR: [u8; 4] = [0, 255, 255, 255]; // 青色
const TEXT_COLOR: [u8; 4] = [0, 0, 0, 255]; // 黑色

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
  pub box_color: Rgba<u8>,
  pub line_width: f32,
  pub label_background: Rgba<u8>,
  pub text_color: Rgba<u8>,
  pub font_size: f32,
  pub label_padding: f32,
}

impl Default for OverlayStyle {
  fn default() -> Self {
    Self {
      box_color: Rgba(OVERLAY_COLOR),
      line_width: LINE_WIDTH,
      label_background: Rgba(OVERLAY_COLOR),
      text_color: Rgba(TEXT_COLOR),
      font_size: LABEL_FONT_SIZE,
      label_padding: LABEL_PADDING,
    }
  }
}

/// 只保留置信度严格大于阈值的检测结果
pub fn confident(detections: &[Detection], threshold: f32) -> impl Iterator<Item = &Detection> {
  detections.iter().filter(move |d| d.confidence > threshold)
}

/// 标签文本，例如 `person 82.0%`
pub fn label_text(detection: &Detection) -> String {
  format!("{} {:.1}%", detection.label, detection.confidence * 100.0)
}

#[derive(Debug, Clone, Default)]
pub struct OverlayRenderer {
  style: OverlayStyle,
}

impl OverlayRenderer {
  pub fn new(style: OverlayStyle) -> Self {
    Self { style }
  }

  pub fn style(&self) -> &OverlayStyle {
    &self.style
  }

  /// 把检测结果绘制到与显示区域同尺寸的表面上
  ///
  /// 表面先调整为 `surface_size` 并清空，检测结果按传入顺序逐个绘制。
  pub fn render<'a, S, I>(
    &self,
    surface: &mut S,
    detections: I,
    geometry: &DisplayGeometry,
    surface_size: (u32, u32),
  ) -> usize
  where
    S: Surface + ?Sized,
    I: IntoIterator<Item = &'a Detection>,
  {
    let (width, height) = surface_size;
    surface.resize(width, height);
    surface.clear();

    let mut drawn = 0;
    for detection in detections {
      self.draw_detection(surface, detection, geometry);
      drawn += 1;
    }
    trace!("绘制了 {} 个检测框", drawn);
    drawn
  }

  fn draw_detection<S: Surface + ?Sized>(
    &self,
    surface: &mut S,
    detection: &Detection,
    geometry: &DisplayGeometry,
  ) {
    let style = &self.style;
    let rect = map_box(&detection.bbox, geometry);
    surface.stroke_rect(&rect, style.box_color, style.line_width);

    let text = label_text(detection);
    let text_width = surface.measure_text(&text, style.font_size);
    let background = BBox::new(
      rect.x,
      rect.y,
      text_width + style.label_padding,
      style.font_size + style.label_padding,
    );
    surface.fill_rect(&background, style.label_background);
    surface.fill_text(&text, rect.x, rect.y, style.font_size, style.text_color);
  }
}
