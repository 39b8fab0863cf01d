// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/output/raster.rs - 位图绘图表面
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use tracing::{debug, info};

use crate::{
  geometry::BBox,
  output::{OutputError, Surface},
};

const LABEL_CHAR_WIDTH_RATIO: f32 = 0.55; // 每字符平均宽度与字号之比（粗略估计）
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// 透明 RGBA 位图上的绘图表面
///
/// 没有字体时只绘制标签背景，文字宽度按字符数估算。
pub struct RasterSurface {
  image: RgbaImage,
  font: Option<FontArc>,
}

impl RasterSurface {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      image: RgbaImage::from_pixel(width, height, TRANSPARENT),
      font: None,
    }
  }

  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_file<P: AsRef<Path>>(self, path: P) -> Result<Self, OutputError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let font = FontArc::try_from_vec(bytes)
      .map_err(|e| OutputError::FontError(format!("{}: {}", path.display(), e)))?;
    info!("加载字体文件: {}", path.display());
    Ok(self.with_font(font))
  }

  pub fn image(&self) -> &RgbaImage {
    &self.image
  }
}

fn to_rect(rect: &BBox) -> Option<Rect> {
  let width = rect.width.round() as i64;
  let height = rect.height.round() as i64;
  if width <= 0 || height <= 0 {
    return None;
  }
  Some(Rect::at(rect.x.round() as i32, rect.y.round() as i32).of_size(width as u32, height as u32))
}

impl Surface for RasterSurface {
  fn resize(&mut self, width: u32, height: u32) {
    if self.image.dimensions() != (width, height) {
      debug!("调整绘图表面尺寸: {}x{}", width, height);
    }
    self.image = RgbaImage::from_pixel(width, height, TRANSPARENT);
  }

  fn size(&self) -> (u32, u32) {
    self.image.dimensions()
  }

  fn clear(&mut self) {
    self.image.pixels_mut().for_each(|p| *p = TRANSPARENT);
  }

  fn stroke_rect(&mut self, rect: &BBox, color: Rgba<u8>, line_width: f32) {
    // 线宽以矩形边为中心向内外各延伸一半
    let thickness = line_width.round().max(1.0);
    let half = (thickness / 2.0).floor();
    let outer = BBox::new(
      rect.x - half,
      rect.y - half,
      rect.width + 2.0 * half,
      rect.height + 2.0 * half,
    );

    for t in 0..thickness as u32 {
      let inset = t as f32;
      let ring = BBox::new(
        outer.x + inset,
        outer.y + inset,
        outer.width - 2.0 * inset,
        outer.height - 2.0 * inset,
      );
      let Some(ring) = to_rect(&ring) else {
        break;
      };
      draw_hollow_rect_mut(&mut self.image, ring, color);
    }
  }

  fn fill_rect(&mut self, rect: &BBox, color: Rgba<u8>) {
    if let Some(rect) = to_rect(rect) {
      draw_filled_rect_mut(&mut self.image, rect, color);
    }
  }

  fn measure_text(&self, text: &str, font_size: f32) -> f32 {
    match &self.font {
      Some(font) => text_size(PxScale::from(font_size), font, text).0 as f32,
      None => text.chars().count() as f32 * font_size * LABEL_CHAR_WIDTH_RATIO,
    }
  }

  fn fill_text(&mut self, text: &str, x: f32, y: f32, font_size: f32, color: Rgba<u8>) {
    if let Some(font) = &self.font {
      draw_text_mut(
        &mut self.image,
        color,
        x.round() as i32,
        y.round() as i32,
        PxScale::from(font_size),
        font,
        text,
      );
    }
  }

  fn is_blank(&self) -> bool {
    self.image.pixels().all(|p| p.0[3] == 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const CYAN: Rgba<u8> = Rgba([0, 255, 255, 255]);

  #[test]
  fn stroke_draws_only_the_border() {
    let mut surface = RasterSurface::new(40, 40);
    surface.stroke_rect(&BBox::new(10.0, 10.0, 20.0, 20.0), CYAN, 3.0);

    assert_eq!(*surface.image().get_pixel(10, 10), CYAN);
    assert_eq!(*surface.image().get_pixel(9, 20), CYAN);
    assert_eq!(*surface.image().get_pixel(11, 20), CYAN);
    assert_eq!(*surface.image().get_pixel(20, 20), TRANSPARENT);
    assert_eq!(*surface.image().get_pixel(5, 5), TRANSPARENT);
  }

  #[test]
  fn shapes_outside_bounds_are_clipped() {
    let mut surface = RasterSurface::new(10, 10);
    surface.stroke_rect(&BBox::new(-20.0, -20.0, 100.0, 100.0), CYAN, 3.0);
    surface.fill_rect(&BBox::new(8.0, 8.0, 50.0, 50.0), CYAN);
    assert_eq!(*surface.image().get_pixel(9, 9), CYAN);
  }

  #[test]
  fn degenerate_rects_draw_nothing() {
    let mut surface = RasterSurface::new(10, 10);
    surface.fill_rect(&BBox::new(2.0, 2.0, 0.0, 5.0), CYAN);
    surface.stroke_rect(&BBox::new(2.0, 2.0, 5.0, -1.0), CYAN, 1.0);
    assert!(surface.is_blank());
  }

  #[test]
  fn clear_and_resize_make_surface_blank() {
    let mut surface = RasterSurface::new(10, 10);
    surface.fill_rect(&BBox::new(0.0, 0.0, 5.0, 5.0), CYAN);
    assert!(!surface.is_blank());
    surface.clear();
    assert!(surface.is_blank());

    surface.fill_rect(&BBox::new(0.0, 0.0, 5.0, 5.0), CYAN);
    surface.resize(20, 8);
    assert_eq!(surface.size(), (20, 8));
    assert!(surface.is_blank());
  }

  #[test]
  fn text_width_is_estimated_without_font() {
    let surface = RasterSurface::new(10, 10);
    let short = surface.measure_text("cat 50.0%", 16.0);
    let long = surface.measure_text("teddy bear 50.0%", 16.0);
    assert!(short > 0.0);
    assert!(long > short);
  }

  #[test]
  fn missing_font_file_is_an_error() {
    let result = RasterSurface::new(1, 1).with_font_file("/nonexistent/font.ttf");
    assert!(matches!(result, Err(OutputError::IoError(_))));
  }
}
