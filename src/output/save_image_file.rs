// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/output/save_image_file.rs - 保存叠加结果图像
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

use image::{
  DynamicImage, Rgba, RgbaImage,
  imageops::{self, FilterType},
};
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::RgbFrame,
  geometry::compute_geometry,
  output::{OutputError, RasterSurface, Surface},
};

const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// 把画面按显示区域等比缩放居中，再叠加绘图表面，保存为图像文件
///
/// `image:///tmp/overlay.png`
pub struct SaveImageFileOutput {
  path: String,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = OutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: decode_url_path(uri),
    })
  }
}

impl SaveImageFileOutput {
  pub fn new<P: Into<String>>(path: P) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  /// 合成显示区域的最终画面
  pub fn compose(frame: &RgbFrame, overlay: &RgbaImage) -> Result<RgbaImage, OutputError> {
    let (src_w, src_h) = frame.dimensions();
    let (dst_w, dst_h) = overlay.dimensions();
    let geometry = compute_geometry(src_w as f32, src_h as f32, dst_w as f32, dst_h as f32)?;
    let content = geometry.content_rect(src_w as f32, src_h as f32);

    let scaled = imageops::resize(
      frame.image(),
      (content.width.round() as u32).max(1),
      (content.height.round() as u32).max(1),
      FilterType::Triangle,
    );
    let scaled = DynamicImage::ImageRgb8(scaled).to_rgba8();

    let mut canvas = RgbaImage::from_pixel(dst_w, dst_h, BACKGROUND);
    imageops::overlay(
      &mut canvas,
      &scaled,
      content.x.round() as i64,
      content.y.round() as i64,
    );
    imageops::overlay(&mut canvas, overlay, 0, 0);
    Ok(canvas)
  }

  fn ensure_parent(&self) -> Result<(), OutputError> {
    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    Ok(())
  }

  /// 保存画面与叠加层的合成结果
  pub fn save(&self, frame: &RgbFrame, surface: &RasterSurface) -> Result<(), OutputError> {
    let canvas = Self::compose(frame, surface.image())?;
    self.ensure_parent()?;

    DynamicImage::ImageRgba8(canvas).to_rgb8().save(&self.path)?;
    info!(
      "保存图像到文件: {} ({}x{})",
      self.path,
      surface.size().0,
      surface.size().1
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use image::{Rgb, RgbImage};

  use super::*;
  use crate::geometry::BBox;

  #[test]
  fn compose_letterboxes_frame_under_overlay() {
    let frame = RgbFrame::from(RgbImage::from_pixel(40, 20, Rgb([255, 0, 0])));
    let mut surface = RasterSurface::new(40, 40);
    surface.fill_rect(&BBox::new(0.0, 15.0, 2.0, 2.0), Rgba([0, 255, 255, 255]));

    let canvas = SaveImageFileOutput::compose(&frame, surface.image()).unwrap();
    assert_eq!(canvas.dimensions(), (40, 40));
    // 上下黑边
    assert_eq!(*canvas.get_pixel(20, 2), BACKGROUND);
    assert_eq!(*canvas.get_pixel(20, 37), BACKGROUND);
    // 画面居中
    assert_eq!(*canvas.get_pixel(20, 20), Rgba([255, 0, 0, 255]));
    // 叠加层在最上
    assert_eq!(*canvas.get_pixel(0, 15), Rgba([0, 255, 255, 255]));
  }

  #[test]
  fn save_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/out.png");
    let output = SaveImageFileOutput::new(path.to_string_lossy());

    let frame = RgbFrame::from(RgbImage::new(8, 8));
    output.save(&frame, &RasterSurface::new(16, 16)).unwrap();

    let saved = image::open(&path).unwrap();
    assert_eq!((saved.width(), saved.height()), (16, 16));
  }

  #[test]
  fn jpeg_output_is_composited_opaque() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.jpg");
    let output = SaveImageFileOutput::new(path.to_string_lossy());

    let frame = RgbFrame::from(RgbImage::from_pixel(32, 16, Rgb([200, 200, 200])));
    let mut surface = RasterSurface::new(32, 32);
    surface.fill_rect(&BBox::new(0.0, 8.0, 4.0, 4.0), Rgba([0, 255, 255, 255]));
    output.save(&frame, &surface).unwrap();

    let saved = image::open(&path).unwrap();
    assert_eq!((saved.width(), saved.height()), (32, 32));
    assert_eq!(saved.color(), image::ColorType::Rgb8);
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("video:///tmp/out.mp4").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(OutputError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn empty_display_is_rejected() {
    let frame = RgbFrame::from(RgbImage::new(8, 8));
    let result = SaveImageFileOutput::compose(&frame, &RgbaImage::new(0, 0));
    assert!(matches!(result, Err(OutputError::GeometryError(_))));
  }
}
