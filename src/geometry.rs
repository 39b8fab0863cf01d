// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/geometry.rs - 源图像到显示区域的坐标映射
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

//! # 坐标映射
//!
//! 源图像按等比缩放放入显示区域（letterbox）：一个方向铺满，另一个方向居中留边。
//! 整幅源图像始终可见，不裁剪，不拉伸。
//!
//! ```
//! use qianliyan::geometry::{BBox, compute_geometry, map_box};
//!
//! let geometry = compute_geometry(1280.0, 720.0, 640.0, 640.0).unwrap();
//! assert_eq!(geometry.offset_y, 140.0);
//!
//! let mapped = map_box(&BBox::new(100.0, 50.0, 200.0, 300.0), &geometry);
//! assert_eq!(mapped, BBox::new(50.0, 165.0, 100.0, 150.0));
//! ```

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum GeometryError {
  #[error("无效尺寸: 源 {src_w}x{src_h}, 显示 {dst_w}x{dst_h}")]
  InvalidDimension {
    src_w: f32,
    src_h: f32,
    dst_w: f32,
    dst_h: f32,
  },
}

/// 轴对齐矩形，(x, y) 为左上角
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BBox {
  pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 由 [x_min, y_min, x_max, y_max] 构造
  pub fn from_corners(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
    Self::new(x_min, y_min, x_max - x_min, y_max - y_min)
  }

  pub fn right(&self) -> f32 {
    self.x + self.width
  }

  pub fn bottom(&self) -> f32 {
    self.y + self.height
  }

  pub fn area(&self) -> f32 {
    self.width.max(0.0) * self.height.max(0.0)
  }

  pub fn iou(&self, other: &BBox) -> f32 {
    let x1 = self.x.max(other.x);
    let y1 = self.y.max(other.y);
    let x2 = self.right().min(other.right());
    let y2 = self.bottom().min(other.bottom());

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

/// 等比缩放与居中偏移
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayGeometry {
  pub scale_x: f32,
  pub scale_y: f32,
  pub offset_x: f32,
  pub offset_y: f32,
}

impl DisplayGeometry {
  /// 源图像在显示区域中实际占据的矩形
  pub fn content_rect(&self, src_w: f32, src_h: f32) -> BBox {
    map_box(&BBox::new(0.0, 0.0, src_w, src_h), self)
  }
}

fn valid(v: f32) -> bool {
  v.is_finite() && v > 0.0
}

/// 计算把 `src_w x src_h` 的源图像放入 `dst_w x dst_h` 显示区域的缩放和偏移
pub fn compute_geometry(
  src_w: f32,
  src_h: f32,
  dst_w: f32,
  dst_h: f32,
) -> Result<DisplayGeometry, GeometryError> {
  if !(valid(src_w) && valid(src_h) && valid(dst_w) && valid(dst_h)) {
    return Err(GeometryError::InvalidDimension {
      src_w,
      src_h,
      dst_w,
      dst_h,
    });
  }

  let aspect_src = src_w / src_h;
  let aspect_dst = dst_w / dst_h;

  let geometry = if aspect_src > aspect_dst {
    // 源图像更宽：宽度铺满，上下留边
    let scale = dst_w / src_w;
    DisplayGeometry {
      scale_x: scale,
      scale_y: scale,
      offset_x: 0.0,
      offset_y: ((dst_h - src_h * scale) / 2.0).max(0.0),
    }
  } else {
    // 源图像更高（或比例相同）：高度铺满，左右留边
    let scale = dst_h / src_h;
    DisplayGeometry {
      scale_x: scale,
      scale_y: scale,
      offset_x: ((dst_w - src_w * scale) / 2.0).max(0.0),
      offset_y: 0.0,
    }
  };

  Ok(geometry)
}

/// 源坐标系中的矩形映射到显示坐标系
pub fn map_box(bbox: &BBox, geometry: &DisplayGeometry) -> BBox {
  BBox {
    x: bbox.x * geometry.scale_x + geometry.offset_x,
    y: bbox.y * geometry.scale_y + geometry.offset_y,
    width: bbox.width * geometry.scale_x,
    height: bbox.height * geometry.scale_y,
  }
}

/// `map_box` 的逆变换，显示坐标系回到源坐标系
pub fn unmap_box(bbox: &BBox, geometry: &DisplayGeometry) -> BBox {
  BBox {
    x: (bbox.x - geometry.offset_x) / geometry.scale_x,
    y: (bbox.y - geometry.offset_y) / geometry.scale_y,
    width: bbox.width / geometry.scale_x,
    height: bbox.height / geometry.scale_y,
  }
}
