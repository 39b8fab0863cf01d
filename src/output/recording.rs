// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/output/recording.rs - 记录绘制指令的表面
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

use crate::{geometry::BBox, output::Surface};

#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
  Resize {
    width: u32,
    height: u32,
  },
  Clear,
  StrokeRect {
    rect: BBox,
    color: Rgba<u8>,
    line_width: f32,
  },
  FillRect {
    rect: BBox,
    color: Rgba<u8>,
  },
  FillText {
    text: String,
    x: f32,
    y: f32,
    font_size: f32,
    color: Rgba<u8>,
  },
}

/// 不产生像素，只按顺序记录绘制指令
///
/// 清空或调整尺寸会丢弃此前的指令，记录只保留当前画面。
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
  size: (u32, u32),
  ops: Vec<DrawOp>,
}

impl RecordingSurface {
  pub fn ops(&self) -> &[DrawOp] {
    &self.ops
  }

  /// 最近一次清空之后绘制的指令
  pub fn visible(&self) -> &[DrawOp] {
    let start = self
      .ops
      .iter()
      .rposition(|op| matches!(op, DrawOp::Clear | DrawOp::Resize { .. }))
      .map_or(0, |i| i + 1);
    &self.ops[start..]
  }

  /// 当前可见的检测框数量
  pub fn boxes(&self) -> usize {
    self
      .visible()
      .iter()
      .filter(|op| matches!(op, DrawOp::StrokeRect { .. }))
      .count()
  }

  /// 当前可见的标签文本
  pub fn labels(&self) -> Vec<String> {
    self
      .visible()
      .iter()
      .filter_map(|op| match op {
        DrawOp::FillText { text, .. } => Some(text.clone()),
        _ => None,
      })
      .collect()
  }

  pub fn take_ops(&mut self) -> Vec<DrawOp> {
    std::mem::take(&mut self.ops)
  }
}

impl Surface for RecordingSurface {
  fn resize(&mut self, width: u32, height: u32) {
    self.size = (width, height);
    self.ops.clear();
    self.ops.push(DrawOp::Resize { width, height });
  }

  fn size(&self) -> (u32, u32) {
    self.size
  }

  fn clear(&mut self) {
    self.ops.clear();
    self.ops.push(DrawOp::Clear);
  }

  fn stroke_rect(&mut self, rect: &BBox, color: Rgba<u8>, line_width: f32) {
    self.ops.push(DrawOp::StrokeRect {
      rect: *rect,
      color,
      line_width,
    });
  }

  fn fill_rect(&mut self, rect: &BBox, color: Rgba<u8>) {
    self.ops.push(DrawOp::FillRect { rect: *rect, color });
  }

  fn measure_text(&self, text: &str, font_size: f32) -> f32 {
    text.chars().count() as f32 * font_size / 2.0
  }

  fn fill_text(&mut self, text: &str, x: f32, y: f32, font_size: f32, color: Rgba<u8>) {
    self.ops.push(DrawOp::FillText {
      text: text.to_string(),
      x,
      y,
      font_size,
      color,
    });
  }

  fn is_blank(&self) -> bool {
    self.visible().is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn visible_ops_start_after_last_clear() {
    let mut surface = RecordingSurface::default();
    let cyan = Rgba([0, 255, 255, 255]);
    surface.stroke_rect(&BBox::new(0.0, 0.0, 1.0, 1.0), cyan, 3.0);
    surface.clear();
    assert!(surface.is_blank());

    surface.stroke_rect(&BBox::new(1.0, 1.0, 2.0, 2.0), cyan, 3.0);
    surface.fill_text("cat 90.0%", 1.0, 1.0, 16.0, cyan);
    assert_eq!(surface.boxes(), 1);
    assert_eq!(surface.labels(), vec!["cat 90.0%".to_string()]);
    assert_eq!(surface.ops().len(), 3);
    assert_eq!(surface.ops()[0], DrawOp::Clear);
  }

  #[test]
  fn repeated_frames_do_not_grow_the_log() {
    let mut surface = RecordingSurface::default();
    let cyan = Rgba([0, 255, 255, 255]);
    for i in 0..1000 {
      surface.resize(640, 480);
      surface.clear();
      surface.stroke_rect(&BBox::new(i as f32, 0.0, 10.0, 10.0), cyan, 3.0);
      surface.fill_text("cat 90.0%", i as f32, 0.0, 16.0, cyan);
    }
    assert_eq!(surface.ops().len(), 3);
    assert_eq!(surface.boxes(), 1);
    assert_eq!(surface.size(), (640, 480));
  }

  #[test]
  fn resize_discards_previous_frame() {
    let mut surface = RecordingSurface::default();
    let cyan = Rgba([0, 255, 255, 255]);
    surface.stroke_rect(&BBox::new(0.0, 0.0, 1.0, 1.0), cyan, 3.0);
    surface.resize(320, 240);
    assert_eq!(
      surface.ops(),
      [DrawOp::Resize {
        width: 320,
        height: 240
      }]
    );
    assert!(surface.is_blank());
  }
}
