// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/model.rs - 模型
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

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::{frame::RgbFrame, geometry::BBox};

pub mod labels;
pub mod session;

pub use self::session::{DetectorHandle, DetectorSession, SessionError};

#[cfg(feature = "backend-tract")]
mod ssd;
#[cfg(feature = "backend-tract")]
pub use self::ssd::{SsdError, SsdLoader, SsdModel};

/// 单个检测结果，边界框位于源图像像素坐标系
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub label: String,
  pub confidence: f32,
  pub bbox: BBox,
}

impl Detection {
  pub fn new(label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
    Self {
      label: label.into(),
      confidence,
      bbox,
    }
  }
}

/// 检测模型
///
/// 推理是阻塞调用，由 [`DetectorHandle`] 放到阻塞线程池中执行。
pub trait Model: Send + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  fn infer(&self, input: &RgbFrame) -> Result<Vec<Detection>, Self::Error>;
}

/// 按型号加载模型
pub trait ModelLoader: Send + Sync + 'static {
  type Model: Model;
  type Error: std::error::Error + Send + Sync + 'static;

  fn load(&self, variant: ModelVariant) -> Result<Self::Model, Self::Error>;
}

/// 可选的模型型号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModelVariant {
  /// 轻量 MobileNet V2，速度优先
  #[default]
  LiteMobilenetV2,
  /// MobileNet V1，精度优先
  MobilenetV1,
}

impl ModelVariant {
  pub const ALL: [ModelVariant; 2] = [ModelVariant::LiteMobilenetV2, ModelVariant::MobilenetV1];

  pub fn as_str(&self) -> &'static str {
    match self {
      ModelVariant::LiteMobilenetV2 => "lite_mobilenet_v2",
      ModelVariant::MobilenetV1 => "mobilenet_v1",
    }
  }
}

impl fmt::Display for ModelVariant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("未知的模型型号: {0}")]
pub struct UnknownVariant(pub String);

impl FromStr for ModelVariant {
  type Err = UnknownVariant;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ModelVariant::ALL
      .into_iter()
      .find(|variant| variant.as_str() == s)
      .ok_or_else(|| UnknownVariant(s.to_string()))
  }
}
