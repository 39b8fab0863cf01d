// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/model/ssd.rs - SSD MobileNet 检测模型（ONNX，tract 推理）
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

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use thiserror::Error;
use tracing::{debug, info, warn};
use tract_onnx::prelude::*;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::RgbFrame,
  geometry::BBox,
  model::{Detection, Model, ModelLoader, ModelVariant, labels::coco_label},
  query_or,
};

const SSD_SCHEME: &str = "ssd";
const SSD_INPUT_SIZE: u32 = 300;
const SSD_MIN_SCORE: f32 = 0.5;
const SSD_MAX_DETECTIONS: usize = 20;
const SSD_NMS_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum SsdError {
  #[error("模型文件读取错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("推理错误: {0}")]
  InferenceError(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

impl From<TractError> for SsdError {
  fn from(err: TractError) -> Self {
    SsdError::InferenceError(format!("{:#}", err))
  }
}

type Plan = TypedRunnableModel<TypedModel>;

/// 按型号从模型目录加载 `<model_dir>/<variant>.onnx`
///
/// `ssd:///opt/models?input_size=300&min_score=0.5&max_detections=20&nms=0.5`
#[derive(Debug, Clone)]
pub struct SsdLoader {
  model_dir: PathBuf,
  input_size: u32,
  min_score: f32,
  max_detections: usize,
  nms_threshold: f32,
}

impl SsdLoader {
  pub fn new<P: Into<PathBuf>>(model_dir: P) -> Self {
    Self {
      model_dir: model_dir.into(),
      input_size: SSD_INPUT_SIZE,
      min_score: SSD_MIN_SCORE,
      max_detections: SSD_MAX_DETECTIONS,
      nms_threshold: SSD_NMS_THRESHOLD,
    }
  }

  pub fn min_score(mut self, min_score: f32) -> Self {
    self.min_score = min_score;
    self
  }

  pub fn max_detections(mut self, max_detections: usize) -> Self {
    self.max_detections = max_detections;
    self
  }

  pub fn model_path(&self, variant: ModelVariant) -> PathBuf {
    self.model_dir.join(format!("{}.onnx", variant))
  }
}

impl FromUrlWithScheme for SsdLoader {
  const SCHEME: &'static str = SSD_SCHEME;
}

impl FromUrl for SsdLoader {
  type Error = SsdError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SsdError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        SSD_SCHEME
      )));
    }

    let mut loader = Self::new(decode_url_path(url));
    loader.input_size = query_or(url, "input_size", SSD_INPUT_SIZE);
    loader.min_score = query_or(url, "min_score", SSD_MIN_SCORE);
    loader.max_detections = query_or(url, "max_detections", SSD_MAX_DETECTIONS);
    loader.nms_threshold = query_or(url, "nms", SSD_NMS_THRESHOLD);
    Ok(loader)
  }
}

impl ModelLoader for SsdLoader {
  type Model = SsdModel;
  type Error = SsdError;

  fn load(&self, variant: ModelVariant) -> Result<Self::Model, Self::Error> {
    let path = self.model_path(variant);
    SsdModel::load(&path, self.input_size).map(|model| SsdModel {
      min_score: self.min_score,
      max_detections: self.max_detections,
      nms_threshold: self.nms_threshold,
      ..model
    })
  }
}

/// SSD MobileNet 检测模型
///
/// 输入为 `[1, H, W, 3]` 的 u8 图像；输出依次为边界框 `[1, N, 4]`
/// （归一化 ymin, xmin, ymax, xmax）、类别 `[1, N]`、分数 `[1, N]` 与数量 `[1]`。
pub struct SsdModel {
  plan: Plan,
  input_size: u32,
  min_score: f32,
  max_detections: usize,
  nms_threshold: f32,
}

impl SsdModel {
  pub fn load(path: &Path, input_size: u32) -> Result<Self, SsdError> {
    info!("加载模型文件: {}", path.display());
    let bytes = std::fs::read(path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      bytes.len() as f64 / (1024.0 * 1024.0)
    );

    let size = input_size as usize;
    let plan = tract_onnx::onnx()
      .model_for_read(&mut bytes.as_slice())
      .map_err(|e| SsdError::ModelInvalid(format!("{:#}", e)))?
      .with_input_fact(
        0,
        InferenceFact::dt_shape(u8::datum_type(), tvec!(1, size, size, 3)),
      )
      .map_err(|e| SsdError::ModelInvalid(format!("{:#}", e)))?
      .into_optimized()
      .map_err(|e| SsdError::ModelInvalid(format!("{:#}", e)))?
      .into_runnable()
      .map_err(|e| SsdError::ModelInvalid(format!("{:#}", e)))?;

    let outputs = plan.model().outputs.len();
    if outputs < 3 {
      return Err(SsdError::ModelInvalid(format!(
        "预期模型输出数量至少为 3, 实际为 {}",
        outputs
      )));
    }

    Ok(Self {
      plan,
      input_size,
      min_score: SSD_MIN_SCORE,
      max_detections: SSD_MAX_DETECTIONS,
      nms_threshold: SSD_NMS_THRESHOLD,
    })
  }

  fn preprocess(&self, frame: &RgbFrame) -> Result<Tensor, SsdError> {
    let resized = imageops::resize(
      frame.image(),
      self.input_size,
      self.input_size,
      FilterType::Triangle,
    );
    let size = self.input_size as usize;
    let input = tract_ndarray::Array4::from_shape_vec((1, size, size, 3), resized.into_raw())
      .map_err(|e| SsdError::InferenceError(e.to_string()))?;
    Ok(input.into_tensor())
  }

  fn postprocess(
    &self,
    outputs: TVec<TValue>,
    width: f32,
    height: f32,
  ) -> Result<Vec<Detection>, SsdError> {
    let boxes = outputs[0].as_slice::<f32>()?;
    let classes = outputs[1].cast_to::<f32>()?;
    let classes = classes.as_slice::<f32>()?;
    let scores = outputs[2].as_slice::<f32>()?;

    let count = match outputs.get(3) {
      Some(num) => num
        .cast_to::<f32>()?
        .as_slice::<f32>()?
        .first()
        .map(|&n| n as usize)
        .unwrap_or(scores.len()),
      None => scores.len(),
    }
    .min(scores.len())
    .min(classes.len())
    .min(boxes.len() / 4);

    let mut candidates = Vec::new();
    for i in 0..count {
      let score = scores[i];
      if score < self.min_score {
        continue;
      }

      let class_id = classes[i] as u32;
      let Some(label) = coco_label(class_id) else {
        warn!("忽略未知类别: {}", class_id);
        continue;
      };

      let [y_min, x_min, y_max, x_max] = [
        boxes[i * 4].clamp(0.0, 1.0),
        boxes[i * 4 + 1].clamp(0.0, 1.0),
        boxes[i * 4 + 2].clamp(0.0, 1.0),
        boxes[i * 4 + 3].clamp(0.0, 1.0),
      ];
      candidates.push(Detection::new(
        label,
        score,
        BBox::from_corners(x_min * width, y_min * height, x_max * width, y_max * height),
      ));
    }

    Ok(non_max_suppression(
      candidates,
      self.nms_threshold,
      self.max_detections,
    ))
  }
}

impl Model for SsdModel {
  type Error = SsdError;

  fn infer(&self, input: &RgbFrame) -> Result<Vec<Detection>, Self::Error> {
    let (width, height) = input.dimensions();
    let tensor = self.preprocess(input)?;
    let outputs = self.plan.run(tvec!(tensor.into()))?;
    let detections = self.postprocess(outputs, width as f32, height as f32)?;
    debug!("检测到 {} 个物体", detections.len());
    Ok(detections)
  }
}

/// 同类别非极大值抑制，按分数降序保留至多 `limit` 个结果
fn non_max_suppression(
  mut detections: Vec<Detection>,
  threshold: f32,
  limit: usize,
) -> Vec<Detection> {
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut kept: Vec<Detection> = Vec::new();
  for candidate in detections {
    if kept.len() >= limit {
      break;
    }
    let suppressed = kept
      .iter()
      .any(|k| k.label == candidate.label && k.bbox.iou(&candidate.bbox) >= threshold);
    if !suppressed {
      kept.push(candidate);
    }
  }
  kept
}
