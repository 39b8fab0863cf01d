// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/model/session.rs - 检测器会话
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

use std::{
  sync::{Arc, Mutex, PoisonError},
  time::Instant,
};

use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, error, info};

use crate::{
  frame::RgbFrame,
  model::{Detection, Model, ModelLoader, ModelVariant},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("模型 {variant} 加载失败: {source}")]
  ModelLoad {
    variant: ModelVariant,
    source: BoxError,
  },
  #[error("推理失败: {0}")]
  Detect(BoxError),
  #[error("后台任务异常: {0}")]
  Join(#[from] JoinError),
}

/// 已加载的模型实例
///
/// 同一句柄上的推理串行执行：前一次推理未结束时，后一次在阻塞线程上等待。
pub struct DetectorHandle<M> {
  variant: ModelVariant,
  model: Arc<Mutex<M>>,
}

impl<M: Model> DetectorHandle<M> {
  pub fn new(variant: ModelVariant, model: M) -> Self {
    Self {
      variant,
      model: Arc::new(Mutex::new(model)),
    }
  }

  pub fn variant(&self) -> ModelVariant {
    self.variant
  }

  pub async fn detect(&self, frame: RgbFrame) -> Result<Vec<Detection>, SessionError> {
    let model = Arc::clone(&self.model);
    tokio::task::spawn_blocking(move || {
      let model = model.lock().unwrap_or_else(PoisonError::into_inner);
      let now = Instant::now();
      let result = model.infer(&frame);
      debug!("第 {} 帧推理耗时: {:.2?}", frame.index(), now.elapsed());
      result.map_err(|e| SessionError::Detect(Box::new(e)))
    })
    .await?
  }
}

/// 检测器会话，持有当前模型句柄
///
/// 加载过程由异步互斥锁串行化；请求的型号与已持有的相同时直接复用句柄，
/// 因此快速连续切换不会重复加载同一个模型。
pub struct DetectorSession<L: ModelLoader> {
  loader: Arc<L>,
  current: tokio::sync::Mutex<Option<Arc<DetectorHandle<L::Model>>>>,
}

impl<L: ModelLoader> DetectorSession<L> {
  pub fn new(loader: L) -> Self {
    Self {
      loader: Arc::new(loader),
      current: tokio::sync::Mutex::new(None),
    }
  }

  pub async fn load(
    &self,
    variant: ModelVariant,
  ) -> Result<Arc<DetectorHandle<L::Model>>, SessionError> {
    let mut current = self.current.lock().await;

    if let Some(handle) = current.as_ref()
      && handle.variant() == variant
    {
      debug!("复用已加载的模型: {}", variant);
      return Ok(Arc::clone(handle));
    }

    info!("加载模型: {}", variant);
    let now = Instant::now();
    let loader = Arc::clone(&self.loader);
    let model = tokio::task::spawn_blocking(move || loader.load(variant))
      .await?
      .map_err(|e| {
        error!("模型 {} 加载失败: {}", variant, e);
        SessionError::ModelLoad {
          variant,
          source: Box::new(e),
        }
      })?;
    info!("模型加载完成: {}，耗时 {:.2?}", variant, now.elapsed());

    let handle = Arc::new(DetectorHandle::new(variant, model));
    *current = Some(Arc::clone(&handle));
    Ok(handle)
  }

  /// 当前持有的句柄（可能尚未加载）
  pub async fn current(&self) -> Option<Arc<DetectorHandle<L::Model>>> {
    self.current.lock().await.clone()
  }

  /// 丢弃当前句柄，下次 `load` 时重新加载
  pub async fn unload(&self) {
    if let Some(handle) = self.current.lock().await.take() {
      info!("卸载模型: {}", handle.variant());
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
  };

  use image::RgbImage;

  use super::*;
  use crate::geometry::BBox;

  #[derive(Error, Debug)]
  #[error("{0}")]
  struct FakeError(&'static str);

  struct FakeModel {
    variant: ModelVariant,
    busy: Arc<AtomicBool>,
  }

  impl Model for FakeModel {
    type Error = FakeError;

    fn infer(&self, _input: &RgbFrame) -> Result<Vec<Detection>, Self::Error> {
      if self.busy.swap(true, Ordering::SeqCst) {
        return Err(FakeError("concurrent inference"));
      }
      std::thread::sleep(Duration::from_millis(15));
      self.busy.store(false, Ordering::SeqCst);
      Ok(vec![Detection::new(
        self.variant.as_str(),
        0.9,
        BBox::new(0.0, 0.0, 1.0, 1.0),
      )])
    }
  }

  #[derive(Default)]
  struct FakeLoader {
    loads: AtomicUsize,
    fail: bool,
  }

  impl ModelLoader for Arc<FakeLoader> {
    type Model = FakeModel;
    type Error = FakeError;

    fn load(&self, variant: ModelVariant) -> Result<Self::Model, Self::Error> {
      std::thread::sleep(Duration::from_millis(30));
      self.loads.fetch_add(1, Ordering::SeqCst);
      if self.fail {
        return Err(FakeError("weights download failed"));
      }
      Ok(FakeModel {
        variant,
        busy: Arc::new(AtomicBool::new(false)),
      })
    }
  }

  fn frame() -> RgbFrame {
    RgbFrame::from(RgbImage::new(4, 4))
  }

  #[tokio::test]
  async fn concurrent_loads_of_one_variant_are_deduplicated() {
    let loader = Arc::new(FakeLoader::default());
    let session = DetectorSession::new(Arc::clone(&loader));

    let (a, b) = tokio::join!(
      session.load(ModelVariant::LiteMobilenetV2),
      session.load(ModelVariant::LiteMobilenetV2)
    );

    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn switching_variant_replaces_handle() {
    let loader = Arc::new(FakeLoader::default());
    let session = DetectorSession::new(Arc::clone(&loader));

    let lite = session.load(ModelVariant::LiteMobilenetV2).await.unwrap();
    let v1 = session.load(ModelVariant::MobilenetV1).await.unwrap();

    assert!(!Arc::ptr_eq(&lite, &v1));
    let current = session.current().await.unwrap();
    assert_eq!(current.variant(), ModelVariant::MobilenetV1);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

    // 旧句柄仍可完成推理
    let detections = lite.detect(frame()).await.unwrap();
    assert_eq!(detections[0].label, "lite_mobilenet_v2");
  }

  #[tokio::test]
  async fn unload_forces_reload() {
    let loader = Arc::new(FakeLoader::default());
    let session = DetectorSession::new(Arc::clone(&loader));

    session.load(ModelVariant::MobilenetV1).await.unwrap();
    session.unload().await;
    assert!(session.current().await.is_none());
    session.load(ModelVariant::MobilenetV1).await.unwrap();

    assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn load_failure_is_reported() {
    let loader = Arc::new(FakeLoader {
      fail: true,
      ..Default::default()
    });
    let session = DetectorSession::new(loader);

    let err = session.load(ModelVariant::MobilenetV1).await.err().unwrap();
    assert!(matches!(
      err,
      SessionError::ModelLoad {
        variant: ModelVariant::MobilenetV1,
        ..
      }
    ));
    assert!(session.current().await.is_none());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn detect_calls_on_one_handle_never_overlap() {
    let session = DetectorSession::new(Arc::new(FakeLoader::default()));
    let handle = session.load(ModelVariant::LiteMobilenetV2).await.unwrap();

    let (a, b, c) = tokio::join!(
      handle.detect(frame()),
      handle.detect(frame()),
      handle.detect(frame())
    );

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
  }
}
