// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/input/pattern.rs - 合成测试图案实时流
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
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use image::{Rgb, RgbImage};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RgbFrame,
  input::{InputError, LiveStream},
  query_or,
};

const PATTERN_SCHEME: &str = "pattern";

/// 测试图案流构建器
///
/// `pattern://?width=640&height=480&fps=30&warmup_ms=0`
#[derive(Debug, Clone)]
pub struct PatternStreamBuilder {
  width: u32,
  height: u32,
  fps: u32,
  warmup: Duration,
}

impl Default for PatternStreamBuilder {
  fn default() -> Self {
    Self {
      width: 640,
      height: 480,
      fps: 30,
      warmup: Duration::ZERO,
    }
  }
}

impl FromUrlWithScheme for PatternStreamBuilder {
  const SCHEME: &'static str = PATTERN_SCHEME;
}

impl FromUrl for PatternStreamBuilder {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InputError::SchemeMismatch(url.scheme().to_string()));
    }

    let default = Self::default();
    Ok(
      Self::new(
        query_or(url, "width", default.width),
        query_or(url, "height", default.height),
      )
      .fps(query_or(url, "fps", default.fps))
      .warmup(Duration::from_millis(query_or(url, "warmup_ms", 0u64))),
    )
  }
}

impl PatternStreamBuilder {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      ..Default::default()
    }
  }

  pub fn fps(mut self, fps: u32) -> Self {
    self.fps = fps.max(1);
    self
  }

  /// 首帧前的延迟，模拟摄像头启动耗时
  pub fn warmup(mut self, warmup: Duration) -> Self {
    self.warmup = warmup;
    self
  }

  pub fn build(self) -> PatternStream {
    let shared = Arc::new(Shared::default());
    let running = Arc::new(AtomicBool::new(true));

    info!(
      "启动测试图案: {}x{} @ {} fps (预热 {:?})",
      self.width, self.height, self.fps, self.warmup
    );

    let worker = {
      let shared = Arc::clone(&shared);
      let running = Arc::clone(&running);
      thread::spawn(move || generate(self, shared, running))
    };

    PatternStream {
      shared,
      running,
      worker: Some(worker),
    }
  }
}

#[derive(Default)]
struct Shared {
  latest: Mutex<Option<RgbFrame>>,
  // 高 32 位为宽，低 32 位为高
  dimensions: AtomicU64,
}

impl Shared {
  fn publish(&self, frame: RgbFrame) {
    let (w, h) = frame.dimensions();
    *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    self
      .dimensions
      .store(((w as u64) << 32) | h as u64, Ordering::Release);
  }
}

fn generate(builder: PatternStreamBuilder, shared: Arc<Shared>, running: Arc<AtomicBool>) {
  let interval = Duration::from_secs(1) / builder.fps;
  let started = Instant::now();

  while running.load(Ordering::Acquire) && started.elapsed() < builder.warmup {
    thread::sleep(Duration::from_millis(1).min(builder.warmup));
  }

  let mut index = 0u64;
  let mut next = Instant::now();
  while running.load(Ordering::Acquire) {
    shared.publish(RgbFrame::new(
      render_pattern(builder.width, builder.height, index),
      index,
      started.elapsed(),
    ));
    index += 1;

    next += interval;
    let now = Instant::now();
    if next > now {
      thread::sleep(next - now);
    } else {
      next = now;
    }
  }
  debug!("测试图案线程退出，共生成 {} 帧", index);
}

/// 渐变背景上一个横向移动的方块
fn render_pattern(width: u32, height: u32, index: u64) -> RgbImage {
  let block = (width.min(height) / 4).max(1);
  let travel = width.saturating_sub(block).max(1) as u64;
  let block_x = ((index * 8) % travel) as u32;
  let block_y = height.saturating_sub(block) / 2;

  RgbImage::from_fn(width, height, |x, y| {
    if x >= block_x && x < block_x + block && y >= block_y && y < block_y + block {
      Rgb([255, 255, 255])
    } else {
      let r = (x * 255 / width.max(1)) as u8;
      let g = (y * 255 / height.max(1)) as u8;
      Rgb([r, g, (index % 256) as u8])
    }
  })
}

/// 合成测试图案实时流，无需摄像头硬件
pub struct PatternStream {
  shared: Arc<Shared>,
  running: Arc<AtomicBool>,
  worker: Option<JoinHandle<()>>,
}

impl LiveStream for PatternStream {
  fn dimensions(&self) -> (u32, u32) {
    let packed = self.shared.dimensions.load(Ordering::Acquire);
    ((packed >> 32) as u32, packed as u32)
  }

  fn current_frame(&self) -> Option<RgbFrame> {
    self
      .shared
      .latest
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn stop(&mut self) {
    self.running.store(false, Ordering::Release);
    if let Some(worker) = self.worker.take() {
      if worker.join().is_err() {
        warn!("测试图案线程异常退出");
      }
      info!("测试图案已停止");
    }
  }
}

impl Drop for PatternStream {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn wait_ready(stream: &PatternStream) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while stream.dimensions() == (0, 0) {
      assert!(Instant::now() < deadline, "pattern never produced a frame");
      thread::sleep(Duration::from_millis(2));
    }
  }

  #[test]
  fn reports_zero_dimensions_during_warmup() {
    let mut stream = PatternStreamBuilder::new(32, 24)
      .warmup(Duration::from_millis(300))
      .build();
    assert_eq!(stream.dimensions(), (0, 0));
    assert!(stream.current_frame().is_none());

    wait_ready(&stream);
    assert_eq!(stream.dimensions(), (32, 24));
    assert!(stream.current_frame().is_some());
    stream.stop();
  }

  #[test]
  fn frames_keep_advancing() {
    let mut stream = PatternStreamBuilder::new(16, 16).fps(200).build();
    wait_ready(&stream);
    let first = stream.current_frame().unwrap().index();

    let deadline = Instant::now() + Duration::from_secs(5);
    while stream.current_frame().unwrap().index() == first {
      assert!(Instant::now() < deadline);
      thread::sleep(Duration::from_millis(2));
    }
    stream.stop();
  }

  #[test]
  fn stop_twice_is_harmless() {
    let mut stream = PatternStreamBuilder::new(8, 8).build();
    stream.stop();
    stream.stop();
    assert!(stream.worker.is_none());
  }

  #[test]
  fn builder_reads_url_query() {
    let url = Url::parse("pattern://?width=320&height=200&fps=5&warmup_ms=40").unwrap();
    let builder = PatternStreamBuilder::from_url(&url).unwrap();
    assert_eq!((builder.width, builder.height, builder.fps), (320, 200, 5));
    assert_eq!(builder.warmup, Duration::from_millis(40));
  }
}
