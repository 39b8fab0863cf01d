// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/task.rs - 检测循环
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
  future::Future,
  pin::Pin,
  sync::{Arc, Mutex, PoisonError},
  time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{
  sync::{mpsc, oneshot, watch},
  task::{JoinError, JoinHandle},
  time::{self, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
  frame::RgbFrame,
  geometry::{GeometryError, compute_geometry},
  input::{CameraProvider, InputError, MediaSource, SourceKind, StaticImage},
  model::{Detection, DetectorHandle, DetectorSession, ModelLoader, ModelVariant, SessionError},
  output::{OutputError, OverlayRenderer, OverlayStyle, Surface, confident},
};

pub const MIN_CONFIDENCE_THRESHOLD: f32 = 0.1;
pub const MAX_CONFIDENCE_THRESHOLD: f32 = 0.9;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(16);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DISPLAY: (u32, u32) = (640, 480);

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("检测器错误: {0}")]
  Session(#[from] SessionError),
  #[error("几何计算错误: {0}")]
  Geometry(#[from] GeometryError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("后台任务异常: {0}")]
  Join(#[from] JoinError),
  #[error("检测循环已停止")]
  Stopped,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
  /// 刷新节拍，对应显示器的一帧
  pub refresh_interval: Duration,
  /// 等待实时流首帧的最长时间
  pub ready_timeout: Duration,
  pub model: ModelVariant,
  pub confidence_threshold: f32,
  /// 显示区域尺寸（像素）
  pub display: (u32, u32),
  pub style: OverlayStyle,
}

impl Default for LoopConfig {
  fn default() -> Self {
    Self {
      refresh_interval: DEFAULT_REFRESH_INTERVAL,
      ready_timeout: DEFAULT_READY_TIMEOUT,
      model: ModelVariant::default(),
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      display: DEFAULT_DISPLAY,
      style: OverlayStyle::default(),
    }
  }
}

/// 把阈值限制在 `[0.1, 0.9]`；非有限值返回 `None`
pub fn clamp_threshold(value: f32) -> Option<f32> {
  value
    .is_finite()
    .then(|| value.clamp(MIN_CONFIDENCE_THRESHOLD, MAX_CONFIDENCE_THRESHOLD))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Idle,
  Starting,
  Running,
}

/// 检测循环对外发布的状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct LoopStatus {
  pub phase: Phase,
  pub running: bool,
  pub loading_model: bool,
  pub fps: Option<f64>,
  pub model: ModelVariant,
  pub confidence_threshold: f32,
  pub source: Option<SourceKind>,
  pub last_error: Option<String>,
  /// 已完成并绘制的检测次数
  pub cycles: u64,
}

impl LoopStatus {
  fn new(config: &LoopConfig) -> Self {
    Self {
      phase: Phase::Idle,
      running: false,
      loading_model: false,
      fps: None,
      model: config.model,
      confidence_threshold: config.confidence_threshold,
      source: None,
      last_error: None,
      cycles: 0,
    }
  }

  pub fn is_running(&self) -> bool {
    self.running
  }

  pub fn is_loading_model(&self) -> bool {
    self.loading_model
  }

  pub fn fps_text(&self) -> String {
    match self.fps {
      Some(fps) => format!("FPS: {:.1}", fps),
      None => "FPS: --".to_string(),
    }
  }
}

enum Command {
  StartStop,
  Start,
  Stop,
  SelectModel(ModelVariant),
  SetConfidenceThreshold(f32),
  SelectImageFile(Vec<u8>),
  ResizeDisplay { width: u32, height: u32 },
  Settle(oneshot::Sender<()>),
}

type DetectFuture = Pin<Box<dyn Future<Output = Result<Vec<Detection>, SessionError>> + Send>>;

/// 进行中的检测，带发起时的代数
struct InFlight {
  generation: u64,
  frame: RgbFrame,
  future: DetectFuture,
}

struct Completed {
  generation: u64,
  frame: RgbFrame,
  result: Result<Vec<Detection>, SessionError>,
}

async fn wait_in_flight(in_flight: &mut Option<InFlight>) -> Completed {
  match in_flight {
    Some(cycle) => {
      let result = (&mut cycle.future).await;
      Completed {
        generation: cycle.generation,
        frame: cycle.frame.clone(),
        result,
      }
    }
    None => std::future::pending().await,
  }
}

fn lock<S>(surface: &Mutex<S>) -> std::sync::MutexGuard<'_, S> {
  surface.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 检测循环
///
/// 所有可变状态归后台任务独占；界面只通过 [`DetectionLoopHandle`] 发送命令、
/// 读取状态和绘图表面。
pub struct DetectionLoop<C, L, S> {
  config: LoopConfig,
  camera: C,
  loader: L,
  surface: S,
}

impl<C, L, S> DetectionLoop<C, L, S>
where
  C: CameraProvider,
  L: ModelLoader,
  S: Surface,
{
  pub fn new(config: LoopConfig, camera: C, loader: L, surface: S) -> Self {
    Self {
      config,
      camera,
      loader,
      surface,
    }
  }

  /// 在当前 tokio 运行时上启动后台任务
  pub fn spawn(self) -> DetectionLoopHandle<S> {
    let mut config = self.config;
    config.confidence_threshold =
      clamp_threshold(config.confidence_threshold).unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD);

    let (commands, receiver) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(LoopStatus::new(&config));
    let surface = Arc::new(Mutex::new(self.surface));
    let last_frame = Arc::new(Mutex::new(None));

    let worker = Worker::new(
      config,
      self.camera,
      self.loader,
      Arc::clone(&surface),
      Arc::clone(&last_frame),
      status_tx,
    );
    let worker = tokio::spawn(worker.run(receiver));

    DetectionLoopHandle {
      commands,
      status: status_rx,
      surface,
      last_frame,
      worker,
    }
  }
}

/// 检测循环的界面侧句柄
///
/// 命令按发送顺序处理。句柄被丢弃或调用 [`shutdown`](Self::shutdown) 时，
/// 后台任务停止检测并释放输入源。
pub struct DetectionLoopHandle<S> {
  commands: mpsc::UnboundedSender<Command>,
  status: watch::Receiver<LoopStatus>,
  surface: Arc<Mutex<S>>,
  last_frame: Arc<Mutex<Option<RgbFrame>>>,
  worker: JoinHandle<()>,
}

impl<S> DetectionLoopHandle<S> {
  fn send(&self, command: Command) -> Result<(), PipelineError> {
    self
      .commands
      .send(command)
      .map_err(|_| PipelineError::Stopped)
  }

  /// 运行中则停止，否则启动
  pub fn start_stop(&self) -> Result<(), PipelineError> {
    self.send(Command::StartStop)
  }

  pub fn start(&self) -> Result<(), PipelineError> {
    self.send(Command::Start)
  }

  pub fn stop(&self) -> Result<(), PipelineError> {
    self.send(Command::Stop)
  }

  pub fn select_model(&self, variant: ModelVariant) -> Result<(), PipelineError> {
    self.send(Command::SelectModel(variant))
  }

  pub fn set_confidence_threshold(&self, threshold: f32) -> Result<(), PipelineError> {
    self.send(Command::SetConfidenceThreshold(threshold))
  }

  /// 选择一张静态图片（编码后的文件内容）
  pub fn select_image_file(&self, bytes: Vec<u8>) -> Result<(), PipelineError> {
    self.send(Command::SelectImageFile(bytes))
  }

  pub fn resize_display(&self, width: u32, height: u32) -> Result<(), PipelineError> {
    self.send(Command::ResizeDisplay { width, height })
  }

  /// 等待此前发送的命令全部处理完毕
  pub async fn settled(&self) -> Result<(), PipelineError> {
    let (tx, rx) = oneshot::channel();
    self.send(Command::Settle(tx))?;
    rx.await.map_err(|_| PipelineError::Stopped)
  }

  pub fn status(&self) -> LoopStatus {
    self.status.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<LoopStatus> {
    self.status.clone()
  }

  pub fn surface(&self) -> Arc<Mutex<S>> {
    Arc::clone(&self.surface)
  }

  /// 绘图表面当前内容对应的输入帧
  ///
  /// 该帧在绘图表面的锁内更新，持有表面锁时读取可得到一致的画面与叠加层。
  pub fn last_frame(&self) -> Option<RgbFrame> {
    lock(&self.last_frame).clone()
  }

  /// 停止检测并等待后台任务退出
  pub async fn shutdown(self) -> Result<(), PipelineError> {
    let Self {
      commands, worker, ..
    } = self;
    drop(commands);
    worker.await?;
    Ok(())
  }
}

struct Worker<C: CameraProvider, L: ModelLoader, S: Surface> {
  config: LoopConfig,
  camera: Arc<C>,
  session: DetectorSession<L>,
  detector: Option<Arc<DetectorHandle<L::Model>>>,
  surface: Arc<Mutex<S>>,
  last_frame: Arc<Mutex<Option<RgbFrame>>>,
  renderer: OverlayRenderer,
  status: watch::Sender<LoopStatus>,
  source: Option<MediaSource>,
  in_flight: Option<InFlight>,
  ticker: Interval,
  running: bool,
  generation: u64,
  last_timestamp: Option<Instant>,
  model: ModelVariant,
  threshold: f32,
  display: (u32, u32),
}

impl<C, L, S> Worker<C, L, S>
where
  C: CameraProvider,
  L: ModelLoader,
  S: Surface,
{
  fn new(
    config: LoopConfig,
    camera: C,
    loader: L,
    surface: Arc<Mutex<S>>,
    last_frame: Arc<Mutex<Option<RgbFrame>>>,
    status: watch::Sender<LoopStatus>,
  ) -> Self {
    let mut ticker = time::interval(config.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    Self {
      camera: Arc::new(camera),
      session: DetectorSession::new(loader),
      detector: None,
      surface,
      last_frame,
      renderer: OverlayRenderer::new(config.style.clone()),
      status,
      source: None,
      in_flight: None,
      ticker,
      running: false,
      generation: 0,
      last_timestamp: None,
      model: config.model,
      threshold: config.confidence_threshold,
      display: config.display,
      config,
    }
  }

  fn publish(&self, modify: impl FnOnce(&mut LoopStatus)) {
    self.status.send_modify(modify);
  }

  async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
    info!("检测循环已启动");

    loop {
      tokio::select! {
        biased;

        command = commands.recv() => match command {
          Some(command) => self.handle_command(command).await,
          None => break,
        },
        completed = wait_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
          self.in_flight = None;
          self.finish_cycle(completed);
        }
        _ = self.ticker.tick(), if self.running && self.in_flight.is_none() => {
          self.begin_cycle();
        }
      }
    }

    self.stop();
    info!("检测循环已退出");
  }

  async fn handle_command(&mut self, command: Command) {
    match command {
      Command::StartStop => {
        if self.running {
          self.stop();
        } else {
          self.start().await;
        }
      }
      Command::Start => self.start().await,
      Command::Stop => self.stop(),
      Command::SelectModel(variant) => self.select_model(variant).await,
      Command::SetConfidenceThreshold(threshold) => self.set_threshold(threshold),
      Command::SelectImageFile(bytes) => self.select_image_file(bytes).await,
      Command::ResizeDisplay { width, height } => {
        debug!("显示区域调整为 {}x{}", width, height);
        self.display = (width, height);
      }
      Command::Settle(done) => {
        let _ = done.send(());
      }
    }
  }

  async fn start(&mut self) {
    if self.running {
      debug!("检测已在运行");
      return;
    }

    info!("启动检测");
    self.release_source();
    self.clear_display();
    self.publish(|s| {
      s.phase = Phase::Starting;
      s.last_error = None;
    });

    if let Err(e) = self.acquire().await {
      error!("启动检测失败: {}", e);
      self.release_source();
      self.publish(|s| {
        s.phase = Phase::Idle;
        s.running = false;
        s.loading_model = false;
        s.source = None;
        s.last_error = Some(e.to_string());
      });
      return;
    }

    self.generation += 1;
    self.running = true;
    self.last_timestamp = Some(Instant::now());
    self.ticker.reset();
    self.publish(|s| {
      s.phase = Phase::Running;
      s.running = true;
    });
    info!("检测已开始，模型: {}", self.model);
  }

  /// 打开实时流、等待首帧并准备检测器
  async fn acquire(&mut self) -> Result<(), PipelineError> {
    let camera = Arc::clone(&self.camera);
    let stream = tokio::task::spawn_blocking(move || camera.open()).await??;
    self.source = Some(MediaSource::from(stream));
    self.publish(|s| s.source = Some(SourceKind::Live));

    self.wait_until_ready().await?;
    self.ensure_detector().await?;
    Ok(())
  }

  async fn wait_until_ready(&mut self) -> Result<(), PipelineError> {
    let deadline = Instant::now() + self.config.ready_timeout;
    let mut poll = time::interval(self.config.refresh_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      if let Some(source) = &self.source
        && source.is_ready()
      {
        let (width, height) = source.dimensions();
        debug!("输入源就绪: {}x{}", width, height);
        return Ok(());
      }
      if Instant::now() >= deadline {
        return Err(
          InputError::DeviceUnavailable(format!(
            "{:?} 内未收到首帧",
            self.config.ready_timeout
          ))
          .into(),
        );
      }
      poll.tick().await;
    }
  }

  async fn ensure_detector(&mut self) -> Result<Arc<DetectorHandle<L::Model>>, PipelineError> {
    if let Some(detector) = &self.detector
      && detector.variant() == self.model
    {
      return Ok(Arc::clone(detector));
    }

    self.publish(|s| s.loading_model = true);
    let result = self.session.load(self.model).await;
    self.publish(|s| s.loading_model = false);

    let detector = result?;
    self.detector = Some(Arc::clone(&detector));
    Ok(detector)
  }

  fn stop(&mut self) {
    self.generation += 1;
    if self.in_flight.take().is_some() {
      debug!("丢弃进行中的检测");
    }

    let was_running = self.running;
    self.running = false;
    self.last_timestamp = None;
    self.release_source();
    self.clear_display();

    self.publish(|s| {
      s.phase = Phase::Idle;
      s.running = false;
      s.fps = None;
      s.source = None;
    });

    if was_running {
      info!("检测已停止");
    }
  }

  fn release_source(&mut self) {
    if let Some(mut source) = self.source.take() {
      source.release();
    }
  }

  fn clear_display(&self) {
    let mut surface = lock(&self.surface);
    surface.clear();
    *lock(&self.last_frame) = None;
  }

  fn begin_cycle(&mut self) {
    if let Some(reason) = self.source.as_ref().and_then(MediaSource::failure) {
      error!("实时流中断，停止检测: {}", reason);
      let error = PipelineError::from(InputError::DeviceUnavailable(reason));
      self.publish(|s| s.last_error = Some(error.to_string()));
      self.stop();
      return;
    }

    let (Some(source), Some(detector)) = (&self.source, &self.detector) else {
      return;
    };
    let Some(frame) = source.current_frame() else {
      trace!("当前帧不可用，等待下一节拍");
      return;
    };

    let detector = Arc::clone(detector);
    let input = frame.clone();
    self.in_flight = Some(InFlight {
      generation: self.generation,
      frame,
      future: Box::pin(async move { detector.detect(input).await }),
    });
  }

  fn finish_cycle(&mut self, completed: Completed) {
    let Completed {
      generation,
      frame,
      result,
    } = completed;
    if generation != self.generation || !self.running {
      debug!("丢弃过期的检测结果");
      return;
    }

    let detections = match result {
      Ok(detections) => detections,
      Err(e) => {
        warn!("检测失败，跳过本轮: {}", e);
        return;
      }
    };

    let now = Instant::now();
    let fps = self
      .last_timestamp
      .replace(now)
      .map(|last| now.duration_since(last).as_secs_f64() * 1000.0)
      .filter(|ms| *ms > 0.0)
      .map(|ms| 1000.0 / ms);

    let rendered = self.render(frame, &detections);
    self.publish(|s| {
      if fps.is_some() {
        s.fps = fps;
      }
      if rendered {
        s.cycles += 1;
      }
    });
  }

  /// 按当前输入尺寸和显示区域重新计算几何并绘制
  ///
  /// 绘制完成后在表面锁内记录对应的输入帧。
  fn render(&self, frame: RgbFrame, detections: &[Detection]) -> bool {
    let Some(source) = &self.source else {
      return false;
    };
    let (src_w, src_h) = source.dimensions();
    let (dst_w, dst_h) = self.display;

    let geometry = match compute_geometry(src_w as f32, src_h as f32, dst_w as f32, dst_h as f32) {
      Ok(geometry) => geometry,
      Err(e) => {
        error!("无法计算显示几何，跳过绘制: {}", e);
        return false;
      }
    };

    let mut surface = lock(&self.surface);
    let drawn = self.renderer.render(
      &mut *surface,
      confident(detections, self.threshold),
      &geometry,
      self.display,
    );
    *lock(&self.last_frame) = Some(frame);
    trace!("检测 {} 个，绘制 {} 个", detections.len(), drawn);
    true
  }

  async fn select_model(&mut self, variant: ModelVariant) {
    if variant == self.model {
      debug!("模型未变化: {}", variant);
      return;
    }

    info!("切换模型: {} -> {}", self.model, variant);
    self.model = variant;
    self.detector = None;
    self.session.unload().await;
    self.publish(|s| s.model = variant);

    if self.running {
      self.stop();
      self.start().await;
    }
  }

  fn set_threshold(&mut self, threshold: f32) {
    let Some(clamped) = clamp_threshold(threshold) else {
      warn!("忽略无效的置信度阈值: {}", threshold);
      return;
    };
    if clamped != threshold {
      debug!("置信度阈值 {} 超出范围，调整为 {}", threshold, clamped);
    }
    self.threshold = clamped;
    self.publish(|s| s.confidence_threshold = clamped);
  }

  async fn select_image_file(&mut self, bytes: Vec<u8>) {
    self.stop();
    self.publish(|s| s.last_error = None);

    if let Err(e) = self.show_image(bytes).await {
      error!("静态图片检测失败: {}", e);
      self.publish(|s| s.last_error = Some(e.to_string()));
    }
  }

  async fn show_image(&mut self, bytes: Vec<u8>) -> Result<(), PipelineError> {
    let detector = self.ensure_detector().await?;

    let image = tokio::task::spawn_blocking(move || StaticImage::from_bytes(&bytes)).await??;
    let (width, height) = image.dimensions();
    info!("载入静态图片: {}x{}", width, height);
    let frame = image.frame();
    self.source = Some(MediaSource::from(image));
    self.publish(|s| s.source = Some(SourceKind::Static));

    let detections = detector.detect(frame.clone()).await?;
    if self.render(frame, &detections) {
      self.publish(|s| s.cycles += 1);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fps_text_formats_one_decimal() {
    let mut status = LoopStatus::new(&LoopConfig::default());
    assert_eq!(status.fps_text(), "FPS: --");
    status.fps = Some(1000.0 / 33.0);
    assert_eq!(status.fps_text(), "FPS: 30.3");
  }

  #[test]
  fn threshold_is_clamped() {
    assert_eq!(clamp_threshold(0.05), Some(0.1));
    assert_eq!(clamp_threshold(0.95), Some(0.9));
    assert_eq!(clamp_threshold(0.45), Some(0.45));
    assert_eq!(clamp_threshold(f32::NAN), None);
    assert_eq!(clamp_threshold(f32::INFINITY), None);
  }

  #[test]
  fn default_config_matches_initial_ui() {
    let config = LoopConfig::default();
    assert_eq!(config.model, ModelVariant::LiteMobilenetV2);
    assert_eq!(config.confidence_threshold, 0.3);
    assert_eq!(config.refresh_interval, Duration::from_millis(16));

    let status = LoopStatus::new(&config);
    assert_eq!(status.phase, Phase::Idle);
    assert!(!status.is_running());
    assert!(!status.is_loading_model());
  }
}
