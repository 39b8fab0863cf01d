// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 摄像头输入
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

//! # GStreamer 实时输入
//!
//! 摄像头或视频文件经 GStreamer 管道解码为 RGB，appsink 回调持续替换最新帧。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## URL 格式
//!
//! - `gst://camera/dev/video0?width=640&height=480&fps=30&rotate=0`
//! - `gst://file/path/to/video.mp4`

use std::{
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::RgbFrame,
  input::{InputError, LiveStream},
  query_or,
};

const GSTREAMER_INPUT_SCHEME: &str = "gst";
const START_TIMEOUT: Duration = Duration::from_secs(5);

enum PipelineItem {
  FileSource(String),
  CameraSource {
    camera: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  VideoFlip {
    method: u32,
  },
  TargetFormat,
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => {
        format!("filesrc location=\"{}\" ! decodebin", path)
      }
      PipelineItem::CameraSource {
        camera,
        width,
        height,
        fps,
      } => format!(
        "v4l2src device={} ! video/x-raw,width={},height={},framerate={}/1",
        camera, width, height, fps
      ),
      PipelineItem::VideoFlip { method } => format!("videoflip method={}", method),
      PipelineItem::TargetFormat => "videoconvert ! video/x-raw,format=RGB".to_string(),
    }
  }
}

/// GStreamer 实时输入构建器
pub struct GStreamerCameraBuilder {
  items: Vec<PipelineItem>,
}

impl GStreamerCameraBuilder {
  pub fn camera(device: &str, width: u32, height: u32, fps: u32) -> Self {
    Self {
      items: vec![PipelineItem::CameraSource {
        camera: device.to_string(),
        width,
        height,
        fps,
      }],
    }
  }

  pub fn file(path: &str) -> Self {
    Self {
      items: vec![PipelineItem::FileSource(path.to_string())],
    }
  }

  /// 旋转角度：0、90、180、270
  pub fn rotate(mut self, degrees: u32) -> Self {
    let method = match degrees {
      90 => 1,
      180 => 2,
      270 => 3,
      _ => 0,
    };
    if method != 0 {
      self.items.push(PipelineItem::VideoFlip { method });
    }
    self
  }

  fn description(&self) -> String {
    let basic = self
      .items
      .iter()
      .chain(std::iter::once(&PipelineItem::TargetFormat))
      .map(PipelineItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    // 文件源按时间戳播放才与实时流节奏一致
    let sync = self
      .items
      .iter()
      .any(|item| matches!(item, PipelineItem::FileSource(_)));
    format!(
      "{} ! appsink name=sink max-buffers=1 drop=true sync={}",
      basic, sync
    )
  }

  pub fn build(self) -> Result<GStreamerCamera, InputError> {
    gst::init().map_err(|e| InputError::DeviceUnavailable(e.to_string()))?;

    let description = self.description();
    info!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(&description)
      .map_err(|e| InputError::DeviceUnavailable(e.to_string()))?
      .downcast::<gst::Pipeline>()
      .map_err(|_| InputError::DeviceUnavailable("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| InputError::DeviceUnavailable("找不到 appsink".to_string()))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| InputError::DeviceUnavailable("appsink 类型转换失败".to_string()))?;

    let shared = Arc::new(Shared::default());
    let callback_shared = Arc::clone(&shared);
    appsink.set_callbacks(
      gst_app::AppSinkCallbacks::builder()
        .new_sample(move |sink| {
          let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
          match convert_sample(&sample) {
            Ok(image) => callback_shared.publish(image),
            Err(e) => warn!("丢弃无法转换的帧: {}", e),
          }
          Ok(gst::FlowSuccess::Ok)
        })
        .build(),
    );

    let mut camera = GStreamerCamera {
      pipeline,
      shared,
      stopped: false,
    };

    // 启动失败时 camera 析构会把管道置回 Null
    camera.start()?;
    Ok(camera)
  }
}

impl FromUrlWithScheme for GStreamerCameraBuilder {
  const SCHEME: &'static str = GSTREAMER_INPUT_SCHEME;
}

impl FromUrl for GStreamerCameraBuilder {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InputError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = decode_url_path(url);
    let builder = match url.host_str() {
      Some("camera") => Self::camera(
        &path,
        query_or(url, "width", 640),
        query_or(url, "height", 480),
        query_or(url, "fps", 30),
      ),
      Some("file") => Self::file(&path),
      other => {
        error!("未知的 GStreamer 输入类型: {:?}", other);
        return Err(InputError::SchemeMismatch(format!(
          "{}://{}",
          url.scheme(),
          other.unwrap_or_default()
        )));
      }
    };

    Ok(builder.rotate(query_or(url, "rotate", 0)))
  }
}

#[derive(Default)]
struct Shared {
  latest: Mutex<Option<RgbFrame>>,
  count: AtomicU64,
  failure: Mutex<Option<String>>,
}

impl Shared {
  fn publish(&self, image: RgbImage) {
    let index = self.count.fetch_add(1, Ordering::AcqRel);
    let frame = RgbFrame::new(image, index, Duration::ZERO);
    *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
  }
}

/// GStreamer 实时流
pub struct GStreamerCamera {
  pipeline: gst::Pipeline,
  shared: Arc<Shared>,
  stopped: bool,
}

impl GStreamerCamera {
  fn start(&mut self) -> Result<(), InputError> {
    self
      .pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| InputError::DeviceUnavailable(e.to_string()))?;

    let bus = self
      .pipeline
      .bus()
      .ok_or_else(|| InputError::DeviceUnavailable("管道没有消息总线".to_string()))?;

    // 等待管道进入 Playing 或报告错误（例如设备被占用或无权限）
    let deadline = Instant::now() + START_TIMEOUT;
    loop {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        error!("GStreamer 管道启动超时");
        return Err(InputError::DeviceUnavailable("管道启动超时".to_string()));
      }

      let Some(message) = bus.timed_pop_filtered(
        gst::ClockTime::from_nseconds(remaining.as_nanos() as u64),
        &[
          gst::MessageType::Error,
          gst::MessageType::AsyncDone,
          gst::MessageType::StateChanged,
        ],
      ) else {
        continue;
      };

      match message.view() {
        gst::MessageView::AsyncDone(_) => break,
        gst::MessageView::StateChanged(changed)
          if changed.current() == gst::State::Playing
            && message.src() == Some(self.pipeline.upcast_ref::<gst::Object>()) =>
        {
          break;
        }
        gst::MessageView::Error(err) => {
          let message = format!(
            "{} ({})",
            err.error(),
            err.debug().map(|d| d.to_string()).unwrap_or_default()
          );
          error!("GStreamer 管道启动失败: {}", message);
          return Err(classify_error(&err.error(), message));
        }
        _ => {}
      }
    }

    info!("GStreamer 管道已启动");
    Ok(())
  }
}

fn classify_error(error: &gst::glib::Error, message: String) -> InputError {
  match error.kind::<gst::ResourceError>() {
    Some(
      gst::ResourceError::NotAuthorized
      | gst::ResourceError::OpenRead
      | gst::ResourceError::OpenReadWrite,
    ) => InputError::PermissionDenied(message),
    _ => InputError::DeviceUnavailable(message),
  }
}

impl LiveStream for GStreamerCamera {
  fn dimensions(&self) -> (u32, u32) {
    self
      .shared
      .latest
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .map(RgbFrame::dimensions)
      .unwrap_or((0, 0))
  }

  fn current_frame(&self) -> Option<RgbFrame> {
    self
      .shared
      .latest
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn failure(&self) -> Option<String> {
    let mut failure = self
      .shared
      .failure
      .lock()
      .unwrap_or_else(PoisonError::into_inner);

    if failure.is_none()
      && let Some(bus) = self.pipeline.bus()
    {
      while let Some(message) =
        bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])
      {
        match message.view() {
          gst::MessageView::Eos(_) => {
            warn!("GStreamer 输入流已结束");
            *failure = Some("输入流已结束".to_string());
          }
          gst::MessageView::Error(err) => {
            let message = format!(
              "{} ({})",
              err.error(),
              err.debug().map(|d| d.to_string()).unwrap_or_default()
            );
            error!("GStreamer 管道运行错误: {}", message);
            *failure = Some(message);
          }
          _ => continue,
        }
        break;
      }
    }

    failure.clone()
  }

  fn stop(&mut self) {
    if self.stopped {
      return;
    }
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
    self.stopped = true;
    debug!(
      "GStreamer 管道已停止，共接收 {} 帧",
      self.shared.count.load(Ordering::Acquire)
    );
  }
}

impl Drop for GStreamerCamera {
  fn drop(&mut self) {
    self.stop();
  }
}

fn convert_sample(sample: &gst::Sample) -> Result<RgbImage, String> {
  let buffer = sample.buffer().ok_or("No buffer in sample")?;
  let caps = sample.caps().ok_or("No caps in sample")?;
  let info = gst_video::VideoInfo::from_caps(caps).map_err(|e| e.to_string())?;

  if info.format() != gst_video::VideoFormat::Rgb {
    return Err(format!("Unsupported video format: {:?}", info.format()));
  }

  let width = info.width() as usize;
  let height = info.height() as usize;
  let stride = info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| e.to_string())?;
  let data = map.as_slice();

  let row_bytes = width * 3;
  if stride < row_bytes || data.len() < stride * (height.saturating_sub(1)) + row_bytes {
    return Err(format!(
      "Buffer size mismatch: stride {}, {} bytes for {}x{}",
      stride,
      data.len(),
      width,
      height
    ));
  }

  // 去掉行尾填充
  let mut pixels = Vec::with_capacity(row_bytes * height);
  for row in data.chunks(stride).take(height) {
    pixels.extend_from_slice(&row[..row_bytes]);
  }

  RgbImage::from_raw(width as u32, height as u32, pixels)
    .ok_or_else(|| "Failed to build RGB image".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn camera_url_builds_v4l2_pipeline() {
    let url = Url::parse("gst://camera/dev/video2?width=1280&height=720&fps=15&rotate=180").unwrap();
    let builder = GStreamerCameraBuilder::from_url(&url).unwrap();
    assert_eq!(
      builder.description(),
      "v4l2src device=/dev/video2 ! video/x-raw,width=1280,height=720,framerate=15/1 \
       ! videoflip method=2 ! videoconvert ! video/x-raw,format=RGB \
       ! appsink name=sink max-buffers=1 drop=true sync=false"
    );
  }

  #[test]
  fn file_url_plays_at_native_rate() {
    let url = Url::parse("gst://file/videos/street%20scene.mp4").unwrap();
    let builder = GStreamerCameraBuilder::from_url(&url).unwrap();
    assert_eq!(
      builder.description(),
      "filesrc location=\"/videos/street scene.mp4\" ! decodebin \
       ! videoconvert ! video/x-raw,format=RGB \
       ! appsink name=sink max-buffers=1 drop=true sync=true"
    );
  }

  #[test]
  fn unknown_host_is_rejected() {
    let url = Url::parse("gst://rtsp/stream").unwrap();
    assert!(GStreamerCameraBuilder::from_url(&url).is_err());
  }
}
