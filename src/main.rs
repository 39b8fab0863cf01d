// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/main.rs - 命令行程序
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

use std::{path::PathBuf, sync::PoisonError};

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use qianliyan::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  input::{StaticImage, UrlCamera},
  model::{ModelVariant, SsdLoader},
  output::{RasterSurface, SaveImageFileOutput},
  task::{DetectionLoop, DetectionLoopHandle, LoopConfig},
};

/// Qianliyan 实时目标检测叠加
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型目录，例如 ssd:///opt/models
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 模型型号（lite_mobilenet_v2 或 mobilenet_v1）
  #[arg(long, value_name = "VARIANT", default_value_t = ModelVariant::LiteMobilenetV2)]
  pub variant: ModelVariant,
  /// 输入来源：pattern://、gst://camera/...、gst://file/... 或 image:///path
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径：image:///path
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 置信度阈值 (0.1 - 0.9)
  #[arg(long, value_name = "THRESHOLD", default_value_t = 0.3)]
  pub confidence: f32,
  /// 显示区域尺寸
  #[arg(long, value_name = "WxH", default_value = "640x480", value_parser = parse_display)]
  pub display: (u32, u32),
  /// 实时输入下完成指定次数检测后退出，0 表示直到中断
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: u64,
  /// 标签字体文件（TTF/OTF）
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
}

fn parse_display(value: &str) -> Result<(u32, u32), String> {
  let (width, height) = value
    .split_once(['x', 'X'])
    .ok_or_else(|| format!("显示尺寸格式应为 WxH: {}", value))?;
  let width = width.trim().parse::<u32>().map_err(|e| e.to_string())?;
  let height = height.trim().parse::<u32>().map_err(|e| e.to_string())?;
  if width == 0 || height == 0 {
    return Err(format!("显示尺寸必须大于零: {}", value));
  }
  Ok((width, height))
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型目录: {}", args.model);
  info!("模型型号: {}", args.variant);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let loader = SsdLoader::from_url(&args.model)?;
  let output = SaveImageFileOutput::from_url(&args.output)?;

  let (width, height) = args.display;
  let mut surface = RasterSurface::new(width, height);
  if let Some(font) = &args.font {
    surface = surface.with_font_file(font)?;
  }

  let config = LoopConfig {
    model: args.variant,
    confidence_threshold: args.confidence,
    display: args.display,
    ..LoopConfig::default()
  };
  let handle = DetectionLoop::new(config, UrlCamera(args.input.clone()), loader, surface).spawn();

  if args.input.scheme() == StaticImage::SCHEME {
    run_static(&handle, &args.input, &output).await?;
  } else {
    run_live(&handle, args.frame_number, &output).await?;
  }

  handle.shutdown().await?;
  info!("任务完成，退出");
  Ok(())
}

async fn run_static(
  handle: &DetectionLoopHandle<RasterSurface>,
  input: &Url,
  output: &SaveImageFileOutput,
) -> Result<()> {
  let path = decode_url_path(input);
  let bytes = tokio::task::spawn_blocking(move || std::fs::read(path)).await??;

  handle.select_image_file(bytes)?;
  handle.settled().await?;

  let status = handle.status();
  if let Some(error) = status.last_error {
    bail!("静态图片检测失败: {}", error);
  }

  if !save_snapshot(handle, output)? {
    bail!("静态图片未能绘制");
  }
  Ok(())
}

/// 保存当前画面与叠加层，没有已绘制的画面时返回 `false`
fn save_snapshot(
  handle: &DetectionLoopHandle<RasterSurface>,
  output: &SaveImageFileOutput,
) -> Result<bool> {
  let surface = handle.surface();
  let surface = surface.lock().unwrap_or_else(PoisonError::into_inner);
  let Some(frame) = handle.last_frame() else {
    return Ok(false);
  };
  output.save(&frame, &surface)?;
  Ok(true)
}

async fn run_live(
  handle: &DetectionLoopHandle<RasterSurface>,
  frame_number: u64,
  output: &SaveImageFileOutput,
) -> Result<()> {
  let (tx, mut interrupt) = mpsc::unbounded_channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
  })
  .map_err(|e| anyhow!("无法设置中断处理: {}", e))?;

  handle.start()?;
  handle.settled().await?;

  let mut status = handle.subscribe();
  let initial = status.borrow_and_update().clone();
  if !initial.is_running() {
    bail!(
      "启动检测失败: {}",
      initial.last_error.unwrap_or_else(|| "未知错误".to_string())
    );
  }

  let mut cycles = initial.cycles;
  loop {
    tokio::select! {
      _ = interrupt.recv() => {
        warn!("中断信号接收，退出检测循环");
        break;
      }
      changed = status.changed() => {
        if changed.is_err() {
          break;
        }
        let current = status.borrow_and_update().clone();
        if !current.is_running() {
          warn!("检测循环已停止");
          break;
        }
        if current.cycles != cycles {
          cycles = current.cycles;
          info!("第 {} 次检测完成，{}", cycles, current.fps_text());
          if frame_number > 0 && cycles >= frame_number {
            info!("达到指定检测次数 {}, 退出检测循环", frame_number);
            break;
          }
        }
      }
    }
  }

  if !save_snapshot(handle, output)? {
    warn!("尚未绘制任何画面，不保存输出");
  }
  handle.stop()?;
  handle.settled().await?;
  Ok(())
}
