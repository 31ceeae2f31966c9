// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/bin/text_reader.rs - 文字识别演示程序
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

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use mingjing::FromUrl;
use mingjing::analyzer::{AnalysisLoop, DetectorAnalyzer};
use mingjing::display::{DisplayWrapper, PreviewSink, SceneReport};
use mingjing::frame::LatestSlot;
use mingjing::overlay::TextBanner;
use mingjing::permission::{DeviceAccess, PermissionGate};
use mingjing::provider::camera_provider;
use mingjing::session::{GstSessionBackend, SessionBinder, SessionConfig, SessionSurfaces};
use mingjing::state::state_cell;
use mingjing::vision::text::{TextReader, TextReaderOptions};

/// Mingjing 文字识别演示参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 摄像头配置，如 camera://back?rotate=0&device=/dev/video0
  #[arg(long, value_name = "CAMERA", default_value = "camera://back")]
  pub camera: Url,

  /// 输出端，如 display://auto 或 record:///tmp/text
  #[arg(long, value_name = "OUTPUT", default_value = "display://auto")]
  pub output: Url,

  /// OCR 模型目录（缺省为 ~/.cache/ocrs）
  #[arg(long, value_name = "DIR")]
  pub ocr_models: Option<PathBuf>,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("摄像头配置: {}", args.camera);
  info!("输出路径: {}", args.output);

  let config = SessionConfig::from_url(&args.camera)?;

  let mut gate = PermissionGate::new(
    DeviceAccess::new(config.device_override.clone()),
    "文字识别演示需要访问摄像头，才能从预览画面里读出文本。",
  );
  gate.run_console().context("摄像头权限不可用")?;

  let provider = camera_provider().wait()?;

  let (text_writer, text_reader) = state_cell(String::new());
  let detector = TextReader::spawn(TextReaderOptions {
    model_dir: args.ocr_models.clone(),
  })?;
  let analyzer = DetectorAnalyzer::new(detector, text_writer);

  let slot = LatestSlot::new();
  let (preview_tx, preview_rx) = mpsc::sync_channel(2);
  let analysis = AnalysisLoop::spawn(Arc::clone(&slot), analyzer);

  let mut binder = SessionBinder::new(GstSessionBackend::new(provider));
  binder
    .rebind(
      &config,
      SessionSurfaces {
        analysis: Arc::clone(&slot),
        preview: preview_tx,
      },
    )
    .context("无法绑定摄像头用例")?;

  let mut sink = DisplayWrapper::from_url(&args.output)?;
  let banner = TextBanner::with_system_font().context("无法加载横幅字体")?;

  let running = Arc::new(AtomicBool::new(true));
  {
    let running = Arc::clone(&running);
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      running.store(false, Ordering::SeqCst);
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
    .expect("Error setting Ctrl-C handler");
  }

  info!("开始预览...");
  let mut rendered = 0usize;
  let mut seen = 0u64;
  let mut latest = String::new();
  while running.load(Ordering::SeqCst) {
    let frame = match preview_rx.recv_timeout(Duration::from_millis(100)) {
      Ok(frame) => frame,
      Err(mpsc::RecvTimeoutError::Timeout) => continue,
      Err(mpsc::RecvTimeoutError::Disconnected) => {
        warn!("预览流已断开");
        break;
      }
    };

    // 没有识别出文字的帧把横幅清空，而不是停留在旧文本上
    if let Some(text) = text_reader.get_if_newer(&mut seen) {
      latest = text;
    }

    let mut image = frame.image;
    banner.draw(&mut image, &latest);
    sink.render(&image, &SceneReport::Text(&latest))?;

    rendered += 1;
    if args.frame_number.map(|n| rendered >= n).unwrap_or(false) {
      info!("达到指定帧数 {}, 退出预览循环", rendered);
      break;
    }
  }

  binder.unbind_all();
  slot.close();
  analysis.join();
  sink.finish()?;

  info!("任务完成，退出");
  Ok(())
}
