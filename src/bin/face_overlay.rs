// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/bin/face_overlay.rs - 人脸叠加演示程序
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
use mingjing::overlay::BoxOverlay;
use mingjing::permission::{DeviceAccess, PermissionGate};
use mingjing::provider::camera_provider;
use mingjing::session::{GstSessionBackend, SessionBinder, SessionConfig, SessionSurfaces};
use mingjing::state::state_cell;
use mingjing::vision::face::{FaceDetector, FaceDetectorOptions, FaceResult};

/// Mingjing 人脸叠加演示参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 摄像头配置，如 camera://front?rotate=0&device=/dev/video0
  #[arg(long, value_name = "CAMERA", default_value = "camera://front")]
  pub camera: Url,

  /// 输出端，如 display://auto 或 record:///tmp/faces
  #[arg(long, value_name = "OUTPUT", default_value = "display://auto")]
  pub output: Url,

  /// SeetaFace 人脸模型文件路径
  #[arg(long, value_name = "MODEL")]
  pub face_model: PathBuf,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("摄像头配置: {}", args.camera);
  info!("输出路径: {}", args.output);
  info!("人脸模型: {}", args.face_model.display());

  let config = SessionConfig::from_url(&args.camera)?;

  // 权限门：已授权才进入相机流程
  let mut gate = PermissionGate::new(
    DeviceAccess::new(config.device_override.clone()),
    "人脸演示需要访问摄像头，才能在预览画面上叠加人脸框。",
  );
  gate.run_console().context("摄像头权限不可用")?;

  // 摄像头子系统：一次性异步获取，结果由进程缓存
  let provider = camera_provider().wait()?;

  // 检测器 → 分析适配器 → 状态单元
  let (faces_writer, faces_reader) = state_cell(FaceResult::default());
  let detector = FaceDetector::spawn(FaceDetectorOptions::new(&args.face_model))?;
  let analyzer = DetectorAnalyzer::new(detector, faces_writer);

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
  let overlay = BoxOverlay::new();

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
  let mut latest = FaceResult::default();
  while running.load(Ordering::SeqCst) {
    let frame = match preview_rx.recv_timeout(Duration::from_millis(100)) {
      Ok(frame) => frame,
      Err(mpsc::RecvTimeoutError::Timeout) => continue,
      Err(mpsc::RecvTimeoutError::Disconnected) => {
        warn!("预览流已断开");
        break;
      }
    };

    if let Some(result) = faces_reader.get_if_newer(&mut seen) {
      latest = result;
    }

    let mut image = frame.image;
    overlay.draw(&mut image, &latest);
    sink.render(&image, &SceneReport::Faces(&latest))?;

    rendered += 1;
    if args.frame_number.map(|n| rendered >= n).unwrap_or(false) {
      info!("达到指定帧数 {}, 退出预览循环", rendered);
      break;
    }
  }

  // 退出顺序：解绑用例 → 关闭槽位 → 等分析循环收尾 → 结束输出
  binder.unbind_all();
  slot.close();
  analysis.join();
  sink.finish()?;

  info!("任务完成，退出");
  Ok(())
}
