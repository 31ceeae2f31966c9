// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/session.rs - 摄像头会话绑定
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

//! # 摄像头会话绑定
//!
//! 把一台物理摄像头绑定为两个用例面：预览面与分析面。
//! GStreamer 管道形如：
//!
//! ```text
//! v4l2src ! videoconvert ! videoscale ! video/x-raw,format=RGB,... ! tee name=t
//!   t. ! queue leaky=downstream ! videoscale ! ... ! appsink name=analysis-sink max-buffers=1 drop=true
//!   t. ! queue leaky=downstream ! [videoflip] ! appsink name=preview-sink max-buffers=2 drop=true
//! ```
//!
//! 分析面的 `max-buffers=1 drop=true` 加上 [`LatestSlot`] 的容量 1
//! 共同构成"只保留最新帧"的背压策略：分析器落后时丢弃中间帧，
//! 绝不堆积过期帧。
//!
//! 绑定纪律：每次配置变更都先全量解绑、再原子地绑定两个用例面，
//! 重复调用安全；绑定失败被捕获并记录，不会让屏幕崩溃，
//! 也不会留下半绑定的摄像头。[`SessionBinder`] 随 Drop 解绑。
//!
//! ## 系统依赖
//!
//! 需要 GStreamer 开发库：
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## 基本用法
//!
//! ```no_run
//! use mingjing::FromUrl;
//! use mingjing::frame::LatestSlot;
//! use mingjing::provider::camera_provider;
//! use mingjing::session::{GstSessionBackend, SessionBinder, SessionConfig, SessionSurfaces};
//! use std::sync::{Arc, mpsc};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = url::Url::parse("camera://front?rotate=0")?;
//! let config = SessionConfig::from_url(&url)?;
//!
//! let provider = camera_provider().wait()?;
//! let slot = LatestSlot::new();
//! let (preview_tx, preview_rx) = mpsc::sync_channel(2);
//!
//! let mut binder = SessionBinder::new(GstSessionBackend::new(provider));
//! binder.rebind(
//!   &config,
//!   SessionSurfaces {
//!     analysis: Arc::clone(&slot),
//!     preview: preview_tx,
//!   },
//! )?;
//!
//! while let Ok(_frame) = preview_rx.recv() {
//!   // 渲染预览帧
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::time::Instant;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, trace, warn};
use url::Url;

use crate::frame::{Frame, LatestSlot, Rotation};
use crate::provider::{CameraFacing, ProviderHandle};
use crate::{FromUrl, FromUrlWithScheme};

const CAMERA_SCHEME: &str = "camera";
const ANALYSIS_SINK: &str = "analysis-sink";
const PREVIEW_SINK: &str = "preview-sink";

/// 进入 Playing 的等待上限，设备被占用或打不开时在此暴露
const BIND_TIMEOUT_MS: u64 = 3000;

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("摄像头 URL 无效: {0}")]
  InvalidConfig(String),
  #[error("设备选择失败: {0}")]
  Provider(#[from] crate::provider::ProviderError),
  #[error("GStreamer error: {0}")]
  GStreamer(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBool(#[from] gst::glib::BoolError),
  #[error("State change error: {0}")]
  StateChange(#[from] gst::StateChangeError),
  #[error("管道元素缺失: {0}")]
  ElementMissing(&'static str),
  #[error("Pipeline error: {0}")]
  Pipeline(String),
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("不支持的视频格式")]
  UnsupportedFormat,
}

/// 会话配置。预览面与分析面可以使用不同的目标分辨率。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
  pub facing: CameraFacing,
  pub device_override: Option<String>,
  pub preview_size: (u32, u32),
  pub analysis_size: (u32, u32),
  pub fps: u32,
  pub rotation: Rotation,
}

impl SessionConfig {
  fn with_facing(facing: CameraFacing) -> Self {
    SessionConfig {
      facing,
      device_override: None,
      preview_size: (1280, 720),
      analysis_size: (640, 480),
      fps: 30,
      rotation: Rotation::Deg0,
    }
  }

  /// 前置摄像头缺省配置（人脸演示）
  pub fn front() -> Self {
    Self::with_facing(CameraFacing::Front)
  }

  /// 后置摄像头缺省配置（文字演示）
  pub fn back() -> Self {
    Self::with_facing(CameraFacing::Back)
  }
}

impl FromUrl for SessionConfig {
  type Error = SessionError;

  /// 形如 `camera://front?device=/dev/video2&width=1280&height=720&fps=30&rotate=90`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != CAMERA_SCHEME {
      return Err(SessionError::SchemeMismatch);
    }

    let mut config = match url.host_str() {
      Some("front") => SessionConfig::front(),
      Some("back") => SessionConfig::back(),
      other => {
        return Err(SessionError::InvalidConfig(format!(
          "未知的摄像头朝向: {:?}",
          other
        )));
      }
    };

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "device" => config.device_override = Some(value.to_string()),
        "width" => config.preview_size.0 = parse_dim(&key, &value)?,
        "height" => config.preview_size.1 = parse_dim(&key, &value)?,
        "analysis-width" => config.analysis_size.0 = parse_dim(&key, &value)?,
        "analysis-height" => config.analysis_size.1 = parse_dim(&key, &value)?,
        "fps" => config.fps = parse_dim(&key, &value)?,
        "rotate" => {
          let degrees = parse_dim(&key, &value)?;
          config.rotation = Rotation::from_degrees(degrees).ok_or_else(|| {
            SessionError::InvalidConfig(format!("rotate 只支持 90 的倍数: {}", value))
          })?;
        }
        _ => {
          return Err(SessionError::InvalidConfig(format!(
            "未知的查询参数: {}",
            key
          )));
        }
      }
    }

    Ok(config)
  }
}

impl FromUrlWithScheme for SessionConfig {
  const SCHEME: &'static str = CAMERA_SCHEME;
}

fn parse_dim(key: &str, value: &str) -> Result<u32, SessionError> {
  value
    .parse::<u32>()
    .map_err(|_| SessionError::InvalidConfig(format!("参数 {} 不是数字: {}", key, value)))
}

/// 两个用例面的投递端：分析帧进槽位，预览帧进通道
#[derive(Clone)]
pub struct SessionSurfaces {
  pub analysis: Arc<LatestSlot>,
  pub preview: SyncSender<Frame>,
}

/// 已绑定的会话，解绑即终结
pub trait ActiveSession {
  fn shut_down(self: Box<Self>);
}

/// 会话后端：把配置与投递面变成一个活动会话
pub trait SessionBackend {
  fn bind(
    &mut self,
    config: &SessionConfig,
    surfaces: SessionSurfaces,
  ) -> Result<Box<dyn ActiveSession>, SessionError>;
}

/// 会话绑定器。
///
/// 物理摄像头同一时刻只属于一个会话：每次重绑都先全量解绑，
/// 失败被记录且不保留任何绑定；Drop 时解绑，构成屏幕退出的确定性回收。
pub struct SessionBinder {
  backend: Box<dyn SessionBackend>,
  active: Option<Box<dyn ActiveSession>>,
}

impl SessionBinder {
  pub fn new(backend: impl SessionBackend + 'static) -> Self {
    SessionBinder {
      backend: Box::new(backend),
      active: None,
    }
  }

  /// 解绑旧用例后原子地绑定当前配置，可随界面重组反复调用
  pub fn rebind(
    &mut self,
    config: &SessionConfig,
    surfaces: SessionSurfaces,
  ) -> Result<(), SessionError> {
    self.unbind_all();
    match self.backend.bind(config, surfaces) {
      Ok(session) => {
        self.active = Some(session);
        info!("摄像头用例绑定完成");
        Ok(())
      }
      Err(e) => {
        error!("绑定摄像头用例失败: {}", e);
        Err(e)
      }
    }
  }

  pub fn unbind_all(&mut self) {
    if let Some(active) = self.active.take() {
      active.shut_down();
      info!("摄像头用例已解绑");
    }
  }

  pub fn is_bound(&self) -> bool {
    self.active.is_some()
  }
}

impl Drop for SessionBinder {
  fn drop(&mut self) {
    self.unbind_all();
  }
}

/// 基于 GStreamer 的会话后端
pub struct GstSessionBackend {
  provider: ProviderHandle,
}

impl GstSessionBackend {
  pub fn new(provider: ProviderHandle) -> Self {
    GstSessionBackend { provider }
  }
}

impl SessionBackend for GstSessionBackend {
  fn bind(
    &mut self,
    config: &SessionConfig,
    surfaces: SessionSurfaces,
  ) -> Result<Box<dyn ActiveSession>, SessionError> {
    let device = self
      .provider
      .select(config.facing, config.device_override.as_deref())?;
    info!("选定摄像头设备: {} {}", device.path, device.card);
    let session = GstSession::bind(&device.path, config, surfaces)?;
    Ok(Box::new(session))
  }
}

struct GstSession {
  pipeline: gst::Pipeline,
}

impl GstSession {
  fn bind(
    device: &str,
    config: &SessionConfig,
    surfaces: SessionSurfaces,
  ) -> Result<GstSession, SessionError> {
    let description = pipeline_description(device, config);
    info!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| SessionError::Pipeline("Failed to create pipeline".to_string()))?;

    let analysis = appsink_by_name(&pipeline, ANALYSIS_SINK)?;
    let preview = appsink_by_name(&pipeline, PREVIEW_SINK)?;
    install_analysis_callbacks(&analysis, surfaces.analysis, config.rotation);
    install_preview_callbacks(&preview, surfaces.preview);

    pipeline.set_state(gst::State::Playing)?;
    let (result, _, _) = pipeline.state(gst::ClockTime::from_mseconds(BIND_TIMEOUT_MS));
    if let Err(e) = result {
      let _ = pipeline.set_state(gst::State::Null);
      return Err(e.into());
    }

    Ok(GstSession { pipeline })
  }
}

impl ActiveSession for GstSession {
  fn shut_down(self: Box<Self>) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

fn pipeline_description(device: &str, config: &SessionConfig) -> String {
  let (pw, ph) = config.preview_size;
  let (aw, ah) = config.analysis_size;
  let flip = match config.rotation {
    Rotation::Deg0 => String::new(),
    Rotation::Deg90 => " ! videoflip method=clockwise".to_string(),
    Rotation::Deg180 => " ! videoflip method=rotate-180".to_string(),
    Rotation::Deg270 => " ! videoflip method=counterclockwise".to_string(),
  };

  format!(
    "v4l2src device={device} ! videoconvert ! videoscale \
     ! video/x-raw,format=RGB,width={pw},height={ph},framerate={fps}/1 ! tee name=t \
     t. ! queue max-size-buffers=1 leaky=downstream ! videoscale \
     ! video/x-raw,format=RGB,width={aw},height={ah} \
     ! appsink name={analysis} max-buffers=1 drop=true sync=false \
     t. ! queue max-size-buffers=2 leaky=downstream{flip} \
     ! appsink name={preview} max-buffers=2 drop=true sync=false",
    fps = config.fps,
    analysis = ANALYSIS_SINK,
    preview = PREVIEW_SINK,
  )
}

fn appsink_by_name(
  pipeline: &gst::Pipeline,
  name: &'static str,
) -> Result<gst_app::AppSink, SessionError> {
  pipeline
    .by_name(name)
    .ok_or(SessionError::ElementMissing(name))?
    .downcast::<gst_app::AppSink>()
    .map_err(|_| SessionError::ElementMissing(name))
}

/// 分析面回调：相机流线程上把样本包成帧投进槽位。
/// 单帧转换失败只记录，不终止整条流水线。
fn install_analysis_callbacks(appsink: &gst_app::AppSink, slot: Arc<LatestSlot>, rotation: Rotation) {
  let index = AtomicU64::new(0);
  let start = Instant::now();
  appsink.set_callbacks(
    gst_app::AppSinkCallbacks::builder()
      .new_sample(move |sink| {
        let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
        match frame_from_sample(&sample, index.fetch_add(1, Ordering::Relaxed), &start, rotation) {
          Ok(frame) => slot.offer(frame),
          Err(e) => warn!("分析帧转换失败: {}", e),
        }
        Ok(gst::FlowSuccess::Ok)
      })
      .build(),
  );
}

/// 预览面回调：通道已满时直接丢帧，绝不阻塞相机流线程
fn install_preview_callbacks(appsink: &gst_app::AppSink, preview: SyncSender<Frame>) {
  let index = AtomicU64::new(0);
  let start = Instant::now();
  appsink.set_callbacks(
    gst_app::AppSinkCallbacks::builder()
      .new_sample(move |sink| {
        let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
        match frame_from_sample(&sample, index.fetch_add(1, Ordering::Relaxed), &start, Rotation::Deg0)
        {
          Ok(frame) => {
            if preview.try_send(frame).is_err() {
              trace!("预览通道已满，丢弃一帧");
            }
          }
          Err(e) => warn!("预览帧转换失败: {}", e),
        }
        Ok(gst::FlowSuccess::Ok)
      })
      .build(),
  );
}

fn frame_from_sample(
  sample: &gst::Sample,
  index: u64,
  start: &Instant,
  rotation: Rotation,
) -> Result<Frame, SessionError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| SessionError::Pipeline("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| SessionError::Pipeline("No caps in sample".to_string()))?;

  let video_info = gst_video::VideoInfo::from_caps(caps)
    .map_err(|_| SessionError::Pipeline("Failed to get video info from caps".to_string()))?;
  if video_info.format() != gst_video::VideoFormat::Rgb {
    return Err(SessionError::UnsupportedFormat);
  }

  let width = video_info.width();
  let height = video_info.height();

  let map = buffer.map_readable().map_err(|e| {
    SessionError::Pipeline(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  // Validate buffer size
  let expected = (width * height * 3) as usize;
  if data.len() < expected {
    return Err(SessionError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let image = RgbImage::from_raw(width, height, data[..expected].to_vec())
    .ok_or_else(|| SessionError::Pipeline("无法创建 RGB 图像".to_string()))?;

  Ok(Frame {
    image,
    index,
    timestamp_ms: start.elapsed().as_millis() as u64,
    rotation,
  })
}
