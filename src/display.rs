// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/display.rs - 预览输出端
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

use chrono::Utc;
use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

#[cfg(feature = "face_detection")]
use crate::vision::face::FaceResult;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum DisplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("显示 URL 无效: {0}")]
  InvalidConfig(String),
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
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  Json(#[from] serde_json::Error),
}

/// 随合成画面送往输出端的检测注记
pub enum SceneReport<'a> {
  None,
  #[cfg(feature = "face_detection")]
  Faces(&'a FaceResult),
  Text(&'a str),
}

impl SceneReport<'_> {
  pub fn to_json(&self) -> serde_json::Value {
    match self {
      SceneReport::None => serde_json::json!({}),
      #[cfg(feature = "face_detection")]
      SceneReport::Faces(result) => serde_json::json!({
        "analysis_size": [result.width, result.height],
        "faces": result
          .boxes
          .iter()
          .map(|face| {
            serde_json::json!({
              "x": face.x,
              "y": face.y,
              "width": face.width,
              "height": face.height,
              "score": face.score,
            })
          })
          .collect::<Vec<_>>(),
      }),
      SceneReport::Text(text) => serde_json::json!({ "text": text }),
    }
  }
}

/// 预览输出端：逐帧接收合成画面与注记
pub trait PreviewSink {
  fn render(&mut self, image: &RgbImage, report: &SceneReport) -> Result<(), DisplayError>;
  fn finish(&mut self) -> Result<(), DisplayError>;
}

const DISPLAY_SCHEME: &str = "display";
const RECORD_SCHEME: &str = "record";

/// 实时窗口输出：appsrc ! videoconvert ! autovideosink
pub struct GstDisplaySink {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  dimensions: Option<(u32, u32)>,
}

impl GstDisplaySink {
  pub fn open() -> Result<Self, DisplayError> {
    gst::init()?;

    let description =
      "appsrc name=src is-live=true format=time do-timestamp=true ! videoconvert ! autovideosink sync=false";
    info!("GStreamer pipeline description: {}", description);
    let pipeline = gst::parse::launch(description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| DisplayError::Pipeline("Failed to create pipeline".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(DisplayError::ElementMissing("src"))?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| DisplayError::ElementMissing("src"))?;

    pipeline.set_state(gst::State::Playing)?;
    Ok(GstDisplaySink {
      pipeline,
      appsrc,
      dimensions: None,
    })
  }

  fn ensure_caps(&mut self, width: u32, height: u32) -> Result<(), DisplayError> {
    if self.dimensions != Some((width, height)) {
      let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, width, height)
        .fps(gst::Fraction::new(30, 1))
        .build()
        .map_err(|_| DisplayError::Pipeline("无效的视频描述".to_string()))?;
      self.appsrc.set_caps(Some(&info.to_caps()?));
      self.dimensions = Some((width, height));
    }
    Ok(())
  }
}

impl PreviewSink for GstDisplaySink {
  fn render(&mut self, image: &RgbImage, _report: &SceneReport) -> Result<(), DisplayError> {
    self.ensure_caps(image.width(), image.height())?;
    let buffer = gst::Buffer::from_mut_slice(image.as_raw().clone());
    self
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| DisplayError::Pipeline(format!("push buffer: {:?}", e)))?;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), DisplayError> {
    let _ = self.appsrc.end_of_stream();
    self.pipeline.set_state(gst::State::Null)?;
    Ok(())
  }
}

impl Drop for GstDisplaySink {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl FromUrl for GstDisplaySink {
  type Error = DisplayError;

  /// `display://auto`，host 暂只支持 auto
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != DISPLAY_SCHEME {
      return Err(DisplayError::SchemeMismatch);
    }
    match url.host_str() {
      None | Some("auto") => GstDisplaySink::open(),
      Some(other) => Err(DisplayError::InvalidConfig(format!(
        "未知的显示目标: {}",
        other
      ))),
    }
  }
}

impl FromUrlWithScheme for GstDisplaySink {
  const SCHEME: &'static str = DISPLAY_SCHEME;
}

/// 目录记录输出：逐帧落盘 PNG 画面与 JSON 注记
pub struct DirectoryRecordSink {
  dir: PathBuf,
  written: u64,
}

impl DirectoryRecordSink {
  pub fn new(dir: impl Into<PathBuf>) -> Result<Self, DisplayError> {
    let dir = dir.into();
    std::fs::create_dir_all(&dir)?;
    Ok(DirectoryRecordSink { dir, written: 0 })
  }
}

impl PreviewSink for DirectoryRecordSink {
  fn render(&mut self, image: &RgbImage, report: &SceneReport) -> Result<(), DisplayError> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    let base = format!("frame-{:06}-{}", self.written, stamp);

    image.save(self.dir.join(format!("{base}.png")))?;
    std::fs::write(
      self.dir.join(format!("{base}.json")),
      serde_json::to_string_pretty(&report.to_json())?,
    )?;

    self.written += 1;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), DisplayError> {
    info!("共记录 {} 帧到 {}", self.written, self.dir.display());
    Ok(())
  }
}

impl FromUrl for DirectoryRecordSink {
  type Error = DisplayError;

  /// `record:///path/to/dir`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != RECORD_SCHEME {
      return Err(DisplayError::SchemeMismatch);
    }
    if url.path().is_empty() || url.path() == "/" {
      return Err(DisplayError::InvalidConfig(
        "record:// 需要目录路径".to_string(),
      ));
    }
    DirectoryRecordSink::new(url.path())
  }
}

impl FromUrlWithScheme for DirectoryRecordSink {
  const SCHEME: &'static str = RECORD_SCHEME;
}

pub enum DisplayWrapper {
  Display(GstDisplaySink),
  Record(DirectoryRecordSink),
}

impl FromUrl for DisplayWrapper {
  type Error = DisplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() == GstDisplaySink::SCHEME {
      return Ok(DisplayWrapper::Display(GstDisplaySink::from_url(url)?));
    }
    if url.scheme() == DirectoryRecordSink::SCHEME {
      return Ok(DisplayWrapper::Record(DirectoryRecordSink::from_url(url)?));
    }
    Err(DisplayError::SchemeMismatch)
  }
}

impl PreviewSink for DisplayWrapper {
  fn render(&mut self, image: &RgbImage, report: &SceneReport) -> Result<(), DisplayError> {
    match self {
      DisplayWrapper::Display(sink) => sink.render(image, report),
      DisplayWrapper::Record(sink) => sink.render(image, report),
    }
  }

  fn finish(&mut self) -> Result<(), DisplayError> {
    match self {
      DisplayWrapper::Display(sink) => sink.finish(),
      DisplayWrapper::Record(sink) => sink.finish(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[cfg(feature = "face_detection")]
  use crate::vision::face::FaceBox;

  #[test]
  fn record_sink_writes_frame_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = DirectoryRecordSink::new(dir.path()).unwrap();

    let image = RgbImage::new(4, 4);
    sink.render(&image, &SceneReport::Text("HELLO")).unwrap();
    sink.render(&image, &SceneReport::None).unwrap();
    sink.finish().unwrap();

    let mut entries: Vec<_> = std::fs::read_dir(dir.path())
      .unwrap()
      .map(|entry| entry.unwrap().file_name().into_string().unwrap())
      .collect();
    entries.sort();
    assert_eq!(entries.len(), 4, "两帧各应有 PNG 与 JSON");
    assert!(entries[0].starts_with("frame-000000") && entries[0].ends_with(".json"));

    let sidecar: serde_json::Value = serde_json::from_str(
      &std::fs::read_to_string(dir.path().join(&entries[0])).unwrap(),
    )
    .unwrap();
    assert_eq!(sidecar["text"], "HELLO");
  }

  #[cfg(feature = "face_detection")]
  #[test]
  fn face_report_serializes_boxes() {
    let result = FaceResult {
      boxes: vec![FaceBox {
        x: 1.0,
        y: 2.0,
        width: 3.0,
        height: 4.0,
        score: 9.5,
      }],
      width: 640,
      height: 480,
    };
    let value = SceneReport::Faces(&result).to_json();
    assert_eq!(value["analysis_size"][0], 640);
    assert_eq!(value["faces"][0]["width"], 3.0);
    assert_eq!(value["faces"].as_array().unwrap().len(), 1);
  }

  #[test]
  fn wrapper_rejects_unknown_scheme() {
    let url = Url::parse("rtsp://host/stream").unwrap();
    assert!(matches!(
      DisplayWrapper::from_url(&url),
      Err(DisplayError::SchemeMismatch)
    ));
  }

  #[test]
  fn record_url_requires_path() {
    let url = Url::parse("record:///").unwrap();
    assert!(matches!(
      DirectoryRecordSink::from_url(&url),
      Err(DisplayError::InvalidConfig(_))
    ));
  }
}
