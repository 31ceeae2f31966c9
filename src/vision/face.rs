// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/vision/face.rs - 人脸检测适配层
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

use tracing::{debug, info};

use crate::vision::{Detector, DetectorHandle, VisionError, VisionImage};

/// 人脸框，直立分析坐标系内的像素值
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
  pub score: f32,
}

/// 一帧的人脸检测结果。`width`/`height` 为直立分析画面的尺寸，
/// 叠加层据此把框缩放到预览面上。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceResult {
  pub boxes: Vec<FaceBox>,
  pub width: u32,
  pub height: u32,
}

/// 人脸检测器的独立配置对象
#[derive(Debug, Clone)]
pub struct FaceDetectorOptions {
  /// SeetaFace 模型文件路径
  pub model_path: PathBuf,
  /// 最小人脸边长（像素）
  pub min_face_size: u32,
  /// 置信度阈值
  pub score_threshold: f64,
  /// 图像金字塔缩放系数
  pub pyramid_scale_factor: f32,
  /// 滑窗步长
  pub slide_window_step: (u32, u32),
}

impl FaceDetectorOptions {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    FaceDetectorOptions {
      model_path: model_path.into(),
      min_face_size: 20,
      score_threshold: 2.0,
      pyramid_scale_factor: 0.8,
      slide_window_step: (4, 4),
    }
  }
}

/// rustface 检测器适配。只在所属工作线程内创建和调用。
pub struct FaceDetector {
  detector: Box<dyn rustface::Detector>,
}

impl FaceDetector {
  pub fn create(options: &FaceDetectorOptions) -> Result<Self, VisionError> {
    if !options.model_path.exists() {
      return Err(VisionError::ModelLoad(format!(
        "人脸模型不存在: {}（SeetaFace 发布件 seeta_fd_frontal_v1.0.bin）",
        options.model_path.display()
      )));
    }

    info!("加载人脸模型: {}", options.model_path.display());
    let mut detector = rustface::create_detector(options.model_path.to_string_lossy().as_ref())
      .map_err(|e| VisionError::ModelLoad(format!("{:?}", e)))?;
    detector.set_min_face_size(options.min_face_size);
    detector.set_score_thresh(options.score_threshold);
    detector.set_pyramid_scale_factor(options.pyramid_scale_factor);
    detector.set_slide_window_step(options.slide_window_step.0, options.slide_window_step.1);
    info!("人脸模型加载完成");

    Ok(FaceDetector { detector })
  }

  /// 在独立工作线程上创建异步句柄
  pub fn spawn(options: FaceDetectorOptions) -> Result<DetectorHandle<FaceResult>, VisionError> {
    DetectorHandle::spawn("face-detector", move || {
      Ok(Box::new(FaceDetector::create(&options)?) as _)
    })
  }
}

impl Detector for FaceDetector {
  type Output = FaceResult;

  fn detect(&mut self, image: &VisionImage) -> Result<FaceResult, VisionError> {
    let upright = image.upright();
    let gray = image::imageops::grayscale(&upright);
    let (width, height) = gray.dimensions();

    let mut data = rustface::ImageData::new(gray.as_raw(), width, height);
    let faces = self.detector.detect(&mut data);
    debug!("检测到 {} 张人脸", faces.len());

    Ok(FaceResult {
      boxes: faces
        .iter()
        .map(|face| {
          let bbox = face.bbox();
          FaceBox {
            x: bbox.x() as f32,
            y: bbox.y() as f32,
            width: bbox.width() as f32,
            height: bbox.height() as f32,
            score: face.score() as f32,
          }
        })
        .collect(),
      width,
      height,
    })
  }
}
