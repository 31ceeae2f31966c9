// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/vision/text.rs - 文字识别适配层
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

use std::path::{Path, PathBuf};

use ocrs::{OcrEngine, OcrEngineParams};
use rten::Model;
use tracing::{debug, info};

use crate::vision::{Detector, DetectorHandle, VisionError, VisionImage};

const DETECTION_MODEL: &str = "text-detection.rten";
const RECOGNITION_MODEL: &str = "text-recognition.rten";

/// 文字识别器的独立配置对象
#[derive(Debug, Clone, Default)]
pub struct TextReaderOptions {
  /// 模型目录，缺省为 `~/.cache/ocrs`
  pub model_dir: Option<PathBuf>,
}

/// ocrs 识别引擎适配。只在所属工作线程内创建和调用。
pub struct TextReader {
  engine: OcrEngine,
}

impl TextReader {
  pub fn create(options: &TextReaderOptions) -> Result<Self, VisionError> {
    let model_dir = match &options.model_dir {
      Some(dir) => dir.clone(),
      None => default_model_dir()?,
    };
    let detection_path = model_dir.join(DETECTION_MODEL);
    let recognition_path = model_dir.join(RECOGNITION_MODEL);

    if !detection_path.exists() || !recognition_path.exists() {
      return Err(VisionError::ModelLoad(format!(
        "未找到 OCR 模型，可用 ocrs-cli 下载或手动放置。期望路径:\n  - {}\n  - {}",
        detection_path.display(),
        recognition_path.display()
      )));
    }

    info!("加载 OCR 模型: {}", model_dir.display());
    let detection_model = load_model(&detection_path)?;
    let recognition_model = load_model(&recognition_path)?;

    let engine = OcrEngine::new(OcrEngineParams {
      detection_model: Some(detection_model),
      recognition_model: Some(recognition_model),
      ..Default::default()
    })
    .map_err(|e| VisionError::ModelLoad(e.to_string()))?;
    info!("OCR 模型加载完成");

    Ok(TextReader { engine })
  }

  /// 在独立工作线程上创建异步句柄
  pub fn spawn(options: TextReaderOptions) -> Result<DetectorHandle<String>, VisionError> {
    DetectorHandle::spawn("text-reader", move || {
      Ok(Box::new(TextReader::create(&options)?) as _)
    })
  }
}

fn load_model(path: &Path) -> Result<Model, VisionError> {
  Model::load_file(path).map_err(|e| VisionError::ModelLoad(e.to_string()))
}

fn default_model_dir() -> Result<PathBuf, VisionError> {
  let home = std::env::var("HOME")
    .or_else(|_| std::env::var("USERPROFILE"))
    .map_err(|_| VisionError::ModelLoad("无法定位用户目录（HOME 未设置）".to_string()))?;
  Ok(Path::new(&home).join(".cache/ocrs"))
}

impl Detector for TextReader {
  type Output = String;

  fn detect(&mut self, image: &VisionImage) -> Result<String, VisionError> {
    let upright = image.upright();
    let source = ocrs::ImageSource::from_bytes(upright.as_raw(), upright.dimensions())
      .map_err(|e| VisionError::Inference(e.to_string()))?;
    let input = self
      .engine
      .prepare_input(source)
      .map_err(|e| VisionError::Inference(e.to_string()))?;
    let text = self
      .engine
      .get_text(&input)
      .map_err(|e| VisionError::Inference(e.to_string()))?;

    let text = text.trim().to_string();
    debug!("识别文本 {} 字符", text.chars().count());
    // 画面里没有文字时返回空串，让上一帧的旧值被清掉
    Ok(text)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_models_report_expected_paths() {
    let dir = tempfile::tempdir().unwrap();
    let err = TextReader::create(&TextReaderOptions {
      model_dir: Some(dir.path().to_path_buf()),
    })
    .map(|_| ())
    .expect_err("空目录应报缺模型");

    match err {
      VisionError::ModelLoad(message) => {
        assert!(message.contains(DETECTION_MODEL));
        assert!(message.contains(RECOGNITION_MODEL));
      }
      other => panic!("错误类型不符: {other}"),
    }
  }
}
