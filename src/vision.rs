// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/vision.rs - 视觉库异步外观
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

//! # 视觉库异步外观
//!
//! 把同步的检测器封装成"提交一帧、回调一次"的异步接口：
//!
//! - [`VisionImage`] 携带像素与旋转元数据，检测前统一转正；
//! - [`Detector`] 是具体视觉库的适配点（人脸用 `rustface`，
//!   文字用 `ocrs` + `rten`），在各自的工作线程内创建与运行；
//! - [`DetectorHandle::process`] 提交一帧后立即返回，
//!   终止回调在工作线程上恰好触发一次（成功或失败，二者其一）。
//!
//! 每个检测器实例独占一个工作线程与一份配置对象，互不共享。

use std::sync::mpsc;
use std::thread;

use image::RgbImage;
use thiserror::Error;
use tracing::warn;

use crate::frame::{Frame, Rotation};

#[cfg(feature = "face_detection")]
pub mod face;
#[cfg(feature = "text_recognition")]
pub mod text;

#[derive(Error, Debug)]
pub enum VisionError {
  #[error("模型加载错误: {0}")]
  ModelLoad(String),
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("检测工作线程不可用")]
  WorkerGone,
}

/// 视觉库的输入图像：像素缓冲 + 顺时针旋转元数据
#[derive(Debug, Clone)]
pub struct VisionImage {
  image: RgbImage,
  rotation: Rotation,
}

impl VisionImage {
  pub fn new(image: RgbImage, rotation: Rotation) -> Self {
    VisionImage { image, rotation }
  }

  /// 从分析帧包装，像素被复制一份，不影响租约的释放时机
  pub fn from_frame(frame: &Frame) -> Self {
    VisionImage {
      image: frame.image.clone(),
      rotation: frame.rotation,
    }
  }

  pub fn rotation(&self) -> Rotation {
    self.rotation
  }

  /// 转正后的直立图像，检测始终在直立画面上进行
  pub fn upright(&self) -> RgbImage {
    upright_image(&self.image, self.rotation)
  }

  /// 转正后的尺寸
  pub fn upright_dimensions(&self) -> (u32, u32) {
    let (w, h) = self.image.dimensions();
    match self.rotation {
      Rotation::Deg90 | Rotation::Deg270 => (h, w),
      _ => (w, h),
    }
  }
}

/// 按顺时针角度转正图像
pub fn upright_image(image: &RgbImage, rotation: Rotation) -> RgbImage {
  match rotation {
    Rotation::Deg0 => image.clone(),
    Rotation::Deg90 => image::imageops::rotate90(image),
    Rotation::Deg180 => image::imageops::rotate180(image),
    Rotation::Deg270 => image::imageops::rotate270(image),
  }
}

/// 检测器本体。实现方是具体视觉库的适配层，
/// 始终在所属工作线程内被创建和调用，无需跨线程。
pub trait Detector {
  type Output: Send + 'static;

  fn detect(&mut self, image: &VisionImage) -> Result<Self::Output, VisionError>;
}

type Terminal<O> = Box<dyn FnOnce(Result<O, VisionError>) + Send>;

struct Job<O> {
  image: VisionImage,
  terminal: Terminal<O>,
}

/// 异步检测句柄，对应视觉库的一个检测器实例
pub struct DetectorHandle<O> {
  tx: Option<mpsc::Sender<Job<O>>>,
  worker: Option<thread::JoinHandle<()>>,
}

impl<O: Send + 'static> DetectorHandle<O> {
  /// 启动工作线程并在其上构建检测器。
  /// 构建失败时线程随之结束，错误返回给调用方。
  pub fn spawn<B>(name: &str, build: B) -> Result<Self, VisionError>
  where
    B: FnOnce() -> Result<Box<dyn Detector<Output = O>>, VisionError> + Send + 'static,
  {
    let (tx, rx) = mpsc::channel::<Job<O>>();
    let (ready_tx, ready_rx) = mpsc::channel();

    let worker = thread::Builder::new()
      .name(name.to_string())
      .spawn(move || {
        let mut detector = match build() {
          Ok(detector) => {
            let _ = ready_tx.send(Ok(()));
            detector
          }
          Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
          }
        };
        while let Ok(job) = rx.recv() {
          (job.terminal)(detector.detect(&job.image));
        }
      })
      .map_err(|e| VisionError::Inference(format!("无法创建工作线程: {}", e)))?;

    match ready_rx.recv() {
      Ok(Ok(())) => Ok(DetectorHandle {
        tx: Some(tx),
        worker: Some(worker),
      }),
      Ok(Err(e)) => {
        let _ = worker.join();
        Err(e)
      }
      Err(_) => {
        let _ = worker.join();
        Err(VisionError::WorkerGone)
      }
    }
  }

  /// 提交一帧。终止回调恰好触发一次，成功与失败互斥、二者其一；
  /// 正常路径在工作线程上触发，工作线程已退出时就地以失败触发。
  pub fn process<F>(&self, image: VisionImage, terminal: F)
  where
    F: FnOnce(Result<O, VisionError>) + Send + 'static,
  {
    if let Some(tx) = &self.tx {
      if let Err(rejected) = tx.send(Job {
        image,
        terminal: Box::new(terminal),
      }) {
        warn!("检测工作线程已退出，该帧按失败处理");
        (rejected.0.terminal)(Err(VisionError::WorkerGone));
      }
    }
  }
}

impl<O> Drop for DetectorHandle<O> {
  fn drop(&mut self) {
    // 关闭通道；在途任务跑完、其结果被丢弃后线程退出
    self.tx.take();
    if let Some(worker) = self.worker.take() {
      if worker.join().is_err() {
        warn!("检测工作线程异常退出");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;
  use std::sync::mpsc;
  use std::time::Duration;

  struct EchoDetector;

  impl Detector for EchoDetector {
    type Output = (u32, u32);

    fn detect(&mut self, image: &VisionImage) -> Result<(u32, u32), VisionError> {
      Ok(image.upright_dimensions())
    }
  }

  #[test]
  fn upright_rotates_clockwise() {
    let mut image = RgbImage::new(2, 1);
    image.put_pixel(0, 0, Rgb([255, 0, 0]));
    image.put_pixel(1, 0, Rgb([0, 0, 255]));

    let upright = upright_image(&image, Rotation::Deg90);
    assert_eq!(upright.dimensions(), (1, 2));
    assert_eq!(upright.get_pixel(0, 0), &Rgb([255, 0, 0]));
    assert_eq!(upright.get_pixel(0, 1), &Rgb([0, 0, 255]));

    let same = upright_image(&image, Rotation::Deg0);
    assert_eq!(same.dimensions(), (2, 1));
  }

  #[test]
  fn upright_dimensions_swap_on_quarter_turns() {
    let image = VisionImage::new(RgbImage::new(4, 3), Rotation::Deg270);
    assert_eq!(image.upright_dimensions(), (3, 4));
    let image = VisionImage::new(RgbImage::new(4, 3), Rotation::Deg180);
    assert_eq!(image.upright_dimensions(), (4, 3));
  }

  #[test]
  fn process_invokes_terminal_exactly_once() {
    let handle =
      DetectorHandle::spawn("test-echo", || Ok(Box::new(EchoDetector) as _)).unwrap();
    let (tx, rx) = mpsc::channel();

    handle.process(VisionImage::new(RgbImage::new(8, 4), Rotation::Deg90), {
      let tx = tx.clone();
      move |result| tx.send(result).unwrap()
    });

    let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result.unwrap(), (4, 8));
    assert!(
      rx.recv_timeout(Duration::from_millis(100)).is_err(),
      "终止回调只应触发一次"
    );
  }

  #[test]
  fn spawn_surfaces_build_failure() {
    let result: Result<DetectorHandle<()>, _> = DetectorHandle::spawn("test-broken", || {
      Err(VisionError::ModelLoad("缺少模型".to_string()))
    });
    assert!(matches!(result, Err(VisionError::ModelLoad(_))));
  }

  struct PanicDetector;

  impl Detector for PanicDetector {
    type Output = ();

    fn detect(&mut self, _image: &VisionImage) -> Result<(), VisionError> {
      panic!("模拟检测器崩溃");
    }
  }

  #[test]
  fn dead_worker_fails_terminal_in_place() {
    let handle = DetectorHandle::spawn("test-panic", || Ok(Box::new(PanicDetector) as _)).unwrap();
    let (tx, rx) = mpsc::channel();

    // 第一帧令工作线程崩溃
    handle.process(VisionImage::new(RgbImage::new(2, 2), Rotation::Deg0), |_| {});

    // 工作线程退出后，后续提交就地以 WorkerGone 失败，而不是静默丢弃回调
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
      let tx = tx.clone();
      handle.process(
        VisionImage::new(RgbImage::new(2, 2), Rotation::Deg0),
        move |result| {
          let _ = tx.send(result);
        },
      );
      match rx.try_recv() {
        Ok(Err(VisionError::WorkerGone)) => break,
        Ok(other) => panic!("不应有其他结果: {:?}", other),
        Err(_) => {}
      }
      assert!(
        std::time::Instant::now() < deadline,
        "等待 WorkerGone 超时"
      );
      thread::sleep(Duration::from_millis(5));
    }
  }
}
