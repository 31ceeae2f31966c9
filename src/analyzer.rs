// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/analyzer.rs - 帧分析适配器与分析循环
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

use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::frame::{FrameLease, LatestSlot};
use crate::state::StateWriter;
use crate::vision::{DetectorHandle, VisionImage};

/// 分析器状态机：IDLE → ANALYZING → (成功|失败) → IDLE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalyzerPhase {
  #[default]
  Idle,
  Analyzing,
}

/// 可观察的状态机位置
pub struct PhaseCell {
  inner: Arc<Mutex<AnalyzerPhase>>,
}

impl Clone for PhaseCell {
  fn clone(&self) -> Self {
    PhaseCell {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl PhaseCell {
  fn new() -> Self {
    PhaseCell {
      inner: Arc::new(Mutex::new(AnalyzerPhase::Idle)),
    }
  }

  pub fn get(&self) -> AnalyzerPhase {
    *self.inner.lock().expect("状态机锁中毒")
  }

  fn begin(&self) {
    let mut phase = self.inner.lock().expect("状态机锁中毒");
    debug_assert_eq!(
      *phase,
      AnalyzerPhase::Idle,
      "同一分析器实例不允许并发分析"
    );
    *phase = AnalyzerPhase::Analyzing;
  }

  fn finish(&self) {
    *self.inner.lock().expect("状态机锁中毒") = AnalyzerPhase::Idle;
  }
}

/// 帧分析器。相机栈每送达一帧调用一次；
/// 上一帧的租约释放前不会有下一次调用。
pub trait Analyzer: Send {
  fn analyze(&mut self, lease: FrameLease);
}

/// 通用检测适配器：包装帧与旋转元数据 → 提交异步检测器 →
/// 成功结果写入状态单元 → 无论成败都释放租约（恰好一次）。
///
/// 人脸与文字两个变体只差检测器实例与状态单元的类型。
pub struct DetectorAnalyzer<O: Send + 'static> {
  detector: DetectorHandle<O>,
  writer: StateWriter<O>,
  phase: PhaseCell,
}

impl<O: Clone + Send + 'static> DetectorAnalyzer<O> {
  pub fn new(detector: DetectorHandle<O>, writer: StateWriter<O>) -> Self {
    DetectorAnalyzer {
      detector,
      writer,
      phase: PhaseCell::new(),
    }
  }

  pub fn phase(&self) -> PhaseCell {
    self.phase.clone()
  }
}

impl<O: Clone + Send + 'static> Analyzer for DetectorAnalyzer<O> {
  fn analyze(&mut self, lease: FrameLease) {
    let image = VisionImage::from_frame(lease.frame());
    let index = lease.frame().index;
    self.phase.begin();

    let writer = self.writer.clone();
    let phase = self.phase.clone();
    self.detector.process(image, move |outcome| {
      match outcome {
        Ok(result) => writer.set(result),
        // 该周期没有结果，不向用户呈现错误，下一帧即是新的尝试
        Err(e) => debug!("第 {} 帧检测失败: {}", index, e),
      }
      phase.finish();
      lease.release();
    });
  }
}

/// 分析循环：从槽位串行取帧、交给分析器，槽位关闭后退出
pub struct AnalysisLoop {
  worker: Option<thread::JoinHandle<()>>,
}

impl AnalysisLoop {
  pub fn spawn<A: Analyzer + 'static>(slot: Arc<LatestSlot>, mut analyzer: A) -> Self {
    let worker = thread::Builder::new()
      .name("analysis".to_string())
      .spawn(move || {
        while let Some(lease) = slot.next_lease() {
          analyzer.analyze(lease);
        }
        debug!("分析循环退出");
      })
      .expect("无法创建分析线程");

    AnalysisLoop {
      worker: Some(worker),
    }
  }

  pub fn join(mut self) {
    self.join_inner();
  }

  fn join_inner(&mut self) {
    if let Some(worker) = self.worker.take() {
      if worker.join().is_err() {
        warn!("分析线程异常退出");
      }
    }
  }
}

impl Drop for AnalysisLoop {
  fn drop(&mut self) {
    self.join_inner();
  }
}
