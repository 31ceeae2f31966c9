// 该文件是 Mingjing （明镜止水） 项目的一部分。
// tests/analysis_flow.rs - 采集-分析-呈现链路的集成测试
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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;

use mingjing::analyzer::{AnalysisLoop, DetectorAnalyzer};
use mingjing::frame::{Frame, LatestSlot, Rotation};
use mingjing::permission::{AccessProbe, CameraAccess, GateView, PermissionGate};
use mingjing::session::{
  ActiveSession, SessionBackend, SessionBinder, SessionConfig, SessionError, SessionSurfaces,
};
use mingjing::state::state_cell;
use mingjing::vision::{Detector, DetectorHandle, VisionError, VisionImage};

fn frame_with_width(index: u64) -> Frame {
  Frame {
    image: RgbImage::new(index as u32, 1),
    index,
    timestamp_ms: index * 33,
    rotation: Rotation::Deg0,
  }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if check() {
      return true;
    }
    thread::sleep(Duration::from_millis(5));
  }
  check()
}

/// 慢速检测器：回报直立画面宽度，借宽度区分帧
struct SlowEcho {
  delay: Duration,
  processed: Arc<Mutex<Vec<u32>>>,
}

impl Detector for SlowEcho {
  type Output = u32;

  fn detect(&mut self, image: &VisionImage) -> Result<u32, VisionError> {
    thread::sleep(self.delay);
    let width = image.upright_dimensions().0;
    self.processed.lock().unwrap().push(width);
    Ok(width)
  }
}

#[test]
fn sustained_delivery_processes_only_latest_frames() {
  let slot = LatestSlot::new();
  let (writer, reader) = state_cell(0u32);
  let processed = Arc::new(Mutex::new(Vec::new()));

  let handle = {
    let processed = Arc::clone(&processed);
    DetectorHandle::spawn("slow-echo", move || {
      Ok(Box::new(SlowEcho {
        delay: Duration::from_millis(25),
        processed,
      }) as _)
    })
    .unwrap()
  };
  let run = AnalysisLoop::spawn(Arc::clone(&slot), DetectorAnalyzer::new(handle, writer));

  // 投递远快于检测：每 3ms 一帧，检测一帧要 25ms
  let total = 40u64;
  for index in 1..=total {
    slot.offer(frame_with_width(index));
    thread::sleep(Duration::from_millis(3));
  }

  assert!(
    wait_until(Duration::from_secs(5), || reader.get() == total as u32),
    "最后一帧最终必须被处理"
  );
  slot.close();
  run.join();

  let processed = processed.lock().unwrap();
  assert!(slot.dropped() > 0, "检测落后时必须有丢帧");
  assert_eq!(slot.offered(), total);
  // 每帧要么被处理、要么被顶替丢弃，二者互斥且无遗漏
  assert_eq!(processed.len() as u64 + slot.dropped(), total);
  // 送达顺序与采集顺序一致，只跳帧、不乱序、不重复
  assert!(
    processed.windows(2).all(|pair| pair[0] < pair[1]),
    "处理序列应严格递增: {:?}",
    *processed
  );
  assert_eq!(*processed.last().unwrap(), total as u32);
}

/// 按脚本逐帧给出识别文本的检测器
struct ScriptedText {
  script: Arc<Mutex<VecDeque<Result<String, VisionError>>>>,
}

impl Detector for ScriptedText {
  type Output = String;

  fn detect(&mut self, _image: &VisionImage) -> Result<String, VisionError> {
    self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or(Ok(String::new()))
  }
}

#[test]
fn recognized_text_replaces_previous_value() {
  let slot = LatestSlot::new();
  let (writer, reader) = state_cell(String::new());
  let script = Arc::new(Mutex::new(VecDeque::from(vec![
    Ok("HELLO".to_string()),
    Ok(String::new()),
  ])));

  let handle = {
    let script = Arc::clone(&script);
    DetectorHandle::spawn("scripted-text", move || {
      Ok(Box::new(ScriptedText { script }) as _)
    })
    .unwrap()
  };
  let run = AnalysisLoop::spawn(Arc::clone(&slot), DetectorAnalyzer::new(handle, writer));

  slot.offer(frame_with_width(1));
  assert!(wait_until(Duration::from_secs(2), || reader.version() == 1));
  assert_eq!(reader.get(), "HELLO");

  // 没有文字的帧把状态清成空串，而不是停留在 HELLO
  slot.offer(frame_with_width(2));
  assert!(wait_until(Duration::from_secs(2), || reader.version() == 2));
  assert_eq!(reader.get(), "");

  slot.close();
  run.join();
}

/// 以固定节奏向两个用例面推帧的假摄像头
struct FakeCamera;

struct FakeFeed {
  stop: Arc<AtomicBool>,
  worker: Option<thread::JoinHandle<()>>,
}

impl SessionBackend for FakeCamera {
  fn bind(
    &mut self,
    _config: &SessionConfig,
    surfaces: SessionSurfaces,
  ) -> Result<Box<dyn ActiveSession>, SessionError> {
    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
      let stop = Arc::clone(&stop);
      thread::spawn(move || {
        let mut index = 1;
        while !stop.load(Ordering::SeqCst) {
          surfaces.analysis.offer(frame_with_width(index));
          let _ = surfaces.preview.try_send(frame_with_width(index));
          index += 1;
          thread::sleep(Duration::from_millis(5));
        }
      })
    };
    Ok(Box::new(FakeFeed {
      stop,
      worker: Some(worker),
    }))
  }
}

impl ActiveSession for FakeFeed {
  fn shut_down(mut self: Box<Self>) {
    self.stop.store(true, Ordering::SeqCst);
    if let Some(worker) = self.worker.take() {
      let _ = worker.join();
    }
  }
}

struct GrantingAccess {
  granted: bool,
}

impl CameraAccess for GrantingAccess {
  fn probe(&self) -> AccessProbe {
    if self.granted {
      AccessProbe::Granted
    } else {
      AccessProbe::Denied
    }
  }

  fn request(&mut self) -> AccessProbe {
    self.granted = true;
    AccessProbe::Granted
  }
}

#[test]
fn grant_then_bind_shows_preview_immediately() {
  // 未授权 → 呈现说明 → 授权 → 下一次呈现即为内容
  let mut gate = PermissionGate::new(GrantingAccess { granted: false }, "需要摄像头权限");
  assert!(matches!(gate.view(), GateView::Rationale(_)));
  assert_eq!(gate.request(), GateView::Content);

  // 授权通过后绑定会话，预览帧应随即到达
  let slot = LatestSlot::new();
  let (preview_tx, preview_rx) = std::sync::mpsc::sync_channel(2);
  let mut binder = SessionBinder::new(FakeCamera);
  binder
    .rebind(
      &SessionConfig::front(),
      SessionSurfaces {
        analysis: Arc::clone(&slot),
        preview: preview_tx,
      },
    )
    .unwrap();

  let frame = preview_rx
    .recv_timeout(Duration::from_secs(1))
    .expect("授权后预览帧应马上出现");
  assert!(frame.image.width() >= 1);

  binder.unbind_all();
  slot.close();
}
