// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/provider.rs - 摄像头子系统句柄的一次性获取
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

use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
  #[error("摄像头子系统初始化失败: {0}")]
  Init(String),
  #[error("未发现可用摄像头设备")]
  NoDevice,
}

/// 物理摄像头朝向，由调用方指定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
  Front,
  Back,
}

#[derive(Debug, Clone)]
pub struct CameraDevice {
  /// 设备节点路径
  pub path: String,
  /// 设备名（V4L2 card 字段）
  pub card: String,
}

/// 已就绪的摄像头子系统句柄，可廉价克隆
#[derive(Clone)]
pub struct ProviderHandle {
  devices: Arc<Vec<CameraDevice>>,
}

const FRONT_HINTS: [&str; 3] = ["front", "user", "integrated"];
const BACK_HINTS: [&str; 3] = ["back", "rear", "world"];

impl ProviderHandle {
  pub fn devices(&self) -> &[CameraDevice] {
    &self.devices
  }

  /// 按朝向选择设备。显式指定的设备路径优先；
  /// 名称不含朝向线索时回退到第一个枚举设备。
  pub fn select(
    &self,
    facing: CameraFacing,
    device_override: Option<&str>,
  ) -> Result<CameraDevice, ProviderError> {
    if let Some(path) = device_override {
      return Ok(CameraDevice {
        path: path.to_string(),
        card: String::new(),
      });
    }

    let hints = match facing {
      CameraFacing::Front => &FRONT_HINTS,
      CameraFacing::Back => &BACK_HINTS,
    };
    let matched = self.devices.iter().find(|device| {
      let card = device.card.to_lowercase();
      hints.iter().any(|hint| card.contains(hint))
    });

    matched
      .or_else(|| self.devices.first())
      .cloned()
      .ok_or(ProviderError::NoDevice)
  }
}

type Fetch<T> = Box<dyn FnOnce() -> Result<T, ProviderError> + Send>;
type Continuation<T> = Box<dyn FnOnce(Result<T, ProviderError>) + Send>;

enum AcquireState<T> {
  /// 尚无人请求，持有获取动作
  Idle(Option<Fetch<T>>),
  /// 获取进行中，登记等待回调
  Pending(Vec<Continuation<T>>),
  /// 结果已缓存
  Ready(Result<T, ProviderError>),
}

/// 只解析一次的共享获取。
///
/// 第一次请求触发后台获取，结果被缓存；
/// 之后的等待与回调直接命中缓存，绝不重复获取。
pub struct SharedAcquisition<T> {
  inner: Arc<AcquireInner<T>>,
}

struct AcquireInner<T> {
  state: Mutex<AcquireState<T>>,
  ready: Condvar,
}

impl<T> Clone for SharedAcquisition<T> {
  fn clone(&self) -> Self {
    SharedAcquisition {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Clone + Send + 'static> SharedAcquisition<T> {
  pub fn new<F>(fetch: F) -> Self
  where
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
  {
    SharedAcquisition {
      inner: Arc::new(AcquireInner {
        state: Mutex::new(AcquireState::Idle(Some(Box::new(fetch)))),
        ready: Condvar::new(),
      }),
    }
  }

  fn ensure_started(&self, state: &mut AcquireState<T>) {
    if let AcquireState::Idle(fetch) = state {
      let fetch = fetch.take().expect("获取动作只会被取走一次");
      *state = AcquireState::Pending(Vec::new());

      let inner = Arc::clone(&self.inner);
      thread::Builder::new()
        .name("camera-provider".to_string())
        .spawn(move || {
          debug!("开始获取摄像头子系统句柄");
          let result = fetch();
          let continuations = {
            let mut state = inner.state.lock().expect("获取状态锁中毒");
            let pending = std::mem::replace(&mut *state, AcquireState::Ready(result.clone()));
            match pending {
              AcquireState::Pending(continuations) => continuations,
              _ => Vec::new(),
            }
          };
          inner.ready.notify_all();
          for continuation in continuations {
            continuation(result.clone());
          }
        })
        .expect("无法创建获取线程");
    }
  }

  /// 阻塞等待结果。可从任意多个线程调用，均得到同一份缓存结果。
  pub fn wait(&self) -> Result<T, ProviderError> {
    let mut state = self.inner.state.lock().expect("获取状态锁中毒");
    self.ensure_started(&mut state);
    loop {
      if let AcquireState::Ready(result) = &*state {
        return result.clone();
      }
      state = self.inner.ready.wait(state).expect("获取状态锁中毒");
    }
  }

  /// 结果就绪时回调。已就绪则原地调用，否则登记等待，绝不重复触发获取。
  pub fn on_ready<F>(&self, continuation: F)
  where
    F: FnOnce(Result<T, ProviderError>) + Send + 'static,
  {
    let mut state = self.inner.state.lock().expect("获取状态锁中毒");
    self.ensure_started(&mut state);
    match &mut *state {
      AcquireState::Ready(result) => {
        let result = result.clone();
        drop(state);
        continuation(result);
      }
      AcquireState::Pending(continuations) => continuations.push(Box::new(continuation)),
      AcquireState::Idle(_) => unreachable!("ensure_started 之后不再是 Idle"),
    }
  }
}

/// 进程级摄像头子系统获取入口，结果由平台缓存
pub fn camera_provider() -> SharedAcquisition<ProviderHandle> {
  static CELL: OnceLock<SharedAcquisition<ProviderHandle>> = OnceLock::new();
  CELL
    .get_or_init(|| SharedAcquisition::new(acquire_subsystem))
    .clone()
}

fn acquire_subsystem() -> Result<ProviderHandle, ProviderError> {
  info!("初始化摄像头子系统");
  gstreamer::init().map_err(|e| ProviderError::Init(e.to_string()))?;

  let mut devices = Vec::new();
  for node in v4l::context::enum_devices() {
    let path = node.path().to_string_lossy().to_string();
    let card = match v4l::Device::with_path(&path).and_then(|device| device.query_caps()) {
      Ok(caps) => {
        if !caps
          .capabilities
          .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
          debug!("跳过非捕获节点 {}", path);
          continue;
        }
        caps.card
      }
      Err(e) => {
        debug!("查询设备 {} 能力失败: {}", path, e);
        String::new()
      }
    };
    devices.push(CameraDevice { path, card });
  }
  devices.sort_by(|a, b| a.path.cmp(&b.path));

  if devices.is_empty() {
    return Err(ProviderError::NoDevice);
  }
  info!("发现 {} 个摄像头设备", devices.len());
  Ok(ProviderHandle {
    devices: Arc::new(devices),
  })
}
