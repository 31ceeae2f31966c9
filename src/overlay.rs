// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/overlay.rs - 预览叠加绘制
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

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use thiserror::Error;

#[cfg(feature = "face_detection")]
use crate::vision::face::FaceResult;

#[derive(Error, Debug)]
pub enum OverlayError {
  #[error("未找到可用字体，尝试过: {0}")]
  FontMissing(String),
  #[error("字体文件无效: {0}")]
  FontInvalid(String),
}

// 叠加样式常量
const BOX_COLOR: Rgb<u8> = Rgb([3, 218, 197]);
const BANNER_HEIGHT: u32 = 56;
const BANNER_FONT_SIZE: f32 = 28.0;
const BANNER_PADDING: i32 = 16;

const FONT_PATHS: [&str; 4] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/local/share/fonts/DejaVuSans.ttf",
];

/// 人脸框叠加：把分析坐标系里的框缩放到预览面并描边
#[cfg(feature = "face_detection")]
pub struct BoxOverlay {
  color: Rgb<u8>,
}

#[cfg(feature = "face_detection")]
impl Default for BoxOverlay {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(feature = "face_detection")]
impl BoxOverlay {
  pub fn new() -> Self {
    BoxOverlay { color: BOX_COLOR }
  }

  pub fn draw(&self, image: &mut RgbImage, result: &FaceResult) {
    if result.width == 0 || result.height == 0 {
      return;
    }
    let scale_x = image.width() as f32 / result.width as f32;
    let scale_y = image.height() as f32 / result.height as f32;

    for face in &result.boxes {
      let x = (face.x * scale_x).max(0.0) as i32;
      let y = (face.y * scale_y).max(0.0) as i32;
      let width = (face.width * scale_x).min(image.width() as f32 - x as f32) as u32;
      let height = (face.height * scale_y).min(image.height() as f32 - y as f32) as u32;

      if width > 0 && height > 0 {
        let rect = Rect::at(x, y).of_size(width, height);
        draw_hollow_rect_mut(image, rect, self.color);

        // 内圈再描一道，增强可见度
        if x > 0 && y > 0 && width > 2 && height > 2 {
          let inner = Rect::at(x + 1, y + 1).of_size(width - 2, height - 2);
          draw_hollow_rect_mut(image, inner, self.color);
        }
      }
    }
  }
}

/// 文字横幅：白底黑字贴在画面底部，文本为空时只清出空横幅
pub struct TextBanner {
  font: FontVec,
  scale: PxScale,
  height: u32,
}

impl TextBanner {
  pub fn new(font: FontVec) -> Self {
    TextBanner {
      font,
      scale: PxScale::from(BANNER_FONT_SIZE),
      height: BANNER_HEIGHT,
    }
  }

  /// 从系统字体目录加载缺省字体
  pub fn with_system_font() -> Result<Self, OverlayError> {
    Ok(Self::new(load_system_font()?))
  }

  pub fn draw(&self, image: &mut RgbImage, text: &str) {
    let Some(top) = fill_banner(image, self.height) else {
      return;
    };

    if text.is_empty() {
      return;
    }
    // 横幅单行呈现，识别结果里的换行折叠成空格
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    draw_text_mut(
      image,
      Rgb([0u8, 0u8, 0u8]),
      BANNER_PADDING,
      top + (self.height as i32 - BANNER_FONT_SIZE as i32) / 2,
      self.scale,
      &self.font,
      &line,
    );
  }
}

/// 在画面底部清出白色横幅，返回横幅上沿的 y 坐标
fn fill_banner(image: &mut RgbImage, height: u32) -> Option<i32> {
  if image.width() == 0 || image.height() == 0 {
    return None;
  }
  let height = height.min(image.height());
  let top = (image.height() - height) as i32;
  draw_filled_rect_mut(
    image,
    Rect::at(0, top).of_size(image.width(), height),
    Rgb([255u8, 255u8, 255u8]),
  );
  Some(top)
}

/// 依次尝试 MINGJING_FONT 环境变量与常见系统路径
pub fn load_system_font() -> Result<FontVec, OverlayError> {
  let mut candidates: Vec<String> = Vec::new();
  if let Ok(path) = std::env::var("MINGJING_FONT") {
    candidates.push(path);
  }
  candidates.extend(FONT_PATHS.iter().map(|path| path.to_string()));

  for path in &candidates {
    if std::path::Path::new(path).exists() {
      let bytes = std::fs::read(path).map_err(|e| OverlayError::FontInvalid(e.to_string()))?;
      return FontVec::try_from_vec(bytes)
        .map_err(|_| OverlayError::FontInvalid(path.to_string()));
    }
  }
  Err(OverlayError::FontMissing(candidates.join(", ")))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[cfg(feature = "face_detection")]
  use crate::vision::face::FaceBox;

  #[cfg(feature = "face_detection")]
  fn face(x: f32, y: f32, width: f32, height: f32) -> FaceBox {
    FaceBox {
      x,
      y,
      width,
      height,
      score: 5.0,
    }
  }

  #[cfg(feature = "face_detection")]
  #[test]
  fn draws_two_boxes_scaled_to_preview() {
    // 分析面 4x4，预览面 8x8：坐标放大一倍
    let mut image = RgbImage::new(8, 8);
    let result = FaceResult {
      boxes: vec![face(0.0, 0.0, 2.0, 2.0), face(2.0, 2.0, 2.0, 2.0)],
      width: 4,
      height: 4,
    };

    BoxOverlay::new().draw(&mut image, &result);

    // 第一个框 (0,0)-(4,4)，第二个框 (4,4)-(8,8)
    assert_eq!(image.get_pixel(0, 0), &BOX_COLOR);
    assert_eq!(image.get_pixel(3, 0), &BOX_COLOR);
    assert_eq!(image.get_pixel(4, 4), &BOX_COLOR);
    assert_eq!(image.get_pixel(7, 7), &BOX_COLOR);
    // 框与框之外的区域不受影响
    assert_eq!(image.get_pixel(6, 1), &Rgb([0, 0, 0]));
  }

  #[cfg(feature = "face_detection")]
  #[test]
  fn empty_result_draws_nothing() {
    let mut image = RgbImage::new(8, 8);
    BoxOverlay::new().draw(&mut image, &FaceResult::default());
    assert!(image.pixels().all(|pixel| pixel == &Rgb([0, 0, 0])));
  }

  #[cfg(feature = "face_detection")]
  #[test]
  fn boxes_are_clamped_to_preview_bounds() {
    let mut image = RgbImage::new(8, 8);
    let result = FaceResult {
      boxes: vec![face(3.0, 3.0, 4.0, 4.0)],
      width: 4,
      height: 4,
    };
    // 不越界、不 panic
    BoxOverlay::new().draw(&mut image, &result);
    assert_eq!(image.get_pixel(6, 7), &BOX_COLOR);
  }

  #[test]
  fn banner_clears_bottom_strip() {
    let mut image = RgbImage::new(100, 80);
    let top = fill_banner(&mut image, BANNER_HEIGHT).unwrap();
    assert_eq!(top, 24);
    assert_eq!(image.get_pixel(0, 24), &Rgb([255, 255, 255]));
    assert_eq!(image.get_pixel(99, 79), &Rgb([255, 255, 255]));
    assert_eq!(image.get_pixel(0, 23), &Rgb([0, 0, 0]));
  }

  #[test]
  fn banner_renders_text_when_font_available() {
    // 测试机上没有系统字体时跳过
    let Ok(banner) = TextBanner::with_system_font() else {
      return;
    };

    let mut image = RgbImage::new(200, 100);
    banner.draw(&mut image, "HELLO");
    let banner_has_ink = image
      .enumerate_pixels()
      .any(|(_, y, pixel)| y >= 44 && pixel != &Rgb([255, 255, 255]) && pixel != &Rgb([0, 0, 0]))
      || image
        .enumerate_pixels()
        .any(|(_, y, pixel)| y >= 44 && pixel == &Rgb([0, 0, 0]));
    assert!(banner_has_ink, "横幅里应有文字笔画");

    // 空文本清空横幅
    banner.draw(&mut image, "");
    for y in 44..100 {
      assert_eq!(image.get_pixel(10, y), &Rgb([255, 255, 255]));
    }
  }
}
