//! 截屏与未读信号检测
//!
//! - Region: 屏幕区域, TOML 中写作 [x, y, w, h]
//! - Snapshotter: 截屏契约, 由调用方注入 (真实实现依赖平台截屏 API)
//! - unread_score: 红色角标像素占比启发式

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};

// =====================================================================
// 区域
// =====================================================================

/// 屏幕矩形区域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(i32, i32, u32, u32)", into = "(i32, i32, u32, u32)")]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

impl From<(i32, i32, u32, u32)> for Region {
    fn from((x, y, w, h): (i32, i32, u32, u32)) -> Self {
        Self { x, y, w, h }
    }
}

impl From<Region> for (i32, i32, u32, u32) {
    fn from(r: Region) -> Self {
        (r.x, r.y, r.w, r.h)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}x{}", self.x, self.y, self.w, self.h)
    }
}

// =====================================================================
// 截屏契约
// =====================================================================

/// 截屏协作方: 截取指定屏幕区域, 返回 RGB 帧
pub trait Snapshotter: Send + Sync {
    fn capture(&self, region: Region) -> Result<RgbImage>;
}

// =====================================================================
// 未读信号
// =====================================================================

/// 未读角标像素判定: R>180 且 G<80 且 B<80
fn is_indicator_red(r: u8, g: u8, b: u8) -> bool {
    r > 180 && g < 80 && b < 80
}

/// 红色角标像素占比, 取值 [0, 1]
///
/// 空帧返回 0 (分母至少为 1, 不会除零)。
pub fn unread_score(frame: &RgbImage) -> f32 {
    let total = frame.width() as u64 * frame.height() as u64;
    let red = frame
        .pixels()
        .filter(|p| {
            let [r, g, b] = p.0;
            is_indicator_red(r, g, b)
        })
        .count() as u64;
    red as f32 / total.max(1) as f32
}
