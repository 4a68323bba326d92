//! 感知哈希与画面变化检测
//!
//! - frame_hash: 8x8 梯度哈希 (64 bit), 对轻微渲染噪声不敏感
//! - RegionHashCache: 每个区域保存一个基线哈希, 汉明距离超阈值才算变化
//!
//! 基线只在确认变化时才更新: 缓慢漂移会相对同一基线累积,
//! 最终越过阈值, 不会被逐帧小改动"蚕食"掉。

use image::RgbImage;
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use std::collections::HashMap;
use tracing::debug;

use crate::capture::Region;

/// 区域基线数量上限, 超过则清理时整体清空
pub const REGION_CACHE_LIMIT: usize = 50;

/// 区域缓存键: 店铺 + 原始矩形
pub fn region_key(shop_id: &str, region: Region) -> String {
    format!("{shop_id}:{region}")
}

/// 计算帧的感知哈希
///
/// 空帧退化为 1x1 黑帧, 避免缩放空图。
pub fn frame_hash(frame: &RgbImage) -> ImageHash {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(8, 8)
        .to_hasher();
    if frame.width() == 0 || frame.height() == 0 {
        return hasher.hash_image(&RgbImage::new(1, 1));
    }
    hasher.hash_image(frame)
}

// =====================================================================
// 区域哈希缓存
// =====================================================================

#[derive(Default)]
pub struct RegionHashCache {
    hashes: HashMap<String, ImageHash>,
}

impl RegionHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 判断区域画面是否变化
    ///
    /// - 首次见到该区域: 记录基线, 返回 true
    /// - 与基线距离 > 阈值: 更新基线, 返回 true
    /// - 否则返回 false, 基线保持不动
    pub fn has_changed(&mut self, key: &str, hash: &ImageHash, threshold: u32) -> bool {
        match self.hashes.get(key) {
            None => {
                self.hashes.insert(key.to_string(), hash.clone());
                true
            }
            Some(prev) => {
                let dist = prev.dist(hash);
                if dist > threshold {
                    debug!("📸 画面变化 [{key}]: 距离 {dist} > 阈值 {threshold}");
                    self.hashes.insert(key.to_string(), hash.clone());
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn clear(&mut self) {
        self.hashes.clear();
    }
}
