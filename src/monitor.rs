//! 千牛消息检测核心
//!
//! 依赖 Snapshotter + OcrBackend (注入契约), 提供:
//! - poll: 单店单轮检测, 未读信号 → 画面变化 → OCR → 去重, 逐级短路
//! - run_housekeeping: 各缓存定期清理
//!
//! 检测链路刻意从便宜到昂贵排序: 大多数轮次在未读评分处就结束,
//! 感知哈希把 OCR 次数压到画面真正变化的轮次。

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

use crate::capture::{unread_score, Snapshotter};
use crate::config::ShopPollConfig;
use crate::dedup::MessageDeduplicator;
use crate::ocr::{OcrBackend, TextExtractor};
use crate::phash::{frame_hash, region_key, RegionHashCache, REGION_CACHE_LIMIT};

/// 单店单轮检测结果
#[derive(Debug, Clone)]
pub struct PollOutcome {
    /// 未读信号评分 [0, 1]
    pub score: f32,
    /// 新消息文本, 各级短路时为空
    pub text: String,
}

impl PollOutcome {
    fn quiet(score: f32) -> Self {
        Self {
            score,
            text: String::new(),
        }
    }
}

/// 一次清理的效果
#[derive(Debug, Clone, Default)]
pub struct HousekeepingReport {
    /// 清除的过期 OCR 缓存条数
    pub ocr_expired: usize,
    /// 去重集合是否到期整体清空
    pub dedup_cleared: bool,
    /// 区域基线超限时整体清空的条数
    pub region_hashes_cleared: Option<usize>,
}

// =====================================================================
// 监控器
// =====================================================================

pub struct QianniuMonitor {
    snapshotter: Arc<dyn Snapshotter>,
    /// 区域画面基线 (店铺+矩形 → 哈希)
    region_hashes: Mutex<RegionHashCache>,
    /// OCR 提取器 (内含引擎槽位与结果缓存)
    extractor: Mutex<TextExtractor>,
    /// 消息指纹集合
    dedup: Mutex<MessageDeduplicator>,
}

impl QianniuMonitor {
    pub fn new(snapshotter: Arc<dyn Snapshotter>, ocr_backend: Arc<dyn OcrBackend>) -> Self {
        Self {
            snapshotter,
            region_hashes: Mutex::new(RegionHashCache::new()),
            extractor: Mutex::new(TextExtractor::new(ocr_backend)),
            dedup: Mutex::new(MessageDeduplicator::new()),
        }
    }

    /// 单店单轮检测
    ///
    /// 截屏失败向上传播, 由调度器记日志并视为本轮无消息;
    /// OCR 与去重内部消化失败, 不会从这里抛出。
    pub fn poll(&self, shop_id: &str, cfg: &ShopPollConfig) -> Result<PollOutcome> {
        self.poll_at(shop_id, cfg, Instant::now(), Local::now())
    }

    fn poll_at(
        &self,
        shop_id: &str,
        cfg: &ShopPollConfig,
        now: Instant,
        wall: DateTime<Local>,
    ) -> Result<PollOutcome> {
        let detect_region = cfg.detect_region;
        let frame = self
            .snapshotter
            .capture(detect_region)
            .with_context(|| format!("截取未读检测区域失败: shop={shop_id}"))?;

        let score = unread_score(&frame);
        debug!("🔴 未读评分: shop={shop_id}, score={score:.4}");
        if score < cfg.unread_threshold {
            return Ok(PollOutcome::quiet(score));
        }

        let key = region_key(shop_id, detect_region);
        let changed = self.region_hashes.lock().unwrap().has_changed(
            &key,
            &frame_hash(&frame),
            cfg.hash_threshold,
        );
        if !changed {
            debug!("📸 画面未变化: shop={shop_id}");
            return Ok(PollOutcome::quiet(score));
        }

        let chat_region = cfg.effective_chat_region();
        let chat_frame = if chat_region == detect_region {
            frame
        } else {
            self.snapshotter
                .capture(chat_region)
                .with_context(|| format!("截取聊天区域失败: shop={shop_id}"))?
        };

        let text = self.extractor.lock().unwrap().extract_at(&chat_frame, now);
        if self
            .dedup
            .lock()
            .unwrap()
            .is_duplicate_at(&text, shop_id, wall)
        {
            debug!("🔁 重复或空消息: shop={shop_id}");
            return Ok(PollOutcome::quiet(score));
        }

        debug!(
            "📨 检出新消息: shop={shop_id}, score={score:.3}, {} 字符",
            text.chars().count()
        );
        Ok(PollOutcome { score, text })
    }

    /// 各缓存清理: OCR 过期条目 / 去重集合到期清空 / 区域基线超限清空
    pub fn run_housekeeping(&self) -> HousekeepingReport {
        self.run_housekeeping_at(Instant::now(), Local::now())
    }

    fn run_housekeeping_at(&self, now: Instant, wall: DateTime<Local>) -> HousekeepingReport {
        let ocr_expired = self
            .extractor
            .lock()
            .unwrap()
            .purge_expired_cache_at(now);
        let dedup_cleared = self.dedup.lock().unwrap().maybe_clear_at(wall);

        let mut hashes = self.region_hashes.lock().unwrap();
        let region_hashes_cleared = if hashes.len() > REGION_CACHE_LIMIT {
            let n = hashes.len();
            hashes.clear();
            Some(n)
        } else {
            None
        };
        drop(hashes);

        let report = HousekeepingReport {
            ocr_expired,
            dedup_cleared,
            region_hashes_cleared,
        };
        if report.ocr_expired > 0 || report.dedup_cleared || report.region_hashes_cleared.is_some()
        {
            debug!(
                "🧹 缓存清理: OCR 过期 {} 条, 去重清空 {}, 区域基线清空 {:?}",
                report.ocr_expired, report.dedup_cleared, report.region_hashes_cleared
            );
        }
        report
    }
}
