//! 消息去重
//!
//! - normalize_text: 只保留字母数字与空白, 抹掉标点差异
//! - message_hash: md5(规整文本:店铺:5 分钟时间桶)
//! - MessageDeduplicator: 哈希集合, 每 10 分钟整体清空
//!
//! 时间桶让同一句话在下一个 5 分钟窗口重新有效;
//! 整体清空粗而便宜, 误放过的代价只是偶尔重复投递一条。

use chrono::{DateTime, Duration, Local, Timelike};
use std::collections::HashSet;
use tracing::debug;

/// 时间桶宽度 (分钟)
pub const DEDUP_WINDOW_MINUTES: u32 = 5;
/// 去重集合整体清空周期 (秒)
pub const DEDUP_CLEAR_SECS: i64 = 600;

/// 规整文本: 去掉标点符号, 保留字母数字与空白, 两端修剪
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .trim()
        .to_string()
}

/// 当前时刻所属的 5 分钟桶标签
fn time_bucket(now: DateTime<Local>) -> String {
    let floored_minute = now.minute() - now.minute() % DEDUP_WINDOW_MINUTES;
    now.with_minute(floored_minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
        .to_rfc3339()
}

/// 消息指纹: 同一店铺同一时间桶内, 规整后相同的文本指纹相同
pub fn message_hash(text: &str, shop_id: &str, now: DateTime<Local>) -> String {
    let normalized = normalize_text(text);
    let bucket = time_bucket(now);
    format!("{:x}", md5::compute(format!("{normalized}:{shop_id}:{bucket}")))
}

// =====================================================================
// 去重器
// =====================================================================

pub struct MessageDeduplicator {
    seen: HashSet<String>,
    last_clear: DateTime<Local>,
}

impl MessageDeduplicator {
    pub fn new() -> Self {
        Self::new_at(Local::now())
    }

    fn new_at(now: DateTime<Local>) -> Self {
        Self {
            seen: HashSet::new(),
            last_clear: now,
        }
    }

    /// 判重并记录
    ///
    /// 空白文本永远算重复 (不值得投递)。先做到期清空, 再查集合。
    pub fn is_duplicate(&mut self, text: &str, shop_id: &str) -> bool {
        self.is_duplicate_at(text, shop_id, Local::now())
    }

    pub(crate) fn is_duplicate_at(
        &mut self,
        text: &str,
        shop_id: &str,
        now: DateTime<Local>,
    ) -> bool {
        self.maybe_clear_at(now);
        if text.trim().is_empty() {
            return true;
        }
        let hash = message_hash(text, shop_id, now);
        if self.seen.contains(&hash) {
            debug!("🔁 重复消息: shop={shop_id}");
            true
        } else {
            self.seen.insert(hash);
            false
        }
    }

    /// 距上次清空超过 10 分钟则整体清空, 返回是否清空
    pub(crate) fn maybe_clear_at(&mut self, now: DateTime<Local>) -> bool {
        if now - self.last_clear > Duration::seconds(DEDUP_CLEAR_SECS) {
            let n = self.seen.len();
            self.seen.clear();
            self.last_clear = now;
            if n > 0 {
                debug!("🧹 去重集合清空: {n} 条");
            }
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}
