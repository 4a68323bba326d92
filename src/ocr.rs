//! OCR 文本提取
//!
//! 依赖注入的 OcrBackend, 提供:
//! - 惰性引擎创建: 首次用到才建, 识别异常直接丢弃实例, 下次重建
//! - 重试: 最多 3 次, 空结果歇 0.5s, 异常歇 1s
//! - 置信度过滤: 只保留 > 0.5 的行, 按行拼接
//! - 结果缓存: 按帧哈希记忆 60s, 容量 100, 超限按时间淘汰最旧 20 条
//!
//! extract 永不报错: 引擎缺失或重试耗尽都返回空串,
//! 文本提取失败最多让本轮检测落空, 不中断轮询。

use anyhow::Result;
use image::RgbImage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::phash::frame_hash;

pub const OCR_ATTEMPTS: u32 = 3;
pub const OCR_MIN_CONFIDENCE: f32 = 0.5;
pub const OCR_CACHE_TTL: Duration = Duration::from_secs(60);
pub const OCR_CACHE_CAP: usize = 100;
pub const OCR_CACHE_EVICT: usize = 20;

const EMPTY_RETRY_DELAY: Duration = Duration::from_millis(500);
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(1);

// =====================================================================
// 引擎契约
// =====================================================================

/// 单行识别结果
#[derive(Debug, Clone)]
pub struct OcrLine {
    pub text: String,
    pub confidence: f32,
}

impl OcrLine {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// OCR 引擎实例, 识别异常后整个实例作废
pub trait OcrEngine: Send {
    fn recognize(&mut self, frame: &RgbImage) -> Result<Vec<OcrLine>>;
}

/// OCR 引擎工厂: 探测依赖 + 创建实例
pub trait OcrBackend: Send + Sync {
    /// 引擎依赖是否就绪, 只在首次需要引擎时探测一次
    fn is_available(&self) -> bool;
    fn create_engine(&self) -> Result<Box<dyn OcrEngine>>;
}

/// 引擎槽位
enum EngineSlot {
    /// 尚未创建
    Idle,
    Ready(Box<dyn OcrEngine>),
    /// 依赖缺失, 不再重试
    Unavailable,
}

// =====================================================================
// 结果缓存
// =====================================================================

struct OcrCache {
    entries: HashMap<String, (String, Instant)>,
}

impl OcrCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// 命中且未过期才返回; 过期条目顺手删掉
    fn get_at(&mut self, key: &str, now: Instant) -> Option<String> {
        match self.entries.get(key) {
            Some((text, at)) if now.duration_since(*at) < OCR_CACHE_TTL => Some(text.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put_at(&mut self, key: &str, text: String, now: Instant) {
        if self.entries.len() >= OCR_CACHE_CAP {
            self.evict_oldest(OCR_CACHE_EVICT);
        }
        self.entries.insert(key.to_string(), (text, now));
    }

    /// 批量淘汰最旧的 n 条 (按写入时间, 非 LRU)
    fn evict_oldest(&mut self, n: usize) {
        let mut stamped: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|(k, (_, at))| (k.clone(), *at))
            .collect();
        stamped.sort_by_key(|(_, at)| *at);
        for (key, _) in stamped.into_iter().take(n) {
            self.entries.remove(&key);
        }
        debug!("🧹 OCR 缓存淘汰 {n} 条, 余 {}", self.entries.len());
    }

    fn purge_expired_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, at)| now.duration_since(*at) < OCR_CACHE_TTL);
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// =====================================================================
// 提取器
// =====================================================================

pub struct TextExtractor {
    backend: Arc<dyn OcrBackend>,
    slot: EngineSlot,
    cache: OcrCache,
}

impl TextExtractor {
    pub fn new(backend: Arc<dyn OcrBackend>) -> Self {
        Self {
            backend,
            slot: EngineSlot::Idle,
            cache: OcrCache::new(),
        }
    }

    /// 识别帧中的文本, 永不报错
    ///
    /// 返回置信度合格各行按 "\n" 拼接的结果; 缓存命中时不触发引擎。
    pub fn extract(&mut self, frame: &RgbImage) -> String {
        self.extract_at(frame, Instant::now())
    }

    pub(crate) fn extract_at(&mut self, frame: &RgbImage, now: Instant) -> String {
        let cache_key = frame_hash(frame).to_base64();
        if let Some(text) = self.cache.get_at(&cache_key, now) {
            debug!("📝 OCR 缓存命中");
            return text;
        }

        for attempt in 1..=OCR_ATTEMPTS {
            match self.recognize_once(frame) {
                Ok(Some(lines)) => {
                    let text = join_confident_lines(&lines);
                    if !text.is_empty() {
                        debug!(
                            "📝 OCR 成功 (第 {attempt} 次): {} 字符",
                            text.chars().count()
                        );
                        self.cache.put_at(&cache_key, text.clone(), now);
                        return text;
                    }
                    debug!("📝 OCR 第 {attempt} 次无有效文本");
                    std::thread::sleep(EMPTY_RETRY_DELAY);
                }
                // 依赖缺失, 永久停用
                Ok(None) => return String::new(),
                Err(e) => {
                    warn!("⚠️ OCR 第 {attempt} 次异常: {e:#}, 丢弃引擎实例");
                    self.slot = EngineSlot::Idle;
                    std::thread::sleep(ERROR_RETRY_DELAY);
                }
            }
        }
        String::new()
    }

    /// 执行一次识别; Ok(None) 表示依赖缺失
    fn recognize_once(&mut self, frame: &RgbImage) -> Result<Option<Vec<OcrLine>>> {
        if let EngineSlot::Idle = self.slot {
            if !self.backend.is_available() {
                info!("📝 OCR 依赖缺失, 文本提取停用");
                self.slot = EngineSlot::Unavailable;
                return Ok(None);
            }
            let engine = self.backend.create_engine()?;
            info!("📝 OCR 引擎已就绪");
            self.slot = EngineSlot::Ready(engine);
        }
        let EngineSlot::Ready(engine) = &mut self.slot else {
            return Ok(None);
        };
        engine.recognize(frame).map(Some)
    }

    /// 清除过期缓存, 返回清除条数
    pub(crate) fn purge_expired_cache_at(&mut self, now: Instant) -> usize {
        self.cache.purge_expired_at(now)
    }

    pub(crate) fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// 置信度过滤 + 按行拼接
fn join_confident_lines(lines: &[OcrLine]) -> String {
    lines
        .iter()
        .filter(|l| l.confidence > OCR_MIN_CONFIDENCE)
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
