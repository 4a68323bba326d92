//! 千牛检测管线自检工具
//!
//! 不依赖真实截屏与 OCR 环境: 用合成帧 + 脚本化协作方逐阶段验证
//! 检测链路 (未读信号 → 画面变化 → OCR → 去重 → 完整轮询 → 清理),
//! 输出分项结果与推荐配置。

use anyhow::Result;
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

use qianniu_monitor::{
    frame_hash, region_key, unread_score, MessageDeduplicator, OcrBackend, OcrEngine, OcrLine,
    QianniuMonitor, Region, RegionHashCache, ShopPollConfig, Snapshotter, TextExtractor,
    DEFAULT_HASH_THRESHOLD,
};

// =====================================================================
// 合成素材与脚本化协作方
// =====================================================================

fn solid(rgb: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(120, 120, Rgb(rgb))
}

fn striped() -> RgbImage {
    RgbImage::from_fn(120, 120, |x, _| {
        if x % 24 < 12 {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// 固定帧截屏: 每次返回同一画面
struct FixedFrame(RgbImage);

impl Snapshotter for FixedFrame {
    fn capture(&self, _region: Region) -> Result<RgbImage> {
        Ok(self.0.clone())
    }
}

/// 脚本化 OCR: 逐次消费脚本, 只剩一步时重复返回
struct ScriptedOcr {
    script: Arc<Mutex<VecDeque<Vec<OcrLine>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedOcr {
    fn new(steps: Vec<Vec<OcrLine>>) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(Mutex::new(steps.into())),
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct ScriptedEngine {
    script: Arc<Mutex<VecDeque<Vec<OcrLine>>>>,
    calls: Arc<AtomicUsize>,
}

impl OcrBackend for ScriptedOcr {
    fn is_available(&self) -> bool {
        true
    }

    fn create_engine(&self) -> Result<Box<dyn OcrEngine>> {
        Ok(Box::new(ScriptedEngine {
            script: self.script.clone(),
            calls: self.calls.clone(),
        }))
    }
}

impl OcrEngine for ScriptedEngine {
    fn recognize(&mut self, _frame: &RgbImage) -> Result<Vec<OcrLine>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        let lines = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        Ok(lines.unwrap_or_default())
    }
}

// =====================================================================
// 报告输出
// =====================================================================

fn header(title: &str) {
    println!("\n{}", "=".repeat(50));
    println!("  {title}");
    println!("{}", "=".repeat(50));
}

fn step(n: usize, title: &str) {
    println!("\n[阶段{n}] {title}");
}

fn result(ok: bool, message: &str) {
    println!("  {} {message}", if ok { "✓" } else { "✗" });
}

// =====================================================================
// 各阶段
// =====================================================================

fn stage_unread_signal() -> (bool, f32) {
    step(1, "未读信号检测");
    let quiet = unread_score(&solid([30, 30, 30]));
    let busy = unread_score(&solid([220, 20, 20]));
    let empty = unread_score(&RgbImage::new(0, 0));
    result(quiet == 0.0, &format!("安静帧评分: {quiet:.4}"));
    result(busy == 1.0, &format!("红色角标帧评分: {busy:.4}"));
    result(empty == 0.0, &format!("空帧评分: {empty:.4} (不除零)"));
    (quiet == 0.0 && busy == 1.0 && empty == 0.0, quiet)
}

fn stage_change_detection() -> bool {
    step(2, "画面变化检测");
    let mut cache = RegionHashCache::new();
    let key = region_key("verify", Region::new(0, 0, 120, 120));
    let red = frame_hash(&solid([220, 20, 20]));

    let first = cache.has_changed(&key, &red, DEFAULT_HASH_THRESHOLD);
    result(first, "首次观察视为变化");
    let stable = !cache.has_changed(&key, &red, DEFAULT_HASH_THRESHOLD);
    result(stable, "相同画面不触发");
    let moved = cache.has_changed(&key, &frame_hash(&striped()), DEFAULT_HASH_THRESHOLD);
    result(moved, "新画面触发并更新基线");
    first && stable && moved
}

fn stage_ocr_extraction() -> bool {
    step(3, "OCR 文本提取");
    let ocr = ScriptedOcr::new(vec![vec![], vec![OcrLine::new("您好，我想退款", 0.93)]]);
    let mut extractor = TextExtractor::new(ocr.clone());
    let frame = solid([200, 200, 200]);

    let text = extractor.extract(&frame);
    let retried = text == "您好，我想退款";
    result(retried, &format!("空结果重试后识别: {text}"));

    let again = extractor.extract(&frame);
    let cached = again == text && ocr.calls() == 2;
    result(
        cached,
        &format!("同帧走缓存, 引擎共调用 {} 次", ocr.calls()),
    );
    retried && cached
}

fn stage_deduplication() -> bool {
    step(4, "消息去重");
    let mut dedup = MessageDeduplicator::new();

    let first = !dedup.is_duplicate("这是一条测试消息", "shop-1");
    let repeat = dedup.is_duplicate("这是一条测试消息", "shop-1");
    result(first && repeat, "相同消息去重: 首条放行, 重复拦截");
    let other = !dedup.is_duplicate("这是另一条消息", "shop-1");
    result(other, "不同消息放行");
    let blank = dedup.is_duplicate("   ", "shop-1");
    result(blank, "空白文本拦截");
    first && repeat && other && blank
}

fn stage_full_poll() -> (bool, Option<QianniuMonitor>) {
    step(5, "完整链路");
    let ocr = ScriptedOcr::new(vec![vec![OcrLine::new("亲，麻烦看下订单", 0.9)]]);
    let monitor = QianniuMonitor::new(Arc::new(FixedFrame(solid([220, 20, 20]))), ocr);
    let cfg = ShopPollConfig {
        auto_mode: true,
        ..ShopPollConfig::default()
    };

    let captured = match monitor.poll("verify-shop", &cfg) {
        Ok(out) => {
            let ok = out.text == "亲，麻烦看下订单" && out.score > 0.9;
            result(
                ok,
                &format!(
                    "首轮捕获: score={:.3}, 文本 {} 字符",
                    out.score,
                    out.text.chars().count()
                ),
            );
            ok
        }
        Err(e) => {
            result(false, &format!("首轮轮询出错: {e:#}"));
            false
        }
    };

    let suppressed = match monitor.poll("verify-shop", &cfg) {
        Ok(out) => {
            let ok = out.text.is_empty();
            result(ok, "次轮画面未变, 检测短路");
            ok
        }
        Err(e) => {
            result(false, &format!("次轮轮询出错: {e:#}"));
            false
        }
    };

    (captured && suppressed, Some(monitor))
}

fn stage_housekeeping(monitor: Option<QianniuMonitor>) -> bool {
    step(6, "缓存清理");
    let Some(monitor) = monitor else {
        result(false, "上一阶段未建立监控器, 跳过");
        return false;
    };
    let report = monitor.run_housekeeping();
    // 缓存都是刚写入的, 到期清理不应动它们
    let ok = report.ocr_expired == 0
        && !report.dedup_cleared
        && report.region_hashes_cleared.is_none();
    result(
        ok,
        &format!(
            "新鲜缓存原样保留 (OCR 过期 {} 条, 去重清空 {}, 基线清空 {:?})",
            report.ocr_expired, report.dedup_cleared, report.region_hashes_cleared
        ),
    );
    ok
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qianniu_monitor=info".into()),
        )
        .init();

    header("千牛检测管线自检");
    println!("合成帧离线验证, 无需真实截屏/OCR 环境");
    info!("🚀 自检开始");

    let (signal_ok, quiet_score) = stage_unread_signal();
    let change_ok = stage_change_detection();
    let ocr_ok = stage_ocr_extraction();
    let dedup_ok = stage_deduplication();
    let (poll_ok, monitor) = stage_full_poll();
    let housekeeping_ok = stage_housekeeping(monitor);

    header("验证报告");
    let stages = [
        ("未读信号检测", signal_ok),
        ("画面变化检测", change_ok),
        ("OCR 文本提取", ocr_ok),
        ("消息去重", dedup_ok),
        ("完整链路", poll_ok),
        ("缓存清理", housekeeping_ok),
    ];
    for (name, ok) in &stages {
        result(*ok, name);
    }
    let passed = stages.iter().filter(|(_, ok)| *ok).count();
    println!("\n通过 {passed}/{}", stages.len());

    println!("\n推荐配置:");
    println!("  detect_region    = [0, 700, 300, 300]");
    println!("  unread_threshold = {:.3}", (quiet_score * 2.0).max(0.01));
    println!("  hash_threshold   = {DEFAULT_HASH_THRESHOLD}");

    if passed < stages.len() {
        std::process::exit(1);
    }
}
