//! 轮询调度
//!
//! 单循环顺序轮询全部店铺:
//! - 每轮先做缓存清理, 再重读店铺配置 (允许运行中热改)
//! - 店与店之间留间隔; auto_mode 关闭或窗口不在则跳过
//! - 检测管线是阻塞代码, 放进 spawn_blocking, 可选整体超时
//!
//! 调度层消化一切协作方故障: 配置读不出来跳过本轮,
//! 单店轮询失败只影响该店本轮, 循环本身不退出。

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ScheduleSection, ShopConfigSource, ShopEntry};
use crate::monitor::QianniuMonitor;
use crate::window::WindowDriver;

// =====================================================================
// 消息出口
// =====================================================================

/// 捕获到的消息记录
#[derive(Debug, Clone, Serialize)]
pub struct CapturedMessage {
    pub shop_id: String,
    /// 暂无按客户拆分的来源, 固定 "unknown"
    pub customer_id: String,
    pub content: String,
    pub source: String,
    pub status: String,
    pub score: f32,
    pub captured_at: DateTime<Local>,
}

impl CapturedMessage {
    pub fn new(shop_id: &str, content: String, score: f32) -> Self {
        Self {
            shop_id: shop_id.to_string(),
            customer_id: "unknown".to_string(),
            content,
            source: "qianniu".to_string(),
            status: "new".to_string(),
            score,
            captured_at: Local::now(),
        }
    }
}

/// 消息落地出口, 入库或推送由调用方实现
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: &CapturedMessage) -> Result<()>;
}

// =====================================================================
// 调度参数
// =====================================================================

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub poll_interval: Duration,
    pub shop_gap: Duration,
    /// 单店轮询整体超时, None 表示不限时
    pub poll_timeout: Option<Duration>,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            shop_gap: Duration::from_secs(2),
            poll_timeout: None,
        }
    }
}

impl From<&ScheduleSection> for ScheduleSettings {
    fn from(sec: &ScheduleSection) -> Self {
        Self {
            // interval 为零会 panic, 下限 1s
            poll_interval: Duration::from_secs(sec.poll_interval_secs.max(1)),
            shop_gap: Duration::from_secs(sec.shop_gap_secs),
            poll_timeout: sec.poll_timeout_secs.map(Duration::from_secs),
        }
    }
}

// =====================================================================
// 调度器
// =====================================================================

pub struct Scheduler {
    monitor: Arc<QianniuMonitor>,
    shops: Arc<dyn ShopConfigSource>,
    windows: Arc<dyn WindowDriver>,
    sink: Arc<dyn MessageSink>,
    settings: ScheduleSettings,
}

impl Scheduler {
    pub fn new(
        monitor: Arc<QianniuMonitor>,
        shops: Arc<dyn ShopConfigSource>,
        windows: Arc<dyn WindowDriver>,
        sink: Arc<dyn MessageSink>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            monitor,
            shops,
            windows,
            sink,
            settings,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "⏰ 轮询调度启动: 周期 {:?}, 店间隔 {:?}",
            self.settings.poll_interval, self.settings.shop_gap
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_tick(&cancel).await;
        }
        info!("⏰ 轮询调度退出");
    }

    async fn run_tick(&self, cancel: &CancellationToken) {
        // 先清理缓存再重读配置, 与单次轮询一样放到阻塞线程上
        let monitor = self.monitor.clone();
        let shops = self.shops.clone();
        let loaded = spawn_blocking(move || {
            monitor.run_housekeeping();
            shops.load_shops()
        })
        .await;

        let entries = match loaded {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                warn!("⚠️ 店铺配置读取失败, 本轮跳过: {e:#}");
                return;
            }
            Err(e) => {
                warn!("⚠️ 清理/读配置任务异常: {e}");
                return;
            }
        };

        for (i, shop) in entries.iter().enumerate() {
            if cancel.is_cancelled() {
                return;
            }
            if i > 0 && !self.settings.shop_gap.is_zero() {
                tokio::time::sleep(self.settings.shop_gap).await;
            }
            if !shop.poll.auto_mode {
                debug!("⏭️ 自动监控关闭, 跳过: shop={}", shop.id);
                continue;
            }
            if !self.window_present(shop).await {
                continue;
            }
            self.poll_shop(shop).await;
        }
    }

    /// 配置了标题关键字时, 确认窗口存在才轮询
    async fn window_present(&self, shop: &ShopEntry) -> bool {
        let Some(keyword) = shop.title_keyword.clone() else {
            return true;
        };
        let windows = self.windows.clone();
        let kw = keyword.clone();
        match spawn_blocking(move || windows.find_windows(&kw)).await {
            Ok(Ok(titles)) if titles.is_empty() => {
                debug!("⏭️ 未找到窗口 [{keyword}], 跳过: shop={}", shop.id);
                false
            }
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("🪟 窗口查找失败, 跳过: shop={}, {e:#}", shop.id);
                false
            }
            Err(e) => {
                warn!("🪟 窗口查找任务异常: {e}");
                false
            }
        }
    }

    async fn poll_shop(&self, shop: &ShopEntry) {
        let monitor = self.monitor.clone();
        let shop_id = shop.id.clone();
        let cfg = shop.poll.clone();
        let handle = spawn_blocking(move || monitor.poll(&shop_id, &cfg));

        let joined = match self.settings.poll_timeout {
            // 超时只是放弃等待, 阻塞任务本身会跑完
            Some(limit) => match timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("⏱️ 轮询超时 ({limit:?}): shop={}", shop.id);
                    return;
                }
            },
            None => handle.await,
        };

        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!("⚠️ 轮询失败, 本轮视为无消息: shop={}, {e:#}", shop.id);
                return;
            }
            Err(e) => {
                warn!("⚠️ 轮询任务异常: shop={}, {e}", shop.id);
                return;
            }
        };

        if outcome.text.is_empty() {
            if outcome.score >= shop.poll.unread_threshold {
                debug!(
                    "🔁 有未读信号但无新文本: shop={}, score={:.3}",
                    shop.id, outcome.score
                );
            }
            return;
        }

        let message = CapturedMessage::new(&shop.id, outcome.text, outcome.score);
        info!(
            "📨 捕获消息: shop={}, score={:.3}, {} 字符",
            shop.id,
            message.score,
            message.content.chars().count()
        );

        let sink = self.sink.clone();
        let record = message.clone();
        match spawn_blocking(move || sink.deliver(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("📨 消息投递失败: shop={}, {e:#}", shop.id),
            Err(e) => warn!("📨 投递任务异常: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Region, Snapshotter};
    use crate::config::ShopPollConfig;
    use crate::ocr::{OcrBackend, OcrEngine, OcrLine};
    use anyhow::bail;
    use image::{Rgb, RgbImage};
    use tokio::sync::mpsc;

    struct StillRed;

    impl Snapshotter for StillRed {
        fn capture(&self, _region: Region) -> Result<RgbImage> {
            Ok(RgbImage::from_pixel(50, 50, Rgb([220, 20, 20])))
        }
    }

    struct OneLineOcr;
    struct OneLineEngine;

    impl OcrBackend for OneLineOcr {
        fn is_available(&self) -> bool {
            true
        }

        fn create_engine(&self) -> Result<Box<dyn OcrEngine>> {
            Ok(Box::new(OneLineEngine))
        }
    }

    impl OcrEngine for OneLineEngine {
        fn recognize(&mut self, _frame: &RgbImage) -> Result<Vec<OcrLine>> {
            Ok(vec![OcrLine::new("您好，我想退款", 0.9)])
        }
    }

    struct StaticShops(Vec<ShopEntry>);

    impl ShopConfigSource for StaticShops {
        fn load_shops(&self) -> Result<Vec<ShopEntry>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenShops;

    impl ShopConfigSource for BrokenShops {
        fn load_shops(&self) -> Result<Vec<ShopEntry>> {
            bail!("配置文件损坏")
        }
    }

    struct ListedWindows(Vec<String>);

    impl WindowDriver for ListedWindows {
        fn find_windows(&self, title_keyword: &str) -> Result<Vec<String>> {
            Ok(self
                .0
                .iter()
                .filter(|t| t.contains(title_keyword))
                .cloned()
                .collect())
        }

        fn activate(&self, title_keyword: &str) -> Result<bool> {
            Ok(self.0.iter().any(|t| t.contains(title_keyword)))
        }

        fn send_text(&self, _text: &str) -> Result<()> {
            Ok(())
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<CapturedMessage>);

    impl MessageSink for ChannelSink {
        fn deliver(&self, message: &CapturedMessage) -> Result<()> {
            self.0
                .send(message.clone())
                .map_err(|e| anyhow::anyhow!("投递通道关闭: {e}"))
        }
    }

    fn shop(id: &str, auto: bool) -> ShopEntry {
        ShopEntry {
            id: id.to_string(),
            title_keyword: None,
            poll: ShopPollConfig {
                auto_mode: auto,
                ..ShopPollConfig::default()
            },
        }
    }

    fn fast_settings() -> ScheduleSettings {
        ScheduleSettings {
            poll_interval: Duration::from_millis(50),
            shop_gap: Duration::ZERO,
            poll_timeout: None,
        }
    }

    fn scheduler_with(
        shops: Arc<dyn ShopConfigSource>,
        windows: Arc<dyn WindowDriver>,
        sink: Arc<dyn MessageSink>,
    ) -> Scheduler {
        let monitor = Arc::new(QianniuMonitor::new(
            Arc::new(StillRed),
            Arc::new(OneLineOcr),
        ));
        Scheduler::new(monitor, shops, windows, sink, fast_settings())
    }

    #[test]
    fn test_settings_from_config_section() {
        let sec = crate::config::ScheduleSection {
            poll_interval_secs: 0,
            shop_gap_secs: 3,
            poll_timeout_secs: Some(30),
        };
        let settings = ScheduleSettings::from(&sec);
        // interval 配零兜底到 1s, 避免 tokio::interval panic
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.shop_gap, Duration::from_secs(3));
        assert_eq!(settings.poll_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_captured_message_serializes_with_stable_fields() {
        // 下游入库/推送按这些字段名取值, 不能随重构漂移
        let message = CapturedMessage::new("shop-1", "您好".to_string(), 0.5);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["shop_id"], "shop-1");
        assert_eq!(value["customer_id"], "unknown");
        assert_eq!(value["source"], "qianniu");
        assert_eq!(value["status"], "new");
        assert_eq!(value["content"], "您好");
    }

    #[tokio::test]
    async fn test_captured_message_is_delivered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = scheduler_with(
            Arc::new(StaticShops(vec![shop("shop-1", true)])),
            Arc::new(ListedWindows(vec![])),
            Arc::new(ChannelSink(tx)),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        let message = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("等待消息超时")
            .expect("通道被关闭");
        assert_eq!(message.shop_id, "shop-1");
        assert_eq!(message.customer_id, "unknown");
        assert_eq!(message.source, "qianniu");
        assert_eq!(message.status, "new");
        assert_eq!(message.content, "您好，我想退款");
        assert!(message.score > 0.9);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("调度未按取消退出")
            .unwrap();
    }

    #[tokio::test]
    async fn test_static_screen_delivers_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = scheduler_with(
            Arc::new(StaticShops(vec![shop("shop-1", true)])),
            Arc::new(ListedWindows(vec![])),
            Arc::new(ChannelSink(tx)),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        assert!(tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("等待首条消息超时")
            .is_some());
        // 画面不变: 后续轮次全部在变化检测处短路, 不再投递
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;
    }

    #[tokio::test]
    async fn test_auto_mode_off_shop_is_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = scheduler_with(
            Arc::new(StaticShops(vec![shop("shop-1", false)])),
            Arc::new(ListedWindows(vec![])),
            Arc::new(ChannelSink(tx)),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;
    }

    #[tokio::test]
    async fn test_missing_window_gates_polling() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut entry = shop("shop-1", true);
        entry.title_keyword = Some("旗舰店".to_string());
        let scheduler = scheduler_with(
            Arc::new(StaticShops(vec![entry])),
            Arc::new(ListedWindows(vec![])),
            Arc::new(ChannelSink(tx)),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;
    }

    #[tokio::test]
    async fn test_present_window_allows_polling() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut entry = shop("shop-1", true);
        entry.title_keyword = Some("旗舰店".to_string());
        let scheduler = scheduler_with(
            Arc::new(StaticShops(vec![entry])),
            Arc::new(ListedWindows(vec!["千牛 - 某某旗舰店".to_string()])),
            Arc::new(ChannelSink(tx)),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        assert!(tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("等待消息超时")
            .is_some());

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;
    }

    #[tokio::test]
    async fn test_config_failure_does_not_kill_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = scheduler_with(
            Arc::new(BrokenShops),
            Arc::new(ListedWindows(vec![])),
            Arc::new(ChannelSink(tx)),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        // 配置一直读不出来: 循环照常跑, 只是没有产出
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err());
        assert!(!handle.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("调度未按取消退出")
            .unwrap();
    }
}
