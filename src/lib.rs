//! Qianniu Monitor - 千牛客户端屏幕消息检测与去重管线
//!
//! 未读信号 → 画面变化 → OCR → 去重, 逐级短路;
//! 截屏/OCR/窗口系统都是注入契约, 方便测试与跨平台接入。

pub mod capture;
pub mod config;
pub mod dedup;
pub mod monitor;
pub mod ocr;
pub mod phash;
pub mod scheduler;
pub mod window;

pub use capture::{unread_score, Region, Snapshotter};
pub use config::{
    MonitorConfig, ScheduleSection, ShopConfigSource, ShopEntry, ShopPollConfig, TomlShopSource,
    DEFAULT_HASH_THRESHOLD, DEFAULT_UNREAD_THRESHOLD,
};
pub use dedup::{message_hash, normalize_text, MessageDeduplicator};
pub use monitor::{HousekeepingReport, PollOutcome, QianniuMonitor};
pub use ocr::{OcrBackend, OcrEngine, OcrLine, TextExtractor};
pub use phash::{frame_hash, region_key, RegionHashCache};
pub use scheduler::{CapturedMessage, MessageSink, ScheduleSettings, Scheduler};
pub use window::{send_reply, ReplyStatus, WindowDriver};
