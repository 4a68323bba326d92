//! 配置
//!
//! - MonitorConfig: 调度参数 + 店铺列表 (TOML 文件)
//! - ShopPollConfig: 单店轮询参数, 缺省值与线上约定一致
//! - ShopConfigSource: 店铺配置来源, 每个调度周期重新读取 (允许热改)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::capture::Region;

pub const DEFAULT_DETECT_REGION: Region = Region {
    x: 0,
    y: 700,
    w: 300,
    h: 300,
};
pub const DEFAULT_UNREAD_THRESHOLD: f32 = 0.02;
pub const DEFAULT_HASH_THRESHOLD: u32 = 5;

// =====================================================================
// 配置结构
// =====================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub shops: Vec<ShopEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSection {
    /// 轮询周期 (秒)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// 店与店之间的间隔 (秒)
    #[serde(default = "default_shop_gap")]
    pub shop_gap_secs: u64,
    /// 单店轮询整体超时 (秒), 缺省不限时
    #[serde(default)]
    pub poll_timeout_secs: Option<u64>,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            shop_gap_secs: default_shop_gap(),
            poll_timeout_secs: None,
        }
    }
}

/// 一家店铺的监控条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopEntry {
    pub id: String,
    /// 千牛窗口标题关键字; 配置后找不到对应窗口则跳过该店
    #[serde(default)]
    pub title_keyword: Option<String>,
    #[serde(flatten)]
    pub poll: ShopPollConfig,
}

/// 单店轮询参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopPollConfig {
    /// 未读检测区域 [x, y, w, h]
    #[serde(default = "default_detect_region")]
    pub detect_region: Region,
    /// 聊天文本截取区域, 缺省与检测区域相同
    #[serde(default)]
    pub chat_region: Option<Region>,
    /// 未读评分门槛
    #[serde(default = "default_unread_threshold")]
    pub unread_threshold: f32,
    /// 感知哈希汉明距离阈值
    #[serde(default = "default_hash_threshold")]
    pub hash_threshold: u32,
    /// 自动监控开关, 关闭则调度器跳过该店
    #[serde(default)]
    pub auto_mode: bool,
}

impl Default for ShopPollConfig {
    fn default() -> Self {
        Self {
            detect_region: DEFAULT_DETECT_REGION,
            chat_region: None,
            unread_threshold: DEFAULT_UNREAD_THRESHOLD,
            hash_threshold: DEFAULT_HASH_THRESHOLD,
            auto_mode: false,
        }
    }
}

impl ShopPollConfig {
    /// 文本截取区域, 缺省回落到检测区域
    pub fn effective_chat_region(&self) -> Region {
        self.chat_region.unwrap_or(self.detect_region)
    }
}

fn default_poll_interval() -> u64 {
    10
}

fn default_shop_gap() -> u64 {
    2
}

fn default_detect_region() -> Region {
    DEFAULT_DETECT_REGION
}

fn default_unread_threshold() -> f32 {
    DEFAULT_UNREAD_THRESHOLD
}

fn default_hash_threshold() -> u32 {
    DEFAULT_HASH_THRESHOLD
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置失败: {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("解析配置失败: {}", path.display()))
    }
}

// =====================================================================
// 店铺配置来源
// =====================================================================

/// 店铺配置来源, 每个调度周期调用一次 load_shops
pub trait ShopConfigSource: Send + Sync {
    fn load_shops(&self) -> Result<Vec<ShopEntry>>;
}

/// 从 TOML 文件读取, 每次调用重新读文件
pub struct TomlShopSource {
    path: PathBuf,
}

impl TomlShopSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ShopConfigSource for TomlShopSource {
    fn load_shops(&self) -> Result<Vec<ShopEntry>> {
        Ok(MonitorConfig::load(&self.path)?.shops)
    }
}
