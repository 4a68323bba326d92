//! 千牛窗口操作
//!
//! - WindowDriver: 窗口系统契约 (查找/激活/输入), 由平台侧实现
//! - send_reply: 激活目标窗口后发送文本
//!
//! "窗口不存在"是正常业务状态而不是错误: 店铺可能尚未登录客户端。

use anyhow::{Context, Result};
use tracing::{info, warn};

/// 窗口系统契约
pub trait WindowDriver: Send + Sync {
    /// 按标题关键字列出匹配的窗口标题
    fn find_windows(&self, title_keyword: &str) -> Result<Vec<String>>;
    /// 激活 (置顶聚焦) 第一个匹配窗口, 找不到返回 false
    fn activate(&self, title_keyword: &str) -> Result<bool>;
    /// 向当前聚焦窗口发送文本
    fn send_text(&self, text: &str) -> Result<()>;
}

/// 回复结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Sent,
    WindowNotFound,
}

/// 向千牛窗口发送回复
///
/// 激活失败 (找不到窗口) 返回 WindowNotFound; 驱动层故障才是 Err。
pub fn send_reply(
    driver: &dyn WindowDriver,
    title_keyword: &str,
    text: &str,
) -> Result<ReplyStatus> {
    let activated = driver
        .activate(title_keyword)
        .with_context(|| format!("激活窗口失败: {title_keyword}"))?;
    if !activated {
        warn!("🪟 未找到窗口: {title_keyword}");
        return Ok(ReplyStatus::WindowNotFound);
    }
    driver
        .send_text(text)
        .with_context(|| format!("发送文本失败: {title_keyword}"))?;
    info!("🪟 已向 [{title_keyword}] 发送 {} 字符", text.chars().count());
    Ok(ReplyStatus::Sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDriver {
        titles: Vec<String>,
        sent: Mutex<Vec<String>>,
        broken: bool,
    }

    impl FakeDriver {
        fn with_window(title: &str) -> Self {
            Self {
                titles: vec![title.to_string()],
                ..Self::default()
            }
        }
    }

    impl WindowDriver for FakeDriver {
        fn find_windows(&self, title_keyword: &str) -> Result<Vec<String>> {
            Ok(self
                .titles
                .iter()
                .filter(|t| t.contains(title_keyword))
                .cloned()
                .collect())
        }

        fn activate(&self, title_keyword: &str) -> Result<bool> {
            if self.broken {
                bail!("窗口系统连接断开");
            }
            Ok(self.titles.iter().any(|t| t.contains(title_keyword)))
        }

        fn send_text(&self, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_reply_sent_to_matching_window() {
        let driver = FakeDriver::with_window("千牛 - 某某旗舰店");
        let status = send_reply(&driver, "旗舰店", "您好，这就为您处理").unwrap();
        assert_eq!(status, ReplyStatus::Sent);
        assert_eq!(
            driver.sent.lock().unwrap().as_slice(),
            ["您好，这就为您处理"]
        );
    }

    #[test]
    fn test_missing_window_is_status_not_error() {
        let driver = FakeDriver::default();
        let status = send_reply(&driver, "旗舰店", "您好").unwrap();
        assert_eq!(status, ReplyStatus::WindowNotFound);
        // 未激活成功就不能往别的窗口打字
        assert!(driver.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_driver_failure_propagates() {
        let driver = FakeDriver {
            broken: true,
            ..FakeDriver::default()
        };
        assert!(send_reply(&driver, "旗舰店", "您好").is_err());
    }
}
