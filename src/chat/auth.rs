//! 凭证提供者接口
//!
//! 凭证获取本身（登录、刷新）由外部实现，这里只定义契约：
//! token 可能在会话中途过期，所以每次队列分发前都要重新取一次。

use anyhow::Result;
use async_trait::async_trait;

/// 凭证提供者
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// 返回一份当前有效的 bearer 凭证；实现可以在内部触发交互式登录
    async fn get_token(&self) -> Result<String>;
}

/// 固定凭证（CLI 与测试用）
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}
