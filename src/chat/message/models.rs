//! 消息本地模型定义

use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "assistant" => MessageRole::Assistant,
            "system" => MessageRole::System,
            _ => MessageRole::User,
        }
    }
}

/// 本地消息记录
///
/// 所属聊天通过按聊天分表的存储结构隐式表达，记录本身不带 chatId。
/// `timestamp` 为合并裁决字段，语义与聊天历史一致（`None` = 从未同步）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMessage {
    /// 消息 ID，在单个聊天内唯一
    pub message_id: String,
    /// 角色
    pub role: MessageRole,
    /// 消息正文
    #[serde(default)]
    pub content: String,
    /// 是否参与当前提示词上下文（与同步状态无关）；
    /// 服务端省略该字段时默认参与，与建表默认值一致
    #[serde(default = "default_is_active")]
    pub is_active: bool,
    /// 创建/最后修改时间（unix 毫秒）；合并裁决字段
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// 序号：时间戳相同时用于确定性排序
    #[serde(default)]
    pub sequence_number: Option<i64>,
    /// 删除墓碑，传播规则与聊天历史一致
    #[serde(default)]
    pub is_deleted: bool,
    /// 搜索结果附加数据（结构化 JSON），upsert 时缺失则保留原值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_results: Option<serde_json::Value>,
    /// 附件引用（结构化 JSON），upsert 时缺失则保留原值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<serde_json::Value>,
}

fn default_is_active() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_omitted_fields_use_local_defaults() {
        // 服务端省略 isActive 时消息默认参与上下文
        let msg: LocalMessage =
            serde_json::from_str(r#"{"messageId":"m1","role":"user","content":"你好"}"#).unwrap();
        assert!(msg.is_active);
        assert_eq!(msg.timestamp, None);
        assert!(!msg.is_deleted);

        // 显式传 false 时照常生效
        let msg: LocalMessage = serde_json::from_str(
            r#"{"messageId":"m1","role":"user","content":"你好","isActive":false}"#,
        )
        .unwrap();
        assert!(!msg.is_active);
    }
}
