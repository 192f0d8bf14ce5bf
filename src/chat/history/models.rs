//! 聊天历史本地模型定义

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 本地聊天历史记录
///
/// 可以直接从服务器返回的 JSON 反序列化，缺失的字段使用默认值。
/// `timestamp` 为合并裁决字段：`None` 表示从未同步过（与"在 T 时刻
/// 同步过"是两种不同状态，不能用 0 之类的哨兵值代替）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalChatHistory {
    /// 聊天 ID，按所属用户加随机后缀命名，创建后不可变
    pub id: String,
    /// 标题，可修改
    #[serde(default)]
    pub title: String,
    /// 关联的 AI 角色配置名（外部所有，这里只引用）
    #[serde(default)]
    pub profile_name: String,
    /// 创建时间（unix 毫秒），仅创建时设置一次
    #[serde(default)]
    pub created_at: i64,
    /// 最后修改时间（unix 毫秒），每次变更都会更新；合并裁决字段
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// 删除墓碑：删除表示为一次置位更新而不是物理删除，
    /// 这样删除本身可以像普通字段变更一样被传播和合并
    #[serde(default)]
    pub is_deleted: bool,
}

impl LocalChatHistory {
    /// 生成新的聊天 ID：`<username>_<随机后缀>`
    pub fn generate_id(username: &str) -> String {
        format!("{}_{}", username, Uuid::new_v4().simple())
    }
}
