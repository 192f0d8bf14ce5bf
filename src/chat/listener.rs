//! 同步监听器回调接口
//!
//! 合并完成后同步器通过这些回调通知展示层刷新；
//! 全部为 fire-and-forget，没有返回值。

use crate::chat::history::models::LocalChatHistory;
use crate::chat::queue::SyncQueueItem;
use async_trait::async_trait;

/// 聊天历史变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryChange {
    Created,
    Updated,
    Deleted,
}

/// 同步监听器回调接口
#[async_trait]
pub trait SyncListener: Send + Sync {
    /// 聊天历史新增 / 更新 / 删除
    async fn on_chat_history_change(&self, change: HistoryChange, history: LocalChatHistory);

    /// 某个聊天的消息列表已合并刷新
    async fn on_messages_refreshed(&self, chat_id: String);

    /// 队列条目达到重试上限（或遇到不可恢复错误）被丢弃
    ///
    /// 原实现静默吞掉这类失败，这里显式上报给调用方展示或记录
    async fn on_sync_item_dropped(&self, item: SyncQueueItem);
}

/// 空实现（默认监听器）
pub struct EmptySyncListener;

#[async_trait]
impl SyncListener for EmptySyncListener {
    async fn on_chat_history_change(&self, _change: HistoryChange, _history: LocalChatHistory) {}
    async fn on_messages_refreshed(&self, _chat_id: String) {}
    async fn on_sync_item_dropped(&self, _item: SyncQueueItem) {}
}
