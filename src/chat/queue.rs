//! 同步队列条目与后台执行单元
//!
//! 所有出站变更经由一条有序队列串行下发：同一时刻最多一个请求在途，
//! 按入队顺序执行，避免同一条记录的并发冲突写。
//!
//! 执行单元是一个独立的 tokio 任务，与分发器之间只通过类型化消息
//! （mpsc）通信，不共享可变内存。

use crate::chat::api::{RemoteGateway, RequestError};
use crate::chat::history::models::LocalChatHistory;
use crate::chat::message::models::LocalMessage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 队列条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncItemKind {
    ChatHistory,
    Message,
}

/// 队列条目动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Upsert,
    Delete,
}

/// 队列条目载荷：完整记录或 ID 引用
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPayload {
    History(LocalChatHistory),
    Message {
        chat_id: String,
        message: LocalMessage,
    },
    HistoryDelete {
        id: String,
    },
    MessageDelete {
        chat_id: String,
        message_id: String,
    },
}

/// 同步队列条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub kind: SyncItemKind,
    pub action: SyncAction,
    pub payload: SyncPayload,
    /// 失败次数，从 0 开始，每次失败加一
    #[serde(default)]
    pub retry_count: u32,
    /// 分发时附加的凭证快照
    #[serde(skip)]
    pub token: Option<String>,
}

impl SyncQueueItem {
    pub fn new(action: SyncAction, payload: SyncPayload) -> Self {
        let kind = match &payload {
            SyncPayload::History(_) | SyncPayload::HistoryDelete { .. } => {
                SyncItemKind::ChatHistory
            }
            SyncPayload::Message { .. } | SyncPayload::MessageDelete { .. } => {
                SyncItemKind::Message
            }
        };
        Self {
            kind,
            action,
            payload,
            retry_count: 0,
            token: None,
        }
    }

    /// 日志用的简短描述
    pub fn describe(&self) -> String {
        let target = match &self.payload {
            SyncPayload::History(h) => h.id.clone(),
            SyncPayload::Message { chat_id, message } => {
                format!("{}/{}", chat_id, message.message_id)
            }
            SyncPayload::HistoryDelete { id } => id.clone(),
            SyncPayload::MessageDelete {
                chat_id,
                message_id,
            } => format!("{}/{}", chat_id, message_id),
        };
        format!("{:?} {:?} {}", self.kind, self.action, target)
    }
}

/// 发给执行单元的请求
#[derive(Debug)]
pub(crate) struct WorkerRequest {
    pub item: SyncQueueItem,
}

/// 执行单元返回的服务端确认数据
#[derive(Debug, Clone)]
pub enum SyncedData {
    History(LocalChatHistory),
    Message(LocalMessage),
    Deleted,
}

/// 执行结果
#[derive(Debug)]
pub(crate) enum WorkerStatus {
    Synced(SyncedData),
    Failed { retryable: bool },
}

/// 执行单元的回执
#[derive(Debug)]
pub(crate) struct WorkerReply {
    pub item: SyncQueueItem,
    pub status: WorkerStatus,
}

/// 后台执行单元：逐条接收请求，执行对应的网关调用并回执
///
/// 一次只处理一条请求；"同一时刻至多一个在途写"由分发器等待回执保证。
pub(crate) async fn run_worker(
    gateway: Arc<dyn RemoteGateway>,
    mut rx: mpsc::UnboundedReceiver<WorkerRequest>,
    reply_tx: mpsc::UnboundedSender<WorkerReply>,
) {
    while let Some(req) = rx.recv().await {
        debug!("[Worker] 执行队列条目: {}", req.item.describe());
        let status = execute(gateway.as_ref(), &req.item).await;
        if reply_tx
            .send(WorkerReply {
                item: req.item,
                status,
            })
            .is_err()
        {
            // 分发器已退出
            break;
        }
    }
    debug!("[Worker] 执行单元退出");
}

async fn execute(gateway: &dyn RemoteGateway, item: &SyncQueueItem) -> WorkerStatus {
    let token = match item.token.as_deref() {
        Some(t) if !t.is_empty() => t,
        // 凭证缺失：下次分发会重新取，按可重试失败处理
        _ => {
            warn!("[Worker] 条目缺少凭证: {}", item.describe());
            return WorkerStatus::Failed { retryable: true };
        }
    };

    let result: Result<SyncedData, RequestError> = match &item.payload {
        SyncPayload::History(history) => gateway
            .upsert_chat_history(token, history)
            .await
            .map(SyncedData::History),
        SyncPayload::HistoryDelete { id } => gateway
            .delete_chat_history(token, id)
            .await
            .map(|_| SyncedData::Deleted),
        SyncPayload::Message { chat_id, message } => {
            let call = match item.action {
                SyncAction::Update => gateway.update_message(token, chat_id, message).await,
                // create / upsert 都走创建接口，服务端按 ID 幂等处理
                _ => gateway.create_message(token, chat_id, message).await,
            };
            call.map(SyncedData::Message)
        }
        SyncPayload::MessageDelete {
            chat_id,
            message_id,
        } => gateway
            .delete_message(token, chat_id, message_id)
            .await
            .map(|_| SyncedData::Deleted),
    };

    match result {
        Ok(data) => WorkerStatus::Synced(data),
        Err(e) => {
            warn!(
                "[Worker] 条目执行失败: {}, 错误: {}, 可重试: {}",
                item.describe(),
                e,
                e.is_retryable()
            );
            WorkerStatus::Failed {
                retryable: e.is_retryable(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::models::MessageRole;

    #[test]
    fn test_kind_derived_from_payload() {
        let h = SyncQueueItem::new(
            SyncAction::Upsert,
            SyncPayload::History(LocalChatHistory {
                id: "alice_1".into(),
                title: String::new(),
                profile_name: String::new(),
                created_at: 0,
                timestamp: None,
                is_deleted: false,
            }),
        );
        assert_eq!(h.kind, SyncItemKind::ChatHistory);
        assert_eq!(h.retry_count, 0);

        let m = SyncQueueItem::new(
            SyncAction::Delete,
            SyncPayload::MessageDelete {
                chat_id: "alice_1".into(),
                message_id: "m1".into(),
            },
        );
        assert_eq!(m.kind, SyncItemKind::Message);
    }

    #[test]
    fn test_describe_targets() {
        let item = SyncQueueItem::new(
            SyncAction::Create,
            SyncPayload::Message {
                chat_id: "alice_1".into(),
                message: LocalMessage {
                    message_id: "m1".into(),
                    role: MessageRole::User,
                    content: String::new(),
                    is_active: true,
                    timestamp: None,
                    sequence_number: None,
                    is_deleted: false,
                    search_results: None,
                    attachments: None,
                },
            },
        );
        assert!(item.describe().contains("alice_1/m1"));
    }
}
