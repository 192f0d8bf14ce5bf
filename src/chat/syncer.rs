//! 同步器（Reconciler）
//!
//! 离线优先同步的核心编排：按需拉取远端变更并与本地合并
//! （时间戳最后写入胜出 + 删除墓碑），将本地较新 / 仅本地存在的记录
//! 排入推送队列，并把队列确认结果回写到本地存储与 UI 层。
//!
//! 合并裁决规则（显式约定）：
//! - 时间戳相等：远端胜出（视为已收敛，不动本地）
//! - 本地严格更新：本地胜出，入队推送覆盖远端
//! - 本地无时间戳：无条件输给任何远端记录（本地从未同步，远端是权威基线）

use crate::chat::api::{ChatApi, RemoteGateway};
use crate::chat::auth::TokenProvider;
use crate::chat::db;
use crate::chat::history::dao::HistoryDao;
use crate::chat::history::models::LocalChatHistory;
use crate::chat::listener::{EmptySyncListener, HistoryChange, SyncListener};
use crate::chat::message::dao::MessageStore;
use crate::chat::message::models::LocalMessage;
use crate::chat::queue::{
    run_worker, SyncAction, SyncPayload, SyncQueueItem, SyncedData, WorkerReply, WorkerRequest,
    WorkerStatus,
};
use crate::chat::state::SyncContext;
use anyhow::{Context, Result};
use sqlx::{Pool, Sqlite};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// 同步器配置
#[derive(Clone, Debug)]
pub struct SyncerConfig {
    /// HTTP API 基础地址
    pub api_base_url: String,
    /// 本地 SQLite 数据库 URL，例如 `sqlite://chats.db?mode=rwc`
    pub db_url: String,
    /// 单条队列条目的最大尝试次数，超过后丢弃并回调上报
    pub max_retries: u32,
    /// 等待乐观本地写入出现的上限（毫秒）
    pub wait_local_timeout_ms: u64,
}

impl SyncerConfig {
    pub fn new(api_base_url: impl Into<String>, db_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            db_url: db_url.into(),
            max_retries: 3,
            wait_local_timeout_ms: 2000,
        }
    }
}

/// 聊天同步器
pub struct ChatSyncer {
    ctx: SyncContext,
    config: SyncerConfig,
    /// 聊天历史 DAO
    history_dao: HistoryDao,
    /// 消息存储
    message_store: MessageStore,
    /// 远端网关
    gateway: Arc<dyn RemoteGateway>,
    /// 凭证提供者，每次分发前重新取
    token_provider: Arc<dyn TokenProvider>,
    /// 同步监听器
    listener: Arc<dyn SyncListener>,
    /// 入队通道（分发任务是唯一消费者）
    queue_tx: mpsc::UnboundedSender<SyncQueueItem>,
    /// 拉取串行化：同一同步器上的拉取不允许交叠
    pull_lock: Mutex<()>,
}

impl ChatSyncer {
    /// 创建同步器（默认空监听器）
    pub async fn new(
        ctx: SyncContext,
        config: SyncerConfig,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Arc<Self>> {
        Self::with_listener(ctx, config, token_provider, Arc::new(EmptySyncListener)).await
    }

    /// 创建同步器（带自定义监听器）
    pub async fn with_listener(
        ctx: SyncContext,
        config: SyncerConfig,
        token_provider: Arc<dyn TokenProvider>,
        listener: Arc<dyn SyncListener>,
    ) -> Result<Arc<Self>> {
        info!(
            "[Sync] 创建同步器，用户: {}, SQLite数据库: {}",
            ctx.username, config.db_url
        );
        let pool = db::create_sqlite_pool(&config.db_url)
            .await
            .context(format!("连接SQLite数据库失败: {}", config.db_url))?;

        let client = reqwest::ClientBuilder::new()
            .build()
            .context("创建 HTTP 客户端失败")?;
        let gateway: Arc<dyn RemoteGateway> =
            Arc::new(ChatApi::new(client, config.api_base_url.clone()));

        Self::with_parts(ctx, config, pool, gateway, token_provider, listener).await
    }

    /// 创建同步器（使用共享连接池与网关实现，测试与嵌入场景用）
    pub async fn with_parts(
        ctx: SyncContext,
        config: SyncerConfig,
        pool: Pool<Sqlite>,
        gateway: Arc<dyn RemoteGateway>,
        token_provider: Arc<dyn TokenProvider>,
        listener: Arc<dyn SyncListener>,
    ) -> Result<Arc<Self>> {
        db::init_db(&pool).await?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let syncer = Arc::new(Self {
            history_dao: HistoryDao::new(pool.clone()),
            message_store: MessageStore::new(pool),
            gateway,
            token_provider,
            listener,
            queue_tx,
            pull_lock: Mutex::new(()),
            ctx,
            config,
        });
        syncer.spawn_tasks(queue_rx);
        Ok(syncer)
    }

    /// 启动后台执行单元与队列分发任务
    fn spawn_tasks(self: &Arc<Self>, queue_rx: mpsc::UnboundedReceiver<SyncQueueItem>) {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_worker(Arc::clone(&self.gateway), worker_rx, reply_tx));

        let syncer = Arc::clone(self);
        tokio::spawn(async move {
            syncer.run_dispatcher(queue_rx, worker_tx, reply_rx).await;
        });
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// 读取本地聊天历史列表（展示层直读入口）
    pub async fn get_chat_histories(&self) -> Result<Vec<LocalChatHistory>> {
        self.history_dao.get_chat_histories(&self.ctx.username).await
    }

    /// 读取某个聊天的本地消息列表
    pub async fn get_messages(&self, chat_id: &str) -> Result<Vec<LocalMessage>> {
        self.message_store.get_messages(chat_id).await
    }

    // ========== 入队接口 ==========

    /// 将一条变更排入同步队列
    pub fn enqueue_sync_item(&self, item: SyncQueueItem) {
        debug!("[Sync] 入队: {}", item.describe());
        if self.queue_tx.send(item).is_err() {
            warn!("[Sync] 队列分发任务已退出，条目被丢弃");
        }
    }

    pub fn sync_message_create(&self, chat_id: &str, message: LocalMessage) {
        self.enqueue_sync_item(SyncQueueItem::new(
            SyncAction::Create,
            SyncPayload::Message {
                chat_id: chat_id.to_string(),
                message,
            },
        ));
    }

    pub fn sync_message_update(&self, chat_id: &str, message: LocalMessage) {
        self.enqueue_sync_item(SyncQueueItem::new(
            SyncAction::Update,
            SyncPayload::Message {
                chat_id: chat_id.to_string(),
                message,
            },
        ));
    }

    pub fn sync_message_delete(&self, chat_id: &str, message_id: &str) {
        self.enqueue_sync_item(SyncQueueItem::new(
            SyncAction::Delete,
            SyncPayload::MessageDelete {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
            },
        ));
    }

    /// 本地乐观创建一条聊天历史并入队首次推送
    ///
    /// 记录立即落库（timestamp 为 None，表示尚未同步），
    /// 服务端确认后由回写路径盖上权威时间戳。
    pub async fn create_chat_history(&self, title: &str) -> Result<LocalChatHistory> {
        let history = LocalChatHistory {
            id: LocalChatHistory::generate_id(&self.ctx.username),
            title: title.to_string(),
            profile_name: self.ctx.current_profile.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
            timestamp: None,
            is_deleted: false,
        };
        self.history_dao
            .upsert_chat_history(&self.ctx.username, &history)
            .await?;
        info!("[Sync] 本地创建聊天: {}", history.id);
        self.enqueue_sync_item(SyncQueueItem::new(
            SyncAction::Create,
            SyncPayload::History(history.clone()),
        ));
        Ok(history)
    }

    pub fn sync_chat_history_create_or_update(&self, history: LocalChatHistory) {
        self.enqueue_sync_item(SyncQueueItem::new(
            SyncAction::Upsert,
            SyncPayload::History(history),
        ));
    }

    pub fn sync_chat_history_delete(&self, id: &str) {
        self.enqueue_sync_item(SyncQueueItem::new(
            SyncAction::Delete,
            SyncPayload::HistoryDelete { id: id.to_string() },
        ));
    }

    // ========== 队列分发 ==========

    /// 队列分发循环：逐条下发给执行单元并等待回执
    ///
    /// 一条在途、一条回执，下一条才会下发——"同一时刻至多一个
    /// 在途远端写"由这个循环结构本身保证，不需要额外的互斥标志。
    async fn run_dispatcher(
        self: Arc<Self>,
        mut queue_rx: mpsc::UnboundedReceiver<SyncQueueItem>,
        worker_tx: mpsc::UnboundedSender<WorkerRequest>,
        mut reply_rx: mpsc::UnboundedReceiver<WorkerReply>,
    ) {
        while let Some(mut item) = queue_rx.recv().await {
            // 分发前取一份新鲜凭证（token 可能在会话中途过期）
            match self.token_provider.get_token().await {
                Ok(token) => item.token = Some(token),
                Err(e) => {
                    warn!("[Sync] 获取凭证失败: {}, 条目: {}", e, item.describe());
                    self.handle_failed_item(item, true).await;
                    continue;
                }
            }

            if worker_tx.send(WorkerRequest { item }).is_err() {
                break;
            }
            let reply = match reply_rx.recv().await {
                Some(reply) => reply,
                None => break,
            };

            match reply.status {
                WorkerStatus::Synced(data) => {
                    if let Err(e) = self.handle_synced_item(&reply.item, data).await {
                        error!(
                            "[Sync] 确认回写失败: {}, 条目: {}",
                            e,
                            reply.item.describe()
                        );
                    }
                }
                WorkerStatus::Failed { retryable } => {
                    self.handle_failed_item(reply.item, retryable).await;
                }
            }
        }
        debug!("[Sync] 队列分发任务退出");
    }

    /// 失败处理：可重试且未达上限则回到队尾，否则丢弃并上报
    ///
    /// 回队尾必须经过入队通道：在途期间提交的条目已经在通道里排队，
    /// 重试不能插到它们前面。
    async fn handle_failed_item(&self, mut item: SyncQueueItem, retryable: bool) {
        item.token = None;
        item.retry_count += 1;
        if retryable && item.retry_count < self.config.max_retries {
            debug!(
                "[Sync] 条目重新入队: {}, 失败次数: {}",
                item.describe(),
                item.retry_count
            );
            if self.queue_tx.send(item).is_err() {
                warn!("[Sync] 队列分发任务已退出，重试条目被丢弃");
            }
        } else {
            warn!(
                "[Sync] ⚠️ 条目达到重试上限或不可恢复，丢弃: {}, 失败次数: {}",
                item.describe(),
                item.retry_count
            );
            self.listener.on_sync_item_dropped(item).await;
        }
    }

    // ========== 推送确认回写 ==========

    /// 队列条目被远端确认后的回写
    async fn handle_synced_item(&self, item: &SyncQueueItem, data: SyncedData) -> Result<()> {
        debug!("[Sync] 远端确认: {}", item.describe());
        match (&item.payload, data) {
            (SyncPayload::Message { chat_id, message }, SyncedData::Message(server_msg)) => {
                // 远端确认可能先于乐观本地写入到达：有界等待后仍缺失，
                // 就用队列里的载荷补建，而不是丢掉服务端的确认
                let wait = Duration::from_millis(self.config.wait_local_timeout_ms);
                let mut merged = match self
                    .message_store
                    .wait_for_message(chat_id, &message.message_id, wait)
                    .await?
                {
                    Some(local) => local,
                    None => {
                        warn!(
                            "[Sync] 本地消息缺失，用队列载荷补建: {}/{}",
                            chat_id, message.message_id
                        );
                        message.clone()
                    }
                };
                // 落库服务端确认时间戳
                if let Some(ts) = server_msg.timestamp {
                    merged.timestamp = Some(ts);
                }
                self.message_store.save_message(chat_id, &merged).await?;
            }
            (SyncPayload::History(history), SyncedData::History(server_history)) => {
                let merged = match self.history_dao.get_chat_history(&history.id).await? {
                    Some(mut local) => {
                        if let Some(ts) = server_history.timestamp {
                            local.timestamp = Some(ts);
                        }
                        local
                    }
                    // 本地记录消失（并发删除等）：采用服务端记录
                    None => server_history.clone(),
                };
                self.history_dao
                    .upsert_chat_history(&self.ctx.username, &merged)
                    .await?;
                // 初次创建 UI 已乐观展示，只有更新类动作需要通知
                if item.action != SyncAction::Create {
                    self.listener
                        .on_chat_history_change(HistoryChange::Updated, merged)
                        .await;
                }
            }
            (SyncPayload::HistoryDelete { id }, SyncedData::Deleted) => {
                self.history_dao.delete_chat_history(id).await?;
                self.message_store.delete_chat(id).await?;
                let tombstone = LocalChatHistory {
                    id: id.clone(),
                    title: String::new(),
                    profile_name: String::new(),
                    created_at: 0,
                    timestamp: None,
                    is_deleted: true,
                };
                self.listener
                    .on_chat_history_change(HistoryChange::Deleted, tombstone)
                    .await;
            }
            (
                SyncPayload::MessageDelete {
                    chat_id,
                    message_id,
                },
                SyncedData::Deleted,
            ) => {
                self.message_store.delete_message(chat_id, message_id).await?;
                self.listener.on_messages_refreshed(chat_id.clone()).await;
            }
            (payload, data) => {
                warn!(
                    "[Sync] 确认数据与载荷不匹配，忽略: {:?} / {:?}",
                    payload, data
                );
            }
        }
        Ok(())
    }

    // ========== 拉取合并 ==========

    /// 拉取并合并当前用户的聊天历史
    ///
    /// 远端拉取失败只记录日志并返回 Ok（本地状态暂时滞后，等下次拉取），
    /// 本地数据库错误向上传播。
    pub async fn sync_chat_histories(&self) -> Result<()> {
        let _guard = self.pull_lock.lock().await;
        info!("[Sync] 🔄 开始同步聊天历史，用户: {}", self.ctx.username);

        // 1. 本地状态与检查点
        let local = self
            .history_dao
            .get_chat_histories(&self.ctx.username)
            .await?;
        let last_timestamp = local.iter().filter_map(|h| h.timestamp).max();
        debug!(
            "[Sync] 本地聊天历史数: {}, 检查点: {:?}",
            local.len(),
            last_timestamp
        );

        // 2. 拉取远端变更（since 过滤只是优化，响应按候选集处理）
        let token = match self.token_provider.get_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("[Sync] 获取凭证失败，本次拉取跳过: {}", e);
                return Ok(());
            }
        };
        let remote = match self
            .gateway
            .fetch_chat_histories(&token, &self.ctx.username, last_timestamp)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                warn!("[Sync] 拉取聊天历史失败，本地状态暂时滞后: {}", e);
                return Ok(());
            }
        };
        info!("[Sync] 远端返回聊天历史数: {}", remote.len());

        // 3. 逐条合并
        let mut matched: HashSet<String> = HashSet::new();
        for remote_history in remote {
            matched.insert(remote_history.id.clone());
            // 合并决定前重新核对本地存在性（await 边界之间本地可能已变化）
            let local_history = self.history_dao.get_chat_history(&remote_history.id).await?;

            if remote_history.is_deleted {
                // 墓碑终态：删除本地记录及其整个消息集合，不复活
                if local_history.is_some() {
                    info!("[Sync]   墓碑删除聊天: {}", remote_history.id);
                    self.history_dao
                        .delete_chat_history(&remote_history.id)
                        .await?;
                    self.message_store.delete_chat(&remote_history.id).await?;
                    self.listener
                        .on_chat_history_change(HistoryChange::Deleted, remote_history)
                        .await;
                }
                continue;
            }

            match local_history {
                None => {
                    // 远端有、本地没有：必须建到本地，绝不能静默丢弃
                    info!("[Sync]   新增聊天: {}", remote_history.id);
                    self.history_dao
                        .upsert_chat_history(&self.ctx.username, &remote_history)
                        .await?;
                    self.listener
                        .on_chat_history_change(HistoryChange::Created, remote_history)
                        .await;
                }
                Some(local_history) => match local_history.timestamp {
                    // 本地从未同步过：远端是权威基线，无条件采用
                    None => {
                        info!("[Sync]   采用远端基线: {}", remote_history.id);
                        self.history_dao
                            .upsert_chat_history(&self.ctx.username, &remote_history)
                            .await?;
                        self.listener
                            .on_chat_history_change(HistoryChange::Updated, remote_history)
                            .await;
                    }
                    Some(local_ts) => {
                        // 远端缺时间戳视为更旧
                        let remote_ts = remote_history.timestamp.unwrap_or(i64::MIN);
                        if local_ts > remote_ts {
                            // 本地严格更新：入队推送，下次分发覆盖远端
                            info!(
                                "[Sync]   本地较新，入队推送: {} ({} > {})",
                                remote_history.id, local_ts, remote_ts
                            );
                            self.sync_chat_history_create_or_update(local_history);
                        } else if remote_ts > local_ts {
                            info!(
                                "[Sync]   采用远端: {} ({} > {})",
                                remote_history.id, remote_ts, local_ts
                            );
                            self.history_dao
                                .upsert_chat_history(&self.ctx.username, &remote_history)
                                .await?;
                            self.listener
                                .on_chat_history_change(HistoryChange::Updated, remote_history)
                                .await;
                        } else {
                            // 相等：已收敛
                            debug!("[Sync]   聊天 {} 无需更新", remote_history.id);
                        }
                    }
                },
            }
        }

        // 4. 首次同步：无时间戳且未被远端匹配的本地记录入队推送
        for local_history in local {
            if local_history.timestamp.is_some() || matched.contains(&local_history.id) {
                continue;
            }
            // 重新核对：仍然存在且仍未同步过才推
            if let Some(current) = self.history_dao.get_chat_history(&local_history.id).await? {
                if current.timestamp.is_none() {
                    info!("[Sync]   首次推送本地聊天: {}", current.id);
                    self.sync_chat_history_create_or_update(current);
                }
            }
        }

        // 5. 本地看护：清理不属于当前用户的聊天消息表
        let pruned = self
            .message_store
            .prune_foreign_chats(&self.ctx.username)
            .await?;
        if pruned > 0 {
            info!("[Sync] 清理他人聊天消息表 {} 张", pruned);
        }

        info!("[Sync] ✅ 聊天历史同步完成");
        Ok(())
    }

    /// 拉取并合并单个聊天的消息，算法与聊天历史一致，连接键为 messageId
    pub async fn sync_messages(&self, chat_id: &str) -> Result<()> {
        let _guard = self.pull_lock.lock().await;
        info!("[Sync] 🔄 开始同步消息，chatId: {}", chat_id);

        let local = self.message_store.get_messages(chat_id).await?;
        let last_timestamp = local.iter().filter_map(|m| m.timestamp).max();
        debug!(
            "[Sync] 本地消息数: {}, 检查点: {:?}",
            local.len(),
            last_timestamp
        );

        let token = match self.token_provider.get_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("[Sync] 获取凭证失败，本次拉取跳过: {}", e);
                return Ok(());
            }
        };
        let remote = match self
            .gateway
            .fetch_messages(&token, chat_id, last_timestamp)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                warn!("[Sync] 拉取消息失败，本地状态暂时滞后: {}", e);
                return Ok(());
            }
        };
        info!("[Sync] 远端返回消息数: {}", remote.len());

        let mut matched: HashSet<String> = HashSet::new();
        let mut changed = false;
        for remote_msg in remote {
            matched.insert(remote_msg.message_id.clone());
            let local_msg = self
                .message_store
                .get_message(chat_id, &remote_msg.message_id)
                .await?;

            if remote_msg.is_deleted {
                if local_msg.is_some() {
                    info!("[Sync]   墓碑删除消息: {}", remote_msg.message_id);
                    self.message_store
                        .delete_message(chat_id, &remote_msg.message_id)
                        .await?;
                    changed = true;
                }
                continue;
            }

            match local_msg {
                None => {
                    debug!("[Sync]   新增消息: {}", remote_msg.message_id);
                    self.message_store.save_message(chat_id, &remote_msg).await?;
                    changed = true;
                }
                Some(local_msg) => match local_msg.timestamp {
                    None => {
                        debug!("[Sync]   采用远端基线: {}", remote_msg.message_id);
                        self.message_store.save_message(chat_id, &remote_msg).await?;
                        changed = true;
                    }
                    Some(local_ts) => {
                        let remote_ts = remote_msg.timestamp.unwrap_or(i64::MIN);
                        if local_ts > remote_ts {
                            debug!(
                                "[Sync]   本地较新，入队推送: {} ({} > {})",
                                remote_msg.message_id, local_ts, remote_ts
                            );
                            self.sync_message_update(chat_id, local_msg);
                        } else if remote_ts > local_ts {
                            debug!(
                                "[Sync]   采用远端: {} ({} > {})",
                                remote_msg.message_id, remote_ts, local_ts
                            );
                            self.message_store.save_message(chat_id, &remote_msg).await?;
                            changed = true;
                        }
                    }
                },
            }
        }

        // 首次同步：无时间戳且未被远端匹配的本地消息入队推送
        for local_msg in local {
            if local_msg.timestamp.is_some() || matched.contains(&local_msg.message_id) {
                continue;
            }
            if let Some(current) = self
                .message_store
                .get_message(chat_id, &local_msg.message_id)
                .await?
            {
                if current.timestamp.is_none() {
                    debug!("[Sync]   首次推送本地消息: {}", current.message_id);
                    self.sync_message_create(chat_id, current);
                }
            }
        }

        if changed {
            self.listener.on_messages_refreshed(chat_id.to_string()).await;
        }
        info!("[Sync] ✅ 消息同步完成，chatId: {}", chat_id);
        Ok(())
    }
}
