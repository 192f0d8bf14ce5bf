//! AI 聊天同步 CLI（测试版）
//!
//! 非交互式 CLI，用于测试和展示离线同步功能：
//! 执行一轮聊天历史拉取合并（可选再拉取某个聊天的消息），
//! 通过监听器回调输出所有合并事件，最后打印本地列表。

use aichat_sdk_core::chat::queue::SyncQueueItem;
use aichat_sdk_core::{
    ChatSyncer, HistoryChange, LocalChatHistory, StaticTokenProvider, SyncContext, SyncListener,
    SyncerConfig,
};
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

/// AI 聊天同步 CLI
#[derive(Parser, Debug)]
#[command(name = "aichat-cli")]
#[command(about = "AI 聊天同步 CLI - 用于测试和展示离线同步功能", long_about = None)]
struct Args {
    /// 用户名
    #[arg(short, long)]
    username: String,

    /// bearer 凭证（凭证获取在本工具范围之外）
    #[arg(short, long)]
    token: String,

    /// HTTP API 基础地址
    #[arg(long, default_value = "http://localhost:10002")]
    api_url: String,

    /// 本地 SQLite 数据库 URL
    #[arg(long, default_value = "sqlite://chats.db?mode=rwc")]
    db_url: String,

    /// 额外同步某个聊天的消息（可选）
    #[arg(long)]
    chat_id: Option<String>,

    /// 日志级别（默认: info,aichat_sdk_core=debug）
    #[arg(long, default_value = "info,aichat_sdk_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

/// 监听器：输出所有合并事件
struct CliSyncListener;

#[async_trait::async_trait]
impl SyncListener for CliSyncListener {
    async fn on_chat_history_change(&self, change: HistoryChange, history: LocalChatHistory) {
        match change {
            HistoryChange::Created => {
                info!("[CLI/Sync] 🆕 新增聊天: {} ({})", history.title, history.id)
            }
            HistoryChange::Updated => {
                info!("[CLI/Sync] 🔄 聊天变更: {} ({})", history.title, history.id)
            }
            HistoryChange::Deleted => info!("[CLI/Sync] 🗑️ 聊天删除: {}", history.id),
        }
    }

    async fn on_messages_refreshed(&self, chat_id: String) {
        info!("[CLI/Sync] 📨 消息列表已刷新: {}", chat_id);
    }

    async fn on_sync_item_dropped(&self, item: SyncQueueItem) {
        error!(
            "[CLI/Sync] ❌ 队列条目被丢弃（重试耗尽或不可恢复）: {}",
            item.describe()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level);

    info!("[CLI] 🚀 AI 聊天同步 CLI（测试模式）");
    info!("[CLI] 👤 用户: {}", args.username);
    info!("[CLI] 🌐 API: {}", args.api_url);
    info!("[CLI] 💾 数据库: {}", args.db_url);

    let ctx = SyncContext::new(args.username.clone(), String::new());
    let config = SyncerConfig::new(args.api_url, args.db_url);
    let provider = Arc::new(StaticTokenProvider::new(args.token));

    let syncer =
        ChatSyncer::with_listener(ctx, config, provider, Arc::new(CliSyncListener)).await?;

    // 拉取合并聊天历史
    info!("[CLI] 🔄 开始同步聊天历史...");
    syncer.sync_chat_histories().await?;

    let histories = syncer.get_chat_histories().await?;
    info!("[CLI] 📋 本地聊天历史（共 {} 条）:", histories.len());
    for history in histories.iter().take(10) {
        info!(
            "[CLI]   - {} | {} | 时间戳: {:?}",
            history.id, history.title, history.timestamp
        );
    }

    // 可选：同步某个聊天的消息
    if let Some(chat_id) = &args.chat_id {
        info!("[CLI] 🔄 开始同步消息，chatId: {}", chat_id);
        syncer.sync_messages(chat_id).await?;

        let messages = syncer.get_messages(chat_id).await?;
        info!("[CLI] 💬 本地消息（共 {} 条）:", messages.len());
        for msg in messages.iter().take(10) {
            let preview: String = msg.content.chars().take(30).collect();
            info!("[CLI]   - {} | {} | {}", msg.message_id, msg.role.as_str(), preview);
        }
    }

    // 给后台队列一点时间把拉取过程中入队的推送发完
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    info!("[CLI] 👋 完成");
    Ok(())
}
