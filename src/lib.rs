pub mod chat;

// 重新导出常用类型和函数，方便外部使用
pub use chat::{
    api::{ChatApi, RemoteGateway, RequestError},
    auth::{StaticTokenProvider, TokenProvider},
    history::LocalChatHistory,
    listener::{EmptySyncListener, HistoryChange, SyncListener},
    message::{LocalMessage, MessageRole},
    queue::{SyncAction, SyncItemKind, SyncPayload, SyncQueueItem},
    ChatSyncer, SyncContext, SyncerConfig,
};
