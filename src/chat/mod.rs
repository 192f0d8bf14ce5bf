pub mod api;
pub mod auth;
pub mod db;
pub mod history;
pub mod listener;
pub mod message;
pub mod queue;
pub mod state;
pub mod syncer;

// 重新导出同步相关类型和函数
pub use syncer::{ChatSyncer, SyncerConfig};
pub use state::SyncContext;
