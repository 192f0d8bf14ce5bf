//! 消息模块
//!
//! 消息记录的本地模型与按聊天分表的消息存储

pub mod dao;
pub mod models;

// 重新导出主要类型
pub use dao::MessageStore;
pub use models::{LocalMessage, MessageRole};
