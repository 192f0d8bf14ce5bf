//! 聊天历史模块
//!
//! 聊天历史记录的本地模型与数据访问层

pub mod dao;
pub mod models;

// 重新导出主要类型
pub use dao::HistoryDao;
pub use models::LocalChatHistory;
