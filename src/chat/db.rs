//! SQLite 数据库工具：统一创建连接池并初始化表结构
//!
//! 固定表（聊天历史、应用状态）在这里初始化；
//! 消息表按聊天动态建表，由 MessageStore 自己管理。

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

use crate::chat::history::dao::HistoryDao;
use crate::chat::state::AppStateDao;

/// 创建 SQLite 连接池
pub async fn create_sqlite_pool(db_url: &str) -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;
    Ok(pool)
}

/// 初始化所有固定表结构
pub async fn init_db(pool: &Pool<Sqlite>) -> Result<()> {
    HistoryDao::init_db_with_connection(pool).await?;
    AppStateDao::init_db_with_connection(pool).await?;
    Ok(())
}

/// 内存库连接池（测试与演示用）
///
/// 必须限制为单连接：`sqlite::memory:` 下每个连接是独立的数据库。
pub async fn memory_pool() -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}
