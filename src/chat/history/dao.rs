//! 聊天历史数据访问层（DAO）
//!
//! 负责聊天历史列表的所有数据库操作，将数据访问逻辑与同步逻辑分离。
//! 按用户维度存储，键不存在时返回空列表而不是错误。

use crate::chat::history::models::LocalChatHistory;
use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

/// 聊天历史 DAO（基于 sqlx）
pub struct HistoryDao {
    db: Pool<Sqlite>,
}

impl HistoryDao {
    /// 创建新的聊天历史 DAO
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 初始化数据库表结构
    pub async fn init_db(&self) -> Result<()> {
        Self::init_db_with_connection(&self.db).await
    }

    /// 使用共享连接初始化数据库表结构（静态方法）
    pub async fn init_db_with_connection(db: &Pool<Sqlite>) -> Result<()> {
        info!("[HistDAO/DB] 初始化聊天历史表结构");

        let sql = r#"
            CREATE TABLE IF NOT EXISTS local_chat_histories (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                profile_name TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL DEFAULT 0,
                timestamp INTEGER,
                is_deleted INTEGER NOT NULL DEFAULT 0
            )
        "#;
        sqlx::query(sql)
            .execute(db)
            .await
            .context("创建聊天历史表失败")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_local_chat_histories_username
            ON local_chat_histories(username)
            "#,
        )
        .execute(db)
        .await
        .context("创建聊天历史索引失败")?;

        Ok(())
    }

    /// 获取某用户的全部聊天历史（没有任何记录时返回空列表）
    pub async fn get_chat_histories(&self, username: &str) -> Result<Vec<LocalChatHistory>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, profile_name, created_at, timestamp, is_deleted
            FROM local_chat_histories
            WHERE username = ?
            ORDER BY created_at
            "#,
        )
        .bind(username)
        .fetch_all(&self.db)
        .await
        .context("查询聊天历史列表失败")?;

        let histories: Vec<LocalChatHistory> = rows.into_iter().map(Self::row_to_history).collect();

        debug!(
            "[HistDAO] 获取用户 {} 的聊天历史，共 {} 条",
            username,
            histories.len()
        );
        Ok(histories)
    }

    /// 根据 ID 查询单条聊天历史
    pub async fn get_chat_history(&self, id: &str) -> Result<Option<LocalChatHistory>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, profile_name, created_at, timestamp, is_deleted
            FROM local_chat_histories
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("查询单条聊天历史失败")?;

        Ok(row.map(Self::row_to_history))
    }

    /// 插入或按 ID 更新一条聊天历史
    pub async fn upsert_chat_history(
        &self,
        username: &str,
        history: &LocalChatHistory,
    ) -> Result<()> {
        let sql = r#"
            INSERT INTO local_chat_histories (
                id, username, title, profile_name, created_at, timestamp, is_deleted
            ) VALUES (?,?,?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                title = excluded.title,
                profile_name = excluded.profile_name,
                created_at = excluded.created_at,
                timestamp = excluded.timestamp,
                is_deleted = excluded.is_deleted
        "#;

        sqlx::query(sql)
            .bind(&history.id)
            .bind(username)
            .bind(&history.title)
            .bind(&history.profile_name)
            .bind(history.created_at)
            .bind(history.timestamp)
            .bind(if history.is_deleted { 1 } else { 0 })
            .execute(&self.db)
            .await
            .context("插入或更新聊天历史失败")?;

        Ok(())
    }

    /// 按 ID 删除聊天历史，返回是否真的删除了记录
    pub async fn delete_chat_history(&self, id: &str) -> Result<bool> {
        let res = sqlx::query(
            r#"
            DELETE FROM local_chat_histories WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await
        .context("删除聊天历史失败")?;
        Ok(res.rows_affected() > 0)
    }

    fn row_to_history(row: sqlx::sqlite::SqliteRow) -> LocalChatHistory {
        let is_deleted: i64 = row.get("is_deleted");
        LocalChatHistory {
            id: row.get("id"),
            title: row.get("title"),
            profile_name: row.get("profile_name"),
            created_at: row.get("created_at"),
            timestamp: row.get("timestamp"),
            is_deleted: is_deleted != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::db::memory_pool;

    fn sample(id: &str, ts: Option<i64>) -> LocalChatHistory {
        LocalChatHistory {
            id: id.to_string(),
            title: "新对话".to_string(),
            profile_name: "default".to_string(),
            created_at: 1_700_000_000_000,
            timestamp: ts,
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get_round() -> Result<()> {
        let pool = memory_pool().await?;
        let dao = HistoryDao::new(pool);
        dao.init_db().await?;

        // 键不存在时返回空列表而不是错误
        assert!(dao.get_chat_histories("alice").await?.is_empty());

        dao.upsert_chat_history("alice", &sample("alice_1", None))
            .await?;
        let mut later = sample("alice_2", Some(100));
        later.created_at += 1_000;
        dao.upsert_chat_history("alice", &later).await?;
        dao.upsert_chat_history("bob", &sample("bob_1", Some(50)))
            .await?;

        let list = dao.get_chat_histories("alice").await?;
        assert_eq!(list.len(), 2);
        // timestamp 的 None / Some 必须原样存取
        assert_eq!(list[0].timestamp, None);
        assert_eq!(list[1].timestamp, Some(100));

        // 同 ID 再次 upsert 更新字段
        let mut updated = sample("alice_1", Some(200));
        updated.title = "改名".to_string();
        dao.upsert_chat_history("alice", &updated).await?;
        let got = dao.get_chat_history("alice_1").await?.unwrap();
        assert_eq!(got.title, "改名");
        assert_eq!(got.timestamp, Some(200));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_reports_removal() -> Result<()> {
        let pool = memory_pool().await?;
        let dao = HistoryDao::new(pool);
        dao.init_db().await?;

        dao.upsert_chat_history("alice", &sample("alice_1", Some(1)))
            .await?;
        assert!(dao.delete_chat_history("alice_1").await?);
        // 再删一次：不存在，返回 false 而不是报错
        assert!(!dao.delete_chat_history("alice_1").await?);
        assert!(dao.get_chat_history("alice_1").await?.is_none());
        Ok(())
    }
}
