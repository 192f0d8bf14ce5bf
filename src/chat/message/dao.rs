//! 消息数据访问层（DAO）
//!
//! 本地消息存储（sqlx / SQLite，按聊天分表）。
//!
//! 每个聊天一张消息表（msg_<chat_id_sanitized>），删除聊天即整表删除，
//! 墓碑传播到聊天历史后其消息集合可以一次性清掉。

use crate::chat::message::models::{LocalMessage, MessageRole};
use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use std::time::Duration;
use tracing::{debug, warn};

/// 本地消息存储
pub struct MessageStore {
    pool: Pool<Sqlite>,
}

impl MessageStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// 将聊天 ID 转为表名（去掉非法字符，前缀 msg_）
    fn table_name(chat_id: &str) -> String {
        let sanitized: String = chat_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("msg_{}", sanitized)
    }

    /// 确保表存在
    async fn ensure_table(&self, chat_id: &str) -> Result<String> {
        let table = Self::table_name(chat_id);
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                message_id       TEXT PRIMARY KEY,
                role             TEXT NOT NULL DEFAULT 'user',
                content          TEXT NOT NULL DEFAULT '',
                is_active        INTEGER NOT NULL DEFAULT 1,
                timestamp        INTEGER,
                sequence_number  INTEGER,
                is_deleted       INTEGER NOT NULL DEFAULT 0,
                search_results   TEXT,
                attachments      TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_timestamp ON {table}(timestamp);
            "#,
            table = table
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .context("创建消息表失败")?;
        Ok(table)
    }

    /// 获取某个聊天的全部消息（表不存在时返回空列表）
    ///
    /// 按 timestamp 升序，时间戳相同按 sequence_number 排序
    pub async fn get_messages(&self, chat_id: &str) -> Result<Vec<LocalMessage>> {
        let table = self.ensure_table(chat_id).await?;
        let sql = format!(
            r#"
            SELECT * FROM {table}
            ORDER BY COALESCE(timestamp, 0), COALESCE(sequence_number, 0), message_id
            "#,
            table = table
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("查询消息列表失败")?;
        Ok(rows.into_iter().map(Self::row_to_message).collect())
    }

    /// 根据消息 ID 查询单条消息
    pub async fn get_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Option<LocalMessage>> {
        let table = self.ensure_table(chat_id).await?;
        let sql = format!(
            "SELECT * FROM {table} WHERE message_id = ? LIMIT 1",
            table = table
        );
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("查询单条消息失败")?;
        Ok(row.map(Self::row_to_message))
    }

    /// 按 message_id upsert 一条消息
    ///
    /// 传入记录缺失 search_results / attachments 时保留库里的原值
    /// （COALESCE），其余字段整体覆盖。
    pub async fn save_message(&self, chat_id: &str, msg: &LocalMessage) -> Result<()> {
        let table = self.ensure_table(chat_id).await?;
        let sql = format!(
            r#"
            INSERT INTO {table} (
                message_id, role, content, is_active, timestamp,
                sequence_number, is_deleted, search_results, attachments
            ) VALUES (?,?,?,?,?,?,?,?,?)
            ON CONFLICT(message_id) DO UPDATE SET
                role = excluded.role,
                content = excluded.content,
                is_active = excluded.is_active,
                timestamp = excluded.timestamp,
                sequence_number = excluded.sequence_number,
                is_deleted = excluded.is_deleted,
                search_results = COALESCE(excluded.search_results, search_results),
                attachments = COALESCE(excluded.attachments, attachments)
            "#,
            table = table
        );

        let search_results = msg
            .search_results
            .as_ref()
            .map(|v| v.to_string());
        let attachments = msg.attachments.as_ref().map(|v| v.to_string());

        sqlx::query(&sql)
            .bind(&msg.message_id)
            .bind(msg.role.as_str())
            .bind(&msg.content)
            .bind(if msg.is_active { 1 } else { 0 })
            .bind(msg.timestamp)
            .bind(msg.sequence_number)
            .bind(if msg.is_deleted { 1 } else { 0 })
            .bind(search_results)
            .bind(attachments)
            .execute(&self.pool)
            .await
            .context("插入或更新消息失败")?;
        Ok(())
    }

    /// 按 ID 删除消息，返回是否真的删除了记录
    pub async fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<bool> {
        let table = self.ensure_table(chat_id).await?;
        let sql = format!(
            "DELETE FROM {table} WHERE message_id = ?",
            table = table
        );
        let res = sqlx::query(&sql)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .context("删除消息失败")?;
        Ok(res.rows_affected() > 0)
    }

    /// 删除整个聊天的消息集合（整表删除）
    pub async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let table = Self::table_name(chat_id);
        let sql = format!("DROP TABLE IF EXISTS {table}", table = table);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .context("删除聊天消息表失败")?;
        Ok(())
    }

    /// 等待消息在本地出现（有界轮询 + 退避）
    ///
    /// 远端确认可能先于乐观本地写入到达，这里轮询到超时为止；
    /// 超时后返回 None，由调用方决定是否用队列里的载荷补建记录。
    pub async fn wait_for_message(
        &self,
        chat_id: &str,
        message_id: &str,
        timeout: Duration,
    ) -> Result<Option<LocalMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = Duration::from_millis(20);

        loop {
            if let Some(msg) = self.get_message(chat_id, message_id).await? {
                return Ok(Some(msg));
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "[MsgStore] 等待本地消息超时: chatId={}, messageId={}",
                    chat_id, message_id
                );
                return Ok(None);
            }
            tokio::time::sleep(interval).await;
            // 指数退避，上限 200ms
            interval = (interval * 2).min(Duration::from_millis(200));
        }
    }

    /// 列出所有按聊天分表的消息表对应的聊天 ID（表名去掉 msg_ 前缀）
    pub async fn chat_table_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name LIKE 'msg_%'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("枚举消息表失败")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let name: String = row.get("name");
                name.trim_start_matches("msg_").to_string()
            })
            .collect())
    }

    /// 清理不属于当前用户的聊天消息表（本地看护），返回清理条数
    ///
    /// 聊天 ID 形如 `<用户名>_<十六进制随机后缀>`，后缀不含下划线。
    /// 归属判断要求前缀之后正好是这样的后缀，仅靠 starts_with 会把
    /// alice_smith 的聊天误判为 alice 的。
    pub async fn prune_foreign_chats(&self, username: &str) -> Result<usize> {
        let prefix = {
            let sanitized: String = username
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            format!("{}_", sanitized)
        };

        let mut pruned = 0usize;
        for chat_id in self.chat_table_ids().await? {
            let owned = chat_id
                .strip_prefix(&prefix)
                .map(|suffix| !suffix.is_empty() && !suffix.contains('_'))
                .unwrap_or(false);
            if !owned {
                debug!("[MsgStore] 清理他人聊天消息表: {}", chat_id);
                self.delete_chat(&chat_id).await?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    fn row_to_message(row: sqlx::sqlite::SqliteRow) -> LocalMessage {
        let role: String = row.try_get("role").unwrap_or_default();
        let is_active: i64 = row.try_get("is_active").unwrap_or(1);
        let is_deleted: i64 = row.try_get("is_deleted").unwrap_or(0);
        let search_results: Option<String> = row.try_get("search_results").unwrap_or(None);
        let attachments: Option<String> = row.try_get("attachments").unwrap_or(None);

        LocalMessage {
            message_id: row.try_get("message_id").unwrap_or_default(),
            role: MessageRole::from_str(&role),
            content: row.try_get("content").unwrap_or_default(),
            is_active: is_active != 0,
            timestamp: row.try_get("timestamp").unwrap_or(None),
            sequence_number: row.try_get("sequence_number").unwrap_or(None),
            is_deleted: is_deleted != 0,
            search_results: search_results.and_then(|s| serde_json::from_str(&s).ok()),
            attachments: attachments.and_then(|s| serde_json::from_str(&s).ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::db::memory_pool;
    use serde_json::json;

    fn sample(id: &str, ts: Option<i64>) -> LocalMessage {
        LocalMessage {
            message_id: id.to_string(),
            role: MessageRole::User,
            content: "你好".to_string(),
            is_active: true,
            timestamp: ts,
            sequence_number: None,
            is_deleted: false,
            search_results: None,
            attachments: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_order() -> Result<()> {
        let pool = memory_pool().await?;
        let store = MessageStore::new(pool);

        // 表还不存在时返回空列表
        assert!(store.get_messages("alice_c1").await?.is_empty());

        store.save_message("alice_c1", &sample("m2", Some(200))).await?;
        store.save_message("alice_c1", &sample("m1", Some(100))).await?;
        // 时间戳相同时按序号排
        let mut a = sample("m4", Some(300));
        a.sequence_number = Some(2);
        let mut b = sample("m3", Some(300));
        b.sequence_number = Some(1);
        store.save_message("alice_c1", &a).await?;
        store.save_message("alice_c1", &b).await?;

        let list = store.get_messages("alice_c1").await?;
        let ids: Vec<&str> = list.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3", "m4"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_upsert_preserves_structured_fields() -> Result<()> {
        let pool = memory_pool().await?;
        let store = MessageStore::new(pool);

        let mut first = sample("m1", Some(100));
        first.search_results = Some(json!([{"url": "https://example.com"}]));
        first.attachments = Some(json!(["img1.png"]));
        store.save_message("alice_c1", &first).await?;

        // 第二次 upsert 不带结构化字段，库里的原值必须保留
        let mut second = sample("m1", Some(200));
        second.content = "改过的内容".to_string();
        store.save_message("alice_c1", &second).await?;

        let got = store.get_message("alice_c1", "m1").await?.unwrap();
        assert_eq!(got.content, "改过的内容");
        assert_eq!(got.timestamp, Some(200));
        assert_eq!(got.search_results, Some(json!([{"url": "https://example.com"}])));
        assert_eq!(got.attachments, Some(json!(["img1.png"])));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_and_drop_chat() -> Result<()> {
        let pool = memory_pool().await?;
        let store = MessageStore::new(pool);

        store.save_message("alice_c1", &sample("m1", Some(1))).await?;
        assert!(store.delete_message("alice_c1", "m1").await?);
        assert!(!store.delete_message("alice_c1", "m1").await?);

        store.save_message("alice_c1", &sample("m2", Some(2))).await?;
        store.delete_chat("alice_c1").await?;
        assert!(store.get_messages("alice_c1").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_message_sees_late_write() -> Result<()> {
        let pool = memory_pool().await?;
        let store = std::sync::Arc::new(MessageStore::new(pool.clone()));

        let writer = std::sync::Arc::new(MessageStore::new(pool));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let _ = writer.save_message("alice_c1", &sample("m1", Some(1))).await;
        });

        let got = store
            .wait_for_message("alice_c1", "m1", Duration::from_millis(500))
            .await?;
        assert!(got.is_some());

        // 不存在的消息：超时后返回 None 而不是报错
        let missing = store
            .wait_for_message("alice_c1", "nope", Duration::from_millis(80))
            .await?;
        assert!(missing.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_foreign_chats() -> Result<()> {
        let pool = memory_pool().await?;
        let store = MessageStore::new(pool);

        store.save_message("alice_c1", &sample("m1", Some(1))).await?;
        store.save_message("bob_c9", &sample("m1", Some(1))).await?;
        // 用户名互为前缀时不能误留：alice_smith 的聊天不属于 alice
        store
            .save_message("alice_smith_c1", &sample("m1", Some(1)))
            .await?;

        let pruned = store.prune_foreign_chats("alice").await?;
        assert_eq!(pruned, 2);
        let ids = store.chat_table_ids().await?;
        assert_eq!(ids, vec!["alice_c1".to_string()]);
        Ok(())
    }
}
