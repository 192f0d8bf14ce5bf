//! 同步上下文与应用状态存储
//!
//! 当前用户 / 当前 AI 角色配置不再是模块级单例，而是显式的上下文对象，
//! 由调用方构造并传入存储层和同步器。`init` 从持久化状态加载。

use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

/// 同步上下文：当前用户与当前 AI 角色配置
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    pub username: String,
    pub current_profile: String,
}

impl SyncContext {
    pub fn new(username: impl Into<String>, current_profile: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            current_profile: current_profile.into(),
        }
    }

    /// 从持久化状态加载上下文；没有持久化记录时返回默认值
    pub async fn init(pool: &Pool<Sqlite>) -> Result<Self> {
        let dao = AppStateDao::new(pool.clone());
        dao.init_db().await?;
        let ctx = dao.load().await?.unwrap_or_default();
        debug!(
            "[State] 加载同步上下文: username={}, profile={}",
            ctx.username, ctx.current_profile
        );
        Ok(ctx)
    }

    /// 持久化当前上下文
    pub async fn save(&self, pool: &Pool<Sqlite>) -> Result<()> {
        AppStateDao::new(pool.clone()).save(self).await
    }
}

/// 应用状态 DAO：单行表，保存 `{username, currentProfile}` 指针
pub struct AppStateDao {
    db: Pool<Sqlite>,
}

impl AppStateDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    pub async fn init_db(&self) -> Result<()> {
        Self::init_db_with_connection(&self.db).await
    }

    pub async fn init_db_with_connection(db: &Pool<Sqlite>) -> Result<()> {
        info!("[State/DB] 初始化应用状态表结构");
        let sql = r#"
            CREATE TABLE IF NOT EXISTS local_app_state (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                username TEXT NOT NULL DEFAULT '',
                current_profile TEXT NOT NULL DEFAULT ''
            )
        "#;
        sqlx::query(sql)
            .execute(db)
            .await
            .context("创建应用状态表失败")?;
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<SyncContext>> {
        let row = sqlx::query(
            r#"
            SELECT username, current_profile FROM local_app_state WHERE id = 0
            "#,
        )
        .fetch_optional(&self.db)
        .await
        .context("读取应用状态失败")?;

        Ok(row.map(|row| SyncContext {
            username: row.get("username"),
            current_profile: row.get("current_profile"),
        }))
    }

    pub async fn save(&self, ctx: &SyncContext) -> Result<()> {
        let sql = r#"
            INSERT INTO local_app_state (id, username, current_profile)
            VALUES (0, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                current_profile = excluded.current_profile
        "#;
        sqlx::query(sql)
            .bind(&ctx.username)
            .bind(&ctx.current_profile)
            .execute(&self.db)
            .await
            .context("保存应用状态失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::db::memory_pool;

    #[tokio::test]
    async fn test_init_defaults_then_round_trip() -> Result<()> {
        let pool = memory_pool().await?;

        // 空库：init 返回默认值
        let ctx = SyncContext::init(&pool).await?;
        assert_eq!(ctx.username, "");

        let ctx = SyncContext::new("alice", "gpt-tutor");
        ctx.save(&pool).await?;

        let loaded = SyncContext::init(&pool).await?;
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.current_profile, "gpt-tutor");

        // 再存覆盖单行
        SyncContext::new("bob", "coder").save(&pool).await?;
        let loaded = SyncContext::init(&pool).await?;
        assert_eq!(loaded.username, "bob");
        Ok(())
    }
}
