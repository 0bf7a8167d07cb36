use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates all tables and indexes. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            company_name TEXT,
            plan TEXT NOT NULL DEFAULT 'free',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS shops (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            shop_name TEXT NOT NULL,
            tts_shop_id TEXT UNIQUE,
            market TEXT,
            category TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            connected_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cr_projects (
            id TEXT PRIMARY KEY,
            shop_id TEXT NOT NULL,
            product_name TEXT NOT NULL,
            product_url TEXT,
            purpose TEXT,
            duration TEXT,
            tone TEXT,
            reference_videos TEXT,
            additional_instructions TEXT,
            ai_output TEXT,
            status TEXT NOT NULL DEFAULT 'draft',
            performance_data TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (shop_id) REFERENCES shops(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_base (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            category TEXT,
            source TEXT,
            performance_score REAL,
            vector_id TEXT UNIQUE,
            created_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS global_knowledge (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            source TEXT,
            vector_id TEXT UNIQUE,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            sources TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trend_products (
            id TEXT PRIMARY KEY,
            product_name TEXT NOT NULL,
            category TEXT,
            sold_count INTEGER,
            revenue REAL,
            growth_rate REAL,
            competition_score REAL,
            top_video_url TEXT,
            video_script TEXT,
            source TEXT,
            market TEXT,
            fetched_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_shops_user_id ON shops(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cr_projects_shop_id ON cr_projects(shop_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_knowledge_user_id ON knowledge_base(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_user_id ON conversations(user_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chat_messages_conversation_id ON chat_messages(conversation_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trend_products_market ON trend_products(market)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Shop, User};
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;
    use uuid::Uuid;

    async fn memory_pool() -> SqlitePool {
        // One connection: each :memory: connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_apply_schema_is_idempotent() {
        let pool = memory_pool().await;
        apply_schema(&pool).await.unwrap();
    }

    // Ids are written as hyphenated TEXT, so the row types must read them
    // back as text rather than as 16-byte blobs.
    #[tokio::test]
    async fn test_text_uuid_columns_decode_into_rows() {
        let pool = memory_pool().await;

        let user_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, plan, created_at) \
             VALUES (?, ?, ?, 'free', ?)",
        )
        .bind(user_id.to_string())
        .bind("seller@example.com")
        .bind("salt$digest")
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        let user: User = sqlx::query_as(
            "SELECT id, email, password_hash, company_name, plan, created_at \
             FROM users WHERE email = ?",
        )
        .bind("seller@example.com")
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(user.id.into_uuid(), user_id);

        let shop_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO shops (id, user_id, shop_name, is_active, connected_at) \
             VALUES (?, ?, ?, 1, ?)",
        )
        .bind(shop_id.to_string())
        .bind(user_id.to_string())
        .bind("Pet Corner")
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        let shop: Shop = sqlx::query_as(
            "SELECT id, user_id, shop_name, tts_shop_id, market, category, is_active, \
             connected_at FROM shops WHERE id = ?",
        )
        .bind(shop_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(shop.id.into_uuid(), shop_id);
        assert_eq!(shop.user_id.into_uuid(), user_id);
    }
}
