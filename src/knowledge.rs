//! Knowledge base routes: the per-user layer and the admin-managed global
//! layer that feed the copilot's retrieval.
//!
//! Writes go to the database first and then, best-effort, to the vector
//! index: the entry is embedded and upserted into the owner's namespace
//! (or `"global"`). If embedding or the index is unavailable the entry
//! still exists and the copilot's database fallback can find it; the row's
//! `vector_id` stays NULL so the gap is visible.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::embedding;
use crate::models::{GlobalKnowledgeEntry, KnowledgeCategory, KnowledgeEntry, User};
use crate::server::{AppError, AppState};
use crate::vector::GLOBAL_NAMESPACE;

const ENTRY_COLUMNS: &str = "id, user_id, title, content, category, source, \
     performance_score, vector_id, created_at";
const GLOBAL_COLUMNS: &str = "id, title, content, source, vector_id, created_at";

#[derive(Debug, Deserialize)]
pub struct EntryCreate {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<KnowledgeCategory>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub performance_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct EntryUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<KnowledgeCategory>,
    pub source: Option<String>,
    pub performance_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct EntryListParams {
    pub category: Option<KnowledgeCategory>,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct GlobalCreate {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GlobalUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub source: Option<String>,
}

fn require_admin(state: &AppState, user: &User) -> Result<(), AppError> {
    if state.config.auth.is_admin(&user.email) {
        Ok(())
    } else {
        Err(AppError::forbidden("Admin access required"))
    }
}

/// Embed `title\n\ncontent` and upsert it under `namespace`. Returns the
/// vector id on success, `None` (with a warning logged) on any failure.
async fn index_entry(
    state: &AppState,
    namespace: &str,
    entry_id: Uuid,
    title: &str,
    content: &str,
) -> Option<String> {
    if !state.config.embedding.is_enabled() || !state.config.vector.is_enabled() {
        return None;
    }

    let text = format!("{}\n\n{}", title, content);
    let values = match embedding::embed_document(&state.config.embedding, &text).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(entry_id = %entry_id, error = %e, "embedding failed, entry not indexed");
            return None;
        }
    };

    let vector_id = entry_id.to_string();
    let metadata = serde_json::json!({ "title": title });
    match state.vector.upsert(namespace, &vector_id, &values, metadata).await {
        Ok(()) => Some(vector_id),
        Err(e) => {
            tracing::warn!(entry_id = %entry_id, error = %e, "vector upsert failed, entry not indexed");
            None
        }
    }
}

/// Best-effort removal from the vector index.
async fn unindex_entry(state: &AppState, namespace: &str, vector_id: Option<String>) {
    let Some(vector_id) = vector_id else { return };
    if !state.config.vector.is_enabled() {
        return;
    }
    if let Err(e) = state.vector.delete(namespace, &[vector_id]).await {
        tracing::warn!(error = %e, "vector delete failed");
    }
}

async fn fetch_owned_entry(
    state: &AppState,
    entry_id: Uuid,
    user_id: Uuid,
) -> Result<KnowledgeEntry, AppError> {
    let entry = sqlx::query_as::<_, KnowledgeEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM knowledge_base WHERE id = ? AND user_id = ?"
    ))
    .bind(entry_id.to_string())
    .bind(user_id.to_string())
    .fetch_optional(&state.pool)
    .await?;

    entry.ok_or_else(|| AppError::not_found("Knowledge entry not found"))
}

// ============ Per-user routes ============

/// Handler for `GET /api/v1/knowledge`.
pub async fn list_entries(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<EntryListParams>,
) -> Result<Json<Vec<KnowledgeEntry>>, AppError> {
    let entries = if let Some(category) = params.category {
        sqlx::query_as::<_, KnowledgeEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM knowledge_base \
             WHERE user_id = ? AND category = ? \
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(user.id.to_string())
        .bind(category)
        .bind(params.limit.clamp(1, 200))
        .bind(params.skip.max(0))
        .fetch_all(&state.pool)
        .await?
    } else {
        sqlx::query_as::<_, KnowledgeEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM knowledge_base \
             WHERE user_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(user.id.to_string())
        .bind(params.limit.clamp(1, 200))
        .bind(params.skip.max(0))
        .fetch_all(&state.pool)
        .await?
    };

    Ok(Json(entries))
}

/// Handler for `POST /api/v1/knowledge`.
pub async fn create_entry(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<EntryCreate>,
) -> Result<(StatusCode, Json<KnowledgeEntry>), AppError> {
    if req.title.trim().is_empty() || req.content.trim().is_empty() {
        return Err(AppError::bad_request("title and content must not be empty"));
    }

    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO knowledge_base (id, user_id, title, content, category, source, \
         performance_score, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(user.id.to_string())
    .bind(req.title.trim())
    .bind(req.content.trim())
    .bind(req.category)
    .bind(&req.source)
    .bind(req.performance_score)
    .bind(Utc::now())
    .execute(&state.pool)
    .await?;

    let namespace = user.id.to_string();
    if let Some(vector_id) =
        index_entry(&state, &namespace, id, req.title.trim(), req.content.trim()).await
    {
        sqlx::query("UPDATE knowledge_base SET vector_id = ? WHERE id = ?")
            .bind(&vector_id)
            .bind(id.to_string())
            .execute(&state.pool)
            .await?;
    }

    let entry = fetch_owned_entry(&state, id, user.id.into_uuid()).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Handler for `GET /api/v1/knowledge/{entry_id}`.
pub async fn get_entry(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<KnowledgeEntry>, AppError> {
    let entry = fetch_owned_entry(&state, entry_id, user.id.into_uuid()).await?;
    Ok(Json(entry))
}

/// Handler for `PATCH /api/v1/knowledge/{entry_id}`. Re-embeds when the
/// title or content changed.
pub async fn update_entry(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(entry_id): Path<Uuid>,
    Json(req): Json<EntryUpdate>,
) -> Result<Json<KnowledgeEntry>, AppError> {
    let mut entry = fetch_owned_entry(&state, entry_id, user.id.into_uuid()).await?;

    let reindex = req.title.is_some() || req.content.is_some();
    if let Some(title) = req.title {
        entry.title = title;
    }
    if let Some(content) = req.content {
        entry.content = content;
    }
    if let Some(category) = req.category {
        entry.category = Some(category);
    }
    if let Some(source) = req.source {
        entry.source = Some(source);
    }
    if let Some(score) = req.performance_score {
        entry.performance_score = Some(score);
    }

    if reindex {
        // Drop the old vector first so a failed re-embed cannot leave the
        // stale text serving retrieval.
        let namespace = user.id.to_string();
        unindex_entry(&state, &namespace, entry.vector_id.take()).await;
        entry.vector_id =
            index_entry(&state, &namespace, entry.id.into_uuid(), &entry.title, &entry.content).await;
    }

    sqlx::query(
        "UPDATE knowledge_base SET title = ?, content = ?, category = ?, source = ?, \
         performance_score = ?, vector_id = ? WHERE id = ? AND user_id = ?",
    )
    .bind(&entry.title)
    .bind(&entry.content)
    .bind(entry.category)
    .bind(&entry.source)
    .bind(entry.performance_score)
    .bind(&entry.vector_id)
    .bind(entry_id.to_string())
    .bind(user.id.to_string())
    .execute(&state.pool)
    .await?;

    Ok(Json(entry))
}

/// Handler for `DELETE /api/v1/knowledge/{entry_id}`.
pub async fn delete_entry(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(entry_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let entry = fetch_owned_entry(&state, entry_id, user.id.into_uuid()).await?;

    sqlx::query("DELETE FROM knowledge_base WHERE id = ? AND user_id = ?")
        .bind(entry_id.to_string())
        .bind(user.id.to_string())
        .execute(&state.pool)
        .await?;

    unindex_entry(&state, &user.id.to_string(), entry.vector_id).await;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Admin (global) routes ============

async fn fetch_global_entry(
    state: &AppState,
    entry_id: Uuid,
) -> Result<GlobalKnowledgeEntry, AppError> {
    let entry = sqlx::query_as::<_, GlobalKnowledgeEntry>(&format!(
        "SELECT {GLOBAL_COLUMNS} FROM global_knowledge WHERE id = ?"
    ))
    .bind(entry_id.to_string())
    .fetch_optional(&state.pool)
    .await?;

    entry.ok_or_else(|| AppError::not_found("Knowledge entry not found"))
}

/// Handler for `GET /api/v1/admin/knowledge`.
pub async fn list_global(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<EntryListParams>,
) -> Result<Json<Vec<GlobalKnowledgeEntry>>, AppError> {
    require_admin(&state, &user)?;

    let entries = sqlx::query_as::<_, GlobalKnowledgeEntry>(&format!(
        "SELECT {GLOBAL_COLUMNS} FROM global_knowledge \
         ORDER BY created_at DESC LIMIT ? OFFSET ?"
    ))
    .bind(params.limit.clamp(1, 200))
    .bind(params.skip.max(0))
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(entries))
}

/// Handler for `POST /api/v1/admin/knowledge`.
pub async fn create_global(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<GlobalCreate>,
) -> Result<(StatusCode, Json<GlobalKnowledgeEntry>), AppError> {
    require_admin(&state, &user)?;
    if req.title.trim().is_empty() || req.content.trim().is_empty() {
        return Err(AppError::bad_request("title and content must not be empty"));
    }

    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO global_knowledge (id, title, content, source, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(req.title.trim())
    .bind(req.content.trim())
    .bind(&req.source)
    .bind(Utc::now())
    .execute(&state.pool)
    .await?;

    if let Some(vector_id) =
        index_entry(&state, GLOBAL_NAMESPACE, id, req.title.trim(), req.content.trim()).await
    {
        sqlx::query("UPDATE global_knowledge SET vector_id = ? WHERE id = ?")
            .bind(&vector_id)
            .bind(id.to_string())
            .execute(&state.pool)
            .await?;
    }

    let entry = fetch_global_entry(&state, id).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Handler for `GET /api/v1/admin/knowledge/{entry_id}`.
pub async fn get_global(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<GlobalKnowledgeEntry>, AppError> {
    require_admin(&state, &user)?;
    let entry = fetch_global_entry(&state, entry_id).await?;
    Ok(Json(entry))
}

/// Handler for `PATCH /api/v1/admin/knowledge/{entry_id}`.
pub async fn update_global(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(entry_id): Path<Uuid>,
    Json(req): Json<GlobalUpdate>,
) -> Result<Json<GlobalKnowledgeEntry>, AppError> {
    require_admin(&state, &user)?;
    let mut entry = fetch_global_entry(&state, entry_id).await?;

    let reindex = req.title.is_some() || req.content.is_some();
    if let Some(title) = req.title {
        entry.title = title;
    }
    if let Some(content) = req.content {
        entry.content = content;
    }
    if let Some(source) = req.source {
        entry.source = Some(source);
    }

    if reindex {
        unindex_entry(&state, GLOBAL_NAMESPACE, entry.vector_id.take()).await;
        entry.vector_id =
            index_entry(&state, GLOBAL_NAMESPACE, entry.id.into_uuid(), &entry.title, &entry.content).await;
    }

    sqlx::query(
        "UPDATE global_knowledge SET title = ?, content = ?, source = ?, vector_id = ? \
         WHERE id = ?",
    )
    .bind(&entry.title)
    .bind(&entry.content)
    .bind(&entry.source)
    .bind(&entry.vector_id)
    .bind(entry_id.to_string())
    .execute(&state.pool)
    .await?;

    Ok(Json(entry))
}

/// Handler for `DELETE /api/v1/admin/knowledge/{entry_id}`.
pub async fn delete_global(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(entry_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_admin(&state, &user)?;
    let entry = fetch_global_entry(&state, entry_id).await?;

    sqlx::query("DELETE FROM global_knowledge WHERE id = ?")
        .bind(entry_id.to_string())
        .execute(&state.pool)
        .await?;

    unindex_entry(&state, GLOBAL_NAMESPACE, entry.vector_id).await;
    Ok(StatusCode::NO_CONTENT)
}
