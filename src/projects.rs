//! Creative-brief project routes.
//!
//! Projects hang off shops, so tenancy is enforced by joining through the
//! shop's `user_id`. Generation is synchronous: the project is written in
//! `generating` state, the model is called, and the row is updated to
//! `generated` (or back to `draft` with an error record if the call fails).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use sqlx::types::Json as SqlJson;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::brief::{self, BriefRequest, BRIEF_SYSTEM_PROMPT};
use crate::models::{CrProject, ProjectDuration, ProjectPurpose, ProjectStatus, Shop};
use crate::server::{AppError, AppState};
use crate::{ai, shops};

const PROJECT_COLUMNS: &str = "p.id, p.shop_id, p.product_name, p.product_url, p.purpose, \
     p.duration, p.tone, p.reference_videos, p.additional_instructions, p.ai_output, \
     p.status, p.performance_data, p.created_at";

#[derive(Debug, Deserialize)]
pub struct ProjectListParams {
    pub shop_id: Option<Uuid>,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub shop_id: Uuid,
    pub product_name: String,
    #[serde(default)]
    pub product_url: Option<String>,
    #[serde(default)]
    pub purpose: Option<ProjectPurpose>,
    #[serde(default)]
    pub duration: Option<ProjectDuration>,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub reference_videos: Vec<String>,
    #[serde(default)]
    pub additional_instructions: Option<String>,
}

async fn fetch_owned_project(
    state: &AppState,
    project_id: Uuid,
    user_id: Uuid,
) -> Result<CrProject, AppError> {
    let project = sqlx::query_as::<_, CrProject>(&format!(
        "SELECT {PROJECT_COLUMNS} FROM cr_projects p \
         JOIN shops s ON s.id = p.shop_id \
         WHERE p.id = ? AND s.user_id = ?"
    ))
    .bind(project_id.to_string())
    .bind(user_id.to_string())
    .fetch_optional(&state.pool)
    .await?;

    project.ok_or_else(|| AppError::not_found("Project not found"))
}

/// Handler for `GET /api/v1/cr/projects`. Optionally filtered by shop.
pub async fn list_projects(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<ProjectListParams>,
) -> Result<Json<Vec<CrProject>>, AppError> {
    let projects = if let Some(shop_id) = params.shop_id {
        // A shop_id the user does not own yields 404, same as a missing one.
        shops::fetch_owned_shop(&state, shop_id, user.id.into_uuid()).await?;
        sqlx::query_as::<_, CrProject>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM cr_projects p \
             JOIN shops s ON s.id = p.shop_id \
             WHERE p.shop_id = ? AND s.user_id = ? \
             ORDER BY p.created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(shop_id.to_string())
        .bind(user.id.to_string())
        .bind(params.limit.clamp(1, 100))
        .bind(params.skip.max(0))
        .fetch_all(&state.pool)
        .await?
    } else {
        sqlx::query_as::<_, CrProject>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM cr_projects p \
             JOIN shops s ON s.id = p.shop_id \
             WHERE s.user_id = ? \
             ORDER BY p.created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(user.id.to_string())
        .bind(params.limit.clamp(1, 100))
        .bind(params.skip.max(0))
        .fetch_all(&state.pool)
        .await?
    };

    Ok(Json(projects))
}

/// Handler for `GET /api/v1/cr/projects/{project_id}`.
pub async fn get_project(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(project_id): Path<Uuid>,
) -> Result<Json<CrProject>, AppError> {
    let project = fetch_owned_project(&state, project_id, user.id.into_uuid()).await?;
    Ok(Json(project))
}

/// Handler for `DELETE /api/v1/cr/projects/{project_id}`.
pub async fn delete_project(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(project_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    fetch_owned_project(&state, project_id, user.id.into_uuid()).await?;

    sqlx::query("DELETE FROM cr_projects WHERE id = ?")
        .bind(project_id.to_string())
        .execute(&state.pool)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /api/v1/cr/generate`.
///
/// Creates the project, calls the model, and returns the finished project.
/// The project row survives a model failure so the attempt is auditable.
pub async fn generate_creative(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<CrProject>), AppError> {
    if req.product_name.trim().is_empty() {
        return Err(AppError::bad_request("product_name must not be empty"));
    }

    let shop: Shop = shops::fetch_owned_shop(&state, req.shop_id, user.id.into_uuid()).await?;

    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO cr_projects (id, shop_id, product_name, product_url, purpose, duration, \
         tone, reference_videos, additional_instructions, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(req.shop_id.to_string())
    .bind(req.product_name.trim())
    .bind(&req.product_url)
    .bind(req.purpose)
    .bind(req.duration)
    .bind(&req.tone)
    .bind(SqlJson(&req.reference_videos))
    .bind(&req.additional_instructions)
    .bind(ProjectStatus::Generating)
    .bind(Utc::now())
    .execute(&state.pool)
    .await?;

    let prompt = brief::build_prompt(&BriefRequest {
        product_name: req.product_name.trim(),
        product_url: req.product_url.as_deref(),
        purpose: req.purpose,
        duration: req.duration,
        tone: req.tone.as_deref(),
        reference_videos: &req.reference_videos,
        additional_instructions: req.additional_instructions.as_deref(),
        shop_market: shop.market.as_deref(),
        shop_category: shop.category.as_deref(),
    });

    let result = ai::complete(
        &state.config.ai,
        BRIEF_SYSTEM_PROMPT,
        &[ai::Message::user(prompt)],
        state.config.ai.brief_max_tokens,
    )
    .await;

    match result {
        Ok(raw) => {
            let output = brief::parse_brief(&raw);
            sqlx::query("UPDATE cr_projects SET ai_output = ?, status = ? WHERE id = ?")
                .bind(SqlJson(&output))
                .bind(ProjectStatus::Generated)
                .bind(id.to_string())
                .execute(&state.pool)
                .await?;

            let project = fetch_owned_project(&state, id, user.id.into_uuid()).await?;
            tracing::info!(project_id = %id, "creative brief generated");
            Ok((StatusCode::CREATED, Json(project)))
        }
        Err(e) => {
            tracing::error!(project_id = %id, error = %e, "creative generation failed");
            let error_record = serde_json::json!({ "error": e.to_string() });
            sqlx::query("UPDATE cr_projects SET ai_output = ?, status = ? WHERE id = ?")
                .bind(SqlJson(&error_record))
                .bind(ProjectStatus::Draft)
                .bind(id.to_string())
                .execute(&state.pool)
                .await?;

            Err(AppError::upstream("Creative generation failed"))
        }
    }
}
