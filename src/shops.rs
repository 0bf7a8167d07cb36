//! Shop CRUD routes. Every query is scoped to the authenticated user, so a
//! shop belonging to another tenant is indistinguishable from a missing one.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::models::Shop;
use crate::server::{AppError, AppState};

const SHOP_COLUMNS: &str =
    "id, user_id, shop_name, tts_shop_id, market, category, is_active, connected_at";

#[derive(Debug, Deserialize)]
pub struct ShopCreate {
    pub shop_name: String,
    #[serde(default)]
    pub tts_shop_id: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ShopUpdate {
    pub shop_name: Option<String>,
    pub tts_shop_id: Option<String>,
    pub market: Option<String>,
    pub category: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

pub(crate) async fn fetch_owned_shop(
    state: &AppState,
    shop_id: Uuid,
    user_id: Uuid,
) -> Result<Shop, AppError> {
    let shop = sqlx::query_as::<_, Shop>(&format!(
        "SELECT {SHOP_COLUMNS} FROM shops WHERE id = ? AND user_id = ?"
    ))
    .bind(shop_id.to_string())
    .bind(user_id.to_string())
    .fetch_optional(&state.pool)
    .await?;

    shop.ok_or_else(|| AppError::not_found("Shop not found"))
}

/// Handler for `GET /api/v1/shops`.
pub async fn list_shops(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<Shop>>, AppError> {
    let shops = sqlx::query_as::<_, Shop>(&format!(
        "SELECT {SHOP_COLUMNS} FROM shops WHERE user_id = ? ORDER BY connected_at DESC LIMIT ? OFFSET ?"
    ))
    .bind(user.id.to_string())
    .bind(page.limit.clamp(1, 100))
    .bind(page.skip.max(0))
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(shops))
}

/// Handler for `POST /api/v1/shops`.
pub async fn create_shop(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<ShopCreate>,
) -> Result<(StatusCode, Json<Shop>), AppError> {
    if req.shop_name.trim().is_empty() {
        return Err(AppError::bad_request("shop_name must not be empty"));
    }

    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO shops (id, user_id, shop_name, tts_shop_id, market, category, is_active, connected_at) \
         VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
    )
    .bind(id.to_string())
    .bind(user.id.to_string())
    .bind(req.shop_name.trim())
    .bind(&req.tts_shop_id)
    .bind(&req.market)
    .bind(&req.category)
    .bind(Utc::now())
    .execute(&state.pool)
    .await?;

    let shop = fetch_owned_shop(&state, id, user.id.into_uuid()).await?;
    Ok((StatusCode::CREATED, Json(shop)))
}

/// Handler for `GET /api/v1/shops/{shop_id}`.
pub async fn get_shop(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(shop_id): Path<Uuid>,
) -> Result<Json<Shop>, AppError> {
    let shop = fetch_owned_shop(&state, shop_id, user.id.into_uuid()).await?;
    Ok(Json(shop))
}

/// Handler for `PATCH /api/v1/shops/{shop_id}`. Partial update: only fields
/// present in the body are changed.
pub async fn update_shop(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(shop_id): Path<Uuid>,
    Json(req): Json<ShopUpdate>,
) -> Result<Json<Shop>, AppError> {
    let mut shop = fetch_owned_shop(&state, shop_id, user.id.into_uuid()).await?;

    if let Some(name) = req.shop_name {
        shop.shop_name = name;
    }
    if let Some(tts_shop_id) = req.tts_shop_id {
        shop.tts_shop_id = Some(tts_shop_id);
    }
    if let Some(market) = req.market {
        shop.market = Some(market);
    }
    if let Some(category) = req.category {
        shop.category = Some(category);
    }
    if let Some(is_active) = req.is_active {
        shop.is_active = is_active;
    }

    sqlx::query(
        "UPDATE shops SET shop_name = ?, tts_shop_id = ?, market = ?, category = ?, is_active = ? \
         WHERE id = ? AND user_id = ?",
    )
    .bind(&shop.shop_name)
    .bind(&shop.tts_shop_id)
    .bind(&shop.market)
    .bind(&shop.category)
    .bind(shop.is_active)
    .bind(shop_id.to_string())
    .bind(user.id.to_string())
    .execute(&state.pool)
    .await?;

    Ok(Json(shop))
}

/// Handler for `DELETE /api/v1/shops/{shop_id}`.
pub async fn delete_shop(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(shop_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    fetch_owned_shop(&state, shop_id, user.id.into_uuid()).await?;

    sqlx::query("DELETE FROM shops WHERE id = ? AND user_id = ?")
        .bind(shop_id.to_string())
        .bind(user.id.to_string())
        .execute(&state.pool)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
