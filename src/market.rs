//! Market trend routes backed by the local `trend_products` snapshot table.
//!
//! Trend rows are shared across tenants (they describe the market, not a
//! user), so these routes only require authentication, not ownership.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::auth::CurrentUser;
use crate::models::TrendProduct;
use crate::server::{AppError, AppState};

const TREND_COLUMNS: &str = "id, product_name, category, sold_count, revenue, growth_rate, \
     competition_score, top_video_url, video_script, source, market, fetched_at";

#[derive(Debug, Deserialize)]
pub struct TrendParams {
    pub market: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct HiddenGemParams {
    pub market: Option<String>,
    #[serde(default = "default_min_growth")]
    pub min_growth_rate: f64,
    #[serde(default = "default_max_competition")]
    pub max_competition: f64,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}
fn default_min_growth() -> f64 {
    0.1
}
fn default_max_competition() -> f64 {
    0.5
}

/// Handler for `GET /api/v1/market/trends`. Highest revenue first.
pub async fn list_trends(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(params): Query<TrendParams>,
) -> Result<Json<Vec<TrendProduct>>, AppError> {
    let mut sql = format!("SELECT {TREND_COLUMNS} FROM trend_products WHERE 1=1");
    if params.market.is_some() {
        sql.push_str(" AND market = ?");
    }
    if params.category.is_some() {
        sql.push_str(" AND category = ?");
    }
    sql.push_str(" ORDER BY revenue DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query_as::<_, TrendProduct>(&sql);
    if let Some(market) = &params.market {
        query = query.bind(market);
    }
    if let Some(category) = &params.category {
        query = query.bind(category);
    }
    let trends = query
        .bind(params.limit.clamp(1, 100))
        .bind(params.skip.max(0))
        .fetch_all(&state.pool)
        .await?;

    Ok(Json(trends))
}

/// Handler for `GET /api/v1/market/hidden-gems`: products growing fast
/// with little competition yet. Fastest growth first.
pub async fn list_hidden_gems(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(params): Query<HiddenGemParams>,
) -> Result<Json<Vec<TrendProduct>>, AppError> {
    let mut sql = format!(
        "SELECT {TREND_COLUMNS} FROM trend_products \
         WHERE growth_rate >= ? AND competition_score <= ?"
    );
    if params.market.is_some() {
        sql.push_str(" AND market = ?");
    }
    sql.push_str(" ORDER BY growth_rate DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query_as::<_, TrendProduct>(&sql)
        .bind(params.min_growth_rate)
        .bind(params.max_competition);
    if let Some(market) = &params.market {
        query = query.bind(market);
    }
    let gems = query
        .bind(params.limit.clamp(1, 100))
        .bind(params.skip.max(0))
        .fetch_all(&state.pool)
        .await?;

    Ok(Json(gems))
}
