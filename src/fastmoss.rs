//! Client and routes for the external market analytics provider.
//!
//! Two upstream surfaces are used:
//!
//! - The partner open API (`openapi.fastmoss.com`): OAuth client
//!   credentials with refresh, and a request signature over the URI and
//!   the compact JSON body (`sha256("{secret}|{uri}|{body}|{secret}")`,
//!   sent as `signature_version=2`).
//! - The public web API (`www.fastmoss.com/api`): no credentials, but the
//!   endpoint expects browser-ish headers and `_time`/`cnonce` query
//!   params. Used as a fallback when partner credentials are missing or
//!   the open API fails, and for the first ten products of page one,
//!   which only carry image URLs on this surface.
//!
//! The open API caps `pagesize` at 10, so one page served by this API is
//! assembled from a batch of consecutive upstream pages fetched
//! concurrently. Responses are cached in memory for a few minutes.
//!
//! The image proxy relays product thumbnails from a host allow-list so the
//! browser never talks to the provider's CDN directly.

use anyhow::{bail, Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::config::Config;
use crate::server::{AppError, AppState};

/// Upstream hard limit on `pagesize`.
const UPSTREAM_PAGE_SIZE: u32 = 10;
/// Consecutive upstream pages merged into one served page.
const PAGE_BATCH: u32 = 5;
/// Page size for full web-API fallback pages.
const WEB_PAGE_SIZE: u32 = UPSTREAM_PAGE_SIZE * PAGE_BATCH;
/// Cache is pruned once it grows past this many entries.
const CACHE_MAX_ENTRIES: usize = 200;
/// Tokens are refreshed this long before their reported expiry.
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

const WEB_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Instant,
}

struct CacheEntry {
    stored_at: Instant,
    value: Value,
}

/// Client for the analytics provider, holding the response cache and the
/// open-API token. One instance lives in [`AppState`] for the process.
pub struct MarketClient {
    config: Arc<Config>,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, CacheEntry>>,
    token: Mutex<Option<CachedToken>>,
}

impl MarketClient {
    pub fn new(config: Arc<Config>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.market.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            http,
            cache: Mutex::new(HashMap::new()),
            token: Mutex::new(None),
        }
    }

    fn has_credentials(&self) -> bool {
        self.config.market.client_id().is_some() && self.config.market.client_secret().is_some()
    }

    // ============ Response cache ============

    fn cache_get(&self, key: &str) -> Option<Value> {
        let ttl = Duration::from_secs(self.config.market.cache_ttl_secs);
        let cache = match self.cache.lock() {
            Ok(c) => c,
            Err(p) => p.into_inner(),
        };
        cache
            .get(key)
            .filter(|e| e.stored_at.elapsed() < ttl)
            .map(|e| e.value.clone())
    }

    fn cache_put(&self, key: String, value: Value) {
        let ttl = Duration::from_secs(self.config.market.cache_ttl_secs);
        let mut cache = match self.cache.lock() {
            Ok(c) => c,
            Err(p) => p.into_inner(),
        };
        if cache.len() >= CACHE_MAX_ENTRIES {
            cache.retain(|_, e| e.stored_at.elapsed() < ttl);
        }
        cache.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                value,
            },
        );
    }

    // ============ Open API ============

    async fn get_access_token(&self) -> Result<String> {
        {
            let token = match self.token.lock() {
                Ok(t) => t,
                Err(p) => p.into_inner(),
            };
            if let Some(cached) = token.as_ref() {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let refresh_token = {
            let token = match self.token.lock() {
                Ok(t) => t,
                Err(p) => p.into_inner(),
            };
            token.as_ref().and_then(|t| t.refresh_token.clone())
        };

        let client_id = self
            .config
            .market
            .client_id()
            .ok_or_else(|| anyhow::anyhow!("FASTMOSS_CLIENT_ID not set"))?;
        let client_secret = self
            .config
            .market
            .client_secret()
            .ok_or_else(|| anyhow::anyhow!("FASTMOSS_CLIENT_SECRET not set"))?;

        // Try a refresh first; fall back to a fresh client-credentials grant.
        if let Some(refresh) = refresh_token {
            let body = json!({ "client_id": client_id, "refresh_token": refresh });
            if let Ok(token) = self.request_token("/v1/refreshToken", body).await {
                return Ok(token);
            }
            tracing::warn!("token refresh failed, requesting a new token");
        }

        self.request_token(
            "/v1/token",
            json!({
                "client_id": client_id,
                "client_secret": client_secret,
            }),
        )
        .await
    }

    async fn request_token(&self, path: &str, body: Value) -> Result<String> {
        let url = format!("{}{}", self.config.market.base_url, path);
        let resp: Value = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Token request failed")?
            .json()
            .await
            .context("Invalid token response")?;

        if resp.get("code").and_then(|c| c.as_i64()) != Some(0) {
            bail!(
                "Token request rejected: {}",
                resp.get("msg").and_then(|m| m.as_str()).unwrap_or("unknown")
            );
        }

        let data = resp
            .get("data")
            .ok_or_else(|| anyhow::anyhow!("Token response missing data"))?;
        let access_token = data
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow::anyhow!("Token response missing access_token"))?
            .to_string();
        let expires_in = data
            .get("expires_in")
            .and_then(|e| e.as_u64())
            .unwrap_or(3600);
        let refresh_token = data
            .get("refresh_token")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string());

        let mut token = match self.token.lock() {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        };
        *token = Some(CachedToken {
            access_token: access_token.clone(),
            refresh_token,
            expires_at: Instant::now() + Duration::from_secs(expires_in)
                - TOKEN_EXPIRY_BUFFER.min(Duration::from_secs(expires_in)),
        });

        Ok(access_token)
    }

    /// POST to the partner open API. Returns the `data` payload.
    async fn open_api_request(&self, uri: &str, params: &Value) -> Result<Value> {
        let client_id = self
            .config
            .market
            .client_id()
            .ok_or_else(|| anyhow::anyhow!("FASTMOSS_CLIENT_ID not set"))?;
        let client_secret = self
            .config
            .market
            .client_secret()
            .ok_or_else(|| anyhow::anyhow!("FASTMOSS_CLIENT_SECRET not set"))?;
        let access_token = self.get_access_token().await?;

        let body = serde_json::to_string(params)?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let sign = generate_sign(&client_secret, uri, &body);

        let url = format!("{}{}", self.config.market.base_url, uri);
        let resp: Value = self
            .http
            .post(&url)
            .query(&[
                ("client_id", client_id.as_str()),
                ("access_token", access_token.as_str()),
                ("timestamp", timestamp.as_str()),
                ("sign", sign.as_str()),
                ("signature_version", "2"),
            ])
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .context("Open API request failed")?
            .json()
            .await
            .context("Invalid open API response")?;

        if resp.get("code").and_then(|c| c.as_i64()) != Some(0) {
            bail!(
                "Open API error: {}",
                resp.get("msg").and_then(|m| m.as_str()).unwrap_or("unknown")
            );
        }

        Ok(resp.get("data").cloned().unwrap_or(Value::Null))
    }

    /// GET from the public web API with anti-bot query params. Returns the
    /// `data` payload.
    async fn web_api_request(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string();
        let cnonce = Uuid::new_v4().simple().to_string();

        let url = format!("{}{}", self.config.market.web_base_url, path);
        let mut query: Vec<(&str, String)> = params.to_vec();
        query.push(("_time", millis));
        query.push(("cnonce", cnonce));

        let resp: Value = self
            .http
            .get(&url)
            .query(&query)
            .header(header::USER_AGENT, WEB_USER_AGENT)
            .header(header::REFERER, "https://www.fastmoss.com/")
            .send()
            .await
            .context("Web API request failed")?
            .json()
            .await
            .context("Invalid web API response")?;

        if resp.get("code").and_then(|c| c.as_i64()) != Some(0) {
            bail!(
                "Web API error: {}",
                resp.get("msg").and_then(|m| m.as_str()).unwrap_or("unknown")
            );
        }

        Ok(resp.get("data").cloned().unwrap_or(Value::Null))
    }

    // ============ Operations ============

    /// Search trending products. One served page merges [`PAGE_BATCH`]
    /// consecutive upstream pages; page one leads with the web API's first
    /// ten records because only those carry image URLs.
    pub async fn search_products(
        &self,
        keyword: Option<&str>,
        market: Option<&str>,
        page: u32,
    ) -> Result<Value> {
        let page = page.max(1);
        let cache_key = format!(
            "search:{}:{}:{}",
            keyword.unwrap_or(""),
            market.unwrap_or(""),
            page
        );
        if let Some(cached) = self.cache_get(&cache_key) {
            return Ok(cached);
        }

        let (products, source) = if !self.has_credentials() {
            (self.search_web(keyword, market, page, WEB_PAGE_SIZE).await?, "web")
        } else if page == 1 {
            (self.search_first_page(keyword, market).await?, "merged")
        } else {
            match self
                .search_open_api(keyword, market, open_api_page_range(page))
                .await
            {
                Ok(products) => (products, "open_api"),
                Err(e) => {
                    tracing::warn!(error = %e, "open API search failed, using web fallback");
                    (self.search_web(keyword, market, page, WEB_PAGE_SIZE).await?, "web")
                }
            }
        };

        let result = json!({
            "products": products,
            "page": page,
            "source": source,
        });
        self.cache_put(cache_key, result.clone());
        Ok(result)
    }

    /// Page one: web API for the first ten (images), open API pages 2-5
    /// for the rest, fetched concurrently. Either side may drop out; the
    /// call only fails when both produced nothing.
    async fn search_first_page(
        &self,
        keyword: Option<&str>,
        market: Option<&str>,
    ) -> Result<Vec<Value>> {
        let (web, tail) = tokio::join!(
            self.search_web(keyword, market, 1, UPSTREAM_PAGE_SIZE),
            self.search_open_api(keyword, market, open_api_page_range(1)),
        );

        let mut products = Vec::new();
        match web {
            Ok(items) if !items.is_empty() => products.extend(items),
            Ok(_) => tracing::warn!("web search returned no products for page one"),
            Err(e) => tracing::warn!(error = %e, "web search failed for page one"),
        }
        if products.is_empty() {
            // Web side came up empty: take the open API's first page instead.
            match self.search_open_api(keyword, market, 1..2).await {
                Ok(items) => products.extend(items),
                Err(e) => tracing::warn!(error = %e, "open API page one failed"),
            }
        }
        match tail {
            Ok(items) => products.extend(items),
            Err(e) => tracing::warn!(error = %e, "open API batch failed for page one"),
        }

        if products.is_empty() {
            bail!("all product search sources failed");
        }
        Ok(products)
    }

    async fn search_open_api(
        &self,
        keyword: Option<&str>,
        market: Option<&str>,
        pages: std::ops::Range<u32>,
    ) -> Result<Vec<Value>> {
        let futures: Vec<_> = pages
            .map(|page| {
                let body = search_body(keyword, market, page);
                async move { self.open_api_request("/product/v1/search", &body).await }
            })
            .collect();
        let pages = futures::future::join_all(futures).await;

        let mut products = Vec::new();
        let mut first_error = None;
        for page in pages {
            match page {
                Ok(data) => {
                    if let Some(items) = data.get("list").and_then(|l| l.as_array()) {
                        products.extend(items.iter().map(normalize_product));
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        // All pages failing means the open API is down; partial failure on
        // later pages is just a shorter result.
        if products.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(products)
    }

    async fn search_web(
        &self,
        keyword: Option<&str>,
        market: Option<&str>,
        page: u32,
        pagesize: u32,
    ) -> Result<Vec<Value>> {
        let mut params: Vec<(&str, String)> = vec![
            ("page", page.to_string()),
            ("pagesize", pagesize.to_string()),
        ];
        if let Some(keyword) = keyword {
            params.push(("keyword", keyword.to_string()));
        }
        if let Some(market) = market {
            params.push(("region", market.to_string()));
        }

        let data = self.web_api_request("/goods/search", &params).await?;
        let items = data
            .get("product_list")
            .or_else(|| data.get("list"))
            .and_then(|l| l.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items.iter().map(normalize_product).collect())
    }

    /// Top videos promoting one product. Open API only; the web API has no
    /// equivalent listing.
    pub async fn product_videos(&self, product_id: &str) -> Result<Value> {
        let cache_key = format!("videos:{}", product_id);
        if let Some(cached) = self.cache_get(&cache_key) {
            return Ok(cached);
        }

        let data = match self
            .open_api_request("/product/v1/videoList", &videos_body(product_id))
            .await
        {
            Ok(data) => data,
            Err(e) => {
                // Not cached, so a recovered upstream serves the next call.
                tracing::warn!(error = %e, "video list fetch failed");
                return Ok(json!({ "product_id": product_id, "videos": [] }));
            }
        };

        let videos: Vec<Value> = data
            .get("list")
            .and_then(|l| l.as_array())
            .map(|items| items.iter().map(normalize_video).collect())
            .unwrap_or_default();

        let result = json!({ "product_id": product_id, "videos": videos });
        self.cache_put(cache_key, result.clone());
        Ok(result)
    }

    /// Top e-commerce creators for a market: the open API ranking first,
    /// the web author search as fallback.
    pub async fn creator_ranking(&self, market: Option<&str>, page: u32) -> Result<Value> {
        let page = page.max(1);
        let cache_key = format!("creators:{}:{}", market.unwrap_or(""), page);
        if let Some(cached) = self.cache_get(&cache_key) {
            return Ok(cached);
        }

        let data = if self.has_credentials() {
            match self
                .open_api_request("/creator/v1/rank/topEcommerce", &creator_rank_body(market, page))
                .await
            {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(error = %e, "open API creator ranking failed, using web fallback");
                    self.creator_ranking_web(market, page).await?
                }
            }
        } else {
            self.creator_ranking_web(market, page).await?
        };

        let creators = data
            .get("list")
            .or_else(|| data.get("author_list"))
            .and_then(|l| l.as_array())
            .cloned()
            .unwrap_or_default();

        let result = json!({ "creators": creators, "page": page });
        self.cache_put(cache_key, result.clone());
        Ok(result)
    }

    async fn creator_ranking_web(&self, market: Option<&str>, page: u32) -> Result<Value> {
        let mut params: Vec<(&str, String)> = vec![
            ("page", page.to_string()),
            ("pagesize", UPSTREAM_PAGE_SIZE.to_string()),
            // 2,2 sorts by sales descending.
            ("order", "2,2".to_string()),
        ];
        if let Some(market) = market {
            params.push(("region", market.to_string()));
        }
        self.web_api_request("/author/search", &params).await
    }

    /// Fetch an image from an allow-listed host, returning its bytes and
    /// content type.
    pub async fn fetch_image(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let resp = self
            .http
            .get(url)
            .header(header::USER_AGENT, WEB_USER_AGENT)
            .header(header::REFERER, "https://www.fastmoss.com/")
            .send()
            .await
            .context("Image fetch failed")?;

        if !resp.status().is_success() {
            bail!("Image fetch failed: {}", resp.status());
        }

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = resp.bytes().await.context("Image read failed")?;
        Ok((bytes.to_vec(), content_type))
    }
}

/// Request signature: `sha256("{secret}|{uri}|{body}|{secret}")`,
/// hex-encoded. `body` must be the exact compact JSON sent on the wire,
/// and the pipe separators are part of the signed string.
fn generate_sign(secret: &str, uri: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b"|");
    hasher.update(uri.as_bytes());
    hasher.update(b"|");
    hasher.update(body.as_bytes());
    hasher.update(b"|");
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Open-API pages backing one served page. Page one reserves its first
/// slot for the web API, so only the tail of its batch comes from here.
fn open_api_page_range(page: u32) -> std::ops::Range<u32> {
    if page <= 1 {
        2..PAGE_BATCH + 1
    } else {
        let first = (page - 1) * PAGE_BATCH + 1;
        first..first + PAGE_BATCH
    }
}

fn search_body(keyword: Option<&str>, market: Option<&str>, page: u32) -> Value {
    let mut filter = json!({});
    if let Some(market) = market {
        filter["region"] = json!(market);
    }
    let mut body = json!({
        "filter": filter,
        "page": page,
        "pagesize": UPSTREAM_PAGE_SIZE,
        "orderby": { "day7_units_sold": "desc" },
    });
    if let Some(keyword) = keyword {
        body["keywords"] = json!(keyword);
    }
    body
}

fn videos_body(product_id: &str) -> Value {
    json!({
        "filter": { "product_id": product_id, "date_type": "7" },
        "page": 1,
        "pagesize": UPSTREAM_PAGE_SIZE,
    })
}

fn creator_rank_body(market: Option<&str>, page: u32) -> Value {
    // date_info is required by the ranking endpoint.
    let mut filter = json!({ "date_info": { "type": "week" } });
    if let Some(market) = market {
        filter["region"] = json!(market);
    }
    json!({
        "filter": filter,
        "orderby": [{ "field": "total_gmv", "order": "desc" }],
        "page": page,
        "pagesize": UPSTREAM_PAGE_SIZE,
    })
}

// ============ Normalization ============

/// Parse upstream numbers that arrive as strings, placeholders ("-"),
/// percentages ("5%"), or grouped digits ("1,234").
fn safe_number(value: Option<&Value>) -> Option<f64> {
    let value = value?;
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    let s = value.as_str()?.trim();
    if s.is_empty() || s == "-" {
        return None;
    }
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    let parsed = cleaned.parse::<f64>().ok()?;
    if s.ends_with('%') {
        Some(parsed / 100.0)
    } else {
        Some(parsed)
    }
}

fn str_field(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| item.get(k).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}

/// Map one upstream product record to the shape the frontend expects.
/// Upstream field names differ between the open and web APIs, so each
/// field probes the known aliases.
fn normalize_product(item: &Value) -> Value {
    json!({
        "product_id": str_field(item, &["goods_id", "id", "product_id"]),
        "product_name": str_field(item, &["goods_name", "title", "product_name"]),
        "category": str_field(item, &["category_name", "category"]),
        "image_url": str_field(item, &["goods_img", "cover", "image_url"]),
        "price": safe_number(item.get("price").or_else(|| item.get("goods_price"))),
        "sold_count": safe_number(item.get("sold_count").or_else(|| item.get("sale_cnt"))),
        "revenue": safe_number(item.get("revenue").or_else(|| item.get("sale_amount"))),
        "growth_rate": safe_number(item.get("growth_rate").or_else(|| item.get("trend"))),
        "market": str_field(item, &["region", "market"]),
    })
}

fn normalize_video(item: &Value) -> Value {
    json!({
        "video_id": str_field(item, &["video_id", "id"]),
        "title": str_field(item, &["title", "desc"]),
        "video_url": str_field(item, &["video_url", "url"]),
        "cover_url": str_field(item, &["cover", "cover_url"]),
        "views": safe_number(item.get("play_count").or_else(|| item.get("views"))),
        "likes": safe_number(item.get("digg_count").or_else(|| item.get("likes"))),
        "creator": str_field(item, &["author_name", "creator", "nickname"]),
    })
}

// ============ Routes ============

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub keyword: Option<String>,
    pub market: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
}

#[derive(Debug, Deserialize)]
pub struct RankingQuery {
    pub market: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
}

fn default_page() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct ImageProxyQuery {
    pub url: String,
}

/// Handler for `GET /api/v1/fastmoss/products`.
pub async fn search_products(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Value>, AppError> {
    let result = state
        .market
        .search_products(params.keyword.as_deref(), params.market.as_deref(), params.page)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "product search failed");
            AppError::upstream("Product search failed")
        })?;
    Ok(Json(result))
}

/// Handler for `GET /api/v1/fastmoss/products/{product_id}/videos`.
pub async fn product_videos(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Path(product_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let result = state.market.product_videos(&product_id).await.map_err(|e| {
        tracing::error!(error = %e, "product videos fetch failed");
        AppError::upstream("Product videos fetch failed")
    })?;
    Ok(Json(result))
}

/// Handler for `GET /api/v1/fastmoss/creators/ranking`.
pub async fn creator_ranking(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    Query(params): Query<RankingQuery>,
) -> Result<Json<Value>, AppError> {
    let result = state
        .market
        .creator_ranking(params.market.as_deref(), params.page)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "creator ranking fetch failed");
            AppError::upstream("Creator ranking fetch failed")
        })?;
    Ok(Json(result))
}

/// Handler for `GET /api/v1/fastmoss/image-proxy?url=...`.
///
/// Only hosts on the configured allow-list may be proxied; anything else
/// is refused outright.
pub async fn image_proxy(
    State(state): State<AppState>,
    Query(params): Query<ImageProxyQuery>,
) -> Result<Response, AppError> {
    let parsed = reqwest::Url::parse(&params.url)
        .map_err(|_| AppError::bad_request("Invalid image URL"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::bad_request("Invalid image URL"))?;

    let allowed = state
        .config
        .market
        .image_proxy_allowed_hosts
        .iter()
        .any(|h| h == host);
    if !allowed {
        return Err(AppError::forbidden("Image host not allowed"));
    }

    let (bytes, content_type) = state.market.fetch_image(&params.url).await.map_err(|e| {
        tracing::warn!(error = %e, "image proxy fetch failed");
        AppError::upstream("Image fetch failed")
    })?;

    let mut response = (StatusCode::OK, bytes).into_response();
    let headers = response.headers_mut();
    if let Ok(ct) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, ct);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=86400"),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_sign_joins_parts_with_pipes() {
        // sha256 of `secret|/product/v1/search|{"page":1}|secret`.
        assert_eq!(
            generate_sign("secret", "/product/v1/search", "{\"page\":1}"),
            "f2e3f31f8705f34a1677c2bdf2803accb99fa2ed1af6fe396691644c8f0607cd"
        );
    }

    #[test]
    fn test_generate_sign_varies_with_inputs() {
        let base = generate_sign("secret", "/product/v1/search", "{}");
        assert_ne!(base, generate_sign("other", "/product/v1/search", "{}"));
        assert_ne!(base, generate_sign("secret", "/product/v1/videoList", "{}"));
        assert_ne!(base, generate_sign("secret", "/product/v1/search", "{\"a\":1}"));
    }

    #[test]
    fn test_open_api_page_range_skips_first_slot_on_page_one() {
        assert_eq!(open_api_page_range(1), 2..6);
        assert_eq!(open_api_page_range(0), 2..6);
    }

    #[test]
    fn test_open_api_page_range_batches_later_pages() {
        assert_eq!(open_api_page_range(2), 6..11);
        assert_eq!(open_api_page_range(3), 11..16);
    }

    #[test]
    fn test_search_body_shape() {
        let body = search_body(Some("collar"), Some("US"), 3);
        assert_eq!(body["filter"]["region"], "US");
        assert_eq!(body["keywords"], "collar");
        assert_eq!(body["page"], 3);
        assert_eq!(body["pagesize"], 10);

        let bare = search_body(None, None, 1);
        assert!(bare.get("keywords").is_none());
        assert!(bare["filter"].get("region").is_none());
    }

    #[test]
    fn test_videos_body_filters_by_product() {
        let body = videos_body("g42");
        assert_eq!(body["filter"]["product_id"], "g42");
        assert_eq!(body["filter"]["date_type"], "7");
        assert_eq!(body["pagesize"], 10);
    }

    #[test]
    fn test_creator_rank_body_carries_date_info() {
        let body = creator_rank_body(Some("JP"), 2);
        assert_eq!(body["filter"]["region"], "JP");
        assert_eq!(body["filter"]["date_info"]["type"], "week");
        assert_eq!(body["orderby"][0]["field"], "total_gmv");
        assert_eq!(body["page"], 2);
    }

    #[test]
    fn test_safe_number_plain() {
        assert_eq!(safe_number(Some(&json!(42))), Some(42.0));
        assert_eq!(safe_number(Some(&json!(1.5))), Some(1.5));
        assert_eq!(safe_number(Some(&json!("12.5"))), Some(12.5));
    }

    #[test]
    fn test_safe_number_placeholders() {
        assert_eq!(safe_number(Some(&json!("-"))), None);
        assert_eq!(safe_number(Some(&json!(""))), None);
        assert_eq!(safe_number(None), None);
        assert_eq!(safe_number(Some(&json!(null))), None);
    }

    #[test]
    fn test_safe_number_percent_and_grouped() {
        assert_eq!(safe_number(Some(&json!("5%"))), Some(0.05));
        assert_eq!(safe_number(Some(&json!("1,234"))), Some(1234.0));
        assert_eq!(safe_number(Some(&json!("$9.99"))), Some(9.99));
    }

    #[test]
    fn test_normalize_product_open_api_fields() {
        let item = json!({
            "goods_id": "g1",
            "goods_name": "LED Collar",
            "category_name": "Pet Supplies",
            "sale_cnt": "1,200",
            "sale_amount": "15000",
            "trend": "12%",
            "region": "US",
        });
        let product = normalize_product(&item);
        assert_eq!(product["product_id"], "g1");
        assert_eq!(product["product_name"], "LED Collar");
        assert_eq!(product["sold_count"], 1200.0);
        assert_eq!(product["growth_rate"], 0.12);
        assert_eq!(product["market"], "US");
    }

    #[test]
    fn test_normalize_product_missing_fields_are_null() {
        let product = normalize_product(&json!({}));
        assert!(product["product_id"].is_null());
        assert!(product["revenue"].is_null());
    }

    fn test_client(ttl_secs: u64) -> MarketClient {
        let config = crate::config::Config {
            server: crate::config::ServerConfig {
                bind: "127.0.0.1:0".to_string(),
                cors_origins: vec![],
            },
            db: crate::config::DbConfig {
                path: std::path::PathBuf::from("/tmp/unused.sqlite"),
            },
            auth: crate::config::AuthConfig {
                secret_key: "k".to_string(),
                token_ttl_minutes: 30,
                admin_emails: vec![],
            },
            ai: Default::default(),
            embedding: Default::default(),
            vector: Default::default(),
            market: crate::config::MarketConfig {
                cache_ttl_secs: ttl_secs,
                ..Default::default()
            },
        };
        MarketClient::new(Arc::new(config))
    }

    #[test]
    fn test_cache_roundtrip() {
        let client = test_client(300);
        assert!(client.cache_get("k").is_none());
        client.cache_put("k".to_string(), json!({ "v": 1 }));
        assert_eq!(client.cache_get("k").unwrap()["v"], 1);
    }

    #[test]
    fn test_cache_expiry() {
        let client = test_client(0);
        client.cache_put("k".to_string(), json!({ "v": 1 }));
        assert!(client.cache_get("k").is_none());
    }
}
