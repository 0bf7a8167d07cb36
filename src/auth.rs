//! Authentication: password hashing, HS256 JWTs, and the bearer-token
//! extractor used by every tenant-scoped route.
//!
//! Tokens are compact JWTs signed with HMAC-SHA256 (`hmac` + `sha2`),
//! base64url-encoded without padding. Verification uses the MAC's
//! constant-time comparison and rejects expired tokens.
//!
//! Passwords are stored as `salt$digest` where the digest is an iterated
//! SHA-256 over the salted password.

use anyhow::{bail, Context, Result};
use axum::extract::{FromRequestParts, State};
use axum::http::{header, request::Parts, StatusCode};
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::User;
use crate::server::{AppError, AppState};

type HmacSha256 = Hmac<Sha256>;

const HASH_ITERATIONS: u32 = 100_000;

// ============ Password hashing ============

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let salt = hex::encode(Uuid::new_v4().as_bytes());
    format!("{}${}", salt, digest_password(&salt, password))
}

/// Verify a password against a stored `salt$digest` hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    digest_password(salt, password) == digest
}

fn digest_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let mut digest = hasher.finalize();
    for _ in 0..HASH_ITERATIONS {
        digest = Sha256::digest(&digest);
    }
    hex::encode(digest)
}

// ============ JWT ============

/// JWT claims carried by access tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry as a unix timestamp.
    pub exp: i64,
}

/// Create a signed access token for a user.
pub fn create_access_token(user_id: Uuid, secret: &str, ttl_minutes: i64) -> Result<String> {
    let header = serde_json::json!({ "alg": "HS256", "typ": "JWT" });
    let claims = Claims {
        sub: user_id.to_string(),
        exp: Utc::now().timestamp() + ttl_minutes * 60,
    };

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
    );

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .context("HMAC can take key of any size")?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", signing_input, signature))
}

/// Decode and verify an access token, returning its claims.
///
/// Fails on malformed tokens, signature mismatch, or expiry.
pub fn decode_token(token: &str, secret: &str) -> Result<Claims> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        bail!("Malformed token");
    };

    let signing_input = format!("{}.{}", header, payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .context("HMAC can take key of any size")?;
    mac.update(signing_input.as_bytes());

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(signature)
        .context("Invalid token signature encoding")?;
    mac.verify_slice(&sig_bytes)
        .map_err(|_| anyhow::anyhow!("Invalid token signature"))?;

    let claims: Claims = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(payload)
            .context("Invalid token payload encoding")?,
    )
    .context("Invalid token payload")?;

    if claims.exp < Utc::now().timestamp() {
        bail!("Token expired");
    }

    Ok(claims)
}

// ============ Extractor ============

/// The authenticated user, extracted from the `Authorization: Bearer` header.
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::unauthorized("Missing bearer token"))?;

        let claims = decode_token(token, &state.config.auth.secret())
            .map_err(|e| AppError::unauthorized(e.to_string()))?;

        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, password_hash, company_name, plan, created_at FROM users WHERE id = ?",
        )
        .bind(&claims.sub)
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
        .ok_or_else(|| AppError::unauthorized("User no longer exists"))?;

        Ok(CurrentUser(user))
    }
}

// ============ Routes ============

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub company_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

/// Handler for `POST /api/v1/auth/register`.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<User>), AppError> {
    let email = req.email.trim().to_lowercase();
    if !email.contains('@') || email.len() < 3 {
        return Err(AppError::bad_request("Invalid email address"));
    }
    if req.password.len() < 8 {
        return Err(AppError::bad_request("Password must be at least 8 characters"));
    }

    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    if existing.is_some() {
        return Err(AppError::bad_request("Email already registered"));
    }

    let id = Uuid::new_v4();
    let created_at = Utc::now();
    sqlx::query(
        "INSERT INTO users (id, email, password_hash, company_name, plan, created_at) VALUES (?, ?, ?, ?, 'free', ?)",
    )
    .bind(id.to_string())
    .bind(&email)
    .bind(hash_password(&req.password))
    .bind(&req.company_name)
    .bind(created_at)
    .execute(&state.pool)
    .await
    .map_err(|e| AppError::internal(e.to_string()))?;

    let user = sqlx::query_as::<_, User>(
        "SELECT id, email, password_hash, company_name, plan, created_at FROM users WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_one(&state.pool)
    .await
    .map_err(|e| AppError::internal(e.to_string()))?;

    tracing::info!(user_id = %id, "user registered");
    Ok((StatusCode::CREATED, Json(user)))
}

/// Handler for `POST /api/v1/auth/login`.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let email = req.email.trim().to_lowercase();

    let user = sqlx::query_as::<_, User>(
        "SELECT id, email, password_hash, company_name, plan, created_at FROM users WHERE email = ?",
    )
    .bind(&email)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| AppError::internal(e.to_string()))?;

    let Some(user) = user.filter(|u| verify_password(&req.password, &u.password_hash)) else {
        return Err(AppError::unauthorized("Incorrect email or password"));
    };

    let token = create_access_token(
        user.id.into_uuid(),
        &state.config.auth.secret(),
        state.config.auth.token_ttl_minutes,
    )
    .map_err(|e| AppError::internal(e.to_string()))?;

    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
    }))
}

/// Handler for `GET /api/v1/auth/me`.
pub async fn me(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_roundtrip() {
        let hash = hash_password("hunter2hunter2");
        assert!(verify_password("hunter2hunter2", &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn test_password_hashes_are_salted() {
        let a = hash_password("same-password");
        let b = hash_password("same-password");
        assert_ne!(a, b);
        assert!(verify_password("same-password", &a));
        assert!(verify_password("same-password", &b));
    }

    #[test]
    fn test_verify_rejects_malformed_hash() {
        assert!(!verify_password("anything", "no-separator-here"));
    }

    #[test]
    fn test_token_roundtrip() {
        let user_id = Uuid::new_v4();
        let token = create_access_token(user_id, "test-secret", 30).unwrap();
        let claims = decode_token(&token, "test-secret").unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_token_wrong_secret_rejected() {
        let token = create_access_token(Uuid::new_v4(), "secret-a", 30).unwrap();
        assert!(decode_token(&token, "secret-b").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = create_access_token(Uuid::new_v4(), "test-secret", -5).unwrap();
        let err = decode_token(&token, "test-secret").unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let token = create_access_token(Uuid::new_v4(), "test-secret", 30).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims {
                sub: Uuid::new_v4().to_string(),
                exp: Utc::now().timestamp() + 3600,
            })
            .unwrap(),
        );
        parts[1] = &forged;
        assert!(decode_token(&parts.join("."), "test-secret").is_err());
    }

    #[test]
    fn test_malformed_token_rejected() {
        assert!(decode_token("not-a-jwt", "test-secret").is_err());
        assert!(decode_token("a.b", "test-secret").is_err());
        assert!(decode_token("a.b.c.d", "test-secret").is_err());
    }
}
