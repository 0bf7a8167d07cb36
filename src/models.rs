//! Core data models used throughout Brief Forge.
//!
//! These types mirror the database schema: tenants (users), their connected
//! shops, creative-brief projects, the two knowledge layers feeding the RAG
//! copilot, persisted conversations, and cached trend products.
//!
//! UUIDs and timestamps are stored as TEXT in SQLite; id columns decode
//! through [`uuid::fmt::Hyphenated`], which sqlx maps to TEXT, and JSON
//! payloads use [`sqlx::types::Json`] over TEXT columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::fmt::Hyphenated;

/// Subscription plan of a tenant account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PlanType {
    Free,
    Starter,
    Pro,
    Enterprise,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Hyphenated,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub company_name: Option<String>,
    pub plan: PlanType,
    pub created_at: DateTime<Utc>,
}

/// A connected e-commerce shop belonging to one user.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Shop {
    pub id: Hyphenated,
    #[serde(skip_serializing)]
    pub user_id: Hyphenated,
    pub shop_name: String,
    pub tts_shop_id: Option<String>,
    pub market: Option<String>,
    pub category: Option<String>,
    pub is_active: bool,
    pub connected_at: DateTime<Utc>,
}

/// What the generated video is meant to achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProjectPurpose {
    Sales,
    Awareness,
    Review,
}

impl ProjectPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectPurpose::Sales => "sales",
            ProjectPurpose::Awareness => "awareness",
            ProjectPurpose::Review => "review",
        }
    }
}

/// Target video length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum ProjectDuration {
    #[serde(rename = "15s")]
    #[sqlx(rename = "15s")]
    Short15s,
    #[serde(rename = "30s")]
    #[sqlx(rename = "30s")]
    Medium30s,
    #[serde(rename = "60s")]
    #[sqlx(rename = "60s")]
    Long60s,
}

impl ProjectDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectDuration::Short15s => "15s",
            ProjectDuration::Medium30s => "30s",
            ProjectDuration::Long60s => "60s",
        }
    }
}

/// Lifecycle of a creative-brief project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProjectStatus {
    Draft,
    Generating,
    Generated,
    Filming,
    Published,
}

/// A creative-brief project tied to a shop.
///
/// `ai_output` holds the structured brief returned by the model
/// (concept, script, hooks, cta, notes) or an error record when
/// generation failed.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CrProject {
    pub id: Hyphenated,
    pub shop_id: Hyphenated,
    pub product_name: String,
    pub product_url: Option<String>,
    pub purpose: Option<ProjectPurpose>,
    pub duration: Option<ProjectDuration>,
    pub tone: Option<String>,
    pub reference_videos: Option<Json<Vec<String>>>,
    pub additional_instructions: Option<String>,
    pub ai_output: Option<Json<serde_json::Value>>,
    pub status: ProjectStatus,
    pub performance_data: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}

/// Category tag for per-user knowledge entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum KnowledgeCategory {
    Hook,
    Script,
    Trend,
    Strategy,
    Product,
}

impl KnowledgeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeCategory::Hook => "hook",
            KnowledgeCategory::Script => "script",
            KnowledgeCategory::Trend => "trend",
            KnowledgeCategory::Strategy => "strategy",
            KnowledgeCategory::Product => "product",
        }
    }
}

/// Per-user knowledge entry. `vector_id` is set once the entry has been
/// embedded and upserted into the hosted vector index.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct KnowledgeEntry {
    pub id: Hyphenated,
    #[serde(skip_serializing)]
    pub user_id: Hyphenated,
    pub title: String,
    pub content: String,
    pub category: Option<KnowledgeCategory>,
    pub source: Option<String>,
    pub performance_score: Option<f64>,
    pub vector_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Admin-managed knowledge shared with every tenant through the copilot.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GlobalKnowledgeEntry {
    pub id: Hyphenated,
    pub title: String,
    pub content: String,
    pub source: Option<String>,
    pub vector_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted copilot conversation.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: Hyphenated,
    #[serde(skip_serializing)]
    pub user_id: Hyphenated,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One message inside a conversation. `sources` records the knowledge
/// titles that grounded an assistant reply.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChatMessage {
    pub id: Hyphenated,
    #[serde(skip_serializing)]
    pub conversation_id: Hyphenated,
    pub role: String,
    pub content: String,
    pub sources: Option<Json<Vec<String>>>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a trending product pulled from an external data source.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TrendProduct {
    pub id: Hyphenated,
    pub product_name: String,
    pub category: Option<String>,
    pub sold_count: Option<i64>,
    pub revenue: Option<f64>,
    pub growth_rate: Option<f64>,
    pub competition_score: Option<f64>,
    pub top_video_url: Option<String>,
    pub video_script: Option<String>,
    pub source: Option<String>,
    pub market: Option<String>,
    pub fetched_at: DateTime<Utc>,
}
