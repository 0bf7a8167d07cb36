//! The copilot: retrieval-augmented chat over the two knowledge layers.
//!
//! A question is answered in four steps: resolve (or create) the
//! conversation, retrieve grounding knowledge, call the model with the
//! conversation history, and persist both sides of the exchange.
//!
//! Retrieval prefers the vector index (global namespace plus the user's
//! namespace, queried concurrently) and falls back to plain database reads
//! when embeddings or the index are unavailable, so the copilot keeps
//! working in a degraded deployment.
//!
//! Streaming responses use SSE with four event types, in order:
//! `conversation_id`, `sources`, zero or more `text` deltas, and `done`.
//! A stream that fails mid-flight emits `error` before `done`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use sqlx::types::Json as SqlJson;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::models::{ChatMessage, Conversation, User};
use crate::server::{AppError, AppState};
use crate::{ai, embedding};

const CONVERSATION_COLUMNS: &str = "id, user_id, title, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, sources, created_at";

/// Conversation titles are the first words of the opening question.
const TITLE_MAX_CHARS: usize = 30;

const COPILOT_SYSTEM_PROMPT: &str = "You are a short-form video marketing copilot for \
e-commerce sellers. Answer questions about hooks, scripts, trends, and creative strategy. \
Be specific and actionable; prefer examples over theory. When the provided knowledge \
contains relevant material, ground your answer in it.";

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: Uuid,
    pub message: String,
    pub sources: Vec<String>,
}

/// Knowledge retrieved to ground one answer.
struct Retrieved {
    /// Titles shown to the user as sources.
    titles: Vec<String>,
    /// Text blocks injected into the system prompt.
    sections: Vec<String>,
}

// ============ Retrieval ============

async fn fetch_knowledge_rows(
    state: &AppState,
    table_global: bool,
    ids: &[String],
    user_id: Option<Uuid>,
) -> Result<Vec<(String, String)>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = if table_global {
        format!("SELECT title, content FROM global_knowledge WHERE id IN ({placeholders})")
    } else {
        format!(
            "SELECT title, content FROM knowledge_base WHERE user_id = ? AND id IN ({placeholders})"
        )
    };

    let mut query = sqlx::query_as::<_, (String, String)>(&sql);
    if let Some(user_id) = user_id {
        query = query.bind(user_id.to_string());
    }
    for id in ids {
        query = query.bind(id);
    }
    query.fetch_all(&state.pool).await
}

/// Vector retrieval: embed the question, query both namespaces, and map
/// the matched ids back to database rows.
async fn retrieve_vector(state: &AppState, user: &User, question: &str) -> Option<Retrieved> {
    if !state.config.embedding.is_enabled() || !state.config.vector.is_enabled() {
        return None;
    }

    let values = match embedding::embed_query(&state.config.embedding, question).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "query embedding failed, using database retrieval");
            return None;
        }
    };

    let result = state.vector.query_both(&user.id.to_string(), &values).await;
    let global_ids: Vec<String> = result.global.into_iter().map(|m| m.id).collect();
    let user_ids: Vec<String> = result.user.into_iter().map(|m| m.id).collect();
    if global_ids.is_empty() && user_ids.is_empty() {
        return None;
    }

    let global_rows = fetch_knowledge_rows(state, true, &global_ids, None)
        .await
        .unwrap_or_default();
    let user_rows = fetch_knowledge_rows(state, false, &user_ids, Some(user.id.into_uuid()))
        .await
        .unwrap_or_default();

    let mut titles = Vec::new();
    let mut sections = Vec::new();
    for (title, content) in global_rows.into_iter().chain(user_rows) {
        sections.push(format!("## {}\n{}", title, content));
        titles.push(title);
    }

    if titles.is_empty() {
        None
    } else {
        Some(Retrieved { titles, sections })
    }
}

/// Database fallback: recent global entries plus the user's strongest
/// performers.
async fn retrieve_fallback(state: &AppState, user: &User) -> Retrieved {
    let global_rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT title, content FROM global_knowledge ORDER BY created_at DESC LIMIT ?",
    )
    .bind(state.config.vector.top_k_global as i64)
    .fetch_all(&state.pool)
    .await
    .unwrap_or_default();

    let user_rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT title, content FROM knowledge_base WHERE user_id = ? \
         ORDER BY performance_score DESC NULLS LAST, created_at DESC LIMIT ?",
    )
    .bind(user.id.to_string())
    .bind(state.config.vector.top_k_user as i64)
    .fetch_all(&state.pool)
    .await
    .unwrap_or_default();

    let mut titles = Vec::new();
    let mut sections = Vec::new();
    for (title, content) in global_rows.into_iter().chain(user_rows) {
        sections.push(format!("## {}\n{}", title, content));
        titles.push(title);
    }
    Retrieved { titles, sections }
}

async fn retrieve(state: &AppState, user: &User, question: &str) -> Retrieved {
    match retrieve_vector(state, user, question).await {
        Some(r) => r,
        None => retrieve_fallback(state, user).await,
    }
}

fn build_system_prompt(retrieved: &Retrieved) -> String {
    if retrieved.sections.is_empty() {
        return COPILOT_SYSTEM_PROMPT.to_string();
    }
    format!(
        "{}\n\n# Knowledge\n\n{}",
        COPILOT_SYSTEM_PROMPT,
        retrieved.sections.join("\n\n")
    )
}

// ============ Conversation persistence ============

fn conversation_title(question: &str) -> String {
    let trimmed = question.trim();
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

async fn fetch_owned_conversation(
    state: &AppState,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<Conversation, AppError> {
    let conversation = sqlx::query_as::<_, Conversation>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ? AND user_id = ?"
    ))
    .bind(conversation_id.to_string())
    .bind(user_id.to_string())
    .fetch_optional(&state.pool)
    .await?;

    conversation.ok_or_else(|| AppError::not_found("Conversation not found"))
}

async fn get_or_create_conversation(
    state: &AppState,
    user: &User,
    conversation_id: Option<Uuid>,
    question: &str,
) -> Result<Conversation, AppError> {
    if let Some(id) = conversation_id {
        return fetch_owned_conversation(state, id, user.id.into_uuid()).await;
    }

    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(user.id.to_string())
    .bind(conversation_title(question))
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    fetch_owned_conversation(state, id, user.id.into_uuid()).await
}

async fn load_history(
    state: &AppState,
    conversation_id: Uuid,
) -> Result<Vec<ai::Message>, sqlx::Error> {
    let messages: Vec<(String, String)> = sqlx::query_as(
        "SELECT role, content FROM chat_messages WHERE conversation_id = ? ORDER BY created_at",
    )
    .bind(conversation_id.to_string())
    .fetch_all(&state.pool)
    .await?;

    Ok(messages
        .into_iter()
        .map(|(role, content)| ai::Message { role, content })
        .collect())
}

async fn save_message(
    state: &AppState,
    conversation_id: Uuid,
    role: &str,
    content: &str,
    sources: Option<&[String]>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO chat_messages (id, conversation_id, role, content, sources, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(conversation_id.to_string())
    .bind(role)
    .bind(content)
    .bind(sources.map(SqlJson))
    .bind(Utc::now())
    .execute(&state.pool)
    .await?;

    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(conversation_id.to_string())
        .execute(&state.pool)
        .await?;

    Ok(())
}

// ============ Chat routes ============

/// Handler for `POST /api/v1/copilot/chat`.
pub async fn chat(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let question = req.message.trim().to_string();
    if question.is_empty() {
        return Err(AppError::bad_request("message must not be empty"));
    }

    let conversation =
        get_or_create_conversation(&state, &user, req.conversation_id, &question).await?;
    let history = load_history(&state, conversation.id.into_uuid()).await?;
    save_message(&state, conversation.id.into_uuid(), "user", &question, None).await?;

    let retrieved = retrieve(&state, &user, &question).await;
    let system = build_system_prompt(&retrieved);

    let mut messages = history;
    messages.push(ai::Message::user(question.clone()));

    let answer = ai::complete(
        &state.config.ai,
        &system,
        &messages,
        state.config.ai.chat_max_tokens,
    )
    .await
    .map_err(|e| {
        tracing::error!(conversation_id = %conversation.id, error = %e, "chat completion failed");
        AppError::upstream("Chat completion failed")
    })?;

    save_message(
        &state,
        conversation.id.into_uuid(),
        "assistant",
        &answer,
        Some(&retrieved.titles),
    )
    .await?;

    Ok(Json(ChatResponse {
        conversation_id: conversation.id.into_uuid(),
        message: answer,
        sources: retrieved.titles,
    }))
}

/// What to do once the streaming call has returned.
enum StreamOutcome {
    Answer(String),
    Retry(anyhow::Error),
    Fail(anyhow::Error),
}

/// A stream that failed before producing any text can be retried with the
/// non-streaming client; one that failed after text was already delivered
/// cannot, or the client would see the answer twice.
fn stream_outcome(result: anyhow::Result<String>, delta_sent: bool) -> StreamOutcome {
    match result {
        Ok(text) => StreamOutcome::Answer(text),
        Err(e) if delta_sent => StreamOutcome::Fail(e),
        Err(e) => StreamOutcome::Retry(e),
    }
}

/// Handler for `POST /api/v1/copilot/chat/stream`.
///
/// SSE events, in order: `conversation_id`, `sources`, `text` (repeated),
/// `done`. Errors mid-stream emit `error` before `done`. If the streaming
/// call fails before any text is delivered, the answer is produced with
/// the non-streaming client and delivered as a single `text` event.
pub async fn chat_stream(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let question = req.message.trim().to_string();
    if question.is_empty() {
        return Err(AppError::bad_request("message must not be empty"));
    }

    let conversation =
        get_or_create_conversation(&state, &user, req.conversation_id, &question).await?;
    let history = load_history(&state, conversation.id.into_uuid()).await?;
    save_message(&state, conversation.id.into_uuid(), "user", &question, None).await?;

    let retrieved = retrieve(&state, &user, &question).await;
    let system = build_system_prompt(&retrieved);

    let mut messages = history;
    messages.push(ai::Message::user(question.clone()));

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);
    let conversation_id = conversation.id.into_uuid();
    let titles = retrieved.titles;

    tokio::spawn(async move {
        let send = |event: Event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Ok(event)).await;
            }
        };

        send(Event::default()
            .event("conversation_id")
            .data(conversation_id.to_string()))
        .await;
        send(Event::default().event("sources").data(
            serde_json::to_string(&titles).unwrap_or_else(|_| "[]".to_string()),
        ))
        .await;

        let delta_tx = tx.clone();
        let mut delta_sent = false;
        let result = ai::stream_completion(
            &state.config.ai,
            &system,
            &messages,
            state.config.ai.chat_max_tokens,
            |delta| {
                delta_sent = true;
                // try_send: a slow client should not stall the model read.
                let _ = delta_tx.try_send(Ok(Event::default().event("text").data(delta)));
            },
        )
        .await;

        let answer = match stream_outcome(result, delta_sent) {
            StreamOutcome::Answer(text) => Some(text),
            StreamOutcome::Retry(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e,
                    "streaming failed before any output, retrying without streaming");
                match ai::complete(
                    &state.config.ai,
                    &system,
                    &messages,
                    state.config.ai.chat_max_tokens,
                )
                .await
                {
                    Ok(text) => {
                        send(Event::default().event("text").data(&text)).await;
                        Some(text)
                    }
                    Err(e) => {
                        tracing::error!(conversation_id = %conversation_id, error = %e,
                            "chat completion failed");
                        send(Event::default()
                            .event("error")
                            .data("Chat completion failed"))
                        .await;
                        None
                    }
                }
            }
            StreamOutcome::Fail(e) => {
                tracing::error!(conversation_id = %conversation_id, error = %e,
                    "stream failed mid-answer");
                send(Event::default()
                    .event("error")
                    .data("Chat stream interrupted"))
                .await;
                None
            }
        };

        if let Some(answer) = answer {
            if let Err(e) =
                save_message(&state, conversation_id, "assistant", &answer, Some(&titles)).await
            {
                tracing::error!(conversation_id = %conversation_id, error = %e,
                    "failed to persist assistant message");
            }
        }

        send(Event::default().event("done").data("")).await;
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

// ============ Conversation routes ============

#[derive(Debug, Deserialize)]
pub struct ConversationListParams {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<ChatMessage>,
}

/// Handler for `GET /api/v1/copilot/conversations`. Most recently active
/// first.
pub async fn list_conversations(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<ConversationListParams>,
) -> Result<Json<Vec<Conversation>>, AppError> {
    let conversations = sqlx::query_as::<_, Conversation>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE user_id = ? \
         ORDER BY updated_at DESC LIMIT ? OFFSET ?"
    ))
    .bind(user.id.to_string())
    .bind(params.limit.clamp(1, 100))
    .bind(params.skip.max(0))
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(conversations))
}

/// Handler for `GET /api/v1/copilot/conversations/{conversation_id}`.
/// Returns the conversation with its full message history.
pub async fn get_conversation(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ConversationDetail>, AppError> {
    let conversation = fetch_owned_conversation(&state, conversation_id, user.id.into_uuid()).await?;

    let messages = sqlx::query_as::<_, ChatMessage>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE conversation_id = ? \
         ORDER BY created_at"
    ))
    .bind(conversation_id.to_string())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(ConversationDetail {
        conversation,
        messages,
    }))
}

/// Handler for `DELETE /api/v1/copilot/conversations/{conversation_id}`.
pub async fn delete_conversation(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    fetch_owned_conversation(&state, conversation_id, user.id.into_uuid()).await?;

    // Messages go with the conversation via ON DELETE CASCADE.
    sqlx::query("DELETE FROM conversations WHERE id = ? AND user_id = ?")
        .bind(conversation_id.to_string())
        .bind(user.id.to_string())
        .execute(&state.pool)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_title_short_question() {
        assert_eq!(conversation_title("What hooks work?"), "What hooks work?");
    }

    #[test]
    fn test_conversation_title_truncated() {
        let long = "What are the best performing hooks for pet products in the US market?";
        let title = conversation_title(long);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }

    #[test]
    fn test_conversation_title_trims_whitespace() {
        assert_eq!(conversation_title("  hi  "), "hi");
    }

    #[test]
    fn test_system_prompt_without_knowledge() {
        let retrieved = Retrieved {
            titles: vec![],
            sections: vec![],
        };
        assert_eq!(build_system_prompt(&retrieved), COPILOT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_stream_success_keeps_answer() {
        let outcome = stream_outcome(Ok("answer".to_string()), true);
        assert!(matches!(outcome, StreamOutcome::Answer(text) if text == "answer"));
    }

    #[test]
    fn test_stream_failure_before_output_retries() {
        let outcome = stream_outcome(Err(anyhow::anyhow!("connect refused")), false);
        assert!(matches!(outcome, StreamOutcome::Retry(_)));
    }

    #[test]
    fn test_stream_failure_after_output_does_not_retry() {
        let outcome = stream_outcome(Err(anyhow::anyhow!("reset mid-body")), true);
        assert!(matches!(outcome, StreamOutcome::Fail(_)));
    }

    // Compile-level check that the SSE handler still satisfies axum's
    // handler contract with its keep-alive wrapper.
    #[test]
    fn test_chat_stream_mounts_as_a_route() {
        let _: axum::routing::MethodRouter<AppState> = axum::routing::post(chat_stream);
    }

    #[test]
    fn test_system_prompt_with_knowledge() {
        let retrieved = Retrieved {
            titles: vec!["Hook patterns".to_string()],
            sections: vec!["## Hook patterns\nOpen with a question.".to_string()],
        };
        let prompt = build_system_prompt(&retrieved);
        assert!(prompt.contains("# Knowledge"));
        assert!(prompt.contains("Open with a question."));
    }
}
